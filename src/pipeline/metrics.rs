use crate::{
    models::floor_hour,
    pipeline::{Pipeline, PipelineError},
    queue::{MetricsAggregatePayload, Task},
};
use chrono::{Duration, Utc};
use tracing::info;

impl Pipeline {
    /// The hourly `metrics:aggregate` handler: recounts the just-completed
    /// hour from the event log and max-merges it into the counters.
    pub(crate) async fn handle_metrics_aggregate(&self, task: &Task) -> Result<(), PipelineError> {
        let payload: MetricsAggregatePayload = task.parse_payload()?;

        let hour_start = payload
            .hour_start
            .unwrap_or_else(|| floor_hour(Utc::now()) - Duration::hours(1));

        let reconciled = self.metrics.reconcile_hour(hour_start).await?;

        info!(
            hour_start = hour_start.to_rfc3339(),
            buckets = reconciled,
            "metrics reconciliation complete"
        );

        Ok(())
    }
}
