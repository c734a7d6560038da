use crate::{
    models::IDEMPOTENCY_TTL_HOURS,
    pipeline::{Pipeline, PipelineError},
    queue::Task,
};
use chrono::{Duration, Utc};
use tracing::info;

const TASK_RETENTION_DAYS: i64 = 7;

impl Pipeline {
    /// The `cleanup:expired` handler: retention sweep over idempotency
    /// keys, webhook events, tracking links and settled task rows.
    pub(crate) async fn handle_cleanup(&self, _task: &Task) -> Result<(), PipelineError> {
        let now = Utc::now();

        let idempotency = self
            .idempotency
            .purge_before(now - Duration::hours(IDEMPOTENCY_TTL_HOURS))
            .await?;
        let webhook_events = self
            .webhook_repo
            .purge_events_before(now - Duration::days(self.config.webhook_retention_days))
            .await?;
        let tracking_links = self
            .tracking
            .purge_before(now - Duration::days(self.config.tracking_retention_days))
            .await?;
        let tasks = self
            .queue
            .purge_done_before(now - Duration::days(TASK_RETENTION_DAYS))
            .await?;

        info!(
            idempotency,
            webhook_events, tracking_links, tasks, "cleanup sweep complete"
        );

        Ok(())
    }
}
