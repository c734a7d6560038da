use crate::{
    models::DomainRepository,
    queue::{MetricsAggregatePayload, TaskKind, TaskQueue, VerifyPayload},
};
use chrono::Duration;
use sqlx::PgPool;
use std::error::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Interval-driven enqueues: the scheduler never does the work itself, it
/// only feeds the task queue.
pub struct Periodically {
    domains: DomainRepository,
    queue: TaskQueue,
}

pub fn run_periodically<F, E, Fut>(task: F, period: Duration, cancel: CancellationToken)
where
    F: Fn() -> Fut + Send + 'static,
    E: Error,
    Fut: Future<Output = Result<(), E>> + Send,
{
    tokio::spawn(async move {
        loop {
            select!(
                _ = cancel.cancelled() => {
                    tracing::info!("periodic task cancelled");
                    return;
                },
                _ = tokio::time::sleep(period.to_std().unwrap_or_default()) => {
                    if let Err(e) = task().await {
                        error!("periodic task failed: {e}");
                    }
                }
            )
        }
    });
}

const DOMAIN_RECHECK_HOURS: i64 = 6;

impl Periodically {
    pub fn new(pool: PgPool, queue: TaskQueue) -> Self {
        Self {
            domains: DomainRepository::new(pool),
            queue,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) {
        let this = std::sync::Arc::new(self);

        let scheduler = this.clone();
        run_periodically(
            move || {
                let scheduler = scheduler.clone();
                async move { scheduler.enqueue_metrics_aggregate().await }
            },
            Duration::hours(1),
            shutdown.clone(),
        );

        let scheduler = this.clone();
        run_periodically(
            move || {
                let scheduler = scheduler.clone();
                async move { scheduler.enqueue_cleanup().await }
            },
            Duration::days(1),
            shutdown.clone(),
        );

        let scheduler = this;
        run_periodically(
            move || {
                let scheduler = scheduler.clone();
                async move { scheduler.reverify_stale_domains().await }
            },
            Duration::hours(1),
            shutdown,
        );
    }

    /// Reconciles the just-completed hour: real-time counters may have
    /// missed increments, and the sweep max-merges the recount.
    pub async fn enqueue_metrics_aggregate(&self) -> Result<(), crate::queue::QueueError> {
        debug!("enqueueing metrics aggregation");
        self.queue
            .enqueue(
                TaskKind::MetricsAggregate,
                &MetricsAggregatePayload { hour_start: None },
            )
            .await?;
        Ok(())
    }

    pub async fn enqueue_cleanup(&self) -> Result<(), crate::queue::QueueError> {
        debug!("enqueueing retention cleanup");
        self.queue
            .enqueue(TaskKind::CleanupExpired, &serde_json::json!({}))
            .await?;
        Ok(())
    }

    /// Domains whose records have not been checked recently get a fresh
    /// verification pass; tenants fix DNS without re-requesting manually.
    pub async fn reverify_stale_domains(&self) -> Result<(), crate::models::Error> {
        let stale = self
            .domains
            .stale(chrono::Utc::now() - Duration::hours(DOMAIN_RECHECK_HOURS))
            .await?;

        for (domain_id, team_id) in stale {
            if let Err(e) = self
                .queue
                .enqueue(TaskKind::DomainVerify, &VerifyPayload { team_id, domain_id })
                .await
            {
                error!(domain_id = domain_id.to_string(), "failed to enqueue verification: {e}");
            }
        }

        Ok(())
    }
}
