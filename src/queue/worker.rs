use crate::queue::{QueueName, Task, TaskQueue};
use async_trait::async_trait;
use chrono::Duration;
use rand::random_range;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Implemented by the pipeline. Handlers must be idempotent with respect to
/// their own status guards: duplicate delivery of the same task is expected.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, task: &Task) -> Result<(), anyhow::Error>;
}

pub struct WorkerPool {
    queue: TaskQueue,
    dispatcher: Arc<dyn Dispatch>,
    workers: usize,
    shutdown: CancellationToken,
}

const IDLE_POLL: std::time::Duration = std::time::Duration::from_millis(500);
const STUCK_RELEASE_PERIOD: std::time::Duration = std::time::Duration::from_secs(60);

impl WorkerPool {
    pub fn new(
        queue: TaskQueue,
        dispatcher: Arc<dyn Dispatch>,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            workers,
            shutdown,
        }
    }

    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.workers + 1);

        for worker_no in 0..self.workers {
            let queue = self.queue.clone();
            let dispatcher = self.dispatcher.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_no, queue, dispatcher, shutdown).await;
            }));
        }

        // one janitor per pool re-releases tasks whose worker died mid-run
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(STUCK_RELEASE_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {
                        match queue.release_stuck(Duration::minutes(10)).await {
                            Ok(0) => {}
                            Ok(released) => warn!(released, "released stuck tasks"),
                            Err(e) => error!("failed to release stuck tasks: {e}"),
                        }
                    }
                }
            }
        }));

        info!(workers = self.workers, "worker pool started");
        handles
    }
}

async fn worker_loop(
    worker_no: usize,
    queue: TaskQueue,
    dispatcher: Arc<dyn Dispatch>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            debug!(worker_no, "worker shutting down");
            return;
        }

        let order = QueueName::pick_order(random_range(0..10));
        let task = match queue.claim(&order).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                }
            }
            Err(e) => {
                error!(worker_no, "failed to claim task: {e}");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };

        trace!(
            worker_no,
            task_id = task.id.to_string(),
            kind = task.kind,
            attempt = task.attempts,
            "claimed task"
        );

        let result = tokio::select! {
            result = dispatcher.dispatch(&task) => result,
            _ = shutdown.cancelled() => Err(anyhow::anyhow!("shutdown during task execution")),
        };

        let bookkeeping = match result {
            Ok(()) => queue.complete(task.id).await,
            Err(e) => {
                if task.final_attempt() {
                    error!(
                        task_id = task.id.to_string(),
                        kind = task.kind,
                        "task failed permanently: {e:#}"
                    );
                } else {
                    warn!(
                        task_id = task.id.to_string(),
                        kind = task.kind,
                        attempt = task.attempts,
                        "task failed, will retry: {e:#}"
                    );
                }
                queue.fail(&task, &format!("{e:#}")).await
            }
        };

        if let Err(e) = bookkeeping {
            error!(task_id = task.id.to_string(), "task bookkeeping failed: {e}");
        }
    }
}
