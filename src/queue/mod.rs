use chrono::{DateTime, Duration, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod worker;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("failed to serialize task payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, From, Display, Deref, sqlx::Type,
    FromStr,
)]
#[sqlx(transparent)]
pub struct TaskId(Uuid);

/// Three queues with priority weights 6:3:1. Webhook and broadcast work is
/// deliberately kept off `critical` so a tenant's slow endpoint cannot
/// starve transactional sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Critical,
    Default,
    Low,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Critical, QueueName::Default, QueueName::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Critical => "critical",
            QueueName::Default => "default",
            QueueName::Low => "low",
        }
    }

    pub fn weight(self) -> u32 {
        match self {
            QueueName::Critical => 6,
            QueueName::Default => 3,
            QueueName::Low => 1,
        }
    }

    /// Queue probe order for one dequeue round: a weighted roll picks the
    /// first queue, the remaining ones follow by descending weight.
    pub fn pick_order(roll: u32) -> [QueueName; 3] {
        let total: u32 = Self::ALL.iter().map(|q| q.weight()).sum();
        let roll = roll % total;
        if roll < QueueName::Critical.weight() {
            [QueueName::Critical, QueueName::Default, QueueName::Low]
        } else if roll < QueueName::Critical.weight() + QueueName::Default.weight() {
            [QueueName::Default, QueueName::Critical, QueueName::Low]
        } else {
            [QueueName::Low, QueueName::Critical, QueueName::Default]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum TaskKind {
    EmailSend,
    EmailSendBatch,
    BroadcastSend,
    DomainVerify,
    WebhookDeliver,
    BounceProcess,
    InboundProcess,
    MetricsAggregate,
    CleanupExpired,
    ContactImport,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::EmailSend => "email:send",
            TaskKind::EmailSendBatch => "email:send_batch",
            TaskKind::BroadcastSend => "broadcast:send",
            TaskKind::DomainVerify => "domain:verify",
            TaskKind::WebhookDeliver => "webhook:deliver",
            TaskKind::BounceProcess => "bounce:process",
            TaskKind::InboundProcess => "inbound:process",
            TaskKind::MetricsAggregate => "metrics:aggregate",
            TaskKind::CleanupExpired => "cleanup:expired",
            TaskKind::ContactImport => "contact:import",
        }
    }

    pub fn from_str(kind: &str) -> Option<Self> {
        Some(match kind {
            "email:send" => TaskKind::EmailSend,
            "email:send_batch" => TaskKind::EmailSendBatch,
            "broadcast:send" => TaskKind::BroadcastSend,
            "domain:verify" => TaskKind::DomainVerify,
            "webhook:deliver" => TaskKind::WebhookDeliver,
            "bounce:process" => TaskKind::BounceProcess,
            "inbound:process" => TaskKind::InboundProcess,
            "metrics:aggregate" => TaskKind::MetricsAggregate,
            "cleanup:expired" => TaskKind::CleanupExpired,
            "contact:import" => TaskKind::ContactImport,
            _ => return None,
        })
    }

    pub fn default_queue(self) -> QueueName {
        match self {
            TaskKind::EmailSend | TaskKind::EmailSendBatch => QueueName::Critical,
            TaskKind::DomainVerify
            | TaskKind::WebhookDeliver
            | TaskKind::BounceProcess
            | TaskKind::InboundProcess => QueueName::Default,
            TaskKind::BroadcastSend
            | TaskKind::MetricsAggregate
            | TaskKind::CleanupExpired
            | TaskKind::ContactImport => QueueName::Low,
        }
    }

    pub fn default_max_retry(self) -> i32 {
        match self {
            TaskKind::EmailSend | TaskKind::EmailSendBatch => 5,
            TaskKind::WebhookDeliver => crate::webhooks::MAX_DELIVERY_ATTEMPTS,
            TaskKind::DomainVerify | TaskKind::BounceProcess | TaskKind::InboundProcess => 3,
            TaskKind::BroadcastSend | TaskKind::ContactImport => 3,
            TaskKind::MetricsAggregate | TaskKind::CleanupExpired => 1,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    pub id: TaskId,
    pub queue: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_retry: i32,
    pub process_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn kind(&self) -> Option<TaskKind> {
        TaskKind::from_str(&self.kind)
    }

    /// True on the last permitted run, after which a failure is final.
    pub fn final_attempt(&self) -> bool {
        self.attempts >= self.max_retry
    }

    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Exponential backoff between attempts: 30 s, 60 s, 120 s, ... capped at
/// one hour.
pub fn retry_backoff(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 7) as u32;
    let secs = 30i64.saturating_mul(2i64.pow(exponent));
    Duration::seconds(secs.min(3600))
}

#[derive(Clone)]
pub struct TaskQueue {
    pool: sqlx::PgPool,
}

impl TaskQueue {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue<P: Serialize>(
        &self,
        kind: TaskKind,
        payload: &P,
    ) -> Result<TaskId, QueueError> {
        self.enqueue_at(kind, payload, None).await
    }

    pub async fn enqueue_at<P: Serialize>(
        &self,
        kind: TaskKind,
        payload: &P,
        process_at: Option<DateTime<Utc>>,
    ) -> Result<TaskId, QueueError> {
        let id = sqlx::query_scalar::<_, TaskId>(
            r#"
            INSERT INTO tasks (queue, kind, payload, max_retry, process_at)
            VALUES ($1, $2, $3, $4, COALESCE($5, now()))
            RETURNING id
            "#,
        )
        .bind(kind.default_queue().as_str())
        .bind(kind.as_str())
        .bind(serde_json::to_value(payload)?)
        .bind(kind.default_max_retry())
        .bind(process_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Claims the oldest due task from the first non-empty queue in probe
    /// order. `FOR UPDATE SKIP LOCKED` lets workers race without blocking
    /// each other; the claim bumps `attempts`, so at-least-once delivery
    /// holds even if the worker dies mid-task (see `release_stuck`).
    pub async fn claim(&self, order: &[QueueName]) -> Result<Option<Task>, QueueError> {
        for queue in order {
            let task = sqlx::query_as::<_, Task>(
                r#"
                UPDATE tasks
                SET status = 'running', locked_at = now(), attempts = attempts + 1
                WHERE id = (
                    SELECT id
                    FROM tasks
                    WHERE queue = $1 AND status = 'pending' AND process_at <= now()
                    ORDER BY process_at
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                RETURNING id, queue, kind, payload, attempts, max_retry, process_at, created_at
                "#,
            )
            .bind(queue.as_str())
            .fetch_optional(&self.pool)
            .await?;

            if task.is_some() {
                return Ok(task);
            }
        }

        Ok(None)
    }

    pub async fn complete(&self, id: TaskId) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'done', locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Handler failure: reschedule with backoff, or dead-letter once the
    /// retry budget is spent. Side effects the handler already committed
    /// stay authoritative either way.
    pub async fn fail(&self, task: &Task, error: &str) -> Result<(), QueueError> {
        let exhausted = task.final_attempt();
        let next_attempt = Utc::now() + retry_backoff(task.attempts);

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = CASE WHEN $2 THEN 'dead'::task_status ELSE 'pending'::task_status END,
                process_at = $3,
                last_error = $4,
                locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(exhausted)
        .bind(next_attempt)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Tasks whose worker died mid-run become claimable again after a grace
    /// period, preserving at-least-once semantics across crashes.
    pub async fn release_stuck(&self, stuck_for: Duration) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', locked_at = NULL
            WHERE status = 'running' AND locked_at < $1
            "#,
        )
        .bind(Utc::now() - stuck_for)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn purge_done_before(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('done', 'dead') AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// Task payloads are self-describing: they carry the identifiers the handler
// needs to re-fetch authoritative state, never the state itself.

#[derive(Debug, Serialize, Deserialize)]
pub struct SendPayload {
    pub team_id: crate::models::TeamId,
    pub email_id: crate::models::EmailId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendBatchPayload {
    pub team_id: crate::models::TeamId,
    pub email_ids: Vec<crate::models::EmailId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub team_id: crate::models::TeamId,
    pub broadcast_id: crate::models::BroadcastId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyPayload {
    pub team_id: crate::models::TeamId,
    pub domain_id: crate::models::DomainId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookDeliverPayload {
    pub webhook_event_id: crate::models::WebhookEventId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BouncePayload {
    pub team_id: crate::models::TeamId,
    pub email_id: crate::models::EmailId,
    pub recipient: String,
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InboundPayload {
    pub team_id: crate::models::TeamId,
    pub inbound_id: crate::models::InboundEmailId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsAggregatePayload {
    /// Start of the hour to reconcile; the just-completed hour when absent.
    pub hour_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContactImportPayload {
    pub team_id: crate::models::TeamId,
    pub audience_id: crate::models::AudienceId,
    pub rows: Vec<crate::models::NewContact>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(1), Duration::seconds(30));
        assert_eq!(retry_backoff(2), Duration::seconds(60));
        assert_eq!(retry_backoff(3), Duration::seconds(120));
        assert_eq!(retry_backoff(6), Duration::seconds(960));
        assert_eq!(retry_backoff(50), Duration::seconds(3600));
        // defensive input
        assert_eq!(retry_backoff(0), Duration::seconds(30));
    }

    #[test]
    fn queue_weights_are_6_3_1() {
        assert_eq!(QueueName::Critical.weight(), 6);
        assert_eq!(QueueName::Default.weight(), 3);
        assert_eq!(QueueName::Low.weight(), 1);
    }

    #[test]
    fn pick_order_matches_weights() {
        let mut first_counts = std::collections::HashMap::new();
        for roll in 0..10 {
            let order = QueueName::pick_order(roll);
            *first_counts.entry(order[0]).or_insert(0u32) += 1;
        }
        assert_eq!(first_counts[&QueueName::Critical], 6);
        assert_eq!(first_counts[&QueueName::Default], 3);
        assert_eq!(first_counts[&QueueName::Low], 1);
    }

    #[test]
    fn kind_round_trips_through_wire_name() {
        for kind in [
            TaskKind::EmailSend,
            TaskKind::EmailSendBatch,
            TaskKind::BroadcastSend,
            TaskKind::DomainVerify,
            TaskKind::WebhookDeliver,
            TaskKind::BounceProcess,
            TaskKind::InboundProcess,
            TaskKind::MetricsAggregate,
            TaskKind::CleanupExpired,
            TaskKind::ContactImport,
        ] {
            assert_eq!(TaskKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(TaskKind::from_str("email:unknown"), None);
    }

    #[test]
    fn final_attempt_tracks_budget() {
        let mut task = Task {
            id: Uuid::new_v4().into(),
            queue: "critical".into(),
            kind: "email:send".into(),
            payload: serde_json::json!({}),
            attempts: 1,
            max_retry: 5,
            process_at: Utc::now(),
            created_at: Utc::now(),
        };
        assert!(!task.final_attempt());
        task.attempts = 5;
        assert!(task.final_attempt());
    }
}
