use crate::models::{Error, TeamId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct WebhookId(Uuid);

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct WebhookEventId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "webhook_event_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Webhook {
    pub id: WebhookId,
    pub team_id: TeamId,
    pub url: String,
    pub events: Vec<String>,
    #[serde(skip_serializing)]
    pub signing_secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEvent {
    pub id: WebhookEventId,
    pub webhook_id: WebhookId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: WebhookEventStatus,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WebhookRepository {
    pool: sqlx::PgPool,
}

impl WebhookRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        team_id: TeamId,
        url: &str,
        events: &[String],
        signing_secret: &str,
    ) -> Result<Webhook, Error> {
        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            INSERT INTO webhooks (team_id, url, events, signing_secret)
            VALUES ($1, $2, $3, $4)
            RETURNING id, team_id, url, events, signing_secret, active, created_at, updated_at
            "#,
        )
        .bind(team_id)
        .bind(url)
        .bind(events)
        .bind(signing_secret)
        .fetch_one(&self.pool)
        .await?;

        Ok(webhook)
    }

    pub async fn list(&self, team_id: TeamId) -> Result<Vec<Webhook>, Error> {
        let webhooks = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT id, team_id, url, events, signing_secret, active, created_at, updated_at
            FROM webhooks
            WHERE team_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(webhooks)
    }

    /// Active webhooks of this team subscribed to the given event type.
    pub async fn subscribed(&self, team_id: TeamId, event_type: &str) -> Result<Vec<Webhook>, Error> {
        let webhooks = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT id, team_id, url, events, signing_secret, active, created_at, updated_at
            FROM webhooks
            WHERE team_id = $1 AND active AND $2 = ANY(events)
            "#,
        )
        .bind(team_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(webhooks)
    }

    pub async fn remove(&self, team_id: TeamId, id: WebhookId) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhooks
            WHERE team_id = $1 AND id = $2
            "#,
        )
        .bind(team_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn create_event(
        &self,
        webhook_id: WebhookId,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<WebhookEvent, Error> {
        let event = sqlx::query_as::<_, WebhookEvent>(
            r#"
            INSERT INTO webhook_events (webhook_id, event_type, payload)
            VALUES ($1, $2, $3)
            RETURNING id, webhook_id, event_type, payload, status, response_code,
                      response_body, attempts, next_retry_at, created_at, updated_at
            "#,
        )
        .bind(webhook_id)
        .bind(event_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(event)
    }

    pub async fn get_event_with_webhook(
        &self,
        event_id: WebhookEventId,
    ) -> Result<(WebhookEvent, Webhook), Error> {
        let event = sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT id, webhook_id, event_type, payload, status, response_code,
                   response_body, attempts, next_retry_at, created_at, updated_at
            FROM webhook_events
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT id, team_id, url, events, signing_secret, active, created_at, updated_at
            FROM webhooks
            WHERE id = $1
            "#,
        )
        .bind(event.webhook_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((event, webhook))
    }

    pub async fn record_attempt(
        &self,
        event_id: WebhookEventId,
        status: WebhookEventStatus,
        response_code: Option<i32>,
        response_body: Option<&str>,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, response_code = $3, response_body = $4,
                attempts = attempts + 1, next_retry_at = $5, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(status)
        .bind(response_code)
        .bind(response_body)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retention: webhook events older than the cutoff are purged.
    pub async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_events
            WHERE created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
