use crate::models::{EmailId, Error};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, From, Display, Deref, sqlx::Type,
    FromStr,
)]
#[sqlx(transparent)]
pub struct EmailEventId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "email_event_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EmailEventType {
    Queued,
    Sent,
    Delivered,
    Bounced,
    Opened,
    Clicked,
    Complained,
    Unsubscribed,
    Failed,
}

impl EmailEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EmailEventType::Queued => "queued",
            EmailEventType::Sent => "sent",
            EmailEventType::Delivered => "delivered",
            EmailEventType::Bounced => "bounced",
            EmailEventType::Opened => "opened",
            EmailEventType::Clicked => "clicked",
            EmailEventType::Complained => "complained",
            EmailEventType::Unsubscribed => "unsubscribed",
            EmailEventType::Failed => "failed",
        }
    }
}

/// Append-only history. Events outlive their email status for auditing and
/// `created_at` is the authoritative per-email ordering.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EmailEvent {
    pub id: EmailEventId,
    pub email_id: EmailId,
    pub event_type: EmailEventType,
    pub recipient: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventRepository {
    pool: sqlx::PgPool,
}

impl EventRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        email_id: EmailId,
        event_type: EmailEventType,
        recipient: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<EmailEvent, Error> {
        let event = sqlx::query_as::<_, EmailEvent>(
            r#"
            INSERT INTO email_events (email_id, event_type, recipient, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING id, email_id, event_type, recipient, payload, created_at
            "#,
        )
        .bind(email_id)
        .bind(event_type)
        .bind(recipient)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(event)
    }

    pub async fn list_for_email(&self, email_id: EmailId) -> Result<Vec<EmailEvent>, Error> {
        let events = sqlx::query_as::<_, EmailEvent>(
            r#"
            SELECT id, email_id, event_type, recipient, payload, created_at
            FROM email_events
            WHERE email_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(email_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Recipients that already received a 2xx on an earlier attempt of this
    /// email. A re-dispatch after a partial temporary failure skips these to
    /// bound duplicate delivery.
    pub async fn sent_recipients(&self, email_id: EmailId) -> Result<Vec<String>, Error> {
        let recipients = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT recipient
            FROM email_events
            WHERE email_id = $1 AND event_type = 'sent' AND recipient IS NOT NULL
            "#,
        )
        .bind(email_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(recipients)
    }
}
