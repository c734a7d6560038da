use crate::models::{DomainId, Error, TeamId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, From, Display, Deref, sqlx::Type,
    FromStr,
)]
#[sqlx(transparent)]
pub struct InboundEmailId(Uuid);

/// Metadata for an attachment persisted through the attachment store. The
/// bytes themselves live outside the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InboundEmail {
    pub id: InboundEmailId,
    pub team_id: TeamId,
    pub domain_id: DomainId,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    #[serde(skip_serializing)]
    pub raw_message: Vec<u8>,
    pub headers: serde_json::Value,
    pub attachments: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewInboundEmail {
    pub team_id: TeamId,
    pub domain_id: DomainId,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub raw_message: Vec<u8>,
    pub headers: serde_json::Value,
    pub attachments: Vec<AttachmentRef>,
}

const INBOUND_COLUMNS: &str = r#"
    id, team_id, domain_id, from_email, to_emails, cc_emails, subject, html,
    text, raw_message, headers, attachments, processed, created_at
"#;

#[derive(Clone)]
pub struct InboundRepository {
    pool: sqlx::PgPool,
}

impl InboundRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewInboundEmail) -> Result<InboundEmail, Error> {
        let attachments = serde_json::to_value(&new.attachments)?;

        let inbound = sqlx::query_as::<_, InboundEmail>(&format!(
            r#"
            INSERT INTO inbound_emails
                (team_id, domain_id, from_email, to_emails, cc_emails, subject,
                 html, text, raw_message, headers, attachments)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {INBOUND_COLUMNS}
            "#
        ))
        .bind(new.team_id)
        .bind(new.domain_id)
        .bind(&new.from_email)
        .bind(&new.to_emails)
        .bind(&new.cc_emails)
        .bind(&new.subject)
        .bind(&new.html)
        .bind(&new.text)
        .bind(&new.raw_message)
        .bind(&new.headers)
        .bind(attachments)
        .fetch_one(&self.pool)
        .await?;

        Ok(inbound)
    }

    pub async fn get(&self, team_id: TeamId, id: InboundEmailId) -> Result<InboundEmail, Error> {
        let inbound = sqlx::query_as::<_, InboundEmail>(&format!(
            r#"
            SELECT {INBOUND_COLUMNS}
            FROM inbound_emails
            WHERE team_id = $1 AND id = $2
            "#
        ))
        .bind(team_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(inbound)
    }

    pub async fn mark_processed(&self, id: InboundEmailId) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_emails
            SET processed = TRUE
            WHERE id = $1 AND NOT processed
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
