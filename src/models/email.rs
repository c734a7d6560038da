use crate::models::{DomainId, Error, TeamId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct EmailId(Uuid);

impl EmailId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type, Default)]
#[sqlx(type_name = "email_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Scheduled,
    #[default]
    Queued,
    Sending,
    Sent,
    Delivered,
    Bounced,
    Failed,
    Cancelled,
}

impl EmailStatus {
    /// Terminal states never transition back to a non-terminal state.
    /// `Sent` still accepts the informational `Delivered` hop.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EmailStatus::Sent
                | EmailStatus::Delivered
                | EmailStatus::Bounced
                | EmailStatus::Failed
                | EmailStatus::Cancelled
        )
    }

    /// The FSM table `EmailRepository::transition` enforces: a requested
    /// from-state that cannot legally reach `to` is dropped from the
    /// guard. `Sending -> Sending` covers a retry re-claiming a row a
    /// crashed worker left behind.
    pub fn can_transition(self, to: EmailStatus) -> bool {
        use EmailStatus::*;
        matches!(
            (self, to),
            (Scheduled, Queued)
                | (Scheduled, Sending)
                | (Scheduled, Cancelled)
                | (Queued, Sending)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Sending, Sending)
                | (Sending, Sent)
                | (Sending, Queued)
                | (Sending, Bounced)
                | (Sending, Failed)
                | (Sent, Delivered)
                | (Sent, Bounced)
        )
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Email {
    pub id: EmailId,
    pub team_id: TeamId,
    pub domain_id: Option<DomainId>,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub bcc_emails: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub status: EmailStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub headers: serde_json::Value,
    pub attachments: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub message_id: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Email {
    pub fn all_recipients(&self) -> impl Iterator<Item = &String> {
        self.to_emails
            .iter()
            .chain(self.cc_emails.iter())
            .chain(self.bcc_emails.iter())
    }
}

#[derive(Debug, Default)]
pub struct NewEmail {
    pub team_id: TeamId,
    pub domain_id: Option<DomainId>,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub bcc_emails: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub status: EmailStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub headers: serde_json::Value,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EmailFilter {
    pub status: Option<EmailStatus>,
    pub tag: Option<String>,
    pub offset: i64,
    pub limit: i64,
}

impl Default for EmailFilter {
    fn default() -> Self {
        Self {
            status: None,
            tag: None,
            offset: 0,
            limit: 100,
        }
    }
}

const EMAIL_COLUMNS: &str = r#"
    id, team_id, domain_id, from_email, to_emails, cc_emails, bcc_emails,
    reply_to, subject, html, text, status, scheduled_at, sent_at,
    delivered_at, tags, headers, attachments, idempotency_key, message_id,
    last_error, retry_count, created_at, updated_at
"#;

#[derive(Clone)]
pub struct EmailRepository {
    pool: sqlx::PgPool,
}

impl EmailRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewEmail) -> Result<Email, Error> {
        let email = sqlx::query_as::<_, Email>(&format!(
            r#"
            INSERT INTO emails
                (team_id, domain_id, from_email, to_emails, cc_emails, bcc_emails,
                 reply_to, subject, html, text, status, scheduled_at, tags, headers,
                 idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {EMAIL_COLUMNS}
            "#
        ))
        .bind(new.team_id)
        .bind(new.domain_id)
        .bind(&new.from_email)
        .bind(&new.to_emails)
        .bind(&new.cc_emails)
        .bind(&new.bcc_emails)
        .bind(&new.reply_to)
        .bind(&new.subject)
        .bind(&new.html)
        .bind(&new.text)
        .bind(new.status)
        .bind(new.scheduled_at)
        .bind(&new.tags)
        .bind(&new.headers)
        .bind(&new.idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(email)
    }

    pub async fn get(&self, team_id: TeamId, id: EmailId) -> Result<Email, Error> {
        let email = sqlx::query_as::<_, Email>(&format!(
            r#"
            SELECT {EMAIL_COLUMNS}
            FROM emails
            WHERE team_id = $1 AND id = $2
            "#
        ))
        .bind(team_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(email)
    }

    pub async fn list(&self, team_id: TeamId, filter: &EmailFilter) -> Result<Vec<Email>, Error> {
        let emails = sqlx::query_as::<_, Email>(&format!(
            r#"
            SELECT {EMAIL_COLUMNS}
            FROM emails
            WHERE team_id = $1
              AND ($2::email_status IS NULL OR status = $2)
              AND ($3::text IS NULL OR $3 = ANY(tags))
            ORDER BY created_at DESC
            OFFSET $4
            LIMIT $5
            "#
        ))
        .bind(team_id)
        .bind(filter.status)
        .bind(&filter.tag)
        .bind(filter.offset)
        .bind(filter.limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?;

        Ok(emails)
    }

    /// Guarded status transition. Requested from-states that the FSM does
    /// not allow to reach `to` are dropped from the guard, and false is
    /// returned when the row was not in one of the remaining states —
    /// which makes duplicate task delivery a no-op.
    pub async fn transition(
        &self,
        id: EmailId,
        from: &[EmailStatus],
        to: EmailStatus,
    ) -> Result<bool, Error> {
        let from: Vec<EmailStatus> = from
            .iter()
            .copied()
            .filter(|state| state.can_transition(to))
            .collect();
        if from.is_empty() {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE emails
            SET status = $3, updated_at = now()
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(&from)
        .bind(to)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_sent(&self, id: EmailId, message_id: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE emails
            SET status = 'sent', sent_at = now(), message_id = $2, last_error = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_delivered(&self, id: EmailId) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE emails
            SET status = 'delivered', delivered_at = now(), updated_at = now()
            WHERE id = $1 AND status = 'sent'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_failed(
        &self,
        id: EmailId,
        from: &[EmailStatus],
        last_error: &str,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE emails
            SET status = 'failed', last_error = $3, updated_at = now()
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_bounced(&self, id: EmailId, last_error: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE emails
            SET status = 'bounced', last_error = $2, updated_at = now()
            WHERE id = $1 AND status IN ('sending', 'sent')
            "#,
        )
        .bind(id)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Put a partially failed email back in the queue for another attempt.
    pub async fn requeue(&self, id: EmailId, last_error: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE emails
            SET status = 'queued', retry_count = retry_count + 1, last_error = $2,
                updated_at = now()
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancellation only wins while the email has not been picked up: a
    /// worker that already flipped the row to `sending` takes precedence.
    pub async fn cancel(&self, team_id: TeamId, id: EmailId) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE emails
            SET status = 'cancelled', updated_at = now()
            WHERE team_id = $1 AND id = $2 AND status IN ('queued', 'scheduled')
            "#,
        )
        .bind(team_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, team_id: TeamId, id: EmailId) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM emails
            WHERE team_id = $1 AND id = $2 AND status <> 'sending'
            "#,
        )
        .bind(team_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_metadata(
        &self,
        team_id: TeamId,
        id: EmailId,
        scheduled_at: Option<DateTime<Utc>>,
        tags: Option<&[String]>,
    ) -> Result<Email, Error> {
        let email = sqlx::query_as::<_, Email>(&format!(
            r#"
            UPDATE emails
            SET scheduled_at = COALESCE($3, scheduled_at),
                tags = COALESCE($4, tags),
                updated_at = now()
            WHERE team_id = $1 AND id = $2 AND status IN ('queued', 'scheduled')
            RETURNING {EMAIL_COLUMNS}
            "#
        ))
        .bind(team_id)
        .bind(id)
        .bind(scheduled_at)
        .bind(tags)
        .fetch_one(&self.pool)
        .await?;

        Ok(email)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminal_states_do_not_regress() {
        use EmailStatus::*;
        let all = [
            Scheduled, Queued, Sending, Sent, Delivered, Bounced, Failed, Cancelled,
        ];
        for from in all {
            if !from.is_terminal() {
                continue;
            }
            for to in all {
                if from.can_transition(to) {
                    // the only hops out of a terminal state stay terminal
                    assert!(to.is_terminal(), "{from:?} -> {to:?} leaves terminal");
                }
            }
        }
        assert!(!Cancelled.can_transition(Queued));
        assert!(!Failed.can_transition(Sending));
        assert!(!Delivered.can_transition(Queued));
    }

    #[test]
    fn send_pipeline_transitions() {
        use EmailStatus::*;
        assert!(Queued.can_transition(Sending));
        assert!(Scheduled.can_transition(Queued));
        assert!(Sending.can_transition(Sent));
        assert!(Sending.can_transition(Queued)); // temporary failure retry
        assert!(Sending.can_transition(Sending)); // retry re-claims an abandoned row
        assert!(Sending.can_transition(Bounced));
        assert!(Sending.can_transition(Failed));
        assert!(Sent.can_transition(Delivered));
        assert!(Queued.can_transition(Cancelled));
        assert!(Scheduled.can_transition(Cancelled));
        assert!(!Sending.can_transition(Cancelled)); // racing worker wins
    }

    #[test]
    fn recipients_are_chained_in_order() {
        let email = Email {
            id: Uuid::new_v4().into(),
            team_id: Uuid::new_v4().into(),
            domain_id: None,
            from_email: "a@x.test".into(),
            to_emails: vec!["to@x.test".into()],
            cc_emails: vec!["cc@x.test".into()],
            bcc_emails: vec!["bcc@x.test".into()],
            reply_to: None,
            subject: "s".into(),
            html: None,
            text: Some("t".into()),
            status: EmailStatus::Queued,
            scheduled_at: None,
            sent_at: None,
            delivered_at: None,
            tags: vec![],
            headers: serde_json::json!({}),
            attachments: serde_json::json!([]),
            idempotency_key: None,
            message_id: None,
            last_error: None,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let all: Vec<_> = email.all_recipients().cloned().collect();
        assert_eq!(all, vec!["to@x.test", "cc@x.test", "bcc@x.test"]);
    }
}
