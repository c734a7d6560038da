use crate::models::{AudienceId, Error, SegmentId, TeamId, TemplateId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct BroadcastId(Uuid);

impl BroadcastId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "broadcast_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    Draft,
    Queued,
    Sending,
    Sent,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Broadcast {
    pub id: BroadcastId,
    pub team_id: TeamId,
    pub name: String,
    pub audience_id: Option<AudienceId>,
    pub segment_id: Option<SegmentId>,
    pub template_id: Option<TemplateId>,
    pub from_email: Option<String>,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub status: BroadcastStatus,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Broadcast {
    /// Send-readiness checked before a draft may be queued: audience, from
    /// and subject present, plus content inline or via template.
    pub fn send_ready(&self) -> Result<(), &'static str> {
        if self.audience_id.is_none() {
            return Err("broadcast has no audience");
        }
        if self.from_email.as_deref().is_none_or(str::is_empty) {
            return Err("broadcast has no from address");
        }
        if self.subject.as_deref().is_none_or(str::is_empty) {
            return Err("broadcast has no subject");
        }
        let has_inline_content = self.html.as_deref().is_some_and(|h| !h.is_empty())
            || self.text.as_deref().is_some_and(|t| !t.is_empty());
        if self.template_id.is_none() && !has_inline_content {
            return Err("broadcast has no content");
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BroadcastDraft {
    pub name: String,
    pub audience_id: Option<AudienceId>,
    pub segment_id: Option<SegmentId>,
    pub template_id: Option<TemplateId>,
    pub from_email: Option<String>,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
}

const BROADCAST_COLUMNS: &str = r#"
    id, team_id, name, audience_id, segment_id, template_id, from_email,
    subject, html, text, status, total_recipients, sent_count, sent_at,
    created_at, updated_at
"#;

#[derive(Clone)]
pub struct BroadcastRepository {
    pool: sqlx::PgPool,
}

impl BroadcastRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, team_id: TeamId, draft: &BroadcastDraft) -> Result<Broadcast, Error> {
        let broadcast = sqlx::query_as::<_, Broadcast>(&format!(
            r#"
            INSERT INTO broadcasts
                (team_id, name, audience_id, segment_id, template_id, from_email,
                 subject, html, text)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {BROADCAST_COLUMNS}
            "#
        ))
        .bind(team_id)
        .bind(&draft.name)
        .bind(draft.audience_id)
        .bind(draft.segment_id)
        .bind(draft.template_id)
        .bind(&draft.from_email)
        .bind(&draft.subject)
        .bind(&draft.html)
        .bind(&draft.text)
        .fetch_one(&self.pool)
        .await?;

        Ok(broadcast)
    }

    pub async fn get(&self, team_id: TeamId, id: BroadcastId) -> Result<Broadcast, Error> {
        let broadcast = sqlx::query_as::<_, Broadcast>(&format!(
            r#"
            SELECT {BROADCAST_COLUMNS}
            FROM broadcasts
            WHERE team_id = $1 AND id = $2
            "#
        ))
        .bind(team_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(broadcast)
    }

    pub async fn list(&self, team_id: TeamId) -> Result<Vec<Broadcast>, Error> {
        let broadcasts = sqlx::query_as::<_, Broadcast>(&format!(
            r#"
            SELECT {BROADCAST_COLUMNS}
            FROM broadcasts
            WHERE team_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(broadcasts)
    }

    /// Guarded transition, same shape as the email FSM: replayed broadcast
    /// tasks observe a stale `from` status and no-op.
    pub async fn transition(
        &self,
        id: BroadcastId,
        from: BroadcastStatus,
        to: BroadcastStatus,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE broadcasts
            SET status = $3,
                sent_at = CASE WHEN $3 = 'sending'::broadcast_status THEN now() ELSE sent_at END,
                updated_at = now()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn finish_expansion(
        &self,
        id: BroadcastId,
        total_recipients: i32,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE broadcasts
            SET total_recipients = $2,
                status = CASE WHEN $2 = 0 THEN 'sent'::broadcast_status ELSE status END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total_recipients)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_draft(
        &self,
        team_id: TeamId,
        id: BroadcastId,
        draft: &BroadcastDraft,
    ) -> Result<Broadcast, Error> {
        let broadcast = sqlx::query_as::<_, Broadcast>(&format!(
            r#"
            UPDATE broadcasts
            SET name = $3, audience_id = $4, segment_id = $5, template_id = $6,
                from_email = $7, subject = $8, html = $9, text = $10, updated_at = now()
            WHERE team_id = $1 AND id = $2 AND status = 'draft'
            RETURNING {BROADCAST_COLUMNS}
            "#
        ))
        .bind(team_id)
        .bind(id)
        .bind(&draft.name)
        .bind(draft.audience_id)
        .bind(draft.segment_id)
        .bind(draft.template_id)
        .bind(&draft.from_email)
        .bind(&draft.subject)
        .bind(&draft.html)
        .bind(&draft.text)
        .fetch_one(&self.pool)
        .await?;

        Ok(broadcast)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn draft_broadcast() -> Broadcast {
        Broadcast {
            id: Uuid::new_v4().into(),
            team_id: Uuid::new_v4().into(),
            name: "launch".into(),
            audience_id: Some(Uuid::new_v4().into()),
            segment_id: None,
            template_id: None,
            from_email: Some("news@x.test".into()),
            subject: Some("Hello".into()),
            html: Some("<p>hi</p>".into()),
            text: None,
            status: BroadcastStatus::Draft,
            total_recipients: 0,
            sent_count: 0,
            sent_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn ready_with_inline_content() {
        assert!(draft_broadcast().send_ready().is_ok());
    }

    #[test]
    fn not_ready_without_audience() {
        let mut b = draft_broadcast();
        b.audience_id = None;
        assert_eq!(b.send_ready(), Err("broadcast has no audience"));
    }

    #[test]
    fn not_ready_without_content_or_template() {
        let mut b = draft_broadcast();
        b.html = None;
        b.text = Some(String::new());
        assert_eq!(b.send_ready(), Err("broadcast has no content"));

        b.template_id = Some(Uuid::new_v4().into());
        assert!(b.send_ready().is_ok());
    }

    #[test]
    fn not_ready_with_empty_from_or_subject() {
        let mut b = draft_broadcast();
        b.from_email = Some(String::new());
        assert!(b.send_ready().is_err());

        let mut b = draft_broadcast();
        b.subject = None;
        assert!(b.send_ready().is_err());
    }
}
