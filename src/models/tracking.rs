use crate::models::{EmailId, Error, TeamId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, From, Display, Deref, sqlx::Type,
    FromStr,
)]
#[sqlx(transparent)]
pub struct TrackingLinkId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "tracking_link_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TrackingLinkType {
    Open,
    Click,
    Unsubscribe,
}

/// Opaque resolver rows minted at send time. The id is the only thing that
/// appears in the wild; resolution records the event and, for clicks,
/// redirects to `original_url`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TrackingLink {
    pub id: TrackingLinkId,
    pub team_id: TeamId,
    pub email_id: EmailId,
    pub link_type: TrackingLinkType,
    pub original_url: Option<String>,
    pub recipient: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TrackingRepository {
    pool: sqlx::PgPool,
}

impl TrackingRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        team_id: TeamId,
        email_id: EmailId,
        link_type: TrackingLinkType,
        recipient: &str,
        original_url: Option<&str>,
    ) -> Result<TrackingLink, Error> {
        let link = sqlx::query_as::<_, TrackingLink>(
            r#"
            INSERT INTO tracking_links (team_id, email_id, link_type, recipient, original_url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, team_id, email_id, link_type, original_url, recipient, created_at
            "#,
        )
        .bind(team_id)
        .bind(email_id)
        .bind(link_type)
        .bind(recipient)
        .bind(original_url)
        .fetch_one(&self.pool)
        .await?;

        Ok(link)
    }

    /// The tracking endpoints are unauthenticated, so resolution is global
    /// by opaque id.
    pub async fn resolve(&self, id: TrackingLinkId) -> Result<Option<TrackingLink>, Error> {
        let link = sqlx::query_as::<_, TrackingLink>(
            r#"
            SELECT id, team_id, email_id, link_type, original_url, recipient, created_at
            FROM tracking_links
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(link)
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM tracking_links
            WHERE created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
