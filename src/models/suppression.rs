use crate::models::{Error, TeamId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, From, Display, Deref, sqlx::Type,
    FromStr,
)]
#[sqlx(transparent)]
pub struct SuppressionId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "suppression_reason", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SuppressionReason {
    Bounce,
    Complaint,
    Unsubscribe,
    Manual,
}

/// Team-scoped deny list. Checked advisorily on acceptance and
/// authoritatively again at dispatch time.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SuppressionEntry {
    pub id: SuppressionId,
    pub team_id: TeamId,
    pub email: String,
    pub reason: SuppressionReason,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SuppressionRepository {
    pool: sqlx::PgPool,
}

impl SuppressionRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent: an existing entry keeps its original reason.
    pub async fn upsert(
        &self,
        team_id: TeamId,
        email: &str,
        reason: SuppressionReason,
        details: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO suppressions (team_id, email, reason, details)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (team_id, email) DO NOTHING
            "#,
        )
        .bind(team_id)
        .bind(email)
        .bind(reason)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns the subset of `addresses` that is suppressed for this team.
    pub async fn filter_suppressed(
        &self,
        team_id: TeamId,
        addresses: &[String],
    ) -> Result<Vec<String>, Error> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        let suppressed = sqlx::query_scalar::<_, String>(
            r#"
            SELECT email
            FROM suppressions
            WHERE team_id = $1 AND email = ANY($2)
            "#,
        )
        .bind(team_id)
        .bind(addresses)
        .fetch_all(&self.pool)
        .await?;

        Ok(suppressed)
    }

    pub async fn list(&self, team_id: TeamId) -> Result<Vec<SuppressionEntry>, Error> {
        let entries = sqlx::query_as::<_, SuppressionEntry>(
            r#"
            SELECT id, team_id, email, reason, details, created_at
            FROM suppressions
            WHERE team_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    pub async fn remove(&self, team_id: TeamId, email: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM suppressions
            WHERE team_id = $1 AND email = $2
            "#,
        )
        .bind(team_id)
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
