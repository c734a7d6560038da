use crate::models::{EmailId, Error, TeamId};
use chrono::{DateTime, Duration, Utc};

/// Deduplicates client submissions: `(team, key) -> email id` with a 24 h
/// window. A lost write after email creation is tolerated; at most one
/// duplicate create can occur inside the window.
pub const IDEMPOTENCY_TTL_HOURS: i64 = 24;

#[derive(Clone)]
pub struct IdempotencyRepository {
    pool: sqlx::PgPool,
}

impl IdempotencyRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, team_id: TeamId, key: &str) -> Result<Option<EmailId>, Error> {
        let email_id = sqlx::query_scalar::<_, EmailId>(
            r#"
            SELECT email_id
            FROM idempotency_keys
            WHERE team_id = $1 AND key = $2 AND created_at > $3
            "#,
        )
        .bind(team_id)
        .bind(key)
        .bind(Utc::now() - Duration::hours(IDEMPOTENCY_TTL_HOURS))
        .fetch_optional(&self.pool)
        .await?;

        Ok(email_id)
    }

    /// First writer wins. When a concurrent request inserted the same key in
    /// between, the stored id is returned so both callers observe one email.
    pub async fn put(
        &self,
        team_id: TeamId,
        key: &str,
        email_id: EmailId,
    ) -> Result<EmailId, Error> {
        let inserted = sqlx::query_scalar::<_, EmailId>(
            r#"
            INSERT INTO idempotency_keys (team_id, key, email_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (team_id, key) DO NOTHING
            RETURNING email_id
            "#,
        )
        .bind(team_id)
        .bind(key)
        .bind(email_id)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(id) => Ok(id),
            None => Ok(self.find(team_id, key).await?.unwrap_or(email_id)),
        }
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
