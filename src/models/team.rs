use crate::models::Error;
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct TeamId(Uuid);

impl TeamId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

/// The tenant isolation boundary. Every non-global entity belongs to exactly
/// one team, and every repository lookup is parameterized by the team id so a
/// foreign id surfaces as `NotFound` rather than leaking existence.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TeamRepository {
    pool: sqlx::PgPool,
}

impl TeamRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, name: &str, api_key: &str) -> Result<Team, Error> {
        let team = sqlx::query_as::<_, Team>(
            r#"
            INSERT INTO teams (name, api_key)
            VALUES ($1, $2)
            RETURNING id, name, api_key, created_at, updated_at
            "#,
        )
        .bind(name)
        .bind(api_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(team)
    }

    pub async fn get(&self, id: TeamId) -> Result<Team, Error> {
        let team = sqlx::query_as::<_, Team>(
            r#"
            SELECT id, name, api_key, created_at, updated_at
            FROM teams
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(team)
    }

    pub async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Team>, Error> {
        let team = sqlx::query_as::<_, Team>(
            r#"
            SELECT id, name, api_key, created_at, updated_at
            FROM teams
            WHERE api_key = $1
            "#,
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(team)
    }
}
