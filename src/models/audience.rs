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
pub struct AudienceId(Uuid);

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct ContactId(Uuid);

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, From, Display, Deref, sqlx::Type,
    FromStr,
)]
#[sqlx(transparent)]
pub struct SegmentId(Uuid);

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Audience {
    pub id: AudienceId,
    pub team_id: TeamId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Contact {
    pub id: ContactId,
    pub audience_id: AudienceId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub unsubscribed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Segment {
    pub id: SegmentId,
    pub audience_id: AudienceId,
    pub name: String,
    pub conditions: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewContact {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Clone)]
pub struct AudienceRepository {
    pool: sqlx::PgPool,
}

impl AudienceRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, team_id: TeamId, name: &str) -> Result<Audience, Error> {
        let audience = sqlx::query_as::<_, Audience>(
            r#"
            INSERT INTO audiences (team_id, name)
            VALUES ($1, $2)
            RETURNING id, team_id, name, created_at
            "#,
        )
        .bind(team_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(audience)
    }

    pub async fn get(&self, team_id: TeamId, id: AudienceId) -> Result<Audience, Error> {
        let audience = sqlx::query_as::<_, Audience>(
            r#"
            SELECT id, team_id, name, created_at
            FROM audiences
            WHERE team_id = $1 AND id = $2
            "#,
        )
        .bind(team_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(audience)
    }

    pub async fn list(&self, team_id: TeamId) -> Result<Vec<Audience>, Error> {
        let audiences = sqlx::query_as::<_, Audience>(
            r#"
            SELECT id, team_id, name, created_at
            FROM audiences
            WHERE team_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(audiences)
    }

    /// Cascades to contacts and segments.
    pub async fn remove(&self, team_id: TeamId, id: AudienceId) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM audiences
            WHERE team_id = $1 AND id = $2
            "#,
        )
        .bind(team_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn add_contact(
        &self,
        audience_id: AudienceId,
        new: &NewContact,
    ) -> Result<Contact, Error> {
        let contact = sqlx::query_as::<_, Contact>(
            r#"
            INSERT INTO contacts (audience_id, email, first_name, last_name)
            VALUES ($1, $2, $3, $4)
            RETURNING id, audience_id, email, first_name, last_name, unsubscribed,
                      created_at, updated_at
            "#,
        )
        .bind(audience_id)
        .bind(&new.email)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(contact)
    }

    /// Bulk import upsert: existing contacts get their names refreshed but
    /// keep their unsubscribed flag.
    pub async fn upsert_contact(
        &self,
        audience_id: AudienceId,
        new: &NewContact,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO contacts (audience_id, email, first_name, last_name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (audience_id, email)
            DO UPDATE SET first_name = EXCLUDED.first_name,
                          last_name = EXCLUDED.last_name,
                          updated_at = now()
            "#,
        )
        .bind(audience_id)
        .bind(&new.email)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_contacts(
        &self,
        audience_id: AudienceId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Contact>, Error> {
        let contacts = sqlx::query_as::<_, Contact>(
            r#"
            SELECT id, audience_id, email, first_name, last_name, unsubscribed,
                   created_at, updated_at
            FROM contacts
            WHERE audience_id = $1
            ORDER BY created_at, id
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(audience_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(contacts)
    }

    /// Flips the unsubscribed flag for every contact with this address in
    /// any of the team's audiences. Returns the number of contacts touched.
    pub async fn unsubscribe_everywhere(
        &self,
        team_id: TeamId,
        email: &str,
    ) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            UPDATE contacts c
            SET unsubscribed = TRUE, updated_at = now()
            FROM audiences a
            WHERE c.audience_id = a.id AND a.team_id = $1 AND c.email = $2
            "#,
        )
        .bind(team_id)
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn create_segment(
        &self,
        audience_id: AudienceId,
        name: &str,
        conditions: &serde_json::Value,
    ) -> Result<Segment, Error> {
        let segment = sqlx::query_as::<_, Segment>(
            r#"
            INSERT INTO segments (audience_id, name, conditions)
            VALUES ($1, $2, $3)
            RETURNING id, audience_id, name, conditions, created_at
            "#,
        )
        .bind(audience_id)
        .bind(name)
        .bind(conditions)
        .fetch_one(&self.pool)
        .await?;

        Ok(segment)
    }
}
