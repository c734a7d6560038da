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
pub struct TemplateId(Uuid);

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, From, Display, Deref, sqlx::Type,
    FromStr,
)]
#[sqlx(transparent)]
pub struct TemplateVersionId(Uuid);

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Template {
    pub id: TemplateId,
    pub team_id: TeamId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TemplateVersion {
    pub id: TemplateVersionId,
    pub template_id: TemplateId,
    pub version_no: i32,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub variables: Vec<String>,
    pub published: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewTemplateVersion {
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub variables: Vec<String>,
}

#[derive(Clone)]
pub struct TemplateRepository {
    pool: sqlx::PgPool,
}

impl TemplateRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, team_id: TeamId, name: &str) -> Result<Template, Error> {
        let template = sqlx::query_as::<_, Template>(
            r#"
            INSERT INTO templates (team_id, name)
            VALUES ($1, $2)
            RETURNING id, team_id, name, created_at
            "#,
        )
        .bind(team_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(template)
    }

    pub async fn get(&self, team_id: TeamId, id: TemplateId) -> Result<Template, Error> {
        let template = sqlx::query_as::<_, Template>(
            r#"
            SELECT id, team_id, name, created_at
            FROM templates
            WHERE team_id = $1 AND id = $2
            "#,
        )
        .bind(team_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(template)
    }

    pub async fn list(&self, team_id: TeamId) -> Result<Vec<Template>, Error> {
        let templates = sqlx::query_as::<_, Template>(
            r#"
            SELECT id, team_id, name, created_at
            FROM templates
            WHERE team_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(templates)
    }

    pub async fn add_version(
        &self,
        template_id: TemplateId,
        new: &NewTemplateVersion,
    ) -> Result<TemplateVersion, Error> {
        let version = sqlx::query_as::<_, TemplateVersion>(
            r#"
            INSERT INTO template_versions (template_id, version_no, subject, html, text, variables)
            SELECT $1, COALESCE(MAX(version_no), 0) + 1, $2, $3, $4, $5
            FROM template_versions
            WHERE template_id = $1
            RETURNING id, template_id, version_no, subject, html, text, variables,
                      published, created_at
            "#,
        )
        .bind(template_id)
        .bind(&new.subject)
        .bind(&new.html)
        .bind(&new.text)
        .bind(&new.variables)
        .fetch_one(&self.pool)
        .await?;

        Ok(version)
    }

    /// Publishing is atomic: all sibling versions are unpublished in the
    /// same transaction that marks the target.
    pub async fn publish_version(
        &self,
        template_id: TemplateId,
        version_id: TemplateVersionId,
    ) -> Result<TemplateVersion, Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE template_versions
            SET published = FALSE
            WHERE template_id = $1
            "#,
        )
        .bind(template_id)
        .execute(&mut *tx)
        .await?;

        let version = sqlx::query_as::<_, TemplateVersion>(
            r#"
            UPDATE template_versions
            SET published = TRUE
            WHERE template_id = $1 AND id = $2
            RETURNING id, template_id, version_no, subject, html, text, variables,
                      published, created_at
            "#,
        )
        .bind(template_id)
        .bind(version_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(version)
    }

    /// The version a broadcast renders from. At most one exists.
    pub async fn published_version(
        &self,
        template_id: TemplateId,
    ) -> Result<Option<TemplateVersion>, Error> {
        let version = sqlx::query_as::<_, TemplateVersion>(
            r#"
            SELECT id, template_id, version_no, subject, html, text, variables,
                   published, created_at
            FROM template_versions
            WHERE template_id = $1 AND published
            "#,
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(version)
    }
}
