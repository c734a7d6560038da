use crate::{
    api::{ApiState, auth::ApiTeam, error::{ApiError, ApiResult}, validation::ValidatedJson},
    models::{
        NewTemplateVersion, Template, TemplateId, TemplateRepository, TemplateVersion,
        TemplateVersionId,
    },
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use garde::Validate;
use serde::Deserialize;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTemplateRequest {
    #[garde(length(min = 1, max = 100))]
    pub name: String,
}

pub async fn create_template(
    State(repo): State<TemplateRepository>,
    ApiTeam(team): ApiTeam,
    ValidatedJson(request): ValidatedJson<CreateTemplateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let template = repo.create(team.id, &request.name).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn list_templates(
    State(repo): State<TemplateRepository>,
    ApiTeam(team): ApiTeam,
) -> ApiResult<Vec<Template>> {
    Ok(Json(repo.list(team.id).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateVersionRequest {
    #[garde(length(max = 988))]
    pub subject: Option<String>,
    #[garde(skip)]
    pub html: Option<String>,
    #[garde(skip)]
    pub text: Option<String>,
    #[serde(default)]
    #[garde(length(max = 50))]
    pub variables: Vec<String>,
}

pub async fn create_version(
    State(repo): State<TemplateRepository>,
    ApiTeam(team): ApiTeam,
    Path(template_id): Path<TemplateId>,
    ValidatedJson(request): ValidatedJson<CreateVersionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let template = repo.get(team.id, template_id).await?;

    let version = repo
        .add_version(
            template.id,
            &NewTemplateVersion {
                subject: request.subject,
                html: request.html,
                text: request.text,
                variables: request.variables,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(version)))
}

pub async fn publish_version(
    State(state): State<ApiState>,
    ApiTeam(team): ApiTeam,
    Path((template_id, version_id)): Path<(TemplateId, TemplateVersionId)>,
) -> ApiResult<TemplateVersion> {
    let repo = TemplateRepository::new(state.pool.clone());
    let template = repo.get(team.id, template_id).await?;

    let version = repo.publish_version(template.id, version_id).await?;
    Ok(Json(version))
}
