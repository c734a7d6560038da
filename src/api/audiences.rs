use crate::{
    api::{ApiState, auth::ApiTeam, error::{ApiError, ApiResult}, validation::ValidatedJson},
    models::{Audience, AudienceId, AudienceRepository, Contact, NewContact, Segment},
    queue::{ContactImportPayload, TaskKind},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use garde::Validate;
use serde::Deserialize;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAudienceRequest {
    #[garde(length(min = 1, max = 100))]
    pub name: String,
}

pub async fn create_audience(
    State(repo): State<AudienceRepository>,
    ApiTeam(team): ApiTeam,
    ValidatedJson(request): ValidatedJson<CreateAudienceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let audience = repo.create(team.id, &request.name).await?;
    Ok((StatusCode::CREATED, Json(audience)))
}

pub async fn list_audiences(
    State(repo): State<AudienceRepository>,
    ApiTeam(team): ApiTeam,
) -> ApiResult<Vec<Audience>> {
    Ok(Json(repo.list(team.id).await?))
}

pub async fn delete_audience(
    State(repo): State<AudienceRepository>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<AudienceId>,
) -> Result<impl IntoResponse, ApiError> {
    if repo.remove(team.id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateContactRequest {
    #[garde(email)]
    pub email: String,
    #[garde(length(max = 100))]
    pub first_name: Option<String>,
    #[garde(length(max = 100))]
    pub last_name: Option<String>,
}

pub async fn create_contact(
    State(repo): State<AudienceRepository>,
    ApiTeam(team): ApiTeam,
    Path(audience_id): Path<AudienceId>,
    ValidatedJson(request): ValidatedJson<CreateContactRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // the audience lookup enforces team scope before the insert
    let audience = repo.get(team.id, audience_id).await?;

    let contact = repo
        .add_contact(
            audience.id,
            &NewContact {
                email: request.email,
                first_name: request.first_name,
                last_name: request.last_name,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(contact)))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ContactPage {
    pub offset: i64,
    pub limit: i64,
}

impl Default for ContactPage {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

pub async fn list_contacts(
    State(repo): State<AudienceRepository>,
    ApiTeam(team): ApiTeam,
    Path(audience_id): Path<AudienceId>,
    Query(page): Query<ContactPage>,
) -> ApiResult<Vec<Contact>> {
    let audience = repo.get(team.id, audience_id).await?;
    let contacts = repo
        .list_contacts(audience.id, page.offset.max(0), page.limit.clamp(1, 1000))
        .await?;
    Ok(Json(contacts))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ImportContactsRequest {
    #[garde(length(min = 1, max = 10_000))]
    pub rows: Vec<NewContact>,
}

/// Accepts pre-parsed rows and defers the heavy lifting to the
/// `contact:import` task.
pub async fn import_contacts(
    State(state): State<ApiState>,
    ApiTeam(team): ApiTeam,
    Path(audience_id): Path<AudienceId>,
    ValidatedJson(request): ValidatedJson<ImportContactsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let repo = AudienceRepository::new(state.pool.clone());
    let audience = repo.get(team.id, audience_id).await?;

    state
        .queue
        .enqueue(
            TaskKind::ContactImport,
            &ContactImportPayload {
                team_id: team.id,
                audience_id: audience.id,
                rows: request.rows,
            },
        )
        .await?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSegmentRequest {
    #[garde(length(min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    #[garde(skip)]
    pub conditions: serde_json::Value,
}

pub async fn create_segment(
    State(repo): State<AudienceRepository>,
    ApiTeam(team): ApiTeam,
    Path(audience_id): Path<AudienceId>,
    ValidatedJson(request): ValidatedJson<CreateSegmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let audience = repo.get(team.id, audience_id).await?;
    let segment: Segment = repo
        .create_segment(audience.id, &request.name, &request.conditions)
        .await?;
    Ok((StatusCode::CREATED, Json(segment)))
}
