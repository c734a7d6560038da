use crate::{
    api::{ApiState, auth::ApiTeam, error::{ApiError, ApiResult}, validation::ValidatedJson},
    models::{
        AudienceId, Broadcast, BroadcastDraft, BroadcastRepository, BroadcastStatus, SegmentId,
        TemplateId,
    },
    queue::{BroadcastPayload, TaskKind},
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
pub struct BroadcastRequest {
    #[garde(length(min = 1, max = 100))]
    pub name: String,
    #[garde(skip)]
    pub audience_id: Option<AudienceId>,
    #[garde(skip)]
    pub segment_id: Option<SegmentId>,
    #[garde(skip)]
    pub template_id: Option<TemplateId>,
    #[garde(inner(email))]
    pub from: Option<String>,
    #[garde(length(max = 988))]
    pub subject: Option<String>,
    #[garde(skip)]
    pub html: Option<String>,
    #[garde(skip)]
    pub text: Option<String>,
}

impl From<BroadcastRequest> for BroadcastDraft {
    fn from(request: BroadcastRequest) -> Self {
        BroadcastDraft {
            name: request.name,
            audience_id: request.audience_id,
            segment_id: request.segment_id,
            template_id: request.template_id,
            from_email: request.from,
            subject: request.subject,
            html: request.html,
            text: request.text,
        }
    }
}

pub async fn create_broadcast(
    State(repo): State<BroadcastRepository>,
    ApiTeam(team): ApiTeam,
    ValidatedJson(request): ValidatedJson<BroadcastRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let broadcast = repo.create(team.id, &request.into()).await?;
    Ok((StatusCode::CREATED, Json(broadcast)))
}

pub async fn list_broadcasts(
    State(repo): State<BroadcastRepository>,
    ApiTeam(team): ApiTeam,
) -> ApiResult<Vec<Broadcast>> {
    Ok(Json(repo.list(team.id).await?))
}

pub async fn get_broadcast(
    State(repo): State<BroadcastRepository>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<crate::models::BroadcastId>,
) -> ApiResult<Broadcast> {
    Ok(Json(repo.get(team.id, id).await?))
}

pub async fn update_broadcast(
    State(repo): State<BroadcastRepository>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<crate::models::BroadcastId>,
    ValidatedJson(request): ValidatedJson<BroadcastRequest>,
) -> ApiResult<Broadcast> {
    // only drafts are mutable; a queued or sent broadcast 404s here
    Ok(Json(repo.update_draft(team.id, id, &request.into()).await?))
}

/// Checks send-readiness, flips draft to queued, and enqueues the
/// expansion task. The expander itself re-checks the queued status, so a
/// double send request is harmless.
pub async fn send_broadcast(
    State(state): State<ApiState>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<crate::models::BroadcastId>,
) -> ApiResult<Broadcast> {
    let repo = BroadcastRepository::new(state.pool.clone());
    let broadcast = repo.get(team.id, id).await?;

    if broadcast.status != BroadcastStatus::Draft {
        return Err(ApiError::Conflict);
    }
    if let Err(reason) = broadcast.send_ready() {
        return Err(ApiError::UnprocessableEntity(reason.to_string()));
    }

    if !repo
        .transition(broadcast.id, BroadcastStatus::Draft, BroadcastStatus::Queued)
        .await?
    {
        return Err(ApiError::Conflict);
    }

    state
        .queue
        .enqueue(
            TaskKind::BroadcastSend,
            &BroadcastPayload {
                team_id: team.id,
                broadcast_id: broadcast.id,
            },
        )
        .await?;

    Ok(Json(repo.get(team.id, id).await?))
}
