use crate::{
    api::{ApiState, auth::ApiTeam, error::{ApiError, ApiResult}, validation::ValidatedJson},
    models::{
        Email, EmailEvent, EmailEventType, EmailFilter, EmailId, EmailRepository, EmailStatus,
        EventRepository, IdempotencyRepository, NewEmail, SuppressionRepository,
    },
    queue::{SendBatchPayload, SendPayload, TaskKind},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use garde::Validate;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize, Validate)]
pub struct SendEmailRequest {
    #[garde(email)]
    pub from: String,
    #[garde(length(min = 1, max = 50), inner(email))]
    pub to: Vec<String>,
    #[serde(default)]
    #[garde(length(max = 50), inner(email))]
    pub cc: Vec<String>,
    #[serde(default)]
    #[garde(length(max = 50), inner(email))]
    pub bcc: Vec<String>,
    #[garde(inner(email))]
    pub reply_to: Option<String>,
    #[garde(length(min = 1, max = 988))]
    pub subject: String,
    #[garde(skip)]
    pub html: Option<String>,
    #[garde(skip)]
    pub text: Option<String>,
    #[serde(default)]
    #[garde(length(max = 10))]
    pub tags: Vec<String>,
    #[serde(default)]
    #[garde(skip)]
    pub headers: serde_json::Map<String, serde_json::Value>,
    #[garde(skip)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[garde(length(min = 1, max = 256))]
    pub idempotency_key: Option<String>,
}

impl SendEmailRequest {
    /// Exactly one of html/text must be non-empty at send time.
    fn check_content(&self) -> Result<(), ApiError> {
        let has_html = self.html.as_deref().is_some_and(|h| !h.is_empty());
        let has_text = self.text.as_deref().is_some_and(|t| !t.is_empty());
        match (has_html, has_text) {
            (true, false) | (false, true) => Ok(()),
            (false, false) => Err(ApiError::UnprocessableEntity(
                "one of html or text is required".to_string(),
            )),
            (true, true) => Err(ApiError::UnprocessableEntity(
                "provide either html or text, not both".to_string(),
            )),
        }
    }
}

async fn accept_email(
    state: &ApiState,
    team_id: crate::models::TeamId,
    request: &SendEmailRequest,
) -> Result<(Email, bool), ApiError> {
    request.check_content()?;

    let emails = EmailRepository::new(state.pool.clone());
    let idempotency = IdempotencyRepository::new(state.pool.clone());
    let events = EventRepository::new(state.pool.clone());

    // idempotent repeat: hand back the email created by the first call
    if let Some(key) = &request.idempotency_key
        && let Some(existing_id) = idempotency.find(team_id, key).await?
    {
        let existing = emails.get(team_id, existing_id).await?;
        return Ok((existing, false));
    }

    // advisory screen only: the authoritative check runs at dispatch time
    let suppressions = SuppressionRepository::new(state.pool.clone());
    let all: Vec<String> = request
        .to
        .iter()
        .chain(request.cc.iter())
        .chain(request.bcc.iter())
        .cloned()
        .collect();
    let suppressed = suppressions.filter_suppressed(team_id, &all).await?;
    if !suppressed.is_empty() {
        info!(
            team_id = team_id.to_string(),
            suppressed = suppressed.len(),
            "accepting email with suppressed recipients"
        );
    }

    // bind the sending domain when the from-address matches one of the
    // team's domains, so dispatch picks up its DKIM and TLS settings
    let from_domain = request
        .from
        .parse::<EmailAddress>()
        .map(|a| a.domain().to_string())
        .map_err(|_| ApiError::UnprocessableEntity("invalid from address".to_string()))?;
    let domain = crate::models::DomainRepository::new(state.pool.clone())
        .find_verified_by_name(team_id, &from_domain)
        .await?;

    let scheduled = request
        .scheduled_at
        .is_some_and(|at| at > Utc::now());

    let new_email = NewEmail {
        team_id,
        domain_id: domain.map(|d| d.id),
        from_email: request.from.clone(),
        to_emails: request.to.clone(),
        cc_emails: request.cc.clone(),
        bcc_emails: request.bcc.clone(),
        reply_to: request.reply_to.clone(),
        subject: request.subject.clone(),
        html: request.html.clone(),
        text: request.text.clone(),
        status: if scheduled {
            EmailStatus::Scheduled
        } else {
            EmailStatus::Queued
        },
        scheduled_at: request.scheduled_at,
        tags: request.tags.clone(),
        headers: serde_json::Value::Object(request.headers.clone()),
        idempotency_key: request.idempotency_key.clone(),
    };

    let mut email = emails.create(&new_email).await?;
    events
        .record(email.id, EmailEventType::Queued, None, json!({}))
        .await?;

    if let Some(key) = &request.idempotency_key {
        // a concurrent request may have won the insert; its email id is
        // authoritative then
        let winner = idempotency.put(team_id, key, email.id).await?;
        if winner != email.id {
            emails.delete(team_id, email.id).await?;
            email = emails.get(team_id, winner).await?;
            return Ok((email, false));
        }
    }

    Ok((email, true))
}

pub async fn send_email(
    State(state): State<ApiState>,
    ApiTeam(team): ApiTeam,
    ValidatedJson(request): ValidatedJson<SendEmailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (email, created) = accept_email(&state, team.id, &request).await?;

    if created {
        state
            .queue
            .enqueue_at(
                TaskKind::EmailSend,
                &SendPayload {
                    team_id: team.id,
                    email_id: email.id,
                },
                email.scheduled_at,
            )
            .await?;
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(email)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendBatchRequest {
    #[garde(length(min = 1, max = 100), dive)]
    pub emails: Vec<SendEmailRequest>,
}

pub async fn send_batch(
    State(state): State<ApiState>,
    ApiTeam(team): ApiTeam,
    ValidatedJson(request): ValidatedJson<SendBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut accepted = Vec::with_capacity(request.emails.len());
    let mut new_ids = Vec::new();

    for item in &request.emails {
        let (email, created) = accept_email(&state, team.id, item).await?;
        if created && email.scheduled_at.is_none() {
            new_ids.push(email.id);
        } else if created {
            // scheduled entries get their own delayed task
            state
                .queue
                .enqueue_at(
                    TaskKind::EmailSend,
                    &SendPayload {
                        team_id: team.id,
                        email_id: email.id,
                    },
                    email.scheduled_at,
                )
                .await?;
        }
        accepted.push(email);
    }

    if !new_ids.is_empty() {
        state
            .queue
            .enqueue(
                TaskKind::EmailSendBatch,
                &SendBatchPayload {
                    team_id: team.id,
                    email_ids: new_ids,
                },
            )
            .await?;
    }

    Ok((StatusCode::CREATED, Json(accepted)))
}

pub async fn list_emails(
    State(repo): State<EmailRepository>,
    ApiTeam(team): ApiTeam,
    Query(filter): Query<EmailFilter>,
) -> ApiResult<Vec<Email>> {
    Ok(Json(repo.list(team.id, &filter).await?))
}

pub async fn get_email(
    State(repo): State<EmailRepository>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<EmailId>,
) -> ApiResult<Email> {
    Ok(Json(repo.get(team.id, id).await?))
}

pub async fn list_email_events(
    State(state): State<ApiState>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<EmailId>,
) -> ApiResult<Vec<EmailEvent>> {
    let emails = EmailRepository::new(state.pool.clone());
    let email = emails.get(team.id, id).await?;

    let events = EventRepository::new(state.pool.clone());
    Ok(Json(events.list_for_email(email.id).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateEmailRequest {
    #[garde(skip)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[garde(length(max = 10))]
    pub tags: Option<Vec<String>>,
}

pub async fn update_email(
    State(repo): State<EmailRepository>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<EmailId>,
    ValidatedJson(request): ValidatedJson<UpdateEmailRequest>,
) -> ApiResult<Email> {
    let email = repo
        .update_metadata(team.id, id, request.scheduled_at, request.tags.as_deref())
        .await?;
    Ok(Json(email))
}

pub async fn delete_email(
    State(repo): State<EmailRepository>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<EmailId>,
) -> Result<impl IntoResponse, ApiError> {
    if repo.delete(team.id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

/// Cancellation only wins while the email is still queued or scheduled; a
/// worker that already started sending takes precedence and the request is
/// rejected as a conflict.
pub async fn cancel_email(
    State(state): State<ApiState>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<EmailId>,
) -> ApiResult<Email> {
    let repo = EmailRepository::new(state.pool.clone());

    if !repo.cancel(team.id, id).await? {
        // distinguish "no such email" from "too late to cancel"
        repo.get(team.id, id).await?;
        return Err(ApiError::Conflict);
    }

    Ok(Json(repo.get(team.id, id).await?))
}
