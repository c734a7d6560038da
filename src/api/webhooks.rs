use crate::{
    api::{ApiState, auth::ApiTeam, error::{ApiError, ApiResult}, validation::ValidatedJson},
    models::{Webhook, WebhookId, WebhookRepository},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use base64ct::{Base64Unpadded, Encoding};
use garde::Validate;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Event types tenants may subscribe to.
const SUBSCRIBABLE_EVENTS: [&str; 7] = [
    "email.sent",
    "email.bounced",
    "email.opened",
    "email.clicked",
    "email.complained",
    "email.inbound",
    "contact.unsubscribed",
];

#[derive(Debug, Deserialize, Validate)]
pub struct CreateWebhookRequest {
    #[garde(length(min = 12, max = 2048))]
    pub url: String,
    #[garde(length(min = 1))]
    pub events: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedWebhook {
    #[serde(flatten)]
    pub webhook: Webhook,
    /// Returned exactly once, at creation.
    pub signing_secret: String,
}

pub async fn create_webhook(
    State(repo): State<WebhookRepository>,
    ApiTeam(team): ApiTeam,
    ValidatedJson(request): ValidatedJson<CreateWebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let url = url::Url::parse(&request.url)
        .map_err(|_| ApiError::UnprocessableEntity("invalid webhook url".to_string()))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ApiError::UnprocessableEntity(
            "webhook url must be http(s)".to_string(),
        ));
    }

    for event in &request.events {
        if !SUBSCRIBABLE_EVENTS.contains(&event.as_str()) {
            return Err(ApiError::UnprocessableEntity(format!(
                "unknown event type: {event}"
            )));
        }
    }

    let signing_secret = generate_signing_secret();
    let webhook = repo
        .create(team.id, url.as_str(), &request.events, &signing_secret)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedWebhook {
            webhook,
            signing_secret,
        }),
    ))
}

pub async fn list_webhooks(
    State(repo): State<WebhookRepository>,
    ApiTeam(team): ApiTeam,
) -> ApiResult<Vec<Webhook>> {
    Ok(Json(repo.list(team.id).await?))
}

pub async fn delete_webhook(
    State(repo): State<WebhookRepository>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<WebhookId>,
) -> Result<impl IntoResponse, ApiError> {
    if repo.remove(team.id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

fn generate_signing_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("whsec_{}", Base64Unpadded::encode_string(&bytes))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signing_secrets_are_prefixed_and_unique() {
        let a = generate_signing_secret();
        let b = generate_signing_secret();
        assert!(a.starts_with("whsec_"));
        assert_ne!(a, b);
        assert!(a.len() > 40);
    }
}
