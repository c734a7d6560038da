use crate::{
    api::{ApiState, error::ApiError},
    models::{
        AudienceRepository, EmailEventType, EmailRepository, EventRepository, MetricsRepository,
        TrackingLink, TrackingLinkId, TrackingLinkType, TrackingRepository, WebhookRepository,
    },
    webhooks::WebhookPublisher,
};
use axum::{
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde_json::json;
use tracing::info;

/// Smallest valid transparent GIF, served for open-tracking pixels.
const TRACKING_PIXEL: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Resolves a link id and insists on the expected type: hitting the open
/// endpoint with a click id is a 404, with no side effects.
async fn resolve_link(
    state: &ApiState,
    id: TrackingLinkId,
    expected: TrackingLinkType,
) -> Result<TrackingLink, ApiError> {
    let link = TrackingRepository::new(state.pool.clone())
        .resolve(id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if link.link_type != expected {
        return Err(ApiError::NotFound);
    }

    Ok(link)
}

fn publisher(state: &ApiState) -> WebhookPublisher {
    WebhookPublisher::new(
        WebhookRepository::new(state.pool.clone()),
        state.queue.clone(),
    )
}

pub async fn track_open(
    State(state): State<ApiState>,
    Path(id): Path<TrackingLinkId>,
) -> Result<impl IntoResponse, ApiError> {
    let link = resolve_link(&state, id, TrackingLinkType::Open).await?;

    let events = EventRepository::new(state.pool.clone());
    let metrics = MetricsRepository::new(state.pool.clone());

    events
        .record(
            link.email_id,
            EmailEventType::Opened,
            Some(&link.recipient),
            json!({}),
        )
        .await?;
    metrics.bump(link.team_id, EmailEventType::Opened).await?;

    // an open is positive delivery feedback: promote sent to delivered
    let promoted = EmailRepository::new(state.pool.clone())
        .mark_delivered(link.email_id)
        .await?;
    if promoted {
        events
            .record(
                link.email_id,
                EmailEventType::Delivered,
                Some(&link.recipient),
                json!({}),
            )
            .await?;
        metrics.bump(link.team_id, EmailEventType::Delivered).await?;
    }
    publisher(&state)
        .publish_quietly(
            link.team_id,
            "email.opened",
            json!({ "email_id": link.email_id, "recipient": link.recipient }),
        )
        .await;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, max-age=0"),
        ],
        TRACKING_PIXEL.to_vec(),
    ))
}

pub async fn track_click(
    State(state): State<ApiState>,
    Path(id): Path<TrackingLinkId>,
) -> Result<impl IntoResponse, ApiError> {
    let link = resolve_link(&state, id, TrackingLinkType::Click).await?;
    let target = link.original_url.clone().ok_or(ApiError::NotFound)?;

    EventRepository::new(state.pool.clone())
        .record(
            link.email_id,
            EmailEventType::Clicked,
            Some(&link.recipient),
            json!({ "url": target }),
        )
        .await?;
    MetricsRepository::new(state.pool.clone())
        .bump(link.team_id, EmailEventType::Clicked)
        .await?;
    publisher(&state)
        .publish_quietly(
            link.team_id,
            "email.clicked",
            json!({
                "email_id": link.email_id,
                "recipient": link.recipient,
                "url": target,
            }),
        )
        .await;

    Ok((StatusCode::FOUND, [(header::LOCATION, target)]))
}

/// Flips the unsubscribed flag for the recipient in every audience of the
/// link's team.
pub async fn track_unsubscribe(
    State(state): State<ApiState>,
    Path(id): Path<TrackingLinkId>,
) -> Result<impl IntoResponse, ApiError> {
    let link = resolve_link(&state, id, TrackingLinkType::Unsubscribe).await?;

    let touched = AudienceRepository::new(state.pool.clone())
        .unsubscribe_everywhere(link.team_id, &link.recipient)
        .await?;

    EventRepository::new(state.pool.clone())
        .record(
            link.email_id,
            EmailEventType::Unsubscribed,
            Some(&link.recipient),
            json!({ "contacts": touched }),
        )
        .await?;
    publisher(&state)
        .publish_quietly(
            link.team_id,
            "contact.unsubscribed",
            json!({ "email_id": link.email_id, "recipient": link.recipient }),
        )
        .await;

    info!(
        recipient = link.recipient,
        contacts = touched,
        "recipient unsubscribed"
    );

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        "<html><body><p>You have been unsubscribed.</p></body></html>",
    ))
}
