use crate::{
    models::{Error, TeamId, WebhookRepository},
    queue::{TaskKind, TaskQueue, WebhookDeliverPayload},
};
use aws_lc_rs::hmac;
use base64ct::{Base64, Encoding};
use tracing::{debug, warn};

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event";
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Maximum delivery attempts per webhook event before it is marked failed.
pub const MAX_DELIVERY_ATTEMPTS: i32 = 5;

/// HMAC-SHA256 over the raw body using the webhook's signing secret,
/// base64-encoded. Receivers recompute and compare.
pub fn sign_payload(signing_secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, signing_secret.as_bytes());
    let tag = hmac::sign(&key, body);
    Base64::encode_string(tag.as_ref())
}

pub fn verify_signature(signing_secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = Base64::decode_vec(signature) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, signing_secret.as_bytes());
    hmac::verify(&key, body, &expected).is_ok()
}

/// What to do with a delivery attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// 5xx, 408, 429 and transport errors are worth another attempt.
    Retry,
    /// Remaining 4xx responses are rejections; retrying cannot help.
    Rejected,
}

pub fn classify_response(status: Option<u16>) -> DeliveryOutcome {
    match status {
        Some(code) if (200..300).contains(&code) => DeliveryOutcome::Delivered,
        Some(408) | Some(429) => DeliveryOutcome::Retry,
        Some(code) if (400..500).contains(&code) => DeliveryOutcome::Rejected,
        // 5xx, unexpected codes, and transport errors without a response
        _ => DeliveryOutcome::Retry,
    }
}

/// Fans a published event out to every subscribed webhook of the team: one
/// pending `WebhookEvent` row plus one `webhook:deliver` task each.
#[derive(Clone)]
pub struct WebhookPublisher {
    webhooks: WebhookRepository,
    queue: TaskQueue,
}

impl WebhookPublisher {
    pub fn new(webhooks: WebhookRepository, queue: TaskQueue) -> Self {
        Self { webhooks, queue }
    }

    pub async fn publish(
        &self,
        team_id: TeamId,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), Error> {
        let subscribed = self.webhooks.subscribed(team_id, event_type).await?;
        if subscribed.is_empty() {
            return Ok(());
        }

        for webhook in subscribed {
            let event = self
                .webhooks
                .create_event(webhook.id, event_type, &payload)
                .await?;

            if let Err(e) = self
                .queue
                .enqueue(
                    TaskKind::WebhookDeliver,
                    &WebhookDeliverPayload {
                        webhook_event_id: event.id,
                    },
                )
                .await
            {
                // the pending row stays behind; the cleanup sweep reaps it
                warn!(
                    webhook_event_id = event.id.to_string(),
                    "failed to enqueue webhook delivery: {e}"
                );
            }
        }

        debug!(team_id = team_id.to_string(), event_type, "published webhook event");
        Ok(())
    }

    /// Publish failures must never break the send pipeline: they are logged
    /// and swallowed.
    pub async fn publish_quietly(
        &self,
        team_id: TeamId,
        event_type: &str,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self.publish(team_id, event_type, payload).await {
            warn!(
                team_id = team_id.to_string(),
                event_type, "failed to publish webhook event: {e}"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let secret = "whsec_ZXhhbXBsZQ";
        let body = br#"{"event_type":"email.sent","email_id":"E1"}"#;

        let signature = sign_payload(secret, body);
        assert!(verify_signature(secret, body, &signature));
        assert!(!verify_signature("other-secret", body, &signature));
        assert!(!verify_signature(secret, b"tampered", &signature));
        assert!(!verify_signature(secret, body, "not-base64!!!"));
    }

    #[test]
    fn signature_is_deterministic() {
        let a = sign_payload("secret", b"body");
        let b = sign_payload("secret", b"body");
        assert_eq!(a, b);
    }

    #[test]
    fn response_classification() {
        assert_eq!(classify_response(Some(200)), DeliveryOutcome::Delivered);
        assert_eq!(classify_response(Some(204)), DeliveryOutcome::Delivered);
        assert_eq!(classify_response(Some(400)), DeliveryOutcome::Rejected);
        assert_eq!(classify_response(Some(404)), DeliveryOutcome::Rejected);
        assert_eq!(classify_response(Some(410)), DeliveryOutcome::Rejected);
        // retryable client errors
        assert_eq!(classify_response(Some(408)), DeliveryOutcome::Retry);
        assert_eq!(classify_response(Some(429)), DeliveryOutcome::Retry);
        // server errors and transport failures
        assert_eq!(classify_response(Some(500)), DeliveryOutcome::Retry);
        assert_eq!(classify_response(Some(503)), DeliveryOutcome::Retry);
        assert_eq!(classify_response(None), DeliveryOutcome::Retry);
    }
}
