use crate::{
    models::WebhookEventStatus,
    pipeline::{Pipeline, PipelineError},
    queue::{Task, WebhookDeliverPayload, retry_backoff},
    webhooks::{
        ATTEMPT_HEADER, DeliveryOutcome, EVENT_TYPE_HEADER, SIGNATURE_HEADER, classify_response,
        sign_payload,
    },
};
use chrono::Utc;
use tracing::{debug, info, warn};

/// Response bodies are recorded truncated; tenants get enough to debug,
/// the database stays small.
const RESPONSE_BODY_CAP: usize = 1024;

fn truncate_response_body(mut body: String) -> String {
    if body.len() > RESPONSE_BODY_CAP {
        let cut = (0..=RESPONSE_BODY_CAP)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    body
}

impl Pipeline {
    /// The `webhook:deliver` handler: signed HTTPS POST, response
    /// classification, capped rescheduling via the queue's backoff.
    pub(crate) async fn handle_webhook_deliver(&self, task: &Task) -> Result<(), PipelineError> {
        let payload: WebhookDeliverPayload = task.parse_payload()?;

        let (event, webhook) = match self
            .webhook_repo
            .get_event_with_webhook(payload.webhook_event_id)
            .await
        {
            Ok(pair) => pair,
            Err(crate::models::Error::NotFound(_)) => {
                debug!(
                    webhook_event_id = payload.webhook_event_id.to_string(),
                    "webhook event purged, dropping task"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // replays of settled events are no-ops
        if event.status != WebhookEventStatus::Pending {
            return Ok(());
        }

        if !webhook.active {
            self.webhook_repo
                .record_attempt(
                    event.id,
                    WebhookEventStatus::Failed,
                    None,
                    Some("webhook deactivated"),
                    None,
                )
                .await?;
            return Ok(());
        }

        let body = serde_json::to_vec(&event.payload)?;
        let signature = sign_payload(&webhook.signing_secret, &body);

        let response = self
            .http
            .post(&webhook.url)
            .timeout(self.config.webhook_timeout)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_TYPE_HEADER, &event.event_type)
            .header(ATTEMPT_HEADER, (event.attempts + 1).to_string())
            .body(body)
            .send()
            .await;

        let (status_code, response_body) = match response {
            Ok(response) => {
                let code = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                (Some(code), truncate_response_body(body))
            }
            Err(e) => (e.status().map(|s| s.as_u16()), e.to_string()),
        };

        match classify_response(status_code) {
            DeliveryOutcome::Delivered => {
                self.webhook_repo
                    .record_attempt(
                        event.id,
                        WebhookEventStatus::Delivered,
                        status_code.map(i32::from),
                        Some(&response_body),
                        None,
                    )
                    .await?;
                debug!(
                    webhook_event_id = event.id.to_string(),
                    attempts = event.attempts + 1,
                    "webhook delivered"
                );
                Ok(())
            }
            DeliveryOutcome::Rejected => {
                self.webhook_repo
                    .record_attempt(
                        event.id,
                        WebhookEventStatus::Failed,
                        status_code.map(i32::from),
                        Some(&response_body),
                        None,
                    )
                    .await?;
                info!(
                    webhook_event_id = event.id.to_string(),
                    code = status_code,
                    "webhook rejected by endpoint, not retrying"
                );
                Ok(())
            }
            DeliveryOutcome::Retry => {
                if task.final_attempt() {
                    self.webhook_repo
                        .record_attempt(
                            event.id,
                            WebhookEventStatus::Failed,
                            status_code.map(i32::from),
                            Some(&response_body),
                            None,
                        )
                        .await?;
                    warn!(
                        webhook_event_id = event.id.to_string(),
                        "webhook delivery failed after final attempt"
                    );
                    return Ok(());
                }

                let next_retry_at = Utc::now() + retry_backoff(task.attempts);
                self.webhook_repo
                    .record_attempt(
                        event.id,
                        WebhookEventStatus::Pending,
                        status_code.map(i32::from),
                        Some(&response_body),
                        Some(next_retry_at),
                    )
                    .await?;

                Err(PipelineError::Retry(format!(
                    "webhook delivery to {} failed with {:?}",
                    webhook.url, status_code
                )))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_body_truncation_respects_char_boundaries() {
        let short = "ok".to_string();
        assert_eq!(truncate_response_body(short.clone()), short);

        let long = "x".repeat(RESPONSE_BODY_CAP + 100);
        assert_eq!(truncate_response_body(long).len(), RESPONSE_BODY_CAP);

        // a multibyte character straddling the cap must not split
        let mut tricky = "x".repeat(RESPONSE_BODY_CAP - 1);
        tricky.push('é');
        tricky.push_str("tail");
        let truncated = truncate_response_body(tricky);
        assert!(truncated.len() <= RESPONSE_BODY_CAP);
        assert!(truncated.is_char_boundary(truncated.len()));
    }
}
