use crate::{
    models::{EmailEventType, SuppressionReason},
    pipeline::{Pipeline, PipelineError},
    queue::{BouncePayload, Task},
};
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceKind {
    Hard,
    Soft,
    Complaint,
}

const COMPLAINT_MARKERS: [&str; 4] = ["spam", "complaint", "abuse", "blocked"];

/// SMTP code plus reply text onto {hard, soft, complaint}. Anything
/// unrecognized is soft: a wrong soft classification costs one retry, a
/// wrong hard one suppresses a deliverable address.
pub fn classify_bounce(code: u16, message: &str) -> BounceKind {
    if code >= 500 {
        let lowered = message.to_lowercase();
        if COMPLAINT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            BounceKind::Complaint
        } else {
            BounceKind::Hard
        }
    } else {
        BounceKind::Soft
    }
}

impl Pipeline {
    /// The `bounce:process` handler. Running it twice for the same bounce
    /// is safe: the suppression upsert never overwrites an existing entry.
    pub(crate) async fn handle_bounce(&self, task: &Task) -> Result<(), PipelineError> {
        let payload: BouncePayload = task.parse_payload()?;
        let kind = classify_bounce(payload.code, &payload.message);

        info!(
            email_id = payload.email_id.to_string(),
            recipient = payload.recipient,
            code = payload.code,
            ?kind,
            "processing bounce"
        );

        match kind {
            BounceKind::Hard => {
                self.suppressions
                    .upsert(
                        payload.team_id,
                        &payload.recipient,
                        SuppressionReason::Bounce,
                        Some(&payload.message),
                    )
                    .await?;
                self.emails
                    .mark_bounced(payload.email_id, &payload.message)
                    .await?;
                self.events
                    .record(
                        payload.email_id,
                        EmailEventType::Bounced,
                        Some(&payload.recipient),
                        json!({ "type": "hard", "code": payload.code, "message": payload.message }),
                    )
                    .await?;
            }
            BounceKind::Complaint => {
                self.suppressions
                    .upsert(
                        payload.team_id,
                        &payload.recipient,
                        SuppressionReason::Complaint,
                        Some(&payload.message),
                    )
                    .await?;
                self.events
                    .record(
                        payload.email_id,
                        EmailEventType::Complained,
                        Some(&payload.recipient),
                        json!({ "code": payload.code, "message": payload.message }),
                    )
                    .await?;
                self.metrics
                    .bump(payload.team_id, EmailEventType::Complained)
                    .await?;
            }
            BounceKind::Soft => {
                // no suppression: the send handler owns soft-failure retries
                self.events
                    .record(
                        payload.email_id,
                        EmailEventType::Bounced,
                        Some(&payload.recipient),
                        json!({ "type": "soft", "code": payload.code, "message": payload.message }),
                    )
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn five_hundreds_with_abuse_text_are_complaints() {
        assert_eq!(
            classify_bounce(550, "message rejected as spam"),
            BounceKind::Complaint
        );
        assert_eq!(
            classify_bounce(554, "Blocked by recipient policy"),
            BounceKind::Complaint
        );
        assert_eq!(
            classify_bounce(571, "user filed a complaint"),
            BounceKind::Complaint
        );
        assert_eq!(classify_bounce(550, "abuse detected"), BounceKind::Complaint);
    }

    #[test]
    fn other_five_hundreds_are_hard() {
        assert_eq!(classify_bounce(550, "no such user"), BounceKind::Hard);
        assert_eq!(classify_bounce(551, "user not local"), BounceKind::Hard);
    }

    #[test]
    fn four_hundreds_and_oddities_are_soft() {
        assert_eq!(classify_bounce(421, "try again later"), BounceKind::Soft);
        assert_eq!(classify_bounce(452, "mailbox full"), BounceKind::Soft);
        // conservative default prevents false suppressions
        assert_eq!(classify_bounce(250, "weird"), BounceKind::Soft);
        assert_eq!(classify_bounce(0, ""), BounceKind::Soft);
    }
}
