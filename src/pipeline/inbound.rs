use crate::{
    pipeline::{Pipeline, PipelineError},
    queue::{InboundPayload, Task},
};
use serde_json::json;
use tracing::{debug, warn};

impl Pipeline {
    /// The `inbound:process` handler: marks the row processed and fans the
    /// parsed message out to subscribed webhooks.
    pub(crate) async fn handle_inbound(&self, task: &Task) -> Result<(), PipelineError> {
        let payload: InboundPayload = task.parse_payload()?;

        let inbound = match self.inbound.get(payload.team_id, payload.inbound_id).await {
            Ok(inbound) => inbound,
            Err(crate::models::Error::NotFound(_)) => {
                warn!(
                    inbound_id = payload.inbound_id.to_string(),
                    "inbound email vanished, dropping task"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // processed flag doubles as the replay guard
        if !self.inbound.mark_processed(inbound.id).await? {
            debug!(inbound_id = inbound.id.to_string(), "inbound email already processed");
            return Ok(());
        }

        self.webhooks
            .publish_quietly(
                inbound.team_id,
                "email.inbound",
                json!({
                    "inbound_id": inbound.id,
                    "from": inbound.from_email,
                    "to": inbound.to_emails,
                    "cc": inbound.cc_emails,
                    "subject": inbound.subject,
                    "html": inbound.html,
                    "text": inbound.text,
                    "attachments": inbound.attachments,
                }),
            )
            .await;

        Ok(())
    }
}
