use crate::{
    models::{BroadcastStatus, Contact, EmailEventType, EmailStatus, NewEmail},
    pipeline::{Pipeline, PipelineError},
    queue::{BroadcastPayload, SendPayload, Task, TaskKind},
};
use serde_json::json;
use tracing::{info, warn};

const CONTACT_PAGE_SIZE: i64 = 500;

/// Trivial placeholder replacement; anything richer is a template
/// engine's job, not ours.
pub fn substitute_placeholders(input: &str, contact: &Contact) -> String {
    input
        .replace("{{contact.email}}", &contact.email)
        .replace(
            "{{contact.first_name}}",
            contact.first_name.as_deref().unwrap_or(""),
        )
        .replace(
            "{{contact.last_name}}",
            contact.last_name.as_deref().unwrap_or(""),
        )
        .replace("{{contact.id}}", &contact.id.to_string())
}

impl Pipeline {
    /// The `broadcast:send` handler: expands a queued broadcast into one
    /// email row plus one send task per eligible contact.
    #[tracing::instrument(skip(self, task), fields(task_id = task.id.to_string()))]
    pub(crate) async fn handle_broadcast(&self, task: &Task) -> Result<(), PipelineError> {
        let payload: BroadcastPayload = task.parse_payload()?;

        let broadcast = match self
            .broadcasts
            .get(payload.team_id, payload.broadcast_id)
            .await
        {
            Ok(broadcast) => broadcast,
            Err(crate::models::Error::NotFound(_)) => {
                warn!(
                    broadcast_id = payload.broadcast_id.to_string(),
                    "broadcast vanished, dropping task"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // idempotent replay: only a queued broadcast may expand
        if broadcast.status != BroadcastStatus::Queued {
            return Ok(());
        }

        // published template fields take priority, field by field
        let (mut subject, mut html, mut text) = (
            broadcast.subject.clone(),
            broadcast.html.clone(),
            broadcast.text.clone(),
        );
        if let Some(template_id) = broadcast.template_id
            && let Some(version) = self.templates.published_version(template_id).await?
        {
            subject = version.subject.or(subject);
            html = version.html.or(html);
            text = version.text.or(text);
        }

        let Some(audience_id) = broadcast.audience_id else {
            // the accepting service checks readiness; a missing audience
            // here means the draft was mutated behind our back
            warn!(
                broadcast_id = broadcast.id.to_string(),
                "queued broadcast lost its audience"
            );
            return Ok(());
        };
        let from_email = broadcast.from_email.clone().unwrap_or_default();
        let subject = subject.unwrap_or_default();

        if !self
            .broadcasts
            .transition(broadcast.id, BroadcastStatus::Queued, BroadcastStatus::Sending)
            .await?
        {
            return Ok(());
        }

        let broadcast_tag = format!("broadcast:{}", broadcast.id);
        let mut enqueued: i32 = 0;
        let mut offset: i64 = 0;

        loop {
            let page = self
                .audiences
                .list_contacts(audience_id, offset, CONTACT_PAGE_SIZE)
                .await?;
            let page_len = page.len() as i64;

            for contact in &page {
                if contact.unsubscribed {
                    continue;
                }

                // a single bad contact must not sink the whole broadcast
                if let Err(e) = self
                    .expand_contact(
                        &broadcast_tag,
                        payload.team_id,
                        &from_email,
                        &subject,
                        html.as_deref(),
                        text.as_deref(),
                        contact,
                    )
                    .await
                {
                    warn!(
                        contact_id = contact.id.to_string(),
                        "skipping contact during broadcast expansion: {e}"
                    );
                    continue;
                }
                enqueued += 1;
            }

            if page_len < CONTACT_PAGE_SIZE {
                break;
            }
            offset += CONTACT_PAGE_SIZE;
        }

        // zero eligible contacts settles the broadcast as sent immediately;
        // otherwise individual email events drive reporting
        self.broadcasts.finish_expansion(broadcast.id, enqueued).await?;

        info!(
            broadcast_id = broadcast.id.to_string(),
            recipients = enqueued,
            "broadcast expanded"
        );

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn expand_contact(
        &self,
        broadcast_tag: &str,
        team_id: crate::models::TeamId,
        from_email: &str,
        subject: &str,
        html: Option<&str>,
        text: Option<&str>,
        contact: &Contact,
    ) -> Result<(), PipelineError> {
        let new_email = NewEmail {
            team_id,
            from_email: from_email.to_string(),
            to_emails: vec![contact.email.clone()],
            subject: substitute_placeholders(subject, contact),
            html: html.map(|h| substitute_placeholders(h, contact)),
            text: text.map(|t| substitute_placeholders(t, contact)),
            status: EmailStatus::Queued,
            tags: vec![broadcast_tag.to_string()],
            headers: json!({}),
            ..Default::default()
        };

        let email = self.emails.create(&new_email).await?;
        self.events
            .record(email.id, EmailEventType::Queued, None, json!({}))
            .await?;
        self.queue
            .enqueue(
                TaskKind::EmailSend,
                &SendPayload {
                    team_id,
                    email_id: email.id,
                },
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn contact(email: &str, first: Option<&str>, last: Option<&str>) -> Contact {
        Contact {
            id: Uuid::new_v4().into(),
            audience_id: Uuid::new_v4().into(),
            email: email.to_string(),
            first_name: first.map(str::to_string),
            last_name: last.map(str::to_string),
            unsubscribed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn placeholders_are_substituted() {
        let contact = contact("ada@x.test", Some("Ada"), Some("Lovelace"));
        assert_eq!(
            substitute_placeholders("Hi {{contact.first_name}} {{contact.last_name}}!", &contact),
            "Hi Ada Lovelace!"
        );
        assert_eq!(
            substitute_placeholders("to: {{contact.email}}", &contact),
            "to: ada@x.test"
        );
        assert_eq!(
            substitute_placeholders("id: {{contact.id}}", &contact),
            format!("id: {}", contact.id)
        );
    }

    #[test]
    fn missing_names_become_empty() {
        let contact = contact("ada@x.test", None, None);
        assert_eq!(
            substitute_placeholders("Hi {{contact.first_name}}!", &contact),
            "Hi !"
        );
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let contact = contact("ada@x.test", None, None);
        assert_eq!(
            substitute_placeholders("{{contact.company}}", &contact),
            "{{contact.company}}"
        );
    }
}
