use crate::{
    models::{
        Domain, DomainStatus, Email, EmailEventType, EmailStatus, TlsPolicy, TrackingLinkType,
    },
    pipeline::{Pipeline, PipelineError},
    queue::{BouncePayload, SendBatchPayload, SendPayload, Task, TaskKind},
    smtp::outbound::{DkimMaterial, OutboundMessage, RecipientResult},
};
use email_address::EmailAddress;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

impl Pipeline {
    /// The `email:send_batch` handler fans out into individual send tasks;
    /// each email keeps its own FSM and retry budget.
    pub(crate) async fn handle_send_batch(&self, task: &Task) -> Result<(), PipelineError> {
        let payload: SendBatchPayload = task.parse_payload()?;

        for email_id in payload.email_ids {
            self.queue
                .enqueue(
                    TaskKind::EmailSend,
                    &SendPayload {
                        team_id: payload.team_id,
                        email_id,
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// The `email:send` handler: fetch, guard, gate, sign, transmit,
    /// classify, settle. Duplicate delivery of this task is harmless
    /// because every state change is guarded on the previous status.
    #[tracing::instrument(skip(self, task), fields(task_id = task.id.to_string()))]
    pub(crate) async fn handle_send(&self, task: &Task) -> Result<(), PipelineError> {
        let payload: SendPayload = task.parse_payload()?;

        let email = match self.emails.get(payload.team_id, payload.email_id).await {
            Ok(email) => email,
            Err(crate::models::Error::NotFound(_)) => {
                warn!(email_id = payload.email_id.to_string(), "email vanished, dropping task");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if email.status.is_terminal() {
            return Ok(());
        }

        // authoritative suppression re-check: closes the race where an entry
        // was added between acceptance and dispatch
        let all: Vec<String> = email.all_recipients().cloned().collect();
        let suppressed = self
            .suppressions
            .filter_suppressed(email.team_id, &all)
            .await?;
        if !suppressed.is_empty() {
            info!(
                email_id = email.id.to_string(),
                skipped = suppressed.len(),
                "skipping suppressed recipients"
            );
        }

        let keep = |addresses: &[String]| -> Vec<String> {
            addresses
                .iter()
                .filter(|a| !suppressed.contains(*a))
                .cloned()
                .collect()
        };
        let to = keep(&email.to_emails);
        let cc = keep(&email.cc_emails);
        let bcc = keep(&email.bcc_emails);

        if to.is_empty() && cc.is_empty() && bcc.is_empty() {
            let moved = self
                .emails
                .mark_failed(
                    email.id,
                    &[EmailStatus::Queued, EmailStatus::Scheduled],
                    "all recipients suppressed",
                )
                .await?;
            if moved {
                self.events
                    .record(
                        email.id,
                        EmailEventType::Failed,
                        None,
                        json!({ "reason": "all recipients suppressed" }),
                    )
                    .await?;
                self.metrics
                    .bump(email.team_id, EmailEventType::Failed)
                    .await?;
            }
            return Ok(());
        }

        let domain = self.resolve_sending_domain(&email).await?;
        let dkim = match &domain {
            Some(domain) if domain.status == DomainStatus::Verified => Some(DkimMaterial {
                domain: domain.name.clone(),
                selector: domain.dkim_selector.clone(),
                private_der: self.vault.open(&domain.dkim_private_key)?,
            }),
            // unverified or unknown domain: transmit unsigned
            _ => None,
        };
        let tls_policy = domain
            .as_ref()
            .map(|d| d.tls_policy)
            .unwrap_or(TlsPolicy::Opportunistic);

        // the worker that wins this transition owns the attempt; a stale
        // duplicate or a cancellation race loses here and no-ops. A retry
        // run may also pick up a row a crashed worker left in `sending`.
        let claimable: &[EmailStatus] = if task.attempts > 1 {
            &[EmailStatus::Queued, EmailStatus::Scheduled, EmailStatus::Sending]
        } else {
            &[EmailStatus::Queued, EmailStatus::Scheduled]
        };
        if !self
            .emails
            .transition(email.id, claimable, EmailStatus::Sending)
            .await?
        {
            return Ok(());
        }

        let unsubscribe_link = if email.retry_count == 0 {
            self.mint_tracking_links(&email, domain.as_ref(), &to, &cc, &bcc)
                .await?
        } else {
            None
        };

        let message_id = email.message_id.clone().unwrap_or_else(|| {
            let domain_part = EmailAddress::new_unchecked(email.from_email.clone())
                .domain()
                .to_string();
            format!("{}@{domain_part}", email.id)
        });

        let mut headers: BTreeMap<String, String> = email
            .headers
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(link_id) = unsubscribe_link {
            headers.insert(
                "List-Unsubscribe".to_string(),
                format!("<{}/unsubscribe/{link_id}>", self.config.public_base_url),
            );
        }

        let message = OutboundMessage {
            message_id: message_id.clone(),
            from: email.from_email.clone(),
            to,
            cc,
            bcc,
            reply_to: email.reply_to.clone(),
            subject: email.subject.clone(),
            html: email.html.clone(),
            text: email.text.clone(),
            headers,
            dkim,
            tls_policy,
        };

        // recipients that got a 2xx on an earlier attempt are not contacted
        // again; this bounds duplicate delivery under the whole-task retry
        let already_sent = self.events.sent_recipients(email.id).await?;

        let results = match self
            .engine
            .send(&message, &already_sent, task.final_attempt())
            .await
        {
            Ok(results) => results,
            Err(e @ crate::smtp::outbound::EngineError::Dkim(_)) => {
                // signing problems are retryable: the vault may recover
                self.emails.requeue(email.id, &e.to_string()).await?;
                return Err(e.into());
            }
            Err(e) => {
                // unbuildable message: terminal, retrying cannot help
                let reason = e.to_string();
                if self
                    .emails
                    .mark_failed(email.id, &[EmailStatus::Sending], &reason)
                    .await?
                {
                    self.events
                        .record(email.id, EmailEventType::Failed, None, json!({ "reason": reason }))
                        .await?;
                    self.metrics
                        .bump(email.team_id, EmailEventType::Failed)
                        .await?;
                }
                return Ok(());
            }
        };

        self.record_recipient_results(&email, &results).await?;
        self.settle(&email, &message_id, &results, task).await
    }

    async fn resolve_sending_domain(&self, email: &Email) -> Result<Option<Domain>, PipelineError> {
        if let Some(domain_id) = email.domain_id {
            match self.domains.get(email.team_id, domain_id).await {
                Ok(domain) => return Ok(Some(domain)),
                Err(crate::models::Error::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let Ok(from) = email.from_email.parse::<EmailAddress>() else {
            return Ok(None);
        };
        Ok(self
            .domains
            .find_verified_by_name(email.team_id, from.domain())
            .await?)
    }

    /// One open and one unsubscribe link per recipient, plus click links
    /// for each distinct URL in the HTML body. The body itself is not
    /// rewritten here. Returns the unsubscribe link of the first
    /// recipient, used for the List-Unsubscribe header.
    async fn mint_tracking_links(
        &self,
        email: &Email,
        domain: Option<&Domain>,
        to: &[String],
        cc: &[String],
        bcc: &[String],
    ) -> Result<Option<crate::models::TrackingLinkId>, PipelineError> {
        let Some(domain) = domain else {
            return Ok(None);
        };

        let mut first_unsubscribe = None;
        let recipients = to.iter().chain(cc.iter()).chain(bcc.iter());
        for recipient in recipients {
            if domain.open_tracking {
                self.tracking
                    .create(email.team_id, email.id, TrackingLinkType::Open, recipient, None)
                    .await?;
            }
            let unsubscribe = self
                .tracking
                .create(
                    email.team_id,
                    email.id,
                    TrackingLinkType::Unsubscribe,
                    recipient,
                    None,
                )
                .await?;
            if first_unsubscribe.is_none() {
                first_unsubscribe = Some(unsubscribe.id);
            }

            if domain.click_tracking
                && let Some(html) = &email.html
            {
                for url in extract_urls(html, self.config.max_tracked_urls) {
                    self.tracking
                        .create(
                            email.team_id,
                            email.id,
                            TrackingLinkType::Click,
                            recipient,
                            Some(&url),
                        )
                        .await?;
                }
            }
        }

        Ok(first_unsubscribe)
    }

    async fn record_recipient_results(
        &self,
        email: &Email,
        results: &[RecipientResult],
    ) -> Result<(), PipelineError> {
        for result in results {
            if result.success {
                self.events
                    .record(
                        email.id,
                        EmailEventType::Sent,
                        Some(&result.recipient),
                        json!({ "code": result.code, "message": result.message }),
                    )
                    .await?;
                self.metrics.bump(email.team_id, EmailEventType::Sent).await?;
                self.webhooks
                    .publish_quietly(
                        email.team_id,
                        "email.sent",
                        json!({
                            "email_id": email.id,
                            "recipient": result.recipient,
                            "subject": email.subject,
                        }),
                    )
                    .await;
            } else if result.permanent && result.code >= 500 {
                self.events
                    .record(
                        email.id,
                        EmailEventType::Bounced,
                        Some(&result.recipient),
                        json!({ "code": result.code, "message": result.message }),
                    )
                    .await?;
                self.metrics
                    .bump(email.team_id, EmailEventType::Bounced)
                    .await?;
                self.webhooks
                    .publish_quietly(
                        email.team_id,
                        "email.bounced",
                        json!({
                            "email_id": email.id,
                            "recipient": result.recipient,
                            "code": result.code,
                            "message": result.message,
                        }),
                    )
                    .await;
                self.queue
                    .enqueue(
                        TaskKind::BounceProcess,
                        &BouncePayload {
                            team_id: email.team_id,
                            email_id: email.id,
                            recipient: result.recipient.clone(),
                            code: result.code,
                            message: result.message.clone(),
                        },
                    )
                    .await?;
            } else {
                let will_retry = !result.permanent;
                self.events
                    .record(
                        email.id,
                        EmailEventType::Failed,
                        Some(&result.recipient),
                        json!({
                            "code": result.code,
                            "message": result.message,
                            "will_retry": will_retry,
                        }),
                    )
                    .await?;
                if result.permanent {
                    self.metrics
                        .bump(email.team_id, EmailEventType::Failed)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Terminal transition per the FSM rules. Temporary failures with
    /// budget left revert to `queued` and surface a task error so the
    /// queue applies its backoff; the whole task retries, not individual
    /// recipients.
    async fn settle(
        &self,
        email: &Email,
        message_id: &str,
        results: &[RecipientResult],
        task: &Task,
    ) -> Result<(), PipelineError> {
        let failures: Vec<&RecipientResult> = results.iter().filter(|r| !r.success).collect();

        if failures.is_empty() {
            // every attempted recipient (and everyone from earlier attempts)
            // has a 2xx
            self.emails.mark_sent(email.id, message_id).await?;
            return Ok(());
        }

        let any_temporary = failures.iter().any(|r| !r.permanent);
        if any_temporary && !task.final_attempt() {
            let reason = format!(
                "temporary failure for {} of {} recipients",
                failures.len(),
                results.len()
            );
            self.emails.requeue(email.id, &reason).await?;
            return Err(PipelineError::Retry(reason));
        }

        let smtp_rejections = failures.iter().filter(|r| r.code >= 500).count();
        let reason = format!(
            "failed to deliver to {} of {} recipients",
            failures.len(),
            results.len()
        );

        if smtp_rejections > 0 {
            self.emails.mark_bounced(email.id, &reason).await?;
        } else {
            // transport failures only, retry budget exhausted
            self.emails
                .mark_failed(email.id, &[EmailStatus::Sending], &reason)
                .await?;
        }

        Ok(())
    }
}

/// Pulls `href="..."` targets out of an HTML body, deduplicated, capped.
fn extract_urls(html: &str, cap: usize) -> Vec<String> {
    let mut urls = Vec::new();
    for chunk in html.split("href=\"").skip(1) {
        let Some(end) = chunk.find('"') else { continue };
        let url = &chunk[..end];
        if (url.starts_with("http://") || url.starts_with("https://"))
            && !urls.iter().any(|u| u == url)
        {
            urls.push(url.to_string());
            if urls.len() >= cap {
                break;
            }
        }
    }
    urls
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn url_extraction_dedupes_and_caps() {
        let html = r##"
            <a href="https://a.test/1">one</a>
            <a href="https://a.test/2">two</a>
            <a href="https://a.test/1">one again</a>
            <a href="mailto:x@a.test">mail</a>
            <a href="#anchor">anchor</a>
        "##;
        assert_eq!(
            extract_urls(html, 20),
            vec!["https://a.test/1", "https://a.test/2"]
        );
        assert_eq!(extract_urls(html, 1), vec!["https://a.test/1"]);
        assert!(extract_urls("no links here", 20).is_empty());
    }
}
