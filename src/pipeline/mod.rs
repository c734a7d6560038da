use crate::{
    dkim::KeyVault,
    dns::DnsResolver,
    models::{
        AudienceRepository, BroadcastRepository, DomainRepository, DomainSettings,
        EmailRepository, EventRepository, IdempotencyRepository, InboundRepository,
        MetricsRepository, SuppressionRepository, TemplateRepository, TrackingRepository,
        WebhookRepository,
    },
    queue::{Task, TaskKind, TaskQueue, worker::Dispatch},
    smtp::outbound::SmtpEngine,
    webhooks::WebhookPublisher,
};
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

mod bounce;
mod broadcast;
mod cleanup;
mod import;
mod inbound;
mod metrics;
mod send;
mod verify;
mod webhook;

pub use bounce::{BounceKind, classify_bounce};
pub use broadcast::substitute_placeholders;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Repository(#[from] crate::models::Error),
    #[error("queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),
    #[error("invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("smtp engine error: {0}")]
    Engine(#[from] crate::smtp::outbound::EngineError),
    #[error("key handling error: {0}")]
    Key(#[from] crate::dkim::KeyError),
    #[error("{0}")]
    Retry(String),
}

#[derive(Clone)]
pub struct PipelineConfig {
    pub domain_settings: DomainSettings,
    /// Base URL the public tracking endpoints are reachable under.
    pub public_base_url: String,
    pub webhook_timeout: std::time::Duration,
    pub webhook_retention_days: i64,
    pub tracking_retention_days: i64,
    /// Upper bound on click-tracking rows minted per recipient.
    pub max_tracked_urls: usize,
}

/// All async task handlers share this context: repositories, the queue
/// client (injected once, never instantiated per call), the SMTP engine,
/// the DNS resolver and the key vault.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) emails: EmailRepository,
    pub(crate) events: EventRepository,
    pub(crate) domains: DomainRepository,
    pub(crate) suppressions: SuppressionRepository,
    pub(crate) broadcasts: BroadcastRepository,
    pub(crate) audiences: AudienceRepository,
    pub(crate) templates: TemplateRepository,
    pub(crate) tracking: TrackingRepository,
    pub(crate) metrics: MetricsRepository,
    pub(crate) inbound: InboundRepository,
    pub(crate) idempotency: IdempotencyRepository,
    pub(crate) webhook_repo: WebhookRepository,
    pub(crate) webhooks: WebhookPublisher,
    pub(crate) queue: TaskQueue,
    pub(crate) engine: SmtpEngine,
    pub(crate) resolver: DnsResolver,
    pub(crate) vault: KeyVault,
    pub(crate) http: reqwest::Client,
    pub(crate) config: Arc<PipelineConfig>,
}

impl Pipeline {
    pub fn new(
        pool: PgPool,
        queue: TaskQueue,
        engine: SmtpEngine,
        resolver: DnsResolver,
        vault: KeyVault,
        config: Arc<PipelineConfig>,
    ) -> Self {
        let webhook_repo = WebhookRepository::new(pool.clone());

        Self {
            emails: EmailRepository::new(pool.clone()),
            events: EventRepository::new(pool.clone()),
            domains: DomainRepository::new(pool.clone()),
            suppressions: SuppressionRepository::new(pool.clone()),
            broadcasts: BroadcastRepository::new(pool.clone()),
            audiences: AudienceRepository::new(pool.clone()),
            templates: TemplateRepository::new(pool.clone()),
            tracking: TrackingRepository::new(pool.clone()),
            metrics: MetricsRepository::new(pool.clone()),
            inbound: InboundRepository::new(pool.clone()),
            idempotency: IdempotencyRepository::new(pool.clone()),
            webhooks: WebhookPublisher::new(webhook_repo.clone(), queue.clone()),
            webhook_repo,
            queue,
            engine,
            resolver,
            vault,
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Dispatch for Pipeline {
    async fn dispatch(&self, task: &Task) -> Result<(), anyhow::Error> {
        let Some(kind) = task.kind() else {
            // unknown kinds are dropped rather than retried forever
            warn!(kind = task.kind, "dropping task of unknown kind");
            return Ok(());
        };

        match kind {
            TaskKind::EmailSend => self.handle_send(task).await?,
            TaskKind::EmailSendBatch => self.handle_send_batch(task).await?,
            TaskKind::BroadcastSend => self.handle_broadcast(task).await?,
            TaskKind::DomainVerify => self.handle_domain_verify(task).await?,
            TaskKind::WebhookDeliver => self.handle_webhook_deliver(task).await?,
            TaskKind::BounceProcess => self.handle_bounce(task).await?,
            TaskKind::InboundProcess => self.handle_inbound(task).await?,
            TaskKind::MetricsAggregate => self.handle_metrics_aggregate(task).await?,
            TaskKind::CleanupExpired => self.handle_cleanup(task).await?,
            TaskKind::ContactImport => self.handle_contact_import(task).await?,
        }

        Ok(())
    }
}
