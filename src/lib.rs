use derive_more::FromStr;
use serde::Serialize;
use sqlx::PgPool;
use std::{env, sync::Arc};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod dkim;
pub mod dns;
pub mod models;
pub mod periodically;
pub mod pipeline;
pub mod queue;
pub mod smtp;
pub mod storage;
pub mod webhooks;

use crate::{
    api::ApiServer,
    config::AppConfig,
    dns::DnsResolver,
    periodically::Periodically,
    pipeline::Pipeline,
    queue::{TaskQueue, worker::WorkerPool},
    smtp::{SmtpServer, outbound::SmtpEngine},
    storage::AttachmentStore,
};

#[derive(Debug, Default, Clone, Copy, FromStr, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub enum Environment {
    Staging,
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn from_env() -> Self {
        env::var("ENVIRONMENT")
            .map(|s| s.parse())
            .inspect_err(|_| warn!("Did not find ENVIRONMENT env var, defaulting to development"))
            .unwrap_or(Ok(Environment::Development))
            .expect(
                "Invalid ENVIRONMENT env var, must be one of: development, production, or staging",
            )
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}=trace,tower_http=debug,axum=trace,info",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wires up and spawns every long-running component: the HTTP API, the
/// inbound SMTP listener, the task worker pool and the periodic scheduler.
/// All of them observe the shared cancellation token.
pub async fn run_platform(
    pool: PgPool,
    config: AppConfig,
    resolver: DnsResolver,
    shutdown: CancellationToken,
) {
    let queue = TaskQueue::new(pool.clone());
    let engine = SmtpEngine::new(resolver.clone(), Arc::new(config.engine.clone()));

    let pipeline = Pipeline::new(
        pool.clone(),
        queue.clone(),
        engine,
        resolver,
        config.vault.clone(),
        Arc::new(config.pipeline.clone()),
    );

    WorkerPool::new(
        queue.clone(),
        Arc::new(pipeline),
        config.workers,
        shutdown.clone(),
    )
    .spawn();

    SmtpServer::new(
        pool.clone(),
        Arc::new(config.smtp.clone()),
        queue.clone(),
        AttachmentStore::new(config.attachment_dir.clone()),
        shutdown.clone(),
    )
    .spawn();

    ApiServer::new(
        config.http_addr,
        pool.clone(),
        queue.clone(),
        config.vault.clone(),
        config.pipeline.domain_settings.clone(),
        shutdown.clone(),
    )
    .spawn();

    Periodically::new(pool, queue).spawn(shutdown);
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
