use crate::{
    dkim::KeyVault,
    models::{
        AudienceRepository, BroadcastRepository, DomainRepository, DomainSettings,
        EmailRepository, SuppressionRepository, TemplateRepository, WebhookRepository,
    },
    queue::TaskQueue,
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, FromRef, State},
    routing::{get, post},
};
use serde::Serialize;
use sqlx::PgPool;
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};

mod audiences;
mod auth;
mod broadcasts;
mod domains;
mod emails;
mod error;
mod suppressions;
mod templates;
mod tracking;
mod validation;
mod webhooks;

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    pub pool: PgPool,
    pub queue: TaskQueue,
    pub vault: KeyVault,
    pub domain_settings: DomainSettings,
}

impl FromRef<ApiState> for PgPool {
    fn from_ref(state: &ApiState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<ApiState> for EmailRepository {
    fn from_ref(state: &ApiState) -> Self {
        EmailRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for DomainRepository {
    fn from_ref(state: &ApiState) -> Self {
        DomainRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for AudienceRepository {
    fn from_ref(state: &ApiState) -> Self {
        AudienceRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for TemplateRepository {
    fn from_ref(state: &ApiState) -> Self {
        TemplateRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for BroadcastRepository {
    fn from_ref(state: &ApiState) -> Self {
        BroadcastRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for WebhookRepository {
    fn from_ref(state: &ApiState) -> Self {
        WebhookRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for SuppressionRepository {
    fn from_ref(state: &ApiState) -> Self {
        SuppressionRepository::new(state.pool.clone())
    }
}

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

impl ApiServer {
    pub fn new(
        socket: SocketAddr,
        pool: PgPool,
        queue: TaskQueue,
        vault: KeyVault,
        domain_settings: DomainSettings,
        shutdown: CancellationToken,
    ) -> ApiServer {
        let state = ApiState {
            pool,
            queue,
            vault,
            domain_settings,
        };

        let api = Router::new()
            .route("/healthy", get(healthy))
            .route("/emails", get(emails::list_emails).post(emails::send_email))
            .route("/emails/batch", post(emails::send_batch))
            .route(
                "/emails/{id}",
                get(emails::get_email)
                    .patch(emails::update_email)
                    .delete(emails::delete_email),
            )
            .route("/emails/{id}/cancel", post(emails::cancel_email))
            .route("/emails/{id}/events", get(emails::list_email_events))
            .route(
                "/domains",
                get(domains::list_domains).post(domains::create_domain),
            )
            .route(
                "/domains/{id}",
                get(domains::get_domain).delete(domains::delete_domain),
            )
            .route("/domains/{id}/verify", post(domains::verify_domain))
            .route(
                "/audiences",
                get(audiences::list_audiences).post(audiences::create_audience),
            )
            .route("/audiences/{id}", axum::routing::delete(audiences::delete_audience))
            .route(
                "/audiences/{id}/contacts",
                get(audiences::list_contacts).post(audiences::create_contact),
            )
            .route(
                "/audiences/{id}/contacts/import",
                post(audiences::import_contacts),
            )
            .route("/audiences/{id}/segments", post(audiences::create_segment))
            .route(
                "/templates",
                get(templates::list_templates).post(templates::create_template),
            )
            .route("/templates/{id}/versions", post(templates::create_version))
            .route(
                "/templates/{id}/versions/{version_id}/publish",
                post(templates::publish_version),
            )
            .route(
                "/broadcasts",
                get(broadcasts::list_broadcasts).post(broadcasts::create_broadcast),
            )
            .route(
                "/broadcasts/{id}",
                get(broadcasts::get_broadcast).patch(broadcasts::update_broadcast),
            )
            .route("/broadcasts/{id}/send", post(broadcasts::send_broadcast))
            .route(
                "/webhooks",
                get(webhooks::list_webhooks).post(webhooks::create_webhook),
            )
            .route(
                "/webhooks/{id}",
                axum::routing::delete(webhooks::delete_webhook),
            )
            .route(
                "/suppressions",
                get(suppressions::list_suppressions).post(suppressions::create_suppression),
            )
            .route(
                "/suppressions/{email}",
                axum::routing::delete(suppressions::delete_suppression),
            )
            .route("/metrics", get(suppressions::list_metrics));

        // tracking endpoints are public: the opaque link id is the secret
        let tracking = Router::new()
            .route("/open/{id}", get(tracking::track_open))
            .route("/click/{id}", get(tracking::track_click))
            .route("/unsubscribe/{id}", get(tracking::track_unsubscribe));

        let router = Router::new()
            .nest("/api", api)
            .merge(tracking)
            .layer((
                TraceLayer::new_for_http(),
                TimeoutLayer::new(Duration::from_secs(10)),
                DefaultBodyLimit::max(MAX_BODY_BYTES),
                tower::limit::GlobalConcurrencyLimitLayer::new(1024),
            ))
            .with_state(state);

        ApiServer {
            router,
            socket,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket)
            .await
            .map_err(ApiServerError::Bind)?;

        info!("API server listening on {}", self.socket);

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
        .await
        .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(e) = self.serve().await {
                error!("server error: {e:?}");
                token.cancel();
            }
        });
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}

#[derive(Debug, Serialize)]
struct HealthyResponse {
    healthy: bool,
    status: &'static str,
}

async fn healthy(State(pool): State<PgPool>) -> Json<HealthyResponse> {
    match sqlx::query("SELECT 1").execute(&pool).await {
        Ok(_) => Json(HealthyResponse {
            healthy: true,
            status: "OK",
        }),
        Err(e) => {
            error!("database error: {e:?}");

            Json(HealthyResponse {
                healthy: false,
                status: "database error",
            })
        }
    }
}
