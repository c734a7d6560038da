use crate::{
    api::{ApiState, auth::ApiTeam, error::{ApiError, ApiResult}, validation::ValidatedJson},
    models::{Domain, DomainDnsRecord, DomainId, DomainRepository, NewDomain, TlsPolicy},
    queue::{TaskKind, VerifyPayload},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use garde::Validate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDomainRequest {
    #[garde(length(min = 3, max = 253), pattern(r"^[A-Za-z0-9][A-Za-z0-9.-]+[A-Za-z0-9]$"))]
    pub name: String,
    #[serde(default)]
    #[garde(skip)]
    pub tls_policy: TlsPolicy,
}

#[derive(Debug, Serialize)]
pub struct DomainResponse {
    #[serde(flatten)]
    pub domain: Domain,
    pub dns_records: Vec<DomainDnsRecord>,
}

/// Creates the domain pending with a fresh keypair and immediately queues
/// its first verification run. The response carries the DNS records the
/// tenant has to publish.
pub async fn create_domain(
    State(state): State<ApiState>,
    ApiTeam(team): ApiTeam,
    ValidatedJson(request): ValidatedJson<CreateDomainRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let repo = DomainRepository::new(state.pool.clone());

    let domain = repo
        .create(
            team.id,
            &NewDomain {
                name: request.name.to_lowercase(),
                tls_policy: request.tls_policy,
            },
            &state.domain_settings,
            &state.vault,
        )
        .await?;

    state
        .queue
        .enqueue(
            TaskKind::DomainVerify,
            &VerifyPayload {
                team_id: team.id,
                domain_id: domain.id,
            },
        )
        .await?;

    let dns_records = repo.records(domain.id).await?;

    Ok((
        StatusCode::CREATED,
        Json(DomainResponse {
            domain,
            dns_records,
        }),
    ))
}

pub async fn list_domains(
    State(repo): State<DomainRepository>,
    ApiTeam(team): ApiTeam,
) -> ApiResult<Vec<Domain>> {
    Ok(Json(repo.list(team.id).await?))
}

pub async fn get_domain(
    State(repo): State<DomainRepository>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<DomainId>,
) -> ApiResult<DomainResponse> {
    let domain = repo.get(team.id, id).await?;
    let dns_records = repo.records(domain.id).await?;

    Ok(Json(DomainResponse {
        domain,
        dns_records,
    }))
}

/// Re-verification may be requested at any time.
pub async fn verify_domain(
    State(state): State<ApiState>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<DomainId>,
) -> Result<impl IntoResponse, ApiError> {
    let repo = DomainRepository::new(state.pool.clone());
    let domain = repo.get(team.id, id).await?;

    state
        .queue
        .enqueue(
            TaskKind::DomainVerify,
            &VerifyPayload {
                team_id: team.id,
                domain_id: domain.id,
            },
        )
        .await?;

    Ok(StatusCode::ACCEPTED)
}

pub async fn delete_domain(
    State(repo): State<DomainRepository>,
    ApiTeam(team): ApiTeam,
    Path(id): Path<DomainId>,
) -> Result<impl IntoResponse, ApiError> {
    repo.remove(team.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
