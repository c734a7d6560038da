use crate::{
    api::{ApiState, auth::ApiTeam, error::{ApiError, ApiResult}, validation::ValidatedJson},
    models::{
        EmailMetrics, MetricPeriod, MetricsRepository, SuppressionEntry, SuppressionReason,
        SuppressionRepository,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{Duration, Utc};
use garde::Validate;
use serde::Deserialize;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSuppressionRequest {
    #[garde(email)]
    pub email: String,
    #[garde(length(max = 500))]
    pub details: Option<String>,
}

/// Operator-initiated entries always carry the `manual` reason; bounce and
/// complaint entries only ever come from the feedback loop.
pub async fn create_suppression(
    State(repo): State<SuppressionRepository>,
    ApiTeam(team): ApiTeam,
    ValidatedJson(request): ValidatedJson<CreateSuppressionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    repo.upsert(
        team.id,
        &request.email,
        SuppressionReason::Manual,
        request.details.as_deref(),
    )
    .await?;

    Ok(StatusCode::CREATED)
}

pub async fn list_suppressions(
    State(repo): State<SuppressionRepository>,
    ApiTeam(team): ApiTeam,
) -> ApiResult<Vec<SuppressionEntry>> {
    Ok(Json(repo.list(team.id).await?))
}

pub async fn delete_suppression(
    State(repo): State<SuppressionRepository>,
    ApiTeam(team): ApiTeam,
    Path(email): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if repo.remove(team.id, &email).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MetricsQuery {
    pub period: MetricPeriod,
    pub days: i64,
}

impl Default for MetricsQuery {
    fn default() -> Self {
        Self {
            period: MetricPeriod::Daily,
            days: 30,
        }
    }
}

pub async fn list_metrics(
    State(state): State<ApiState>,
    ApiTeam(team): ApiTeam,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Vec<EmailMetrics>> {
    let since = Utc::now() - Duration::days(query.days.clamp(1, 365));
    let metrics = MetricsRepository::new(state.pool.clone())
        .list(team.id, query.period, since)
        .await?;

    Ok(Json(metrics))
}
