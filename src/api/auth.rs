use crate::{
    api::{ApiState, error::ApiError},
    models::{Team, TeamRepository},
};
use axum::extract::FromRequestParts;
use http::{header::AUTHORIZATION, request::Parts};

/// The authenticated tenant, resolved from a bearer API key. Every
/// team-scoped handler takes this extractor; the team id it carries is the
/// isolation boundary for all repository calls underneath.
pub struct ApiTeam(pub Team);

impl FromRequestParts<ApiState> for ApiTeam {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        let team = TeamRepository::new(state.pool.clone())
            .find_by_api_key(token)
            .await?
            .ok_or(ApiError::Unauthorized)?;

        Ok(ApiTeam(team))
    }
}
