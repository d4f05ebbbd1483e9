use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::{api_state::ApiState, error::ApiError};

/// Runners authenticate with a shared token rather than per-user API keys.
pub async fn runner_auth(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get("X-Runner-Token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Runner token required".to_string()))?;

    if state.config.runner_token.is_empty() || token != state.config.runner_token {
        return Err(ApiError::Unauthorized("Invalid runner token".to_string()));
    }

    Ok(next.run(request).await)
}
