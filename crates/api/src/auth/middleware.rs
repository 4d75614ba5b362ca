//! Bearer-token middleware for staff and scheduler endpoints

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid token")]
    InvalidToken,
    /// The server has no secret for this surface, so nothing can authenticate
    #[error("Authentication not configured")]
    NotConfigured,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingAuth => "Authentication required",
            AuthError::InvalidAuthFormat => "Invalid authentication format",
            AuthError::InvalidToken | AuthError::NotConfigured => "Invalid or expired token",
        };
        let status = StatusCode::UNAUTHORIZED;
        let body = Json(json!({
            "error": "unauthorized",
            "message": message,
        }));
        (status, body).into_response()
    }
}

/// Extract a bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Result<&str, AuthError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthFormat)?;
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::InvalidAuthFormat)
}

/// Constant-time comparison so response timing does not reveal the secret
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn check(request: &Request, expected: Option<&str>) -> Result<(), AuthError> {
    let presented = extract_bearer_token(request)?;
    let expected = expected.ok_or(AuthError::NotConfigured)?;
    if tokens_match(presented, expected) {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}

/// Middleware for `/api/cron/*`; rejects before any job work starts
pub async fn require_cron_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match check(&request, state.config.cron_secret.as_deref()) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            tracing::warn!(
                path = %request.uri().path(),
                error = %err,
                security_event = true,
                "Cron request rejected"
            );
            err.into_response()
        }
    }
}

/// Middleware for staff endpoints (POS, pass redemption, admin)
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match check(&request, state.config.admin_api_token.as_deref()) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            tracing::warn!(
                path = %request.uri().path(),
                error = %err,
                security_event = true,
                "Admin request rejected"
            );
            err.into_response()
        }
    }
}
