use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::admin::AdminState;

/// Require `Authorization: Bearer <api_key>`. An empty key locks the API.
pub async fn admin_auth_middleware(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if !state.api_key.is_empty() && token == &*state.api_key => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::debug!(path = %request.uri().path(), "Admin request rejected");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
