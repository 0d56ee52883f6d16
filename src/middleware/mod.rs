// Authentication and CORS middleware

use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::routes::AppState;

/// Authentication middleware
///
/// Accepts the control key as "Bearer {CONTROL_API_KEY}" in the
/// Authorization header or bare in x-api-key.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers();
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    let authorized = [bearer, api_key]
        .into_iter()
        .flatten()
        .any(|presented| keys_match(presented, &state.control_api_key));

    if authorized {
        return Ok(next.run(request).await);
    }

    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    tracing::warn!(
        "[{}] Control API call with invalid or missing key: {} {}",
        request_id,
        request.method(),
        request.uri().path()
    );
    Err(ApiError::AuthError(
        "Invalid or missing control key".to_string(),
    ))
}

/// Compare keys without leaking the matching prefix length through timing
fn keys_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Create CORS middleware layer
///
/// Allows all origins, methods, and headers.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
