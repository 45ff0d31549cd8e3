//! Bearer-key check in front of every admin route.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::admin::AdminState;

pub async fn admin_auth_middleware(
    State(state): State<AdminState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    match bearer_key(&request) {
        Some(key) if key_matches(key, &state.api_key) => Ok(next.run(request).await),
        presented => {
            tracing::debug!(
                path = %request.uri().path(),
                key_present = presented.is_some(),
                "Admin request rejected"
            );
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn bearer_key(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Compare without short-circuiting on the first differing byte.
fn key_matches(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
