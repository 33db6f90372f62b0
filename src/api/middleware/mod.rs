pub mod identity;
pub mod verify_external;
pub mod verify_internal;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::header::{REFERRER_POLICY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS};
use http::request::Parts as ReqParts;
use http::{HeaderValue, Method, StatusCode};
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::api::server::{AppState, RouteError};

pub type MiddlewareResult<T> = core::result::Result<T, MiddlewareErr>;

#[derive(Debug, Error)]
pub enum MiddlewareErr {
    #[error("missing or unreadable header '{0}'")]
    MissingHeader(&'static str),

    #[error("signature does not match request body")]
    SignatureMismatch,

    #[error("invalid authorization token")]
    InvalidToken,

    #[error("internal routes are disabled: no token configured")]
    InternalRoutesDisabled,

    #[error("unable to read request body: {0}")]
    Body(#[from] axum::Error),
}

impl MiddlewareErr {
    pub fn status(&self) -> StatusCode {
        match self {
            MiddlewareErr::MissingHeader(_) => StatusCode::UNAUTHORIZED,
            MiddlewareErr::SignatureMismatch => StatusCode::FORBIDDEN,
            MiddlewareErr::InvalidToken => StatusCode::UNAUTHORIZED,
            MiddlewareErr::InternalRoutesDisabled => StatusCode::UNAUTHORIZED,
            MiddlewareErr::Body(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// `*` allows any origin; otherwise a comma-separated list of origin suffixes
pub fn cors(cors_allowed: &str) -> CorsLayer {
    let allowed = if cors_allowed.trim() == "*" {
        AllowOrigin::any()
    } else {
        let suffixes: Vec<String> = cors_allowed
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        AllowOrigin::predicate(move |org: &HeaderValue, _: &ReqParts| {
            suffixes
                .iter()
                .any(|suffix| org.as_bytes().ends_with(suffix.as_bytes()))
        })
    };

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(allowed)
}

pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    let headers = res.headers_mut();

    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(REFERRER_POLICY, HeaderValue::from_static("no-referrer"));

    res
}

/// Global token bucket shared by every route; a request that finds it empty is turned away
/// instead of queued
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, RouteError> {
    if let Some(limiter) = &state.limiter {
        if !limiter.try_acquire(1) {
            return Err(RouteError::RateLimited);
        }
    }

    Ok(next.run(req).await)
}
