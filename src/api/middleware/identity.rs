use axum::extract::FromRequestParts;
use http::request::Parts;

use crate::api::server::RouteError;
use crate::constants::USER_ID_HEADER;
use crate::db::prelude::UserId;

/// Caller identity, already authenticated upstream and forwarded in `X-User-Id`
#[derive(Debug, Clone)]
pub struct CallerId(pub UserId);

impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = RouteError;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CallerId(UserId::from(v)))
            .ok_or(RouteError::MissingIdentity)
    }
}
