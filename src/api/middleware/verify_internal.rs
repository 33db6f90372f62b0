use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::HeaderMap;
use http::header::AUTHORIZATION;

use super::{MiddlewareErr, MiddlewareResult};
use crate::api::server::{AppState, RouteError};
use crate::util::constant_time_cmp;

/// Gate for the admin routes. Without a configured token they are unreachable.
pub async fn verify_internal_ident(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, RouteError> {
    if let Err(err) = check_token(state.internal_token.as_deref(), req.headers()) {
        tracing::warn!(error = %err, uri = %req.uri(), "rejected internal request");
        return Err(err.into());
    }

    Ok(next.run(req).await)
}

fn check_token(expected: Option<&str>, headers: &HeaderMap) -> MiddlewareResult<()> {
    let expected = expected.ok_or(MiddlewareErr::InternalRoutesDisabled)?;

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(MiddlewareErr::MissingHeader("authorization"))?;
    let presented = presented.strip_prefix("Bearer ").unwrap_or(presented);

    if constant_time_cmp(presented, expected) {
        Ok(())
    } else {
        Err(MiddlewareErr::InvalidToken)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use http::HeaderValue;

    fn auth(value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn test_check_token() {
        assert!(check_token(Some("tok"), &auth("tok")).is_ok());
        assert!(check_token(Some("tok"), &auth("Bearer tok")).is_ok());

        assert!(matches!(
            check_token(Some("tok"), &auth("Bearer tok2")),
            Err(MiddlewareErr::InvalidToken)
        ));
        assert!(matches!(
            check_token(Some("tok"), &HeaderMap::new()),
            Err(MiddlewareErr::MissingHeader(_))
        ));
        assert!(matches!(
            check_token(None, &auth("tok")),
            Err(MiddlewareErr::InternalRoutesDisabled)
        ));
    }
}
