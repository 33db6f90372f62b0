use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::HeaderMap;
use ring::hmac::{self, Key};

use super::{MiddlewareErr, MiddlewareResult};
use crate::api::server::{AppState, RouteError};
use crate::constants::{HMAC_PREFIX, PROVIDER_SIGNATURE_HEADER, PROVIDER_TIMESTAMP_HEADER};
use crate::util::constant_time_cmp;

/// Builds the provider webhook key from the shared secret
pub fn signing_key(secret: &str) -> Key {
    Key::new(hmac::HMAC_SHA256, secret.as_bytes())
}

/// `sha256=<hex>` signature of `timestamp || body`
pub fn sign(key: &Key, timestamp: &str, body: &[u8]) -> String {
    let message = rebuild_message(timestamp, body);
    format!("{}{}", HMAC_PREFIX, hex::encode(hmac::sign(key, &message)))
}

/// Request body that has been buffered (and, when a signing secret is configured, verified)
/// before the handler runs
#[derive(Clone)]
pub struct VerifiedBody(pub Bytes);

impl VerifiedBody {
    pub fn as_json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.0)
    }
}

pub async fn verify_provider_signature(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, RouteError> {
    let body = extract_body(&mut req, state.max_body_bytes).await?;

    if let Some(key) = &state.signing_key {
        if let Err(err) = verify_signature(key, req.headers(), &body) {
            tracing::warn!(error = %err, "unable to verify provider webhook signature");
            return Err(err.into());
        }
    }

    req.extensions_mut().insert(VerifiedBody(body));
    Ok(next.run(req).await)
}

async fn extract_body(request: &mut Request, limit: usize) -> MiddlewareResult<Bytes> {
    let body = std::mem::replace(request.body_mut(), Body::empty());
    Ok(axum::body::to_bytes(body, limit).await?)
}

fn verify_signature(key: &Key, headers: &HeaderMap, body: &Bytes) -> MiddlewareResult<()> {
    let (timestamp, extern_signature) = get_message_parts(headers)?;
    let expected_signature = sign(key, timestamp, body);

    if constant_time_cmp(extern_signature, &expected_signature) {
        return Ok(());
    }

    Err(MiddlewareErr::SignatureMismatch)
}

fn rebuild_message(ts: &str, body: &[u8]) -> Vec<u8> {
    let mut m = Vec::with_capacity(ts.len() + body.len());
    m.extend_from_slice(ts.as_bytes());
    m.extend_from_slice(body);

    m
}

fn get_message_parts(headers: &HeaderMap) -> MiddlewareResult<(&str, &str)> {
    let timestamp = headers
        .get(PROVIDER_TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(MiddlewareErr::MissingHeader(PROVIDER_TIMESTAMP_HEADER))?;

    let signature = headers
        .get(PROVIDER_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(MiddlewareErr::MissingHeader(PROVIDER_SIGNATURE_HEADER))?;

    Ok((timestamp, signature))
}

impl<S> FromRequest<S> for VerifiedBody
where
    S: Send + Sync,
{
    type Rejection = RouteError;

    async fn from_request(req: Request, _: &S) -> Result<Self, Self::Rejection> {
        req.extensions()
            .get::<VerifiedBody>()
            .cloned()
            .ok_or(RouteError::Internal(String::from(
                "request body was not buffered",
            )))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use http::HeaderValue;

    fn headers(ts: &str, sig: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(PROVIDER_TIMESTAMP_HEADER, HeaderValue::from_str(ts).unwrap());
        h.insert(PROVIDER_SIGNATURE_HEADER, HeaderValue::from_str(sig).unwrap());
        h
    }

    #[test]
    fn test_signature_roundtrip() {
        let key = signing_key("s3cret");
        let body = Bytes::from_static(br#"{"external_event_id":"ev-42"}"#);
        let sig = sign(&key, "1700000000", &body);

        assert!(sig.starts_with(HMAC_PREFIX));
        assert!(verify_signature(&key, &headers("1700000000", &sig), &body).is_ok());
    }

    #[test]
    fn test_signature_rejects_tampering() {
        let key = signing_key("s3cret");
        let body = Bytes::from_static(b"{}");
        let sig = sign(&key, "1700000000", &body);

        // timestamp is part of the signed message
        assert!(matches!(
            verify_signature(&key, &headers("1700000001", &sig), &body),
            Err(MiddlewareErr::SignatureMismatch)
        ));
        assert!(matches!(
            verify_signature(&key, &headers("1700000000", &sig), &Bytes::from_static(b"{ }")),
            Err(MiddlewareErr::SignatureMismatch)
        ));
        assert!(matches!(
            verify_signature(&signing_key("other"), &headers("1700000000", &sig), &body),
            Err(MiddlewareErr::SignatureMismatch)
        ));
    }

    #[test]
    fn test_missing_headers() {
        let key = signing_key("s3cret");
        let mut h = HeaderMap::new();
        h.insert(PROVIDER_TIMESTAMP_HEADER, HeaderValue::from_static("1"));

        assert!(matches!(
            verify_signature(&key, &h, &Bytes::new()),
            Err(MiddlewareErr::MissingHeader(PROVIDER_SIGNATURE_HEADER))
        ));
    }
}
