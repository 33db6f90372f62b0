use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, MatchedPath, Request};
use axum::middleware::{Next, from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use leaky_bucket::RateLimiter;
use ring::hmac::Key;
use serde::Serialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::handler::*;
use crate::api::middleware::verify_external::{signing_key, verify_provider_signature};
use crate::api::middleware::verify_internal::verify_internal_ident;
use crate::api::middleware::{self, MiddlewareErr};
use crate::db::prelude::*;
use crate::engine::pipeline::ScoringQueue;
use crate::engine::{Engine, EngineError};
use crate::util::env::Env;

pub type JsonResult<T> = core::result::Result<Json<T>, RouteError>;

pub struct AppState {
    pub engine: Engine,
    /// Applied events are handed to the scoring workers when present, scored inline otherwise
    pub queue: Option<ScoringQueue>,
    pub limiter: Option<RateLimiter>,
    pub internal_token: Option<String>,
    pub signing_key: Option<Key>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(engine: Engine, queue: Option<ScoringQueue>, env: &Env) -> Self {
        let limiter = (env.api_rate_limit > 0).then(|| {
            RateLimiter::builder()
                .max(env.api_rate_limit)
                .initial(env.api_rate_limit)
                .refill(env.api_rate_limit)
                .interval(Duration::from_secs(1))
                .build()
        });

        if env.internal_token().is_none() {
            tracing::warn!("INTERNAL_TOKEN is not set, admin routes will reject every request");
        }

        Self {
            engine,
            queue,
            limiter,
            internal_token: env.internal_token().map(str::to_string),
            signing_key: env.provider_signing_secret().map(signing_key),
            max_body_bytes: env.max_body_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
    pub cors_allow_origins: String,
}

impl From<&Env> for ApiConfig {
    fn from(env: &Env) -> Self {
        Self {
            port: env.server_api_port,
            cors_allow_origins: env.cors_allow_origins.clone(),
        }
    }
}

pub fn router(state: Arc<AppState>, cors_allowed: &str) -> Router {
    //
    // provider webhook
    let external_post_routes = Router::new()
        .route("/events", post(ingest_event))
        .route_layer(from_fn_with_state(state.clone(), verify_provider_signature));

    //
    // operator routes
    let internal_post_routes = Router::new()
        .route("/rounds", post(create_round))
        .route("/rounds/{id}/lock", post(lock_round))
        .route("/rounds/{id}/finish", post(finish_round))
        .route("/leaderboard/rebuild", post(rebuild_leaderboard))
        .route_layer(from_fn_with_state(state.clone(), verify_internal_ident));

    Router::new()
        .merge(external_post_routes)
        .merge(internal_post_routes)
        .route("/health", get(health))
        .route("/predictions", post(submit_prediction))
        .route("/leaderboard", get(leaderboard))
        .route("/rounds/{id}", get(round_status))
        .route("/ws/matches/{id}", get(match_feed))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(from_fn(middleware::security_headers))
        .layer(middleware::cors(cors_allowed))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let method = req.method();
                let uri = req.uri();

                let matched_path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|matched| matched.as_str());

                tracing::debug_span!("api_request", ?method, ?uri, ?matched_path)
            }),
        )
        .layer(from_fn(log_route_errors))
        .with_state(state)
}

/// Binds the API port and serves until `shutdown` resolves, letting in-flight requests finish
pub async fn serve<F>(state: Arc<AppState>, config: &ApiConfig, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state, &config.cors_allow_origins);

    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    let local = listener.local_addr()?;

    tracing::info!(
        server_url = &format!("http://127.0.0.1:{}", local.port()),
        "server ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Logs server-class `RouteError`s, which carry themselves as a response extension
#[instrument(skip(request, next), fields(uri = request.uri().to_string()))]
async fn log_route_errors(request: Request, next: Next) -> Response {
    let res = next.run(request).await;
    if let Some(err) = res.extensions().get::<Arc<RouteError>>() {
        tracing::error!(error = ?err, "error occurred inside route handler");
    }

    res
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Middleware(#[from] MiddlewareErr),

    #[error("round '{round_id}' belongs to match '{actual}', not '{requested}'")]
    MatchMismatch {
        round_id: RoundId,
        requested: MatchId,
        actual: MatchId,
    },

    #[error("missing or empty caller identity header")]
    MissingIdentity,

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("{0}")]
    Internal(String),

    #[error("rate limit exceeded")]
    RateLimited,
}

impl RouteError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            RouteError::Engine(err) => match err {
                EngineError::DuplicatePrediction { .. } => {
                    (StatusCode::CONFLICT, "DUPLICATE_PREDICTION")
                }
                EngineError::RoundLocked(_) => (StatusCode::LOCKED, "ROUND_LOCKED"),
                EngineError::UnknownRound(_) => (StatusCode::NOT_FOUND, "UNKNOWN_ROUND"),
                EngineError::DuplicateRound(_) => (StatusCode::CONFLICT, "DUPLICATE_ROUND"),
                EngineError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, "INVALID_TRANSITION")
                }
                EngineError::InvalidSchedule { .. } => {
                    (StatusCode::BAD_REQUEST, "INVALID_SCHEDULE")
                }
                EngineError::MalformedEvent(_) => (StatusCode::BAD_REQUEST, "MALFORMED_EVENT"),
                EngineError::RoundStillOpen(_) => (StatusCode::CONFLICT, "ROUND_STILL_OPEN"),
                EngineError::StorageUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
                }
            },
            RouteError::Middleware(err) => {
                let status = err.status();
                let code = match err {
                    MiddlewareErr::SignatureMismatch => "INVALID_SIGNATURE",
                    MiddlewareErr::Body(_) => "BODY_TOO_LARGE",
                    _ => "UNAUTHENTICATED",
                };
                (status, code)
            }
            RouteError::MatchMismatch { .. } => (StatusCode::BAD_REQUEST, "MATCH_MISMATCH"),
            RouteError::MissingIdentity => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            RouteError::InvalidBody(_) => (StatusCode::BAD_REQUEST, "INVALID_BODY"),
            RouteError::MalformedEvent(_) => (StatusCode::BAD_REQUEST, "MALFORMED_EVENT"),
            RouteError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
            RouteError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            code: &'static str,
            message: String,
        }

        let (status, code) = self.status_and_code();
        let message = self.to_string();

        let mut response = (status, Json(ErrorResponse { code, message })).into_response();

        // client-class outcomes are normal control flow and stay out of the error log
        if status.is_server_error() {
            response.extensions_mut().insert(Arc::new(self));
        }

        response
    }
}

#[cfg(test)]
mod test {
    use axum::body::Body;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use http::header::{AUTHORIZATION, CONTENT_TYPE};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::api::middleware::verify_external::sign;
    use crate::constants::{PROVIDER_SIGNATURE_HEADER, PROVIDER_TIMESTAMP_HEADER, USER_ID_HEADER};
    use crate::engine::EngineSettings;
    use crate::engine::clock::{Clock, ManualClock};

    const TOKEN: &str = "internal-test-token";

    struct Harness {
        app: Router,
        engine: Engine,
        clock: Arc<ManualClock>,
    }

    fn harness_with(env: Env) -> Harness {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let engine = Engine::in_memory(clock.clone(), EngineSettings::default());
        let state = Arc::new(AppState::new(engine.clone(), None, &env));

        Harness {
            app: router(state, &env.cors_allow_origins),
            engine,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(Env {
            internal_token: Some(TOKEN.to_string()),
            ..Default::default()
        })
    }

    async fn send(app: &Router, req: http::Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        (status, body)
    }

    fn post_json(uri: &str) -> http::request::Builder {
        http::Request::post(uri).header(CONTENT_TYPE, "application/json")
    }

    fn predict(user: &str, body: Value) -> http::Request<Body> {
        post_json("/predictions")
            .header(USER_ID_HEADER, user)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn event(body: Value) -> http::Request<Body> {
        post_json("/events")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn admin(uri: &str, body: Value) -> http::Request<Body> {
        post_json(uri)
            .header(AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn open_round(h: &Harness, id: &str) {
        let now = h.clock.now();
        h.engine
            .rounds
            .open_round(id.into(), "m-1".into(), now, now + ChronoDuration::seconds(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_sets_security_headers() {
        let h = harness();
        let res = h
            .app
            .clone()
            .oneshot(http::Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-content-type-options"], "nosniff");
        assert_eq!(res.headers()["x-frame-options"], "DENY");
    }

    #[tokio::test]
    async fn test_prediction_status_codes() {
        let h = harness();
        open_round(&h, "r-1").await;

        let body = json!({ "match_id": "m-1", "round_id": "r-1", "prediction": "goal" });

        let (status, created) = send(&h.app, predict("u-1", body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["user_id"], "u-1");
        assert_eq!(created["outcome"], "goal");

        let (status, err) = send(&h.app, predict("u-1", body.clone())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["code"], "DUPLICATE_PREDICTION");

        let unknown = json!({ "match_id": "m-1", "round_id": "r-404", "prediction": "goal" });
        let (status, err) = send(&h.app, predict("u-2", unknown)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["code"], "UNKNOWN_ROUND");

        let mismatch = json!({ "match_id": "m-2", "round_id": "r-1", "prediction": "goal" });
        let (status, err) = send(&h.app, predict("u-2", mismatch)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "MATCH_MISMATCH");

        let bad = json!({ "match_id": "m-1", "round_id": "r-1", "prediction": "penalty" });
        let (status, err) = send(&h.app, predict("u-2", bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "INVALID_BODY");

        let anonymous = http::Request::post("/predictions")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, err) = send(&h.app, anonymous).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(err["code"], "UNAUTHENTICATED");

        h.clock.advance(ChronoDuration::seconds(11));
        let (status, err) = send(&h.app, predict("u-3", body)).await;
        assert_eq!(status, StatusCode::LOCKED);
        assert_eq!(err["code"], "ROUND_LOCKED");
    }

    #[tokio::test]
    async fn test_event_replay_reports_applied_once() {
        let h = harness();
        let ev = json!({
            "external_event_id": "ev-42",
            "provider": "acme",
            "match_id": "m-1",
            "event_type": "corner",
            "minute": 12
        });

        let (status, first) = send(&h.app, event(ev.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["applied"], true);

        let (status, second) = send(&h.app, event(ev)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["applied"], false);

        let (status, err) = send(&h.app, event(json!({ "provider": "acme" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "MALFORMED_EVENT");

        let garbage = http::Request::post("/events")
            .body(Body::from("not json"))
            .unwrap();
        let (status, err) = send(&h.app, garbage).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "MALFORMED_EVENT");
    }

    #[tokio::test]
    async fn test_signed_events() {
        let h = harness_with(Env {
            provider_signing_secret: Some("hook-secret".to_string()),
            ..Default::default()
        });
        let body = json!({
            "external_event_id": "ev-1",
            "provider": "acme",
            "match_id": "m-1",
            "event_type": "goal"
        })
        .to_string();
        let signature = sign(&signing_key("hook-secret"), "1700000000", body.as_bytes());

        let unsigned = http::Request::post("/events")
            .body(Body::from(body.clone()))
            .unwrap();
        let (status, err) = send(&h.app, unsigned).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(err["code"], "UNAUTHENTICATED");

        let forged = http::Request::post("/events")
            .header(PROVIDER_TIMESTAMP_HEADER, "1700000001")
            .header(PROVIDER_SIGNATURE_HEADER, &signature)
            .body(Body::from(body.clone()))
            .unwrap();
        let (status, err) = send(&h.app, forged).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(err["code"], "INVALID_SIGNATURE");

        let signed = http::Request::post("/events")
            .header(PROVIDER_TIMESTAMP_HEADER, "1700000000")
            .header(PROVIDER_SIGNATURE_HEADER, &signature)
            .body(Body::from(body))
            .unwrap();
        let (status, ok) = send(&h.app, signed).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ok["applied"], true);
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let h = harness();
        let body = json!({
            "id": "r-9",
            "match_id": "m-1",
            "open_at": "2023-11-14T22:13:20Z",
            "lock_at": "2023-11-14T22:14:20Z"
        });

        let anonymous = http::Request::post("/rounds")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _) = send(&h.app, anonymous).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, round) = send(&h.app, admin("/rounds", body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(round["state"], "open");
        assert_eq!(round["finish_at"], "2023-11-14T22:17:20Z");

        let (status, err) = send(&h.app, admin("/rounds", body.clone())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["code"], "DUPLICATE_ROUND");

        let mut changed = body.clone();
        changed["match_id"] = json!("m-2");
        let (status, err) = send(&h.app, admin("/rounds", changed)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["code"], "DUPLICATE_ROUND");

        let backwards = json!({
            "id": "r-10",
            "match_id": "m-1",
            "open_at": "2023-11-14T22:14:20Z",
            "lock_at": "2023-11-14T22:13:20Z"
        });
        let (status, err) = send(&h.app, admin("/rounds", backwards)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "INVALID_SCHEDULE");

        let (status, locked) = send(&h.app, admin("/rounds/r-9/lock", Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(locked["transitioned"], true);
        assert_eq!(locked["round"]["state"], "locked");

        let (status, again) = send(&h.app, admin("/rounds/r-9/lock", Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["transitioned"], false);

        let (status, finished) = send(&h.app, admin("/rounds/r-9/finish", Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(finished["round"]["state"], "finished");

        let (status, err) = send(&h.app, admin("/rounds/r-404/lock", Value::Null)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["code"], "INVALID_TRANSITION");

        let (status, rebuilt) = send(&h.app, admin("/leaderboard/rebuild", Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rebuilt["entries"], 0);
    }

    #[tokio::test]
    async fn test_round_status_and_leaderboard() {
        let h = harness();
        open_round(&h, "r-1").await;

        h.engine
            .submit("u-1".into(), "r-1".into(), Outcome::Corner)
            .await
            .unwrap();

        let status_req = http::Request::get("/rounds/r-1").body(Body::empty()).unwrap();
        let (status, body) = send(&h.app, status_req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepting_predictions"], true);
        assert_eq!(body["round"]["id"], "r-1");

        let missing = http::Request::get("/rounds/r-404").body(Body::empty()).unwrap();
        let (status, _) = send(&h.app, missing).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.clock.advance(ChronoDuration::seconds(10));
        h.engine.lock_round(&"r-1".into()).await.unwrap();
        h.clock.advance(ChronoDuration::seconds(1));
        h.engine
            .ingest(IncomingEvent {
                external_event_id: Some("ev-1".into()),
                provider: Some("acme".into()),
                match_id: Some("m-1".into()),
                event_type: Some("corner".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let board = http::Request::get("/leaderboard?limit=10&page=0")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&h.app, board).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_items"], 1);
        assert_eq!(body["items"][0]["user_id"], "u-1");
        assert_eq!(body["items"][0]["total_points"], 20);
        assert_eq!(body["items"][0]["accuracy"], 100.0);
    }

    #[tokio::test]
    async fn test_leaderboard_far_page_is_empty() {
        let h = harness();
        let req = http::Request::get(format!("/leaderboard?limit=500&page={}", i64::MAX))
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"], json!([]));
        assert_eq!(body["page"], i64::MAX);
    }

    #[tokio::test]
    async fn test_match_feed_over_websocket() {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let h = harness();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = h.app.clone();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/matches/m-1"))
            .await
            .unwrap();

        open_round(&h, "r-1").await;
        for (id, match_id) in [("ev-other", "m-2"), ("ev-1", "m-1")] {
            h.engine
                .ingest(IncomingEvent {
                    external_event_id: Some(id.into()),
                    provider: Some("acme".into()),
                    match_id: Some(match_id.into()),
                    event_type: Some("corner".into()),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let mut frames = Vec::new();
        while frames.len() < 2 {
            let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                frames.push(serde_json::from_str::<Value>(text.as_str()).unwrap());
            }
        }

        assert_eq!(frames[0]["type"], "round");
        assert_eq!(frames[0]["round"]["id"], "r-1");
        assert_eq!(frames[1]["type"], "event");
        assert_eq!(frames[1]["event"]["external_event_id"], "ev-1");
        assert_eq!(frames[1]["event"]["kind"], "corner");

        socket.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_when_bucket_is_empty() {
        let h = harness_with(Env {
            api_rate_limit: 2,
            ..Default::default()
        });

        for _ in 0..2 {
            let req = http::Request::get("/health").body(Body::empty()).unwrap();
            let (status, _) = send(&h.app, req).await;
            assert_eq!(status, StatusCode::OK);
        }

        let req = http::Request::get("/health").body(Body::empty()).unwrap();
        let (status, err) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn test_oversized_event_body() {
        let h = harness_with(Env {
            max_body_bytes: 64,
            ..Default::default()
        });

        let big = json!({ "payload": "x".repeat(256) });
        let (status, err) = send(&h.app, event(big)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err["code"], "BODY_TOO_LARGE");
    }
}
