use std::sync::Arc;

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api::middleware::identity::CallerId;
use crate::api::middleware::verify_external::VerifiedBody;
use crate::api::server::{AppState, JsonResult, RouteError};
use crate::constants::LIVE_HEARTBEAT_SECONDS;
use crate::db::prelude::*;
use crate::engine::clock::Clock;
use crate::engine::dedup::Ingested;
use crate::engine::live::MatchFeed;

#[derive(Debug, Deserialize)]
pub struct SubmitPrediction {
    pub match_id: MatchId,
    pub round_id: RoundId,
    pub prediction: Outcome,
}

#[derive(Debug, Deserialize)]
pub struct CreateRound {
    pub id: RoundId,
    pub match_id: MatchId,
    pub open_at: DateTime<Utc>,
    pub lock_at: DateTime<Utc>,
    /// Defaults to `lock_at` plus the configured round duration
    pub finish_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct EventAck {
    pub applied: bool,
}

#[derive(Debug, Serialize)]
pub struct RoundStatus {
    pub round: Round,
    pub accepting_predictions: bool,
}

#[derive(Debug, Serialize)]
pub struct RoundTransition {
    pub round: Round,
    /// `false` when the round was already at or past the requested state
    pub transitioned: bool,
}

#[derive(Debug, Serialize)]
pub struct RebuildSummary {
    pub entries: usize,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Heartbeat {
    Ping,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
}

pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

#[instrument(skip(state))]
pub async fn submit_prediction(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    body: Result<Json<SubmitPrediction>, JsonRejection>,
) -> JsonResult<Prediction> {
    let Json(req) = body.map_err(|rejection| RouteError::InvalidBody(rejection.body_text()))?;

    let round = state.engine.rounds.round(&req.round_id).await?;
    if round.match_id != req.match_id {
        return Err(RouteError::MatchMismatch {
            round_id: round.id,
            requested: req.match_id,
            actual: round.match_id,
        });
    }

    let prediction = state
        .engine
        .submit(user_id, req.round_id, req.prediction)
        .await?;

    Ok(Json(prediction))
}

#[instrument(skip(state, body))]
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    body: VerifiedBody,
) -> JsonResult<EventAck> {
    let incoming: IncomingEvent = body
        .as_json()
        .map_err(|err| RouteError::MalformedEvent(err.to_string()))?;

    let applied = match &state.queue {
        Some(queue) => match state.engine.accept(incoming).await? {
            (Ingested::Applied(event), report) => {
                tracing::debug!(?report, seq = event.seq, "event accepted, forwarding to scoring");
                queue.enqueue(event).await;
                true
            }
            (Ingested::Replayed, _) => false,
        },
        None => state.engine.ingest(incoming).await?.applied,
    };

    Ok(Json(EventAck { applied }))
}

#[instrument(skip(state))]
pub async fn leaderboard(
    Query(param): Query<Pagination>,
    State(state): State<Arc<AppState>>,
) -> JsonResult<PaginatedResponse<LeaderboardEntry>> {
    Ok(Json(state.engine.leaderboard.page(&param).await?))
}

#[instrument(skip(state))]
pub async fn round_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> JsonResult<RoundStatus> {
    let round = state.engine.rounds.round(&id.into()).await?;
    let accepting_predictions = round.accepts_predictions_at(state.engine.clock().now());

    Ok(Json(RoundStatus {
        round,
        accepting_predictions,
    }))
}

#[instrument(skip(state))]
pub async fn create_round(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateRound>, JsonRejection>,
) -> Result<(StatusCode, Json<Round>), RouteError> {
    let Json(req) = body.map_err(|rejection| RouteError::InvalidBody(rejection.body_text()))?;
    let rounds = &state.engine.rounds;

    let round = match req.finish_at {
        Some(finish_at) => {
            let window = RoundWindow {
                open_at: req.open_at,
                lock_at: req.lock_at,
                finish_at,
            };
            rounds.open_round_with_window(req.id, req.match_id, window).await?
        }
        None => {
            rounds
                .open_round(req.id, req.match_id, req.open_at, req.lock_at)
                .await?
        }
    };

    Ok((StatusCode::CREATED, Json(round)))
}

#[instrument(skip(state))]
pub async fn lock_round(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> JsonResult<RoundTransition> {
    let round_id = RoundId::from(id);
    let transitioned = state.engine.lock_round(&round_id).await?;
    let round = state.engine.rounds.round(&round_id).await?;

    Ok(Json(RoundTransition {
        round,
        transitioned,
    }))
}

#[instrument(skip(state))]
pub async fn finish_round(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> JsonResult<RoundTransition> {
    let round_id = RoundId::from(id);
    let transitioned = state.engine.finish_round(&round_id).await?;
    let round = state.engine.rounds.round(&round_id).await?;

    Ok(Json(RoundTransition {
        round,
        transitioned,
    }))
}

#[instrument(skip(state))]
pub async fn rebuild_leaderboard(State(state): State<Arc<AppState>>) -> JsonResult<RebuildSummary> {
    let entries = state.engine.leaderboard.rebuild().await?;
    tracing::info!(entries, "leaderboard rebuilt on request");

    Ok(Json(RebuildSummary { entries }))
}

/// Streams the match's applied events and round transitions as JSON text frames
#[instrument(skip(state, ws))]
pub async fn match_feed(
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let feed = state.engine.live.subscribe(match_id.into());
    ws.on_upgrade(move |socket| stream_match(socket, feed))
}

async fn stream_match(mut socket: WebSocket, mut feed: MatchFeed) {
    let mut heartbeat = tokio::time::interval(Duration::from_secs(LIVE_HEARTBEAT_SECONDS));
    heartbeat.tick().await;

    tracing::debug!(match_id = %feed.match_id(), "live subscriber connected");

    loop {
        let frame = tokio::select! {
            update = feed.next() => match update {
                Some(update) => serde_json::to_string(&update),
                None => break,
            },
            _ = heartbeat.tick() => serde_json::to_string(&Heartbeat::Ping),
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };

        let text = match frame {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(error = %err, "unable to encode live update");
                continue;
            }
        };

        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }

    tracing::debug!(match_id = %feed.match_id(), "live subscriber disconnected");
}
