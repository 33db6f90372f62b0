//! Storage seams of the engine.
//!
//! Every method here is a single atomic unit: implementations must never let a concurrent
//! caller observe one of these operations half-applied. Both [`MemoryStore`] and [`PgStore`]
//! implement every trait.
//!
//! [`MemoryStore`]: crate::db::memory::MemoryStore
//! [`PgStore`]: crate::db::repositories::PgStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::db::StoreResult;
use crate::db::models::event::{MatchEvent, NewEvent};
use crate::db::models::leaderboard::{LeaderboardEntry, ScoreDelta};
use crate::db::models::prediction::{Prediction, UserId};
use crate::db::models::round::{MatchId, Round, RoundId, RoundState};

/// Result of a compare-and-swap on a round's state
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// This call moved the round into the requested state
    Applied(Round),
    /// The round was not in the required predecessor state; returned as it currently is
    Unchanged(Round),
    Missing,
}

/// Result of the combined openness-check-and-insert
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted(Prediction),
    /// An entry for the (user, round) pair already exists; carries that entry
    Duplicate(Prediction),
    /// The round does not accept predictions. `state` may still be `Open` when only the
    /// lock deadline has passed.
    Closed { state: RoundState },
    UnknownRound,
}

#[async_trait]
pub trait RoundStore: Send + Sync {
    /// Inserts a new round, returning `false` if the id is already taken
    async fn insert_round(&self, round: &Round) -> StoreResult<bool>;

    async fn get_round(&self, id: &RoundId) -> StoreResult<Option<Round>>;

    async fn rounds_for_match(&self, match_id: &MatchId) -> StoreResult<Vec<Round>>;

    async fn rounds_in_state(&self, state: RoundState) -> StoreResult<Vec<Round>>;

    /// Moves the round to `to` only if it currently sits in `to.predecessor()`
    async fn transition(
        &self,
        id: &RoundId,
        to: RoundState,
        at: DateTime<Utc>,
    ) -> StoreResult<Transition>;
}

#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Checks that the round is open and `now` is before its lock deadline, then inserts the
    /// prediction unless the (user, round) pair already has one. Serialized against
    /// [`RoundStore::transition`] for the same round.
    async fn insert_if_open(
        &self,
        prediction: &Prediction,
        now: DateTime<Utc>,
    ) -> StoreResult<SubmitOutcome>;

    async fn get_prediction(
        &self,
        user_id: &UserId,
        round_id: &RoundId,
    ) -> StoreResult<Option<Prediction>>;

    async fn predictions_for_round(&self, round_id: &RoundId) -> StoreResult<Vec<Prediction>>;

    async fn unscored_for_round(&self, round_id: &RoundId) -> StoreResult<Vec<Prediction>>;

    /// Rounds past `open` that still hold at least one unscored prediction
    async fn rounds_awaiting_score(&self) -> StoreResult<Vec<RoundId>>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert-or-ignore on `(external_event_id, provider)`. Returns the stored event on
    /// first sight, `None` on a replay. Events of one match become visible in the same order
    /// their `(received_at, seq)` keys sort.
    async fn insert_if_absent(
        &self,
        event: NewEvent,
        received_at: DateTime<Utc>,
    ) -> StoreResult<Option<MatchEvent>>;

    /// The stored copy of an event, looked up by its dedup key
    async fn find_event(
        &self,
        external_event_id: &str,
        provider: &str,
    ) -> StoreResult<Option<MatchEvent>>;

    /// All events for a match in receipt order
    async fn events_for_match(&self, match_id: &MatchId) -> StoreResult<Vec<MatchEvent>>;
}

#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Marks the referenced prediction as scored, appends the delta and folds it into the
    /// user's leaderboard entry in one step. Returns `None` if the prediction was already
    /// scored (or no longer exists), in which case nothing changes.
    async fn commit_delta(&self, delta: &ScoreDelta) -> StoreResult<Option<LeaderboardEntry>>;

    async fn deltas_for_user(&self, user_id: &UserId) -> StoreResult<Vec<ScoreDelta>>;

    async fn leaderboard_entry(&self, user_id: &UserId) -> StoreResult<Option<LeaderboardEntry>>;

    /// A single ordered page plus the total number of entries
    async fn leaderboard_page(
        &self,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<LeaderboardEntry>, i64)>;

    /// Lazily yields every entry in leaderboard order
    fn leaderboard_stream(&self) -> BoxStream<'_, StoreResult<LeaderboardEntry>>;

    /// Replaces every entry with one recomputed from the delta history; returns the number
    /// of entries written
    async fn rebuild_leaderboard(&self) -> StoreResult<usize>;
}

/// Everything the engine needs from a backend
pub trait Store: RoundStore + PredictionStore + EventStore + ScoreStore {}

impl<T> Store for T where T: RoundStore + PredictionStore + EventStore + ScoreStore {}
