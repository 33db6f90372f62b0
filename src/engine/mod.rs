//! Round lifecycle and live scoring.
//!
//! [`Engine`] wires the five components together over one shared [`Store`]:
//! the [`RoundRegistry`] owns round state, the [`PredictionLedger`] gates submissions on it,
//! the [`EventDeduplicator`] filters provider replays, the [`ScoringEngine`] settles rounds
//! and the [`LeaderboardAggregator`] folds the resulting deltas. Applied events and round
//! transitions are also pushed to the per-match [`LiveFeed`].

use std::sync::Arc;

use chrono::Duration;
use thiserror::Error;
use tracing::instrument;

use crate::constants::{LIVE_FEED_CAPACITY, ROUND_SECONDS};
use crate::db::memory::MemoryStore;
use crate::db::prelude::*;
use crate::util::env::Env;
use crate::util::retry::RetryPolicy;

pub mod clock;
pub mod dedup;
pub mod leaderboard;
pub mod ledger;
pub mod live;
pub mod pipeline;
pub mod rounds;
pub mod scheduler;
pub mod scoring;


use clock::{Clock, SystemClock};
use dedup::{EventDeduplicator, Ingested};
use leaderboard::LeaderboardAggregator;
use ledger::PredictionLedger;
use live::{LiveFeed, LiveUpdate};
use rounds::RoundRegistry;
use scoring::{ScoreReport, ScoringEngine, ScoringPolicy};

pub type EngineResult<T> = core::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("user '{user_id}' already has a prediction for round '{round_id}'")]
    DuplicatePrediction { user_id: UserId, round_id: RoundId },

    #[error("round '{0}' is locked")]
    RoundLocked(RoundId),

    #[error("round '{0}' does not exist")]
    UnknownRound(RoundId),

    #[error("round '{0}' already exists")]
    DuplicateRound(RoundId),

    #[error("round '{round_id}' cannot move to {to}")]
    InvalidTransition { round_id: RoundId, to: RoundState },

    #[error("round '{round_id}' needs open_at <= lock_at <= finish_at")]
    InvalidSchedule { round_id: RoundId },

    #[error("malformed event: missing or blank '{0}'")]
    MalformedEvent(&'static str),

    #[error("round '{0}' is still open")]
    RoundStillOpen(RoundId),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
}

impl EngineError {
    /// Whether the caller may reasonably try the same request again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StorageUnavailable(err) if err.is_transient())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub round_duration: Duration,
    pub scoring: ScoringPolicy,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            round_duration: Duration::seconds(ROUND_SECONDS as i64),
            scoring: ScoringPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Env> for EngineSettings {
    fn from(env: &Env) -> Self {
        Self {
            round_duration: Duration::seconds(env.round_duration_secs.min(i64::MAX as u64) as i64),
            scoring: ScoringPolicy {
                base_points: env.scoring_base_points,
            },
            retry: RetryPolicy::with_attempts(env.storage_retry_attempts),
        }
    }
}

/// Result of pushing one provider event through dedup, lifecycle handling and scoring
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub applied: bool,
    pub rounds_locked: usize,
    pub rounds_finished: usize,
    pub scored: ScoreReport,
}

/// What one scheduler pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub locked: usize,
    pub finished: usize,
    pub scored: ScoreReport,
    pub failures: usize,
}

#[derive(Clone)]
pub struct Engine {
    pub rounds: RoundRegistry,
    pub ledger: PredictionLedger,
    pub dedup: EventDeduplicator,
    pub scoring: ScoringEngine,
    pub leaderboard: LeaderboardAggregator,
    pub live: LiveFeed,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, settings: EngineSettings) -> Self {
        let retry = settings.retry;
        let live = LiveFeed::new(LIVE_FEED_CAPACITY);

        let rounds = RoundRegistry::new(
            store.clone(),
            clock.clone(),
            live.clone(),
            settings.round_duration,
            retry,
        );
        let ledger = PredictionLedger::new(store.clone(), clock.clone(), rounds.clone(), retry);
        let dedup = EventDeduplicator::new(store.clone(), clock.clone(), retry);
        let leaderboard = LeaderboardAggregator::new(store.clone(), retry);
        let scoring = ScoringEngine::new(
            store,
            clock.clone(),
            dedup.clone(),
            leaderboard.clone(),
            settings.scoring,
            retry,
        );

        Self {
            rounds,
            ledger,
            dedup,
            scoring,
            leaderboard,
            live,
            clock,
        }
    }

    /// Engine over a fresh [`MemoryStore`]
    pub fn in_memory(clock: Arc<dyn Clock>, settings: EngineSettings) -> Self {
        Self::new(Arc::new(MemoryStore::new()), clock, settings)
    }

    pub fn system(store: Arc<dyn Store>, settings: EngineSettings) -> Self {
        Self::new(store, Arc::new(SystemClock), settings)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Dedups the event and applies its lifecycle effects. Scoring is left to the caller
    /// (inline via [`Engine::score`] or through the worker queue).
    ///
    /// Lifecycle effects are compare-and-swaps, so a replayed kickoff or full time applies
    /// them again. A delivery that failed after the dedup insert is completed by the retry.
    #[instrument(skip(self, incoming), fields(event = ?incoming.external_event_id, provider = ?incoming.provider))]
    pub async fn accept(&self, incoming: IncomingEvent) -> EngineResult<(Ingested, IngestReport)> {
        let event = incoming.validate().map_err(EngineError::MalformedEvent)?;
        let lifecycle = event.kind.drives_lifecycle();

        let ingested = self.dedup.ingest(event.clone()).await?;
        let mut report = IngestReport {
            applied: ingested.applied(),
            ..Default::default()
        };

        match &ingested {
            Ingested::Applied(stored) => {
                self.live.publish(LiveUpdate::Event {
                    event: stored.clone(),
                });
                self.apply_lifecycle(stored, &mut report).await?;
            }
            Ingested::Replayed if lifecycle => {
                if let Some(stored) = self.dedup.stored(&event).await? {
                    self.apply_lifecycle(&stored, &mut report).await?;
                }
            }
            Ingested::Replayed => {}
        }

        Ok((ingested, report))
    }

    /// [`Engine::accept`] followed by inline scoring of the applied event
    pub async fn ingest(&self, incoming: IncomingEvent) -> EngineResult<IngestReport> {
        let (ingested, mut report) = self.accept(incoming).await?;

        if let Ingested::Applied(event) = &ingested {
            report.scored = self.score(event).await?;
        }

        Ok(report)
    }

    pub async fn score(&self, event: &MatchEvent) -> EngineResult<ScoreReport> {
        self.scoring.evaluate(event).await
    }

    pub async fn submit(
        &self,
        user_id: UserId,
        round_id: RoundId,
        outcome: Outcome,
    ) -> EngineResult<Prediction> {
        self.ledger.submit(user_id, round_id, outcome).await
    }

    /// Locks the round and scores anything its window already settles
    pub async fn lock_round(&self, round_id: &RoundId) -> EngineResult<bool> {
        let locked = self.rounds.lock_round(round_id).await?;
        self.scoring.evaluate_round(round_id).await?;

        Ok(locked)
    }

    /// Finishes the round and scores it
    pub async fn finish_round(&self, round_id: &RoundId) -> EngineResult<bool> {
        let finished = self.rounds.finish_round(round_id).await?;
        self.scoring.evaluate_round(round_id).await?;

        Ok(finished)
    }

    async fn apply_lifecycle(&self, event: &MatchEvent, report: &mut IngestReport) -> EngineResult<()> {
        match event.kind {
            EventKind::Kickoff => {
                for round in self.rounds.rounds_for_match(&event.match_id).await? {
                    // rounds scheduled for later in the match keep taking predictions
                    if round.state == RoundState::Open
                        && round.window.open_at <= event.received_at
                        && self.rounds.lock_round(&round.id).await?
                    {
                        report.rounds_locked += 1;
                    }
                }
            }
            EventKind::FullTime => {
                for round in self.rounds.rounds_for_match(&event.match_id).await? {
                    if round.state != RoundState::Finished
                        && self.rounds.finish_round(&round.id).await?
                    {
                        report.rounds_finished += 1;
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// One scheduler pass: deadline locks, deadline finishes, then a sweep for locked or
    /// finished rounds that still hold unscored predictions
    #[instrument(skip(self))]
    pub async fn tick(&self) -> EngineResult<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for round in self.rounds.rounds_in_state(RoundState::Open).await? {
            if round.window.lock_at > now {
                continue;
            }

            match self.rounds.lock_round(&round.id).await {
                Ok(true) => report.locked += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(round = %round.id, error = %err, "scheduled lock failed");
                    report.failures += 1;
                }
            }
        }

        for round in self.rounds.rounds_in_state(RoundState::Locked).await? {
            if round.window.finish_at > now {
                continue;
            }

            match self.rounds.finish_round(&round.id).await {
                Ok(true) => report.finished += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(round = %round.id, error = %err, "scheduled finish failed");
                    report.failures += 1;
                }
            }
        }

        for round_id in self.scoring.backlog().await? {
            match self.scoring.evaluate_round(&round_id).await {
                Ok(scored) => report.scored += scored,
                Err(EngineError::RoundStillOpen(_)) => {}
                Err(err) => {
                    tracing::warn!(round = %round_id, error = %err, "scoring sweep failed");
                    report.failures += 1;
                }
            }
        }

        if report != TickReport::default() {
            tracing::debug!(?report, "scheduler tick");
        }

        Ok(report)
    }
}
