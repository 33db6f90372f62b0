use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use tracing::instrument;

use super::clock::Clock;
use super::live::{LiveFeed, LiveUpdate};
use super::{EngineError, EngineResult};
use crate::db::prelude::*;
use crate::util::retry::{RetryPolicy, with_backoff};

/// Owns the round state machine. Every transition is a compare-and-swap in the store, so when
/// several triggers race (deadline, kickoff, admin) exactly one of them reports `true`.
#[derive(Clone)]
pub struct RoundRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    live: LiveFeed,
    round_duration: Duration,
    retry: RetryPolicy,
}

impl RoundRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        live: LiveFeed,
        round_duration: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            live,
            round_duration,
            retry,
        }
    }

    /// Opens a round whose play window lasts the configured round duration past `lock_at`
    pub async fn open_round(
        &self,
        round_id: RoundId,
        match_id: MatchId,
        open_at: DateTime<Utc>,
        lock_at: DateTime<Utc>,
    ) -> EngineResult<Round> {
        let window = RoundWindow {
            open_at,
            lock_at,
            finish_at: lock_at + self.round_duration,
        };

        self.open_round_with_window(round_id, match_id, window).await
    }

    #[instrument(skip(self))]
    pub async fn open_round_with_window(
        &self,
        round_id: RoundId,
        match_id: MatchId,
        window: RoundWindow,
    ) -> EngineResult<Round> {
        let window = RoundWindow {
            open_at: window.open_at.trunc_subsecs(6),
            lock_at: window.lock_at.trunc_subsecs(6),
            finish_at: window.finish_at.trunc_subsecs(6),
        };

        if !window.is_ordered() {
            return Err(EngineError::InvalidSchedule { round_id });
        }

        let round = Round::new(round_id, match_id, window, self.clock.now());
        let inserted = with_backoff(&self.retry, "insert_round", |_| {
            self.store.insert_round(&round)
        })
        .await?;

        if !inserted {
            return Err(EngineError::DuplicateRound(round.id));
        }

        tracing::info!(round = %round.id, match_id = %round.match_id, lock_at = %window.lock_at, "round opened");
        self.live.publish(LiveUpdate::Round { round: round.clone() });
        Ok(round)
    }

    pub async fn round(&self, round_id: &RoundId) -> EngineResult<Round> {
        with_backoff(&self.retry, "get_round", |_| self.store.get_round(round_id))
            .await?
            .ok_or_else(|| EngineError::UnknownRound(round_id.clone()))
    }

    pub async fn current_state(&self, round_id: &RoundId) -> EngineResult<RoundState> {
        Ok(self.round(round_id).await?.state)
    }

    pub async fn is_accepting_predictions(&self, round_id: &RoundId) -> EngineResult<bool> {
        let round = self.round(round_id).await?;
        Ok(round.accepts_predictions_at(self.clock.now()))
    }

    pub async fn rounds_for_match(&self, match_id: &MatchId) -> EngineResult<Vec<Round>> {
        Ok(with_backoff(&self.retry, "rounds_for_match", |_| {
            self.store.rounds_for_match(match_id)
        })
        .await?)
    }

    pub async fn rounds_in_state(&self, state: RoundState) -> EngineResult<Vec<Round>> {
        Ok(with_backoff(&self.retry, "rounds_in_state", |_| {
            self.store.rounds_in_state(state)
        })
        .await?)
    }

    /// open -> locked. Returns whether this call performed the transition; a round that is
    /// already locked or finished is left alone.
    #[instrument(skip(self))]
    pub async fn lock_round(&self, round_id: &RoundId) -> EngineResult<bool> {
        match self.transition(round_id, RoundState::Locked).await? {
            Transition::Applied(round) => {
                tracing::info!(round = %round.id, locked_at = ?round.locked_at, "round locked");
                self.live.publish(LiveUpdate::Round { round });
                Ok(true)
            }
            Transition::Unchanged(round) => {
                tracing::trace!(round = %round.id, state = %round.state, "round already past open");
                Ok(false)
            }
            Transition::Missing => Err(EngineError::InvalidTransition {
                round_id: round_id.clone(),
                to: RoundState::Locked,
            }),
        }
    }

    /// locked -> finished, passing through `locked` first when the round is still open.
    /// Returns whether this call performed the finishing transition.
    #[instrument(skip(self))]
    pub async fn finish_round(&self, round_id: &RoundId) -> EngineResult<bool> {
        for _ in 0..2 {
            match self.transition(round_id, RoundState::Finished).await? {
                Transition::Applied(round) => {
                    tracing::info!(round = %round.id, finished_at = ?round.finished_at, "round finished");
                    self.live.publish(LiveUpdate::Round { round });
                    return Ok(true);
                }
                Transition::Unchanged(round) if round.state == RoundState::Open => {
                    self.lock_round(round_id).await?;
                }
                Transition::Unchanged(_) => return Ok(false),
                Transition::Missing => break,
            }
        }

        Err(EngineError::InvalidTransition {
            round_id: round_id.clone(),
            to: RoundState::Finished,
        })
    }

    async fn transition(&self, round_id: &RoundId, to: RoundState) -> EngineResult<Transition> {
        let at = self.clock.now();
        Ok(with_backoff(&self.retry, "transition", |_| {
            self.store.transition(round_id, to, at)
        })
        .await?)
    }
}
