//! Turns a match's accumulated events into exactly one score delta per prediction.
//!
//! A round's realized outcome is the first scorable event (by receipt order) inside its play
//! window. When the window holds no scorable event the outcome is `nothing`, but only once
//! the round has finished; before that the round is left for a later pass.

use std::ops::AddAssign;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;

use super::clock::Clock;
use super::dedup::EventDeduplicator;
use super::leaderboard::LeaderboardAggregator;
use super::{EngineError, EngineResult};
use crate::constants::{
    BASE_POINTS, CORNER_MULTIPLIER, GOAL_MULTIPLIER, NOTHING_MULTIPLIER, YELLOW_CARD_MULTIPLIER,
};
use crate::db::prelude::*;
use crate::util::retry::{RetryPolicy, with_backoff};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringPolicy {
    pub base_points: i64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            base_points: BASE_POINTS,
        }
    }
}

impl ScoringPolicy {
    pub fn multiplier(outcome: Outcome) -> i64 {
        match outcome {
            Outcome::Goal => GOAL_MULTIPLIER,
            Outcome::Corner => CORNER_MULTIPLIER,
            Outcome::YellowCard => YELLOW_CARD_MULTIPLIER,
            Outcome::Nothing => NOTHING_MULTIPLIER,
        }
    }

    pub fn points(&self, predicted: Outcome, realized: Outcome) -> i64 {
        if predicted == realized {
            self.base_points * Self::multiplier(realized)
        } else {
            0
        }
    }
}

/// Outcome that settles `round`, or `None` while it is still undetermined
pub fn realized_outcome(round: &Round, events: &[MatchEvent]) -> Option<Outcome> {
    if round.state == RoundState::Open {
        return None;
    }

    let (start, end) = round.play_window();
    let first = events
        .iter()
        .filter(|e| e.match_id == round.match_id)
        .filter(|e| e.received_at >= start && e.received_at < end)
        .filter_map(|e| e.kind.scorable().map(|outcome| (e, outcome)))
        .min_by_key(|(e, _)| (e.received_at, e.seq))
        .map(|(_, outcome)| outcome);

    match (first, round.state) {
        (Some(outcome), _) => Some(outcome),
        (None, RoundState::Finished) => Some(Outcome::Nothing),
        (None, _) => None,
    }
}

/// Pure evaluation of one prediction against a settled outcome
pub fn evaluate_prediction(
    policy: &ScoringPolicy,
    prediction: &Prediction,
    realized: Outcome,
    now: DateTime<Utc>,
) -> ScoreDelta {
    ScoreDelta {
        prediction_id: prediction.id,
        user_id: prediction.user_id.clone(),
        round_id: prediction.round_id.clone(),
        points: policy.points(prediction.outcome, realized),
        correct: prediction.outcome == realized,
        applied_at: now,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreReport {
    /// Rounds whose outcome was known and whose predictions were evaluated
    pub rounds_evaluated: usize,
    pub deltas_applied: usize,
    /// Predictions some other scorer got to first
    pub already_scored: usize,
    /// Rounds skipped because their outcome is still undetermined
    pub deferred: usize,
}

impl AddAssign for ScoreReport {
    fn add_assign(&mut self, rhs: Self) {
        self.rounds_evaluated += rhs.rounds_evaluated;
        self.deltas_applied += rhs.deltas_applied;
        self.already_scored += rhs.already_scored;
        self.deferred += rhs.deferred;
    }
}

#[derive(Clone)]
pub struct ScoringEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    events: EventDeduplicator,
    leaderboard: LeaderboardAggregator,
    policy: ScoringPolicy,
    retry: RetryPolicy,
}

impl ScoringEngine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        events: EventDeduplicator,
        leaderboard: LeaderboardAggregator,
        policy: ScoringPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            leaderboard,
            policy,
            retry,
        }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Scores whatever the event may have settled for its match
    #[instrument(skip(self, event), fields(seq = event.seq, match_id = %event.match_id, kind = %event.kind))]
    pub async fn evaluate(&self, event: &MatchEvent) -> EngineResult<ScoreReport> {
        self.evaluate_match(&event.match_id).await
    }

    pub async fn evaluate_match(&self, match_id: &MatchId) -> EngineResult<ScoreReport> {
        let rounds = with_backoff(&self.retry, "rounds_for_match", |_| {
            self.store.rounds_for_match(match_id)
        })
        .await?;

        let rounds: Vec<_> = rounds
            .into_iter()
            .filter(|r| r.state != RoundState::Open)
            .collect();

        let mut report = ScoreReport::default();
        if rounds.is_empty() {
            return Ok(report);
        }

        let events = self.events.events_for_match(match_id).await?;
        for round in &rounds {
            report += self.score_round(round, &events).await?;
        }

        Ok(report)
    }

    /// Rounds past `open` that still hold unscored predictions
    pub async fn backlog(&self) -> EngineResult<Vec<RoundId>> {
        Ok(with_backoff(&self.retry, "rounds_awaiting_score", |_| {
            self.store.rounds_awaiting_score()
        })
        .await?)
    }

    /// Fails with `RoundStillOpen` for a round that has not locked yet
    #[instrument(skip(self))]
    pub async fn evaluate_round(&self, round_id: &RoundId) -> EngineResult<ScoreReport> {
        let round = with_backoff(&self.retry, "get_round", |_| self.store.get_round(round_id))
            .await?
            .ok_or_else(|| EngineError::UnknownRound(round_id.clone()))?;

        if round.state == RoundState::Open {
            return Err(EngineError::RoundStillOpen(round.id));
        }

        let events = self.events.events_for_match(&round.match_id).await?;
        self.score_round(&round, &events).await
    }

    async fn score_round(&self, round: &Round, events: &[MatchEvent]) -> EngineResult<ScoreReport> {
        let mut report = ScoreReport::default();

        let Some(realized) = realized_outcome(round, events) else {
            tracing::trace!(round = %round.id, "outcome undetermined, deferring");
            report.deferred += 1;
            return Ok(report);
        };

        let pending = with_backoff(&self.retry, "unscored_for_round", |_| {
            self.store.unscored_for_round(&round.id)
        })
        .await?;

        report.rounds_evaluated += 1;
        let now = self.clock.now();

        for prediction in &pending {
            let delta = evaluate_prediction(&self.policy, prediction, realized, now);
            match self.leaderboard.apply_delta(&delta).await? {
                Some(_) => report.deltas_applied += 1,
                None => report.already_scored += 1,
            }
        }

        if !pending.is_empty() {
            tracing::debug!(
                monotonic_counter.score_deltas_committed = report.deltas_applied as u64,
                round = %round.id,
                outcome = %realized,
                applied = report.deltas_applied,
                skipped = report.already_scored,
                "round scored"
            );
        }

        Ok(report)
    }
}
