use std::sync::Arc;

use tracing::instrument;

use super::clock::Clock;
use super::rounds::RoundRegistry;
use super::{EngineError, EngineResult};
use crate::db::prelude::*;
use crate::util::retry::{RetryPolicy, with_backoff};

/// One prediction per (user, round), accepted only while the round is open
#[derive(Clone)]
pub struct PredictionLedger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    registry: RoundRegistry,
    retry: RetryPolicy,
}

impl PredictionLedger {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        registry: RoundRegistry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            registry,
            retry,
        }
    }

    #[instrument(skip(self))]
    pub async fn submit(
        &self,
        user_id: UserId,
        round_id: RoundId,
        outcome: Outcome,
    ) -> EngineResult<Prediction> {
        let now = self.clock.now();

        // the id is fixed before the first attempt so a retry can recognise its own row
        let prediction = Prediction::new(user_id, round_id, outcome, now);

        let result = with_backoff(&self.retry, "insert_prediction", |_| {
            self.store.insert_if_open(&prediction, now)
        })
        .await?;

        match result {
            SubmitOutcome::Accepted(stored) => {
                tracing::debug!(
                    monotonic_counter.predictions_accepted = 1_u64,
                    outcome = %stored.outcome,
                    prediction = %stored.id,
                    "prediction accepted"
                );
                Ok(stored)
            }
            SubmitOutcome::Duplicate(existing) if existing.id == prediction.id => Ok(existing),
            SubmitOutcome::Duplicate(existing) => {
                tracing::debug!(
                    monotonic_counter.predictions_rejected = 1_u64,
                    reason = "duplicate",
                    existing = %existing.id,
                    "duplicate prediction rejected"
                );
                Err(EngineError::DuplicatePrediction {
                    user_id: prediction.user_id,
                    round_id: prediction.round_id,
                })
            }
            SubmitOutcome::Closed { state } => {
                if state == RoundState::Open {
                    // deadline passed before anything locked the round
                    if let Err(err) = self.registry.lock_round(&prediction.round_id).await {
                        tracing::warn!(error = %err, round = %prediction.round_id, "deadline lock failed");
                    }
                }

                tracing::debug!(
                    monotonic_counter.predictions_rejected = 1_u64,
                    reason = "locked",
                    round = %prediction.round_id,
                    %state,
                    "submission after lock rejected"
                );
                Err(EngineError::RoundLocked(prediction.round_id))
            }
            SubmitOutcome::UnknownRound => Err(EngineError::UnknownRound(prediction.round_id)),
        }
    }

    pub async fn prediction(
        &self,
        user_id: &UserId,
        round_id: &RoundId,
    ) -> EngineResult<Option<Prediction>> {
        Ok(with_backoff(&self.retry, "get_prediction", |_| {
            self.store.get_prediction(user_id, round_id)
        })
        .await?)
    }

    pub async fn predictions_for_round(&self, round_id: &RoundId) -> EngineResult<Vec<Prediction>> {
        Ok(with_backoff(&self.retry, "predictions_for_round", |_| {
            self.store.predictions_for_round(round_id)
        })
        .await?)
    }
}
