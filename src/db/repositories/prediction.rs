use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use super::sql_fragment::PREDICTION_FIELDS;
use super::{PgStore, Tx};
use crate::db::StoreResult;
use crate::db::models::prediction::{Prediction, PredictionRow, UserId};
use crate::db::models::round::{RoundId, RoundState};
use crate::db::store::{PredictionStore, SubmitOutcome};

fn into_predictions(rows: Vec<PredictionRow>) -> StoreResult<Vec<Prediction>> {
    rows.into_iter().map(Prediction::try_from).collect()
}

#[async_trait]
impl PredictionStore for PgStore {
    #[instrument(skip(self, prediction), fields(user = %prediction.user_id, round = %prediction.round_id))]
    async fn insert_if_open(
        &self,
        prediction: &Prediction,
        now: DateTime<Utc>,
    ) -> StoreResult<SubmitOutcome> {
        let mut tx = Tx::begin(self.pool()).await?;

        // FOR SHARE conflicts with the row lock taken by a state transition, so the state
        // read here stays valid until this transaction ends
        let gate: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT state, lock_at
            FROM rounds
            WHERE id = $1
            FOR SHARE
            "#,
        )
        .bind(&prediction.round_id)
        .fetch_optional(&mut **tx.inner_mut()?)
        .await?;

        let Some((state, lock_at)) = gate else {
            tx.rollback().await?;
            return Ok(SubmitOutcome::UnknownRound);
        };

        let state: RoundState = state.parse()?;
        if state != RoundState::Open || now >= lock_at {
            tx.rollback().await?;
            return Ok(SubmitOutcome::Closed { state });
        }

        let inserted = sqlx::query_as::<_, PredictionRow>(&format!(
            r#"
            INSERT INTO predictions (
                id,
                user_id,
                round_id,
                outcome,
                submitted_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, round_id)
            DO NOTHING
            RETURNING {PREDICTION_FIELDS}
            "#,
        ))
        .bind(prediction.id)
        .bind(&prediction.user_id)
        .bind(&prediction.round_id)
        .bind(prediction.outcome.as_str())
        .bind(prediction.submitted_at)
        .fetch_optional(&mut **tx.inner_mut()?)
        .await?;

        let outcome = match inserted {
            Some(row) => SubmitOutcome::Accepted(row.try_into()?),
            None => {
                let existing = sqlx::query_as::<_, PredictionRow>(&format!(
                    "SELECT {} FROM predictions WHERE user_id = $1 AND round_id = $2",
                    PREDICTION_FIELDS
                ))
                .bind(&prediction.user_id)
                .bind(&prediction.round_id)
                .fetch_one(&mut **tx.inner_mut()?)
                .await?;

                SubmitOutcome::Duplicate(existing.try_into()?)
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn get_prediction(
        &self,
        user_id: &UserId,
        round_id: &RoundId,
    ) -> StoreResult<Option<Prediction>> {
        sqlx::query_as::<_, PredictionRow>(&format!(
            "SELECT {} FROM predictions WHERE user_id = $1 AND round_id = $2",
            PREDICTION_FIELDS
        ))
        .bind(user_id)
        .bind(round_id)
        .fetch_optional(self.pool())
        .await?
        .map(Prediction::try_from)
        .transpose()
    }

    #[instrument(skip(self))]
    async fn predictions_for_round(&self, round_id: &RoundId) -> StoreResult<Vec<Prediction>> {
        let rows = sqlx::query_as::<_, PredictionRow>(&format!(
            "SELECT {} FROM predictions WHERE round_id = $1 ORDER BY submitted_at ASC",
            PREDICTION_FIELDS
        ))
        .bind(round_id)
        .fetch_all(self.pool())
        .await?;

        into_predictions(rows)
    }

    #[instrument(skip(self))]
    async fn unscored_for_round(&self, round_id: &RoundId) -> StoreResult<Vec<Prediction>> {
        let rows = sqlx::query_as::<_, PredictionRow>(&format!(
            r#"
            SELECT {PREDICTION_FIELDS}
            FROM predictions
            WHERE round_id = $1
            AND points IS NULL
            ORDER BY submitted_at ASC
            "#,
        ))
        .bind(round_id)
        .fetch_all(self.pool())
        .await?;

        into_predictions(rows)
    }

    #[instrument(skip(self))]
    async fn rounds_awaiting_score(&self) -> StoreResult<Vec<RoundId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT r.id
            FROM rounds r
            WHERE r.state <> 'open'
            AND EXISTS (
                SELECT 1 FROM predictions p
                WHERE p.round_id = r.id
                AND p.points IS NULL
            )
            ORDER BY r.lock_at ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(ids.into_iter().map(RoundId::from).collect())
    }
}
