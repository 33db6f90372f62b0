use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use super::PgStore;
use super::sql_fragment::ROUND_FIELDS;
use crate::db::StoreResult;
use crate::db::models::round::{MatchId, Round, RoundId, RoundRow, RoundState};
use crate::db::store::{RoundStore, Transition};

fn into_rounds(rows: Vec<RoundRow>) -> StoreResult<Vec<Round>> {
    rows.into_iter().map(Round::try_from).collect()
}

#[async_trait]
impl RoundStore for PgStore {
    #[instrument(skip(self, round), fields(round = %round.id))]
    async fn insert_round(&self, round: &Round) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO rounds (
                id,
                match_id,
                state,
                open_at,
                lock_at,
                finish_at,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id)
            DO NOTHING
            "#,
        )
        .bind(&round.id)
        .bind(&round.match_id)
        .bind(round.state.as_str())
        .bind(round.window.open_at)
        .bind(round.window.lock_at)
        .bind(round.window.finish_at)
        .bind(round.created_at)
        .execute(self.pool())
        .await?;

        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get_round(&self, id: &RoundId) -> StoreResult<Option<Round>> {
        sqlx::query_as::<_, RoundRow>(&format!(
            "SELECT {} FROM rounds WHERE id = $1",
            ROUND_FIELDS
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .map(Round::try_from)
        .transpose()
    }

    #[instrument(skip(self))]
    async fn rounds_for_match(&self, match_id: &MatchId) -> StoreResult<Vec<Round>> {
        let rows = sqlx::query_as::<_, RoundRow>(&format!(
            "SELECT {} FROM rounds WHERE match_id = $1 ORDER BY lock_at ASC",
            ROUND_FIELDS
        ))
        .bind(match_id)
        .fetch_all(self.pool())
        .await?;

        into_rounds(rows)
    }

    #[instrument(skip(self))]
    async fn rounds_in_state(&self, state: RoundState) -> StoreResult<Vec<Round>> {
        let rows = sqlx::query_as::<_, RoundRow>(&format!(
            "SELECT {} FROM rounds WHERE state = $1 ORDER BY lock_at ASC",
            ROUND_FIELDS
        ))
        .bind(state.as_str())
        .fetch_all(self.pool())
        .await?;

        into_rounds(rows)
    }

    #[instrument(skip(self))]
    async fn transition(
        &self,
        id: &RoundId,
        to: RoundState,
        at: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        let Some(from) = to.predecessor() else {
            return Ok(match self.get_round(id).await? {
                Some(round) => Transition::Unchanged(round),
                None => Transition::Missing,
            });
        };

        let stamp_column = match to {
            RoundState::Finished => "finished_at",
            _ => "locked_at",
        };

        // the state guard in the WHERE clause is the compare-and-swap; concurrent callers
        // serialize on the row lock and all but one match zero rows
        let applied = sqlx::query_as::<_, RoundRow>(&format!(
            r#"
            UPDATE rounds
            SET state = $2,
                {stamp_column} = $4
            WHERE id = $1
            AND state = $3
            RETURNING {ROUND_FIELDS}
            "#,
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(from.as_str())
        .bind(at)
        .fetch_optional(self.pool())
        .await?;

        if let Some(row) = applied {
            return Ok(Transition::Applied(row.try_into()?));
        }

        Ok(match self.get_round(id).await? {
            Some(round) => Transition::Unchanged(round),
            None => Transition::Missing,
        })
    }
}
