use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::instrument;

use super::sql_fragment::LEADERBOARD_FIELDS;
use super::{PgStore, Tx};
use crate::db::models::leaderboard::{LeaderboardEntry, LeaderboardRow, ScoreDelta, ScoreDeltaRow};
use crate::db::models::prediction::UserId;
use crate::db::store::ScoreStore;
use crate::db::{StoreError, StoreResult};

// the stream borrows its query text for as long as it is polled
const LEADERBOARD_STREAM_QUERY: &str = r#"
    SELECT
        user_id,
        total_points,
        correct_count,
        total_count,
        accuracy,
        updated_at
    FROM leaderboard
    ORDER BY total_points DESC, updated_at DESC, user_id ASC
"#;

#[async_trait]
impl ScoreStore for PgStore {
    #[instrument(skip(self, delta), fields(prediction = %delta.prediction_id))]
    async fn commit_delta(&self, delta: &ScoreDelta) -> StoreResult<Option<LeaderboardEntry>> {
        let mut tx = Tx::begin(self.pool()).await?;

        // `points IS NULL` is the exactly-once guard; a second scorer matches nothing
        let claimed = sqlx::query(
            r#"
            UPDATE predictions
            SET is_correct = $2,
                points = $3,
                scored_at = $4
            WHERE id = $1
            AND user_id = $5
            AND points IS NULL
            "#,
        )
        .bind(delta.prediction_id)
        .bind(delta.correct)
        .bind(delta.points)
        .bind(delta.applied_at)
        .bind(&delta.user_id)
        .execute(&mut **tx.inner_mut()?)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query(
            r#"
            INSERT INTO score_deltas (
                prediction_id,
                user_id,
                round_id,
                points,
                is_correct,
                applied_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(delta.prediction_id)
        .bind(&delta.user_id)
        .bind(&delta.round_id)
        .bind(delta.points)
        .bind(delta.correct)
        .bind(delta.applied_at)
        .execute(&mut **tx.inner_mut()?)
        .await?;

        let entry = sqlx::query_as::<_, LeaderboardRow>(&format!(
            r#"
            INSERT INTO leaderboard (
                user_id,
                total_points,
                correct_count,
                total_count,
                accuracy,
                updated_at
            )
            VALUES ($1, $2, $3, 1, ROUND(($3 * 100.0)::numeric, 2)::float8, $4)
            ON CONFLICT (user_id)
            DO UPDATE SET
                total_points = leaderboard.total_points + EXCLUDED.total_points,
                correct_count = leaderboard.correct_count + EXCLUDED.correct_count,
                total_count = leaderboard.total_count + 1,
                accuracy = ROUND(
                    ((leaderboard.correct_count + EXCLUDED.correct_count) * 100.0
                        / (leaderboard.total_count + 1))::numeric,
                    2
                )::float8,
                updated_at = GREATEST(leaderboard.updated_at, EXCLUDED.updated_at)
            RETURNING {LEADERBOARD_FIELDS}
            "#,
        ))
        .bind(&delta.user_id)
        .bind(delta.points)
        .bind(i64::from(delta.correct))
        .bind(delta.applied_at)
        .fetch_one(&mut **tx.inner_mut()?)
        .await?;

        tx.commit().await?;
        Ok(Some(entry.into()))
    }

    #[instrument(skip(self))]
    async fn deltas_for_user(&self, user_id: &UserId) -> StoreResult<Vec<ScoreDelta>> {
        let rows = sqlx::query_as::<_, ScoreDeltaRow>(
            r#"
            SELECT
                prediction_id,
                user_id,
                round_id,
                points,
                is_correct,
                applied_at
            FROM score_deltas
            WHERE user_id = $1
            ORDER BY applied_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(ScoreDelta::from).collect())
    }

    #[instrument(skip(self))]
    async fn leaderboard_entry(&self, user_id: &UserId) -> StoreResult<Option<LeaderboardEntry>> {
        let row = sqlx::query_as::<_, LeaderboardRow>(&format!(
            "SELECT {} FROM leaderboard WHERE user_id = $1",
            LEADERBOARD_FIELDS
        ))
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(LeaderboardEntry::from))
    }

    #[instrument(skip(self))]
    async fn leaderboard_page(
        &self,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<LeaderboardEntry>, i64)> {
        let rows = sqlx::query_as::<_, LeaderboardRow>(&format!(
            r#"
            SELECT {LEADERBOARD_FIELDS}
            FROM leaderboard
            ORDER BY total_points DESC, updated_at DESC, user_id ASC
            LIMIT $1
            OFFSET $2
            "#,
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leaderboard")
            .fetch_one(self.pool())
            .await?;

        Ok((rows.into_iter().map(LeaderboardEntry::from).collect(), total))
    }

    fn leaderboard_stream(&self) -> BoxStream<'_, StoreResult<LeaderboardEntry>> {
        sqlx::query_as::<_, LeaderboardRow>(LEADERBOARD_STREAM_QUERY)
            .fetch(self.pool())
            .map(|row| row.map(LeaderboardEntry::from).map_err(StoreError::from))
            .boxed()
    }

    #[instrument(skip(self))]
    async fn rebuild_leaderboard(&self) -> StoreResult<usize> {
        let mut tx = Tx::begin(self.pool()).await?;

        // blocks concurrent commits' upserts until the rebuilt table is visible
        sqlx::query("LOCK TABLE leaderboard IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut **tx.inner_mut()?)
            .await?;

        sqlx::query("DELETE FROM leaderboard")
            .execute(&mut **tx.inner_mut()?)
            .await?;

        let res = sqlx::query(
            r#"
            INSERT INTO leaderboard (
                user_id,
                total_points,
                correct_count,
                total_count,
                accuracy,
                updated_at
            )
            SELECT
                user_id,
                SUM(points)::bigint,
                COUNT(*) FILTER (WHERE is_correct),
                COUNT(*),
                ROUND((COUNT(*) FILTER (WHERE is_correct) * 100.0 / COUNT(*))::numeric, 2)::float8,
                MAX(applied_at)
            FROM score_deltas
            GROUP BY user_id
            "#,
        )
        .execute(&mut **tx.inner_mut()?)
        .await?;

        tx.commit().await?;
        Ok(res.rows_affected() as usize)
    }
}
