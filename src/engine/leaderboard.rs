use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::instrument;

use super::{EngineError, EngineResult};
use crate::db::prelude::*;
use crate::util::retry::{RetryPolicy, with_backoff};

/// Incrementally maintained view of per-user totals.
///
/// Each entry is updated in the same atomic step that marks the prediction scored, so an
/// entry never lags its own deltas. Ranking across users is only read-committed.
#[derive(Clone)]
pub struct LeaderboardAggregator {
    store: Arc<dyn Store>,
    retry: RetryPolicy,
}

impl LeaderboardAggregator {
    pub fn new(store: Arc<dyn Store>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Commits the delta and folds it into the user's entry. `None` means the prediction was
    /// already scored and nothing changed.
    #[instrument(skip(self, delta), fields(user = %delta.user_id, points = delta.points))]
    pub async fn apply_delta(&self, delta: &ScoreDelta) -> EngineResult<Option<LeaderboardEntry>> {
        Ok(with_backoff(&self.retry, "commit_delta", |_| {
            self.store.commit_delta(delta)
        })
        .await?)
    }

    /// Every entry in leaderboard order, fetched lazily. Each call starts a fresh read.
    pub fn snapshot(&self) -> BoxStream<'_, EngineResult<LeaderboardEntry>> {
        self.store
            .leaderboard_stream()
            .map(|entry| entry.map_err(EngineError::from))
            .boxed()
    }

    pub async fn page(&self, pagination: &Pagination) -> EngineResult<PaginatedResponse<LeaderboardEntry>> {
        let (limit, offset) = pagination.window();
        let (items, total) = with_backoff(&self.retry, "leaderboard_page", |_| {
            self.store.leaderboard_page(limit, offset)
        })
        .await?;

        Ok(PaginatedResponse::new(items, total, limit, pagination.page.max(0)))
    }

    pub async fn entry(&self, user_id: &UserId) -> EngineResult<Option<LeaderboardEntry>> {
        Ok(with_backoff(&self.retry, "leaderboard_entry", |_| {
            self.store.leaderboard_entry(user_id)
        })
        .await?)
    }

    pub async fn deltas_for_user(&self, user_id: &UserId) -> EngineResult<Vec<ScoreDelta>> {
        Ok(with_backoff(&self.retry, "deltas_for_user", |_| {
            self.store.deltas_for_user(user_id)
        })
        .await?)
    }

    /// Recomputes every entry from the delta history
    #[instrument(skip(self))]
    pub async fn rebuild(&self) -> EngineResult<usize> {
        let count = with_backoff(&self.retry, "rebuild_leaderboard", |_| {
            self.store.rebuild_leaderboard()
        })
        .await?;

        tracing::info!(entries = count, "leaderboard rebuilt");
        Ok(count)
    }
}
