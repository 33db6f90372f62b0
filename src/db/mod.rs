use std::sync::LazyLock;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::sync::OnceCell;

pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

pub mod prelude {
    pub use crate::db::memory::MemoryStore;
    pub use crate::db::repositories::{PgStore, Tx};
    pub use crate::db::store::{
        EventStore, PredictionStore, RoundStore, ScoreStore, Store, SubmitOutcome, Transition,
    };
    pub use crate::db::{StoreError, StoreResult, db_pool};

    pub use crate::db::models::event::{EventKind, IncomingEvent, MatchEvent, NewEvent};
    pub use crate::db::models::leaderboard::{LeaderboardEntry, ScoreDelta};
    pub use crate::db::models::prediction::{Outcome, Prediction, PredictionId, UserId};
    pub use crate::db::models::round::{MatchId, Round, RoundId, RoundState, RoundWindow};
    pub use crate::db::models::{PaginatedResponse, Pagination};
}

static DB_POOL: LazyLock<OnceCell<Db>> = LazyLock::new(OnceCell::new);

/// Process-wide connection pool, created on first use
pub async fn db_pool(database_url: &str, max_connections: u32) -> StoreResult<&'static PgPool> {
    Ok(&DB_POOL
        .get_or_try_init(|| async { Db::new_pool(database_url, max_connections).await })
        .await?
        .pool)
}

struct Db {
    pool: PgPool,
}

impl Db {
    async fn new_pool(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        tracing::info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }
}

pub type StoreResult<T> = core::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error("unexpected value '{value}' in column '{column}'")]
    Decode { column: &'static str, value: String },
}

impl StoreError {
    /// Whether the failure is worth retrying: the operation is known not to have taken
    /// effect and the cause is expected to go away on its own
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::SqlxError(err) => match err {
                sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db_err) => {
                    // serialization_failure, deadlock_detected
                    matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
                }
                _ => false,
            },
            StoreError::Decode { .. } => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::SqlxError(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::SqlxError(sqlx::Error::RowNotFound).is_transient());
        assert!(
            !StoreError::Decode {
                column: "state",
                value: "bogus".into()
            }
            .is_transient()
        );
    }
}
