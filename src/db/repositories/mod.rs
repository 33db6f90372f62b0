use sqlx::{Pool, Postgres, Result as SqlxResult, Transaction};
use tracing::instrument;

pub mod event;
pub mod leaderboard;
pub mod prediction;
pub mod round;

/// Postgres-backed implementation of every store trait. Expects the schema from
/// `migrations/0001_core.sql` to have been applied.
#[derive(Debug, Clone, Copy)]
pub struct PgStore {
    pool: &'static Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: &'static Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &'static Pool<Postgres> {
        self.pool
    }
}

/// Explicit transaction handle. Dropping it without calling `commit` rolls back.
pub struct Tx<'a> {
    inner: Option<Transaction<'a, Postgres>>,
}

impl<'a> Tx<'a> {
    #[instrument(skip(pool))]
    pub async fn begin(pool: &'a Pool<Postgres>) -> SqlxResult<Self> {
        let inner = pool.begin().await?;
        Ok(Self { inner: Some(inner) })
    }

    #[instrument(skip(self))]
    pub async fn commit(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.commit().await
        } else {
            Err(sqlx::Error::Protocol("Transaction already completed".into()))
        }
    }

    #[instrument(skip(self))]
    pub async fn rollback(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.rollback().await
        } else {
            Err(sqlx::Error::Protocol("Transaction already completed".into()))
        }
    }

    pub fn inner_mut(&mut self) -> SqlxResult<&mut Transaction<'a, Postgres>> {
        self.inner
            .as_mut()
            .ok_or_else(|| sqlx::Error::Protocol("Transaction already completed".into()))
    }
}

pub mod sql_fragment {
    pub const ROUND_FIELDS: &str = r#"
        id,
        match_id,
        state,
        open_at,
        lock_at,
        finish_at,
        locked_at,
        finished_at,
        created_at
    "#;

    pub const PREDICTION_FIELDS: &str = r#"
        id,
        user_id,
        round_id,
        outcome,
        submitted_at,
        is_correct,
        points,
        scored_at
    "#;

    pub const EVENT_FIELDS: &str = r#"
        seq,
        external_event_id,
        provider,
        match_id,
        event_type,
        minute,
        payload,
        received_at
    "#;

    pub const LEADERBOARD_FIELDS: &str = r#"
        user_id,
        total_points,
        correct_count,
        total_count,
        accuracy,
        updated_at
    "#;
}

/// These need a live database with the schema applied:
/// `DATABASE_URL=... cargo test -- --ignored`
#[cfg(test)]
mod test {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::db::db_pool;
    use crate::db::models::prediction::{Outcome, Prediction};
    use crate::db::models::round::{Round, RoundState, RoundWindow};
    use crate::db::models::event::{EventKind, NewEvent};
    use crate::db::store::{EventStore, PredictionStore, RoundStore, SubmitOutcome, Transition};

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PgStore::new(db_pool(&url, 5).await.unwrap())
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_round_lock_blocks_submission() {
        let store = store().await;
        let now = Utc::now();
        let round_id = format!("pg-test-{}", uuid::Uuid::new_v4());

        let window = RoundWindow {
            open_at: now,
            lock_at: now + Duration::minutes(5),
            finish_at: now + Duration::minutes(8),
        };
        let round = Round::new(round_id.clone().into(), "pg-match".into(), window, now);
        assert!(store.insert_round(&round).await.unwrap());
        assert!(!store.insert_round(&round).await.unwrap());

        let first = Prediction::new("pg-user".into(), round.id.clone(), Outcome::Corner, now);
        assert!(matches!(
            store.insert_if_open(&first, now).await.unwrap(),
            SubmitOutcome::Accepted(_)
        ));

        let again = Prediction::new("pg-user".into(), round.id.clone(), Outcome::Goal, now);
        assert!(matches!(
            store.insert_if_open(&again, now).await.unwrap(),
            SubmitOutcome::Duplicate(p) if p.id == first.id
        ));

        assert!(matches!(
            store.transition(&round.id, RoundState::Locked, now).await.unwrap(),
            Transition::Applied(_)
        ));

        let late = Prediction::new("pg-user-2".into(), round.id.clone(), Outcome::Goal, now);
        assert_eq!(
            store.insert_if_open(&late, now).await.unwrap(),
            SubmitOutcome::Closed {
                state: RoundState::Locked
            }
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_events_of_a_match_stay_in_receipt_order() {
        let store = store().await;
        let now = Utc::now();
        let match_id = format!("pg-match-{}", uuid::Uuid::new_v4());

        let event = |id: &str, kind: EventKind| NewEvent {
            external_event_id: format!("{match_id}-{id}"),
            provider: "acme".to_string(),
            match_id: match_id.clone().into(),
            kind,
            minute: None,
            payload: serde_json::Value::Null,
        };

        let inserts = (0..8).map(|i| {
            let store = store;
            let ev = event(&format!("ev-{i}"), EventKind::Corner);
            // stamps run backwards against submission order
            let at = now - Duration::seconds(i);
            tokio::spawn(async move { store.insert_if_absent(ev, at).await.unwrap().unwrap() })
        });
        for handle in inserts.collect::<Vec<_>>() {
            handle.await.unwrap();
        }

        let stored = store.events_for_match(&match_id.clone().into()).await.unwrap();
        assert_eq!(stored.len(), 8);
        assert!(stored.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(stored.windows(2).all(|w| w[0].received_at <= w[1].received_at));

        assert!(
            store
                .insert_if_absent(event("ev-0", EventKind::Goal), now)
                .await
                .unwrap()
                .is_none()
        );
        let found = store
            .find_event(&format!("{match_id}-ev-0"), "acme")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.kind, EventKind::Corner);
    }
}
