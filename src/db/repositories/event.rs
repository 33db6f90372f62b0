use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use super::sql_fragment::EVENT_FIELDS;
use super::{PgStore, Tx};
use crate::db::StoreResult;
use crate::db::models::event::{MatchEvent, MatchEventRow, NewEvent};
use crate::db::models::round::MatchId;
use crate::db::store::EventStore;

#[async_trait]
impl EventStore for PgStore {
    #[instrument(skip(self, event), fields(event = %event.external_event_id, provider = %event.provider))]
    async fn insert_if_absent(
        &self,
        event: NewEvent,
        received_at: DateTime<Utc>,
    ) -> StoreResult<Option<MatchEvent>> {
        let mut tx = Tx::begin(self.pool()).await?;

        // inserts for one match queue behind each other until commit, so an event never
        // becomes visible behind one that sorts after it
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&event.match_id)
            .execute(&mut **tx.inner_mut()?)
            .await?;

        let row = sqlx::query_as::<_, MatchEventRow>(&format!(
            r#"
            INSERT INTO match_events (
                external_event_id,
                provider,
                match_id,
                event_type,
                minute,
                payload,
                received_at
            )
            SELECT $1, $2, $3, $4, $5, $6, GREATEST($7, MAX(received_at))
            FROM match_events
            WHERE match_id = $3
            ON CONFLICT (external_event_id, provider)
            DO NOTHING
            RETURNING {EVENT_FIELDS}
            "#,
        ))
        .bind(&event.external_event_id)
        .bind(&event.provider)
        .bind(&event.match_id)
        .bind(event.kind.as_str())
        .bind(event.minute)
        .bind(&event.payload)
        .bind(received_at)
        .fetch_optional(&mut **tx.inner_mut()?)
        .await?;

        tx.commit().await?;
        Ok(row.map(MatchEvent::from))
    }

    #[instrument(skip(self))]
    async fn find_event(
        &self,
        external_event_id: &str,
        provider: &str,
    ) -> StoreResult<Option<MatchEvent>> {
        let row = sqlx::query_as::<_, MatchEventRow>(&format!(
            "SELECT {} FROM match_events WHERE external_event_id = $1 AND provider = $2",
            EVENT_FIELDS
        ))
        .bind(external_event_id)
        .bind(provider)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(MatchEvent::from))
    }

    #[instrument(skip(self))]
    async fn events_for_match(&self, match_id: &MatchId) -> StoreResult<Vec<MatchEvent>> {
        let rows = sqlx::query_as::<_, MatchEventRow>(&format!(
            r#"
            SELECT {EVENT_FIELDS}
            FROM match_events
            WHERE match_id = $1
            ORDER BY received_at ASC, seq ASC
            "#,
        ))
        .bind(match_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(MatchEvent::from).collect())
    }
}
