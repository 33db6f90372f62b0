use std::sync::Arc;

use tracing::instrument;

use super::clock::Clock;
use super::EngineResult;
use crate::db::prelude::*;
use crate::util::retry::{RetryPolicy, with_backoff};

#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// First sighting; the stored event should be forwarded for scoring
    Applied(MatchEvent),
    Replayed,
}

impl Ingested {
    pub fn applied(&self) -> bool {
        matches!(self, Ingested::Applied(_))
    }
}

/// Insert-or-ignore gate in front of scoring, keyed by `(external_event_id, provider)`
#[derive(Clone)]
pub struct EventDeduplicator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl EventDeduplicator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    #[instrument(skip(self, event), fields(event = %event.external_event_id, provider = %event.provider))]
    pub async fn ingest(&self, event: NewEvent) -> EngineResult<Ingested> {
        let stored = with_backoff(&self.retry, "insert_event", |_| {
            self.store.insert_if_absent(event.clone(), self.clock.now())
        })
        .await?;

        Ok(match stored {
            Some(event) => {
                tracing::debug!(
                    monotonic_counter.events_applied = 1_u64,
                    kind = %event.kind,
                    seq = event.seq,
                    match_id = %event.match_id,
                    "event applied"
                );
                Ingested::Applied(event)
            }
            None => {
                tracing::debug!(
                    monotonic_counter.events_replayed = 1_u64,
                    event = %event.external_event_id,
                    provider = %event.provider,
                    "event replay ignored"
                );
                Ingested::Replayed
            }
        })
    }

    /// The stored copy of an event that may have been ingested earlier
    pub async fn stored(&self, event: &NewEvent) -> EngineResult<Option<MatchEvent>> {
        Ok(with_backoff(&self.retry, "find_event", |_| {
            self.store
                .find_event(&event.external_event_id, &event.provider)
        })
        .await?)
    }

    pub async fn events_for_match(&self, match_id: &MatchId) -> EngineResult<Vec<MatchEvent>> {
        Ok(with_backoff(&self.retry, "events_for_match", |_| {
            self.store.events_for_match(match_id)
        })
        .await?)
    }
}
