use async_channel::{Receiver, Sender, TrySendError};
use tokio::task::JoinHandle;

use super::Engine;
use crate::db::prelude::MatchEvent;

/// Bounded hand-off between event ingestion and the scoring workers
#[derive(Clone)]
pub struct ScoringQueue {
    tx: Sender<MatchEvent>,
}

impl ScoringQueue {
    /// Queues the event, waiting while the queue is full. Returns `false` when no worker is
    /// left to receive it; the scheduler sweep picks such events up later.
    pub async fn enqueue(&self, event: MatchEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::debug!(capacity = ?self.tx.capacity(), "scoring queue full, waiting");
                self.tx.send(event).await.is_ok()
            }
            Err(TrySendError::Closed(event)) => {
                tracing::warn!(seq = event.seq, "scoring queue closed, event left for sweep");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Stops accepting events; workers drain what is queued and exit
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Spawns `workers` tasks that score queued events
pub fn spawn_workers(
    engine: Engine,
    workers: usize,
    capacity: usize,
) -> (ScoringQueue, Vec<JoinHandle<()>>) {
    let (tx, rx) = async_channel::bounded(capacity.max(1));

    let handles = (0..workers.max(1))
        .map(|worker| tokio::spawn(run_worker(engine.clone(), rx.clone(), worker)))
        .collect();

    (ScoringQueue { tx }, handles)
}

async fn run_worker(engine: Engine, rx: Receiver<MatchEvent>, worker: usize) {
    tracing::debug!(worker, "scoring worker started");

    while let Ok(event) = rx.recv().await {
        match engine.score(&event).await {
            Ok(report) => {
                tracing::trace!(worker, seq = event.seq, ?report, "event scored");
            }
            Err(err) => {
                tracing::warn!(worker, seq = event.seq, error = %err, "scoring failed, left for sweep");
            }
        }
    }

    tracing::debug!(worker, "scoring worker stopped");
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use futures::future::join_all;

    use super::*;
    use crate::db::prelude::*;
    use crate::engine::EngineSettings;
    use crate::engine::clock::ManualClock;
    use crate::engine::dedup::Ingested;

    #[tokio::test]
    async fn test_workers_score_queued_events() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let engine = Engine::in_memory(clock.clone(), EngineSettings::default());

        engine
            .rounds
            .open_round("r-1".into(), "m-1".into(), start, start + Duration::seconds(10))
            .await
            .unwrap();
        engine
            .submit("u-1".into(), "r-1".into(), Outcome::Goal)
            .await
            .unwrap();

        clock.advance(Duration::seconds(10));
        engine.lock_round(&"r-1".into()).await.unwrap();
        clock.advance(Duration::seconds(5));

        let (queue, handles) = spawn_workers(engine.clone(), 2, 8);

        let incoming = IncomingEvent {
            external_event_id: Some("ev-1".into()),
            provider: Some("acme".into()),
            match_id: Some("m-1".into()),
            event_type: Some("goal".into()),
            ..Default::default()
        };
        let (ingested, _) = engine.accept(incoming).await.unwrap();
        let Ingested::Applied(event) = ingested else {
            panic!("first sighting must apply");
        };

        assert!(queue.enqueue(event).await);
        queue.close();
        join_all(handles).await;

        let entry = engine.leaderboard.entry(&"u-1".into()).await.unwrap().unwrap();
        assert_eq!(entry.total_points, 30);
        assert_eq!(entry.correct_count, 1);
    }
}
