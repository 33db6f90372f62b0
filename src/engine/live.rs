//! Per-match live feed.
//!
//! Applied events and round transitions are fanned out over one broadcast channel; every
//! subscriber filters it down to the match it watches.

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::db::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveUpdate {
    Event { event: MatchEvent },
    Round { round: Round },
}

impl LiveUpdate {
    pub fn match_id(&self) -> &MatchId {
        match self {
            LiveUpdate::Event { event } => &event.match_id,
            LiveUpdate::Round { round } => &round.match_id,
        }
    }
}

#[derive(Clone)]
pub struct LiveFeed {
    tx: broadcast::Sender<LiveUpdate>,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, update: LiveUpdate) {
        // nobody watching is not an error
        _ = self.tx.send(update);
    }

    pub fn subscribe(&self, match_id: MatchId) -> MatchFeed {
        MatchFeed {
            match_id,
            rx: self.tx.subscribe(),
        }
    }
}

/// One subscriber's view of the feed, limited to a single match
pub struct MatchFeed {
    match_id: MatchId,
    rx: broadcast::Receiver<LiveUpdate>,
}

impl MatchFeed {
    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    /// Next update for this match, `None` once every publisher is gone. A subscriber that
    /// falls more than the channel capacity behind skips what it missed.
    pub async fn next(&mut self) -> Option<LiveUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) if update.match_id() == &self.match_id => return Some(update),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(match_id = %self.match_id, skipped, "live subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn round(id: &str, match_id: &str) -> Round {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let window = RoundWindow {
            open_at: at,
            lock_at: at,
            finish_at: at,
        };
        Round::new(id.into(), match_id.into(), window, at)
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_its_match() {
        let feed = LiveFeed::new(8);
        let mut m1 = feed.subscribe("m-1".into());

        feed.publish(LiveUpdate::Round { round: round("r-2", "m-2") });
        feed.publish(LiveUpdate::Round { round: round("r-1", "m-1") });

        match m1.next().await {
            Some(LiveUpdate::Round { round }) => assert_eq!(round.id, RoundId::from("r-1")),
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_ahead() {
        let feed = LiveFeed::new(2);
        let mut m1 = feed.subscribe("m-1".into());

        for id in ["r-1", "r-2", "r-3"] {
            feed.publish(LiveUpdate::Round { round: round(id, "m-1") });
        }

        match m1.next().await {
            Some(LiveUpdate::Round { round }) => assert_eq!(round.id, RoundId::from("r-2")),
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_feed_closes_with_its_publishers() {
        let feed = LiveFeed::new(2);
        let mut m1 = feed.subscribe("m-1".into());
        drop(feed);

        assert!(m1.next().await.is_none());
    }

    #[test]
    fn test_update_wire_shape() {
        let json = serde_json::to_value(LiveUpdate::Round { round: round("r-1", "m-1") }).unwrap();
        assert_eq!(json["type"], "round");
        assert_eq!(json["round"]["id"], "r-1");
        assert_eq!(json["round"]["state"], "open");
    }
}
