//! In-process store used by tests and by database-less runs.
//!
//! Each round lives in its own slot behind its own mutex, so submissions and transitions for
//! one round serialize against each other without touching any other round. Events and score
//! bookkeeping each have their own lock. Lock order is always index -> round slot -> scores.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::db::StoreResult;
use crate::db::models::event::{MatchEvent, NewEvent};
use crate::db::models::leaderboard::{LeaderboardEntry, ScoreDelta, leaderboard_order};
use crate::db::models::prediction::{Prediction, UserId};
use crate::db::models::round::{MatchId, Round, RoundId, RoundState};
use crate::db::store::{
    EventStore, PredictionStore, RoundStore, ScoreStore, SubmitOutcome, Transition,
};

type Slot = Arc<Mutex<RoundSlot>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    rounds: RwLock<RoundIndex>,
    events: Mutex<EventLog>,
    scores: Mutex<ScoreBook>,
}

#[derive(Debug, Default)]
struct RoundIndex {
    slots: HashMap<RoundId, Slot>,
    by_match: HashMap<MatchId, Vec<RoundId>>,
}

#[derive(Debug)]
struct RoundSlot {
    round: Round,
    predictions: HashMap<UserId, Prediction>,
}

#[derive(Debug, Default)]
struct EventLog {
    seen: HashMap<(String, String), MatchEvent>,
    by_match: HashMap<MatchId, Vec<MatchEvent>>,
    next_seq: i64,
    last_received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ScoreBook {
    deltas: Vec<ScoreDelta>,
    entries: HashMap<UserId, LeaderboardEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: &RoundId) -> Option<Slot> {
        self.rounds.read().await.slots.get(id).cloned()
    }

    async fn all_slots(&self) -> Vec<Slot> {
        self.rounds.read().await.slots.values().cloned().collect()
    }

    async fn sorted_entries(&self) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> =
            self.scores.lock().await.entries.values().cloned().collect();
        entries.sort_by(leaderboard_order);
        entries
    }
}

#[async_trait]
impl RoundStore for MemoryStore {
    async fn insert_round(&self, round: &Round) -> StoreResult<bool> {
        let mut guard = self.rounds.write().await;
        let index = &mut *guard;
        match index.slots.entry(round.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(RoundSlot {
                    round: round.clone(),
                    predictions: HashMap::new(),
                })));
                index
                    .by_match
                    .entry(round.match_id.clone())
                    .or_default()
                    .push(round.id.clone());

                Ok(true)
            }
        }
    }

    async fn get_round(&self, id: &RoundId) -> StoreResult<Option<Round>> {
        Ok(match self.slot(id).await {
            Some(slot) => Some(slot.lock().await.round.clone()),
            None => None,
        })
    }

    async fn rounds_for_match(&self, match_id: &MatchId) -> StoreResult<Vec<Round>> {
        let slots: Vec<Slot> = {
            let index = self.rounds.read().await;
            index
                .by_match
                .get(match_id)
                .map(|ids| ids.iter().filter_map(|id| index.slots.get(id).cloned()).collect())
                .unwrap_or_default()
        };

        let mut rounds = Vec::with_capacity(slots.len());
        for slot in slots {
            rounds.push(slot.lock().await.round.clone());
        }

        Ok(rounds)
    }

    async fn rounds_in_state(&self, state: RoundState) -> StoreResult<Vec<Round>> {
        let mut rounds = Vec::new();
        for slot in self.all_slots().await {
            let slot = slot.lock().await;
            if slot.round.state == state {
                rounds.push(slot.round.clone());
            }
        }

        Ok(rounds)
    }

    #[instrument(skip(self))]
    async fn transition(
        &self,
        id: &RoundId,
        to: RoundState,
        at: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        let Some(slot) = self.slot(id).await else {
            return Ok(Transition::Missing);
        };

        let mut slot = slot.lock().await;
        if Some(slot.round.state) == to.predecessor() {
            slot.round.advance(to, at);
            Ok(Transition::Applied(slot.round.clone()))
        } else {
            Ok(Transition::Unchanged(slot.round.clone()))
        }
    }
}

#[async_trait]
impl PredictionStore for MemoryStore {
    async fn insert_if_open(
        &self,
        prediction: &Prediction,
        now: DateTime<Utc>,
    ) -> StoreResult<SubmitOutcome> {
        let Some(slot) = self.slot(&prediction.round_id).await else {
            return Ok(SubmitOutcome::UnknownRound);
        };

        let mut slot = slot.lock().await;
        if !slot.round.accepts_predictions_at(now) {
            return Ok(SubmitOutcome::Closed {
                state: slot.round.state,
            });
        }

        Ok(match slot.predictions.entry(prediction.user_id.clone()) {
            Entry::Occupied(existing) => SubmitOutcome::Duplicate(existing.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(prediction.clone());
                SubmitOutcome::Accepted(prediction.clone())
            }
        })
    }

    async fn get_prediction(
        &self,
        user_id: &UserId,
        round_id: &RoundId,
    ) -> StoreResult<Option<Prediction>> {
        Ok(match self.slot(round_id).await {
            Some(slot) => slot.lock().await.predictions.get(user_id).cloned(),
            None => None,
        })
    }

    async fn predictions_for_round(&self, round_id: &RoundId) -> StoreResult<Vec<Prediction>> {
        let mut predictions: Vec<Prediction> = match self.slot(round_id).await {
            Some(slot) => slot.lock().await.predictions.values().cloned().collect(),
            None => Vec::new(),
        };

        predictions.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(predictions)
    }

    async fn unscored_for_round(&self, round_id: &RoundId) -> StoreResult<Vec<Prediction>> {
        let mut predictions = self.predictions_for_round(round_id).await?;
        predictions.retain(|p| !p.is_scored());
        Ok(predictions)
    }

    async fn rounds_awaiting_score(&self) -> StoreResult<Vec<RoundId>> {
        let mut ids = Vec::new();
        for slot in self.all_slots().await {
            let slot = slot.lock().await;
            if slot.round.state != RoundState::Open
                && slot.predictions.values().any(|p| !p.is_scored())
            {
                ids.push(slot.round.id.clone());
            }
        }

        Ok(ids)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        event: NewEvent,
        received_at: DateTime<Utc>,
    ) -> StoreResult<Option<MatchEvent>> {
        let mut log = self.events.lock().await;

        let key = (event.external_event_id.clone(), event.provider.clone());
        if log.seen.contains_key(&key) {
            return Ok(None);
        }

        // receipt order and insertion order must agree
        let received_at = match log.last_received_at {
            Some(last) if last > received_at => last,
            _ => received_at,
        };
        log.last_received_at = Some(received_at);
        log.next_seq += 1;

        let stored = MatchEvent::from_new(event, log.next_seq, received_at);
        log.seen.insert(key, stored.clone());
        log.by_match
            .entry(stored.match_id.clone())
            .or_default()
            .push(stored.clone());

        Ok(Some(stored))
    }

    async fn find_event(
        &self,
        external_event_id: &str,
        provider: &str,
    ) -> StoreResult<Option<MatchEvent>> {
        let key = (external_event_id.to_string(), provider.to_string());
        Ok(self.events.lock().await.seen.get(&key).cloned())
    }

    async fn events_for_match(&self, match_id: &MatchId) -> StoreResult<Vec<MatchEvent>> {
        Ok(self
            .events
            .lock()
            .await
            .by_match
            .get(match_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ScoreStore for MemoryStore {
    #[instrument(skip(self, delta), fields(prediction = %delta.prediction_id))]
    async fn commit_delta(&self, delta: &ScoreDelta) -> StoreResult<Option<LeaderboardEntry>> {
        let Some(slot) = self.slot(&delta.round_id).await else {
            return Ok(None);
        };

        let mut slot = slot.lock().await;
        let Some(prediction) = slot.predictions.get_mut(&delta.user_id) else {
            return Ok(None);
        };

        if prediction.id != delta.prediction_id || prediction.is_scored() {
            return Ok(None);
        }

        prediction.points = Some(delta.points);
        prediction.is_correct = Some(delta.correct);
        prediction.scored_at = Some(delta.applied_at);

        let mut book = self.scores.lock().await;
        book.deltas.push(delta.clone());

        let entry = book
            .entries
            .entry(delta.user_id.clone())
            .or_insert_with(|| LeaderboardEntry::empty(delta.user_id.clone(), delta.applied_at));
        entry.absorb(delta);

        Ok(Some(entry.clone()))
    }

    async fn deltas_for_user(&self, user_id: &UserId) -> StoreResult<Vec<ScoreDelta>> {
        Ok(self
            .scores
            .lock()
            .await
            .deltas
            .iter()
            .filter(|d| &d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn leaderboard_entry(&self, user_id: &UserId) -> StoreResult<Option<LeaderboardEntry>> {
        Ok(self.scores.lock().await.entries.get(user_id).cloned())
    }

    async fn leaderboard_page(
        &self,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<LeaderboardEntry>, i64)> {
        let entries = self.sorted_entries().await;
        let total = entries.len() as i64;
        let page = entries
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();

        Ok((page, total))
    }

    fn leaderboard_stream(&self) -> BoxStream<'_, StoreResult<LeaderboardEntry>> {
        stream::once(self.sorted_entries())
            .flat_map(|entries| stream::iter(entries.into_iter().map(Ok)))
            .boxed()
    }

    #[instrument(skip(self))]
    async fn rebuild_leaderboard(&self) -> StoreResult<usize> {
        let mut book = self.scores.lock().await;

        let mut rebuilt: HashMap<UserId, LeaderboardEntry> = HashMap::new();
        for delta in &book.deltas {
            rebuilt
                .entry(delta.user_id.clone())
                .or_insert_with(|| LeaderboardEntry::empty(delta.user_id.clone(), delta.applied_at))
                .absorb(delta);
        }

        let count = rebuilt.len();
        book.entries = rebuilt;

        Ok(count)
    }
}
