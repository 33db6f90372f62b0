use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::prediction::{PredictionId, UserId};
use super::round::RoundId;

/// Outcome of scoring exactly one prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDelta {
    pub prediction_id: PredictionId,
    pub user_id: UserId,
    pub round_id: RoundId,
    pub points: i64,
    pub correct: bool,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub total_points: i64,
    pub correct_count: i64,
    pub total_count: i64,
    pub accuracy: f64,
    pub updated_at: DateTime<Utc>,
}

/// `correct / total * 100` rounded to two decimal places; zero when nothing was scored
pub fn accuracy(correct: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }

    let pct = correct as f64 * 100.0 / total as f64;
    (pct * 100.0).round() / 100.0
}

impl LeaderboardEntry {
    pub fn empty(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            total_points: 0,
            correct_count: 0,
            total_count: 0,
            accuracy: 0.0,
            updated_at: now,
        }
    }

    /// Folds one delta into the running totals
    pub fn absorb(&mut self, delta: &ScoreDelta) {
        self.total_points += delta.points;
        self.correct_count += i64::from(delta.correct);
        self.total_count += 1;
        self.accuracy = accuracy(self.correct_count, self.total_count);
        self.updated_at = self.updated_at.max(delta.applied_at);
    }
}

/// Leaderboard order: points descending, most recently updated first, then user id so the
/// order is total
pub fn leaderboard_order(a: &LeaderboardEntry, b: &LeaderboardEntry) -> std::cmp::Ordering {
    b.total_points
        .cmp(&a.total_points)
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeaderboardRow {
    pub user_id: String,
    pub total_points: i64,
    pub correct_count: i64,
    pub total_count: i64,
    pub accuracy: f64,
    pub updated_at: DateTime<Utc>,
}

impl From<LeaderboardRow> for LeaderboardEntry {
    fn from(row: LeaderboardRow) -> Self {
        LeaderboardEntry {
            user_id: row.user_id.into(),
            total_points: row.total_points,
            correct_count: row.correct_count,
            total_count: row.total_count,
            accuracy: row.accuracy,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScoreDeltaRow {
    pub prediction_id: Uuid,
    pub user_id: String,
    pub round_id: String,
    pub points: i64,
    pub is_correct: bool,
    pub applied_at: DateTime<Utc>,
}

impl From<ScoreDeltaRow> for ScoreDelta {
    fn from(row: ScoreDeltaRow) -> Self {
        ScoreDelta {
            prediction_id: PredictionId(row.prediction_id),
            user_id: row.user_id.into(),
            round_id: row.round_id.into(),
            points: row.points,
            correct: row.is_correct,
            applied_at: row.applied_at,
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    fn delta(points: i64, correct: bool, secs: i64) -> ScoreDelta {
        ScoreDelta {
            prediction_id: PredictionId::new(),
            user_id: "u".into(),
            round_id: "r".into(),
            points,
            correct,
            applied_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_accuracy_formula() {
        assert_eq!(accuracy(0, 0), 0.0);
        assert_eq!(accuracy(3, 4), 75.0);
        assert_eq!(accuracy(1, 3), 33.33);
        assert_eq!(accuracy(2, 3), 66.67);
    }

    #[test]
    fn test_absorb_accumulates() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut entry = LeaderboardEntry::empty("u".into(), start);

        for d in [delta(30, true, 1), delta(0, false, 2), delta(20, true, 3), delta(10, true, 4)] {
            entry.absorb(&d);
        }

        assert_eq!(entry.total_points, 60);
        assert_eq!(entry.correct_count, 3);
        assert_eq!(entry.total_count, 4);
        assert_eq!(entry.accuracy, 75.0);
        assert_eq!(entry.updated_at, start + chrono::Duration::seconds(4));
    }

    #[test]
    fn test_leaderboard_order_breaks_ties_on_recency() {
        let t = |s: i64| Utc.timestamp_opt(1_700_000_000 + s, 0).unwrap();
        let mut entries = vec![
            LeaderboardEntry { total_points: 10, ..LeaderboardEntry::empty("a".into(), t(1)) },
            LeaderboardEntry { total_points: 30, ..LeaderboardEntry::empty("b".into(), t(1)) },
            LeaderboardEntry { total_points: 10, ..LeaderboardEntry::empty("c".into(), t(5)) },
        ];
        entries.sort_by(leaderboard_order);

        let ids: Vec<_> = entries.iter().map(|e| e.user_id.0.as_str()).collect();
        assert_eq!(ids, ["b", "c", "a"]);
    }
}
