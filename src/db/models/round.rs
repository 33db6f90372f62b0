use core::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct RoundId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct MatchId(pub String);

/// Lifecycle of a round. Variants are ordered so that `a < b` means `a` comes before `b`;
/// transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundState {
    Open,
    Locked,
    Finished,
}

impl RoundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundState::Open => "open",
            RoundState::Locked => "locked",
            RoundState::Finished => "finished",
        }
    }

    /// The only state a round may be in immediately before entering `self`
    pub fn predecessor(&self) -> Option<RoundState> {
        match self {
            RoundState::Open => None,
            RoundState::Locked => Some(RoundState::Open),
            RoundState::Finished => Some(RoundState::Locked),
        }
    }
}

impl FromStr for RoundState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(RoundState::Open),
            "locked" => Ok(RoundState::Locked),
            "finished" => Ok(RoundState::Finished),
            other => Err(StoreError::Decode {
                column: "state",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduled boundaries of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundWindow {
    pub open_at: DateTime<Utc>,
    pub lock_at: DateTime<Utc>,
    pub finish_at: DateTime<Utc>,
}

impl RoundWindow {
    pub fn is_ordered(&self) -> bool {
        self.open_at <= self.lock_at && self.lock_at <= self.finish_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub match_id: MatchId,
    pub state: RoundState,
    #[serde(flatten)]
    pub window: RoundWindow,
    /// When the round actually left `open`, which may be earlier than `lock_at` if a
    /// kickoff arrived first
    pub locked_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Round {
    pub fn new(id: RoundId, match_id: MatchId, window: RoundWindow, now: DateTime<Utc>) -> Self {
        Self {
            id,
            match_id,
            state: RoundState::Open,
            window,
            locked_at: None,
            finished_at: None,
            created_at: now,
        }
    }

    pub fn accepts_predictions_at(&self, now: DateTime<Utc>) -> bool {
        self.state == RoundState::Open && now < self.window.lock_at
    }

    /// Period of play whose events decide this round: from the moment it locked until it
    /// finished (or was scheduled to)
    pub fn play_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = match self.locked_at {
            Some(at) => at.min(self.window.lock_at),
            None => self.window.lock_at,
        };

        let end = match self.finished_at {
            Some(at) => at.min(self.window.finish_at),
            None => self.window.finish_at,
        };

        (start, end)
    }

    /// Applies a forward transition in place; callers are expected to have checked
    /// `predecessor()` already.
    pub(crate) fn advance(&mut self, to: RoundState, at: DateTime<Utc>) {
        match to {
            RoundState::Open => {}
            RoundState::Locked => self.locked_at = Some(at),
            RoundState::Finished => self.finished_at = Some(at),
        }

        self.state = to;
    }
}

/// Database row shape for the `rounds` table
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoundRow {
    pub id: String,
    pub match_id: String,
    pub state: String,
    pub open_at: DateTime<Utc>,
    pub lock_at: DateTime<Utc>,
    pub finish_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<RoundRow> for Round {
    type Error = StoreError;

    fn try_from(row: RoundRow) -> Result<Self, Self::Error> {
        Ok(Round {
            id: row.id.into(),
            match_id: row.match_id.into(),
            state: row.state.parse()?,
            window: RoundWindow {
                open_at: row.open_at,
                lock_at: row.lock_at,
                finish_at: row.finish_at,
            },
            locked_at: row.locked_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
        })
    }
}

impl From<String> for RoundId {
    fn from(value: String) -> Self {
        RoundId(value)
    }
}

impl From<&str> for RoundId {
    fn from(value: &str) -> Self {
        RoundId(value.to_string())
    }
}

impl From<String> for MatchId {
    fn from(value: String) -> Self {
        MatchId(value)
    }
}

impl From<&str> for MatchId {
    fn from(value: &str) -> Self {
        MatchId(value.to_string())
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_state_order_is_monotonic() {
        assert!(RoundState::Open < RoundState::Locked);
        assert!(RoundState::Locked < RoundState::Finished);
        assert_eq!(RoundState::Finished.predecessor(), Some(RoundState::Locked));
        assert_eq!(RoundState::Open.predecessor(), None);
    }

    #[test]
    fn test_state_parse() {
        assert_eq!("locked".parse::<RoundState>().unwrap(), RoundState::Locked);
        assert!("paused".parse::<RoundState>().is_err());
    }

    #[test]
    fn test_play_window_uses_early_lock() {
        let window = RoundWindow {
            open_at: at(0),
            lock_at: at(10),
            finish_at: at(190),
        };
        let mut round = Round::new("r".into(), "m".into(), window, at(0));
        assert_eq!(round.play_window(), (at(10), at(190)));

        round.advance(RoundState::Locked, at(4));
        assert_eq!(round.play_window(), (at(4), at(190)));

        round.advance(RoundState::Finished, at(90));
        assert_eq!(round.play_window(), (at(4), at(90)));
        assert_eq!(round.finished_at, Some(at(4) + Duration::seconds(86)));
    }

    #[test]
    fn test_accepts_predictions_deadline() {
        let window = RoundWindow {
            open_at: at(0),
            lock_at: at(10),
            finish_at: at(20),
        };
        let round = Round::new("r".into(), "m".into(), window, at(0));

        assert!(round.accepts_predictions_at(at(9)));
        assert!(!round.accepts_predictions_at(at(10)));
        assert!(!round.accepts_predictions_at(at(11)));
    }
}
