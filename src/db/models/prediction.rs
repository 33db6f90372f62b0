use core::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::round::RoundId;
use crate::db::StoreError;

/// Opaque, already-authenticated caller identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct PredictionId(pub Uuid);

impl PredictionId {
    pub fn new() -> Self {
        PredictionId(Uuid::new_v4())
    }
}

impl Default for PredictionId {
    fn default() -> Self {
        Self::new()
    }
}

/// What a user expects to happen first once the round locks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Goal,
    Corner,
    YellowCard,
    Nothing,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Goal => "goal",
            Outcome::Corner => "corner",
            Outcome::YellowCard => "yellow_card",
            Outcome::Nothing => "nothing",
        }
    }
}

impl FromStr for Outcome {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "goal" => Ok(Outcome::Goal),
            "corner" => Ok(Outcome::Corner),
            "yellow_card" => Ok(Outcome::YellowCard),
            "nothing" => Ok(Outcome::Nothing),
            other => Err(StoreError::Decode {
                column: "outcome",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: PredictionId,
    pub user_id: UserId,
    pub round_id: RoundId,
    pub outcome: Outcome,
    pub submitted_at: DateTime<Utc>,
    pub is_correct: Option<bool>,
    pub points: Option<i64>,
    pub scored_at: Option<DateTime<Utc>>,
}

impl Prediction {
    pub fn new(user_id: UserId, round_id: RoundId, outcome: Outcome, now: DateTime<Utc>) -> Self {
        Self {
            id: PredictionId::new(),
            user_id,
            round_id,
            outcome,
            submitted_at: now,
            is_correct: None,
            points: None,
            scored_at: None,
        }
    }

    pub fn is_scored(&self) -> bool {
        self.points.is_some()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PredictionRow {
    pub id: Uuid,
    pub user_id: String,
    pub round_id: String,
    pub outcome: String,
    pub submitted_at: DateTime<Utc>,
    pub is_correct: Option<bool>,
    pub points: Option<i64>,
    pub scored_at: Option<DateTime<Utc>>,
}

impl TryFrom<PredictionRow> for Prediction {
    type Error = StoreError;

    fn try_from(row: PredictionRow) -> Result<Self, Self::Error> {
        Ok(Prediction {
            id: PredictionId(row.id),
            user_id: row.user_id.into(),
            round_id: row.round_id.into(),
            outcome: row.outcome.parse()?,
            submitted_at: row.submitted_at,
            is_correct: row.is_correct,
            points: row.points,
            scored_at: row.scored_at,
        })
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        UserId(value)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId(value.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PredictionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_outcome_wire_names() {
        let parsed: Outcome = serde_json::from_str("\"yellow_card\"").unwrap();
        assert_eq!(parsed, Outcome::YellowCard);
        assert_eq!(parsed.as_str().parse::<Outcome>().unwrap(), Outcome::YellowCard);
        assert!(serde_json::from_str::<Outcome>("\"penalty\"").is_err());
    }
}
