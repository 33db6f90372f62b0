use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::prediction::Outcome;
use super::round::MatchId;

/// Normalized event type. Anything the engine does not act on is kept verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Kickoff,
    Goal,
    Corner,
    YellowCard,
    FullTime,
    Other(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "kickoff" | "kick_off" => EventKind::Kickoff,
            "goal" => EventKind::Goal,
            "corner" => EventKind::Corner,
            "yellow_card" | "yellowcard" => EventKind::YellowCard,
            "full_time" | "fulltime" => EventKind::FullTime,
            _ => EventKind::Other(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Kickoff => "kickoff",
            EventKind::Goal => "goal",
            EventKind::Corner => "corner",
            EventKind::YellowCard => "yellow_card",
            EventKind::FullTime => "full_time",
            EventKind::Other(other) => other,
        }
    }

    /// Kickoff and full time move rounds through their lifecycle
    pub fn drives_lifecycle(&self) -> bool {
        matches!(self, EventKind::Kickoff | EventKind::FullTime)
    }

    /// The prediction outcome this event settles, if any
    pub fn scorable(&self) -> Option<Outcome> {
        match self {
            EventKind::Goal => Some(Outcome::Goal),
            EventKind::Corner => Some(Outcome::Corner),
            EventKind::YellowCard => Some(Outcome::YellowCard),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EventKind::parse(&raw))
    }
}

/// Event exactly as delivered by the provider webhook. Every field is optional here so that
/// missing fields surface as a malformed-event error instead of a generic parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingEvent {
    pub external_event_id: Option<String>,
    pub provider: Option<String>,
    pub match_id: Option<String>,
    pub event_type: Option<String>,
    pub minute: Option<i32>,
    pub payload: Option<serde_json::Value>,
}

/// A validated event that has not been stored yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub external_event_id: String,
    pub provider: String,
    pub match_id: MatchId,
    pub kind: EventKind,
    pub minute: Option<i32>,
    pub payload: serde_json::Value,
}

impl IncomingEvent {
    /// Returns the name of the first required field that is missing or blank
    pub fn validate(self) -> Result<NewEvent, &'static str> {
        fn required(value: Option<String>, field: &'static str) -> Result<String, &'static str> {
            match value {
                Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
                _ => Err(field),
            }
        }

        let external_event_id = required(self.external_event_id, "external_event_id")?;
        let provider = required(self.provider, "provider")?;
        let match_id = required(self.match_id, "match_id")?;
        let event_type = required(self.event_type, "event_type")?;

        Ok(NewEvent {
            external_event_id,
            provider,
            match_id: match_id.into(),
            kind: EventKind::parse(&event_type),
            minute: self.minute,
            payload: self.payload.unwrap_or(serde_json::Value::Null),
        })
    }
}

/// Stored, deduplicated match event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEvent {
    /// Store-assigned insertion order; breaks ties between equal `received_at` stamps
    pub seq: i64,
    pub external_event_id: String,
    pub provider: String,
    pub match_id: MatchId,
    pub kind: EventKind,
    pub minute: Option<i32>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl MatchEvent {
    pub fn from_new(event: NewEvent, seq: i64, received_at: DateTime<Utc>) -> Self {
        Self {
            seq,
            external_event_id: event.external_event_id,
            provider: event.provider,
            match_id: event.match_id,
            kind: event.kind,
            minute: event.minute,
            payload: event.payload,
            received_at,
        }
    }

    pub fn dedup_key(&self) -> (&str, &str) {
        (&self.external_event_id, &self.provider)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MatchEventRow {
    pub seq: i64,
    pub external_event_id: String,
    pub provider: String,
    pub match_id: String,
    pub event_type: String,
    pub minute: Option<i32>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl From<MatchEventRow> for MatchEvent {
    fn from(row: MatchEventRow) -> Self {
        MatchEvent {
            seq: row.seq,
            external_event_id: row.external_event_id,
            provider: row.provider,
            match_id: row.match_id.into(),
            kind: EventKind::parse(&row.event_type),
            minute: row.minute,
            payload: row.payload,
            received_at: row.received_at,
        }
    }
}
