//! Instance event protocol.
//!
//! Instances emit newline-delimited JSON records on stdout:
//!
//! ```text
//! {"ts": 1589987460000000000, "event": {"type": "finish", "outcome": "ok"}}
//! ```
//!
//! `ts` is unix time in nanoseconds. The envelope is first decoded into a
//! generic map, then the `event` member into a typed [`Event`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Start,
    Message,
    Metric,
    Finish,
}

/// Outcome carried by a `finish` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Failed,
    Crashed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Ok => "ok",
            Outcome::Failed => "failed",
            Outcome::Crashed => "crashed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown outcome: {0:?}")]
pub struct UnknownOutcome(pub String);

impl FromStr for Outcome {
    type Err = UnknownOutcome;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Outcome::Ok),
            "failed" => Ok(Outcome::Failed),
            "crashed" => Ok(Outcome::Crashed),
            other => Err(UnknownOutcome(other.to_string())),
        }
    }
}

/// A single structured event emitted by an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,

    /// Raw outcome; only meaningful on `finish`. Kept as a string so an
    /// unrecognized value is reported instead of failing the decode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runenv: Option<Value>,
}

impl Event {
    fn bare(kind: EventType) -> Self {
        Event {
            kind,
            outcome: None,
            error: None,
            stacktrace: None,
            message: None,
            metric: None,
            runenv: None,
        }
    }

    pub fn start() -> Self {
        Self::bare(EventType::Start)
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Event {
            message: Some(msg.into()),
            ..Self::bare(EventType::Message)
        }
    }

    pub fn metric(metric: Value) -> Self {
        Event {
            metric: Some(metric),
            ..Self::bare(EventType::Metric)
        }
    }

    pub fn ok() -> Self {
        Event {
            outcome: Some(Outcome::Ok.to_string()),
            ..Self::bare(EventType::Finish)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Event {
            outcome: Some(Outcome::Failed.to_string()),
            error: Some(error.into()),
            ..Self::bare(EventType::Finish)
        }
    }

    pub fn crashed(error: impl Into<String>, stacktrace: impl Into<String>) -> Self {
        Event {
            outcome: Some(Outcome::Crashed.to_string()),
            error: Some(error.into()),
            stacktrace: Some(stacktrace.into()),
            ..Self::bare(EventType::Finish)
        }
    }

    /// Typed outcome. A missing outcome is unknown.
    pub fn outcome(&self) -> Result<Outcome, UnknownOutcome> {
        match &self.outcome {
            Some(o) => o.parse(),
            None => Err(UnknownOutcome(String::new())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope has no event member")]
    MissingEvent,

    #[error("malformed event: {0}")]
    Event(#[source] serde_json::Error),
}

/// One line on an instance's stdout.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Emission time reported by the instance, if any.
    pub ts: Option<DateTime<Utc>>,
    pub event: Event,
}

impl Envelope {
    pub fn new(event: Event) -> Self {
        Envelope {
            ts: Some(Utc::now()),
            event,
        }
    }

    /// Decode one stdout line.
    pub fn parse(line: &[u8]) -> Result<Self, EnvelopeError> {
        let mut map: serde_json::Map<String, Value> = serde_json::from_slice(line)?;

        let ts = map
            .get("ts")
            .and_then(Value::as_i64)
            .map(DateTime::from_timestamp_nanos);

        let raw = map.remove("event").ok_or(EnvelopeError::MissingEvent)?;
        let event = serde_json::from_value(raw).map_err(EnvelopeError::Event)?;

        Ok(Envelope { ts, event })
    }

    /// Encode as a single protocol line, without the trailing newline.
    pub fn to_line(&self) -> String {
        let mut map = serde_json::Map::new();
        if let Some(nanos) = self.ts.and_then(|t| t.timestamp_nanos_opt()) {
            map.insert("ts".into(), Value::from(nanos));
        }
        map.insert(
            "event".into(),
            serde_json::to_value(&self.event).unwrap_or(Value::Null),
        );
        Value::Object(map).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_finish_ok() {
        let env =
            Envelope::parse(br#"{"ts":1589987460000000000,"event":{"type":"finish","outcome":"ok"}}"#)
                .unwrap();
        assert_eq!(env.event.kind, EventType::Finish);
        assert_eq!(env.event.outcome(), Ok(Outcome::Ok));
        assert_eq!(env.ts.unwrap().timestamp(), 1_589_987_460);
    }

    #[test]
    fn test_unknown_outcome_still_decodes() {
        let env = Envelope::parse(br#"{"event":{"type":"finish","outcome":"meh"}}"#).unwrap();
        assert!(env.ts.is_none());
        assert_eq!(env.event.outcome(), Err(UnknownOutcome("meh".into())));

        let env = Envelope::parse(br#"{"event":{"type":"finish"}}"#).unwrap();
        assert!(env.event.outcome().is_err());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            Envelope::parse(b"hello world"),
            Err(EnvelopeError::Json(_))
        ));
        assert!(matches!(
            Envelope::parse(br#"{"ts":1}"#),
            Err(EnvelopeError::MissingEvent)
        ));
        assert!(matches!(
            Envelope::parse(br#"{"event":{"type":"teleport"}}"#),
            Err(EnvelopeError::Event(_))
        ));
    }

    #[test]
    fn test_to_line_is_parseable() {
        let env = Envelope::new(Event::crashed("boom", "main.go:12"));
        let line = env.to_line();
        assert!(!line.contains('\n'));

        let back = Envelope::parse(line.as_bytes()).unwrap();
        assert_eq!(back.event.outcome(), Ok(Outcome::Crashed));
        assert_eq!(back.event.stacktrace.as_deref(), Some("main.go:12"));
    }
}
