//! Commit and event payload types shared by the log, store, and processors.
//!
//! A [`Commit`] is the unit of persistence: an immutable, versioned batch of
//! events appended atomically to one aggregate stream. [`EventData`] is the
//! stored form of a single domain fact. No I/O occurs here.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::headers::Headers;

/// Fixed namespace UUID for deterministic stream id derivation.
///
/// Stream ids are UUID v5 values derived from this namespace and the
/// `"{aggregate_type}/{instance_id}"` string, so the same aggregate
/// identity always maps to the same stream regardless of which process
/// performs the mapping.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x4f, 0x82, 0x1d, 0x6a, 0x0e, 0x5c, 0x45, 0x91, 0x9d, 0x27, 0x8b, 0x44, 0x3a, 0x1f, 0x6e, 0xd2,
]);

/// Derive a deterministic stream UUID from aggregate type and instance id.
///
/// # Examples
///
/// ```
/// use ledgerstream::stream_uuid;
/// let id = stream_uuid("order", "o-1");
/// assert_eq!(id, stream_uuid("order", "o-1")); // deterministic
/// assert_ne!(id, stream_uuid("order", "o-2"));
/// ```
pub fn stream_uuid(aggregate_type: &str, instance_id: &str) -> Uuid {
    let name = format!("{aggregate_type}/{instance_id}");
    Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes())
}

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The stored form of a single domain event.
///
/// `event_type` is the tag of the adjacently tagged domain enum variant;
/// `payload` is its `"data"` portion, or `Null` for fieldless variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Unique id of this event occurrence.
    pub event_id: Uuid,
    /// Event type tag (e.g. `"Incremented"`).
    pub event_type: String,
    /// JSON payload of the event, `Null` when the variant has no fields.
    pub payload: Value,
}

impl EventData {
    /// Build an event with a freshly generated id.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// An immutable, versioned batch of events for one aggregate stream.
///
/// `version` is the stream version this commit transitions the stream *to*:
/// the first commit of a stream has version 1. The log accepts a commit
/// only when its version is exactly one past the current stream head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    /// Identity of this commit attempt; two commits at the same version
    /// with different ids are a conflict, with the same id a duplicate.
    pub commit_id: Uuid,
    /// Correlation id of the unit of work that produced this commit.
    pub correlation_id: Uuid,
    /// Stream this commit belongs to.
    pub stream_id: Uuid,
    /// The stream version after this commit applies.
    pub version: u64,
    /// Milliseconds since the Unix epoch at commit build time.
    pub timestamp_ms: u64,
    /// Metadata attached to the commit as a whole.
    pub headers: Headers,
    /// The events of this commit, in raise order.
    pub events: Vec<EventData>,
}

impl Commit {
    /// Build a commit with a fresh commit id and the current timestamp.
    pub fn new(
        correlation_id: Uuid,
        stream_id: Uuid,
        version: u64,
        headers: Headers,
        events: Vec<EventData>,
    ) -> Self {
        Self {
            commit_id: Uuid::new_v4(),
            correlation_id,
            stream_id,
            version,
            timestamp_ms: unix_timestamp_ms(),
            headers,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_uuid_is_deterministic() {
        assert_eq!(stream_uuid("counter", "c-1"), stream_uuid("counter", "c-1"));
    }

    #[test]
    fn stream_uuid_separates_types_and_instances() {
        assert_ne!(stream_uuid("counter", "c-1"), stream_uuid("counter", "c-2"));
        assert_ne!(stream_uuid("counter", "c-1"), stream_uuid("order", "c-1"));
        // The separator is part of the hashed name: "a/bc" must not
        // collide with "ab/c".
        assert_ne!(stream_uuid("a", "bc"), stream_uuid("ab", "c"));
    }

    #[test]
    fn event_data_gets_unique_ids() {
        let a = EventData::new("Opened", Value::Null);
        let b = EventData::new("Opened", Value::Null);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.event_type, "Opened");
    }

    #[test]
    fn commit_serde_roundtrip() {
        let commit = Commit::new(
            Uuid::new_v4(),
            stream_uuid("counter", "c-1"),
            1,
            Headers::new().with("origin", json!("test")),
            vec![EventData::new("Incremented", Value::Null)],
        );

        let text = serde_json::to_string(&commit).expect("serialize");
        let back: Commit = serde_json::from_str(&text).expect("deserialize");

        assert_eq!(back.commit_id, commit.commit_id);
        assert_eq!(back.version, 1);
        assert_eq!(back.events, commit.events);
        assert_eq!(back.headers, commit.headers);
    }
}
