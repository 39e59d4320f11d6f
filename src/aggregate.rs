//! Aggregate trait, the event codec bridge, and the versioned root wrapper.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::commit::{Commit, EventData, stream_uuid};
use crate::error::{CommitError, EventCodecError, StoreError};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the [`apply`](Aggregate::apply) method.
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O, no side effects.
///   It validates a command against the current state and returns zero or more events.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes ownership of
///   the current state and a reference to a domain event, returning the next state.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "order"). Part of the stream identity.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    ///
    /// Must use adjacently tagged serde
    /// (`#[serde(tag = "type", content = "data")]`).
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// Encode a domain event into its stored [`EventData`] form.
///
/// The adjacently tagged serialization produces an object like
/// `{"type": "Incremented"}` or `{"type": "Added", "data": {"amount": 5}}`;
/// the `"type"` field becomes the event type tag and the `"data"` portion
/// becomes the payload.
///
/// # Errors
///
/// [`EventCodecError::UntaggedShape`] when the event does not serialize to
/// a tagged object, [`EventCodecError::Json`] on serialization failure.
pub fn encode_event<A: Aggregate>(event: &A::DomainEvent) -> Result<EventData, EventCodecError> {
    let value = serde_json::to_value(event)?;
    let Value::Object(mut obj) = value else {
        return Err(EventCodecError::UntaggedShape);
    };
    let Some(Value::String(event_type)) = obj.remove("type") else {
        return Err(EventCodecError::UntaggedShape);
    };
    // Data is absent for fieldless variants.
    let payload = obj.remove("data").unwrap_or(Value::Null);
    Ok(EventData {
        event_id: Uuid::new_v4(),
        event_type,
        payload,
    })
}

/// Decode a stored [`EventData`] back into the aggregate's domain event.
///
/// # Errors
///
/// [`EventCodecError::Json`] when the stored tag or payload does not match
/// any variant of `A::DomainEvent`. Decoding failures surface loudly:
/// replay never silently skips an event it cannot interpret.
pub fn decode_event<A: Aggregate>(data: &EventData) -> Result<A::DomainEvent, EventCodecError> {
    let tagged = if data.payload.is_null() {
        serde_json::json!({ "type": data.event_type })
    } else {
        serde_json::json!({ "type": data.event_type, "data": data.payload })
    };
    serde_json::from_value(tagged).map_err(EventCodecError::from)
}

/// Hash of an aggregate's serialized state.
///
/// Used to detect illegal out-of-band mutation between load and save.
fn state_checksum<A: Serialize>(state: &A) -> Result<u64, serde_json::Error> {
    let bytes = serde_json::to_vec(state)?;
    let mut hasher = DefaultHasher::new();
    hasher.write(&bytes);
    Ok(hasher.finish())
}

/// A domain aggregate together with its stream identity and version.
///
/// `version` counts the commits applied so far; 0 means uninitialized
/// (no commit has ever been saved for this instance). The checksum is
/// recomputed on every legitimate mutation (replay, save) and verified
/// before a save; a mismatch means the state was mutated outside the
/// store's control.
///
/// The caller owns the instance exclusively between a `get` and the
/// matching `save`.
pub struct AggregateRoot<A: Aggregate> {
    stream_id: Uuid,
    instance_id: String,
    version: u64,
    state: A,
    checksum: u64,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Build an uninitialized root at version 0.
    pub(crate) fn fresh(instance_id: &str) -> Result<Self, StoreError> {
        let state = A::default();
        let checksum = state_checksum(&state).map_err(codec_error)?;
        Ok(Self {
            stream_id: stream_uuid(A::AGGREGATE_TYPE, instance_id),
            instance_id: instance_id.to_owned(),
            version: 0,
            state,
            checksum,
        })
    }

    /// Restore a root from snapshotted state at a known version.
    pub(crate) fn from_snapshot(
        instance_id: &str,
        version: u64,
        state: Value,
    ) -> Result<Self, serde_json::Error> {
        let state: A = serde_json::from_value(state)?;
        let checksum = state_checksum(&state)?;
        Ok(Self {
            stream_id: stream_uuid(A::AGGREGATE_TYPE, instance_id),
            instance_id: instance_id.to_owned(),
            version,
            state,
            checksum,
        })
    }

    /// The stream this aggregate's commits belong to.
    pub fn id(&self) -> Uuid {
        self.stream_id
    }

    /// The human-readable instance identifier within the aggregate type.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Number of commits applied to this instance.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// True once at least one commit has been applied.
    pub fn is_initialized(&self) -> bool {
        self.version > 0
    }

    /// The current domain state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Apply a commit's events to the state and advance the version.
    ///
    /// The commit applies atomically: all events are decoded before any is
    /// folded, so a decode failure leaves the root untouched.
    ///
    /// # Errors
    ///
    /// * [`CommitError::StreamIntegrity`] (wrapped) when the commit's
    ///   version is not exactly `version + 1`. A gap or overlap in replay
    ///   is fatal, never skipped or reordered.
    /// * [`StoreError::EventDecode`] when an event cannot be decoded.
    pub(crate) fn apply_commit(&mut self, commit: &Commit) -> Result<(), StoreError> {
        if commit.version != self.version + 1 {
            return Err(StoreError::Log(CommitError::StreamIntegrity {
                stream_id: self.stream_id,
                expected: self.version + 1,
                found: commit.version,
            }));
        }

        let mut events = Vec::with_capacity(commit.events.len());
        for data in &commit.events {
            let event = decode_event::<A>(data).map_err(|source| StoreError::EventDecode {
                stream_id: self.stream_id,
                event_type: data.event_type.clone(),
                source,
            })?;
            events.push(event);
        }

        let mut state = std::mem::take(&mut self.state);
        for event in &events {
            state = state.apply(event);
        }
        self.state = state;
        self.version = commit.version;
        self.checksum = state_checksum(&self.state).map_err(codec_error)?;
        Ok(())
    }

    /// Verify the state hash recorded at the last legitimate mutation.
    ///
    /// # Errors
    ///
    /// [`StoreError::TamperedAggregate`] on mismatch. This is a
    /// programming-error signal, not a recoverable condition.
    pub(crate) fn verify_checksum(&self) -> Result<(), StoreError> {
        let current = state_checksum(&self.state).map_err(codec_error)?;
        if current != self.checksum {
            return Err(StoreError::TamperedAggregate {
                stream_id: self.stream_id,
            });
        }
        Ok(())
    }

    /// Mutable state access for tamper tests only.
    #[cfg(test)]
    pub(crate) fn state_mut(&mut self) -> &mut A {
        &mut self.state
    }
}

fn codec_error(e: serde_json::Error) -> StoreError {
    StoreError::Log(CommitError::Codec(e))
}

// Manual `Clone`: a derive would require `A: Clone` on the struct's own
// bound list even though the trait already guarantees it.
impl<A: Aggregate> Clone for AggregateRoot<A> {
    fn clone(&self) -> Self {
        Self {
            stream_id: self.stream_id,
            instance_id: self.instance_id.clone(),
            version: self.version,
            state: self.state.clone(),
            checksum: self.checksum,
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregateRoot<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("instance_id", &self.instance_id)
            .field("version", &self.version)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::test_fixtures::{Counter, CounterCommand, CounterError, CounterEvent};
    use super::*;
    use crate::headers::Headers;

    fn commit_of(stream_id: Uuid, version: u64, events: Vec<EventData>) -> Commit {
        Commit::new(Uuid::new_v4(), stream_id, version, Headers::new(), events)
    }

    #[test]
    fn handle_decrement_at_zero_is_rejected() {
        let counter = Counter::default();
        let err = counter
            .handle(CounterCommand::Decrement)
            .expect_err("decrement at zero should be rejected");
        assert!(matches!(err, CounterError::AlreadyZero));
    }

    #[test]
    fn encode_decode_roundtrip_fieldless() {
        let data = encode_event::<Counter>(&CounterEvent::Incremented).expect("encode");
        assert_eq!(data.event_type, "Incremented");
        assert!(data.payload.is_null());

        let event = decode_event::<Counter>(&data).expect("decode");
        assert_eq!(event, CounterEvent::Incremented);
    }

    #[test]
    fn encode_decode_roundtrip_with_payload() {
        let data = encode_event::<Counter>(&CounterEvent::Added { amount: 5 }).expect("encode");
        assert_eq!(data.event_type, "Added");
        assert_eq!(data.payload, json!({"amount": 5}));

        let event = decode_event::<Counter>(&data).expect("decode");
        assert_eq!(event, CounterEvent::Added { amount: 5 });
    }

    #[test]
    fn decode_unknown_event_type_is_an_error() {
        let data = EventData::new("NoSuchEvent", Value::Null);
        let err = decode_event::<Counter>(&data).expect_err("unknown type should not decode");
        assert!(matches!(err, EventCodecError::Json(_)));
    }

    #[test]
    fn apply_commit_advances_version_and_folds_events() {
        let mut root = AggregateRoot::<Counter>::fresh("c-1").expect("fresh root");
        let commit = commit_of(
            root.id(),
            1,
            vec![
                encode_event::<Counter>(&CounterEvent::Incremented).expect("encode"),
                encode_event::<Counter>(&CounterEvent::Added { amount: 4 }).expect("encode"),
            ],
        );

        root.apply_commit(&commit).expect("apply should succeed");
        assert_eq!(root.version(), 1);
        assert_eq!(root.state().value, 5);
        root.verify_checksum().expect("checksum should match");
    }

    #[test]
    fn apply_commit_with_version_gap_is_fatal() {
        let mut root = AggregateRoot::<Counter>::fresh("c-1").expect("fresh root");
        let commit = commit_of(
            root.id(),
            3,
            vec![encode_event::<Counter>(&CounterEvent::Incremented).expect("encode")],
        );

        let err = root.apply_commit(&commit).expect_err("gap should fail");
        assert!(matches!(
            err,
            StoreError::Log(CommitError::StreamIntegrity {
                expected: 1,
                found: 3,
                ..
            })
        ));
        // Nothing was applied.
        assert_eq!(root.version(), 0);
        assert_eq!(root.state().value, 0);
    }

    #[test]
    fn apply_commit_with_undecodable_event_leaves_root_untouched() {
        let mut root = AggregateRoot::<Counter>::fresh("c-1").expect("fresh root");
        let commit = commit_of(
            root.id(),
            1,
            vec![
                encode_event::<Counter>(&CounterEvent::Incremented).expect("encode"),
                EventData::new("Bogus", Value::Null),
            ],
        );

        let err = root.apply_commit(&commit).expect_err("decode should fail");
        assert!(matches!(err, StoreError::EventDecode { .. }));
        assert_eq!(root.version(), 0, "partial application is forbidden");
        assert_eq!(root.state().value, 0);
    }

    #[test]
    fn out_of_band_mutation_fails_checksum_verification() {
        let mut root = AggregateRoot::<Counter>::fresh("c-1").expect("fresh root");
        root.verify_checksum().expect("fresh root should verify");

        root.state_mut().value = 99;

        let err = root.verify_checksum().expect_err("tamper should be detected");
        assert!(matches!(err, StoreError::TamperedAggregate { .. }));
    }

    #[test]
    fn snapshot_restore_matches_replayed_state() {
        let mut root = AggregateRoot::<Counter>::fresh("c-1").expect("fresh root");
        let commit = commit_of(
            root.id(),
            1,
            vec![encode_event::<Counter>(&CounterEvent::Added { amount: 7 }).expect("encode")],
        );
        root.apply_commit(&commit).expect("apply should succeed");

        let state = serde_json::to_value(root.state()).expect("serialize state");
        let restored =
            AggregateRoot::<Counter>::from_snapshot("c-1", root.version(), state).expect("restore");

        assert_eq!(restored.version(), 1);
        assert_eq!(restored.state().value, 7);
        assert_eq!(restored.id(), root.id());
        restored
            .verify_checksum()
            .expect("restored checksum should match");
    }
}
