//! Crate-level error types for the log, store, context, scheduler, and
//! processors.
//!
//! The taxonomy separates expected outcomes (a concurrency conflict that the
//! processor retries) from fatal conditions (a stream with a version gap, a
//! context released out of order). Conflicts are never swallowed below the
//! processor: the store and log propagate them unchanged.

use std::time::Duration;

use uuid::Uuid;

/// Error raised while encoding or decoding a domain event.
///
/// Domain events use adjacently tagged serde (`#[serde(tag = "type",
/// content = "data")]`); an event type that serializes to anything other
/// than a tagged JSON object cannot be stored.
#[derive(Debug, thiserror::Error)]
pub enum EventCodecError {
    /// The domain event did not serialize to an adjacently tagged object.
    #[error("domain event did not serialize to an adjacently tagged object")]
    UntaggedShape,

    /// Serialization or deserialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Error returned by [`EventLog`](crate::EventLog) operations.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// Another writer committed the attempted version first.
    ///
    /// Expected under concurrent load. The aggregate store propagates this
    /// unchanged; only the processor's retry loop decides to retry.
    #[error("concurrency conflict on stream {stream_id}: version {attempted} was taken by another writer")]
    Conflict {
        /// Stream the commit targeted.
        stream_id: Uuid,
        /// The version the losing writer attempted to claim.
        attempted: u64,
    },

    /// A commit's version does not line up with the stream head.
    ///
    /// Indicates a corrupted log or a bug in the caller. Never retried.
    #[error("stream {stream_id} integrity violation: expected version {expected}, found {found}")]
    StreamIntegrity {
        /// Stream the violation was observed on.
        stream_id: Uuid,
        /// The only version the stream would have accepted or replayed next.
        expected: u64,
        /// The version actually presented.
        found: u64,
    },

    /// Disk I/O failure in a file-backed log.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be parsed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Error returned by [`AggregateStore`](crate::AggregateStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An underlying event log failure, including concurrency conflicts.
    #[error(transparent)]
    Log(#[from] CommitError),

    /// The aggregate's state hash no longer matches its contents.
    ///
    /// The in-memory instance was mutated outside a save. Programming
    /// error, not recoverable.
    #[error("aggregate on stream {stream_id} was mutated outside a save (checksum mismatch)")]
    TamperedAggregate {
        /// Stream of the tampered aggregate.
        stream_id: Uuid,
    },

    /// A stored event could not be decoded into the aggregate's event type.
    #[error("failed to decode event '{event_type}' on stream {stream_id}: {source}")]
    EventDecode {
        /// Stream the undecodable event belongs to.
        stream_id: Uuid,
        /// Persisted event type tag.
        event_type: String,
        /// Underlying codec failure.
        #[source]
        source: EventCodecError,
    },
}

impl StoreError {
    /// True when this error is a concurrency conflict that a retry loop may
    /// resolve by reloading and re-running the unit of work.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Log(CommitError::Conflict { .. }))
    }
}

/// Error raised by [`ExecutionContext`](crate::ExecutionContext) misuse.
///
/// All variants are programming errors: the context lifetime is a strict
/// stack discipline and violations indicate a bug in the calling code.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The context was closed from a thread other than its creator.
    #[error("execution context closed from a thread other than its creator")]
    ThreadViolation,

    /// The context was closed while an inner context was still open.
    #[error("execution context closed while an inner context is still open")]
    OrderViolation,

    /// No context is active on the current thread.
    #[error("no execution context is active on this thread")]
    NoActiveContext,
}

/// Error surfaced by the [`PartitionedScheduler`](crate::PartitionedScheduler).
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The unit of work panicked; the partition queue keeps draining.
    #[error("unit of work panicked: {0}")]
    Panicked(String),

    /// The scheduler no longer admits work.
    #[error("scheduler is shut down")]
    Shutdown,
}

/// Error returned by the command and event processors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// No handler is registered for the message's target type.
    ///
    /// Fatal for this message; never retried.
    #[error("no handler registered for '{0}'")]
    HandlerNotFound(String),

    /// The message payload could not be deserialized into the handler's
    /// command type.
    #[error("malformed payload for '{kind}': {source}")]
    MalformedMessage {
        /// The message's declared target type.
        kind: String,
        /// Underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// The domain handler rejected the message.
    #[error("handler rejected message: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A raised event could not be encoded for persistence.
    #[error("event encoding failed: {0}")]
    Codec(#[from] EventCodecError),

    /// The aggregate store failed, including concurrency conflicts.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Execution context misuse inside the unit of work.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The scheduler rejected or lost the unit of work.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The retry budget was exhausted without resolving a conflict.
    ///
    /// Carries the final error for diagnosis; `correlation_id` identifies
    /// the unit of work that timed out.
    #[error("retry budget exhausted after {elapsed:?} for unit {correlation_id}")]
    RetryTimeout {
        /// Correlation id of the unit of work that gave up.
        correlation_id: Uuid,
        /// Wall-clock time spent retrying.
        elapsed: Duration,
        /// The last error observed before giving up.
        #[source]
        source: Box<ProcessError>,
    },
}

impl ProcessError {
    /// True when this error is a concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}
