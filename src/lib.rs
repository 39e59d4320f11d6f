//! Event-sourced aggregate store with partitioned command scheduling.
//!
//! Domain state is persisted as an ordered, append-only log of commits per
//! aggregate stream and reconstructed by replay, optionally accelerated by
//! snapshots. Concurrent modifications of one aggregate are serialized by
//! a partitioned scheduler and conflict-detected optimistically at the
//! log; the command processor resolves conflicts by reloading and
//! re-running the handler under an exponential-backoff budget.

mod aggregate;
pub use aggregate::{Aggregate, AggregateRoot, decode_event, encode_event};

mod cache;
pub use cache::{
    AggregateKey, AggregateLockGuard, AggregateLockSet, CacheConfig, CachedAggregateStore,
};

mod commit;
pub use commit::{Commit, EventData, stream_uuid};

mod context;
pub use context::{AmbientContext, ExecutionContext};

mod error;
pub use error::{
    CommitError, ContextError, EventCodecError, ProcessError, ScheduleError, StoreError,
};

pub mod headers;
pub use headers::Headers;

mod journal;
pub use journal::{JournalEventLog, StreamLayout};

mod log;
pub use log::{EventLog, MemoryEventLog, SaveOutcome};

mod processor;
pub use processor::{
    CommandEnvelope, CommandProcessor, CommandProcessorBuilder, EventEnvelope, EventHandler,
    EventProcessor, EventProcessorBuilder, NeverTransient, RetryPolicy, TransienceClassifier,
};

mod scheduler;
pub use scheduler::{JobHandle, PartitionedScheduler, SchedulerConfig};

mod snapshot;
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore};

mod store;
pub use store::{AggregateAccess, AggregateStore, SaveReceipt, StoreConfig};
