//! The aggregate store: load by snapshot + replay, save with optimistic
//! concurrency.
//!
//! `get` reconstructs an aggregate from its last snapshot (if any) plus a
//! tail replay of newer commits. `save` turns the execution context's
//! raised events into a single commit targeting `version + 1` and submits
//! it to the event log; a conflict from the log propagates unchanged, since
//! only the caller can decide whether to reload and re-run its business
//! logic. Snapshot writes are best-effort on both paths.

use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::commit::Commit;
use crate::context::ExecutionContext;
use crate::error::StoreError;
use crate::headers;
use crate::log::{EventLog, SaveOutcome};
use crate::snapshot::{Snapshot, SnapshotStore};

/// Tunables for the aggregate store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Commits between snapshots. A snapshot is written when a save lands
    /// on a multiple of this interval, or when a `get` replayed at least
    /// this many commits past the previous snapshot. `0` disables
    /// snapshotting entirely.
    pub snapshot_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 100,
        }
    }
}

/// What a `save` did, for callers that want to observe the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReceipt {
    /// False when the context had raised no events and the save was a no-op.
    pub committed: bool,
    /// The aggregate's version after the save.
    pub version: u64,
    /// Identity of the commit written, when one was.
    pub commit_id: Option<Uuid>,
}

/// Load/save access to aggregates, implemented by both the plain
/// [`AggregateStore`] and the caching decorator.
///
/// The processor's typed dispatchers are generic over this trait so a
/// deployment chooses per-processor whether loads go through the cache.
pub trait AggregateAccess: Send + Sync {
    /// Load an aggregate by snapshot + tail replay.
    fn get<A: Aggregate>(
        &self,
        instance_id: &str,
    ) -> impl Future<Output = Result<AggregateRoot<A>, StoreError>> + Send;

    /// Commit the context's raised events against the aggregate.
    fn save<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        ctx: &ExecutionContext,
    ) -> impl Future<Output = Result<SaveReceipt, StoreError>> + Send;
}

/// Orchestrates aggregate loading and committing over an [`EventLog`] and
/// a [`SnapshotStore`].
///
/// `Clone` is cheap; all backends are `Arc`-wrapped.
#[derive(Clone)]
pub struct AggregateStore {
    log: Arc<dyn EventLog>,
    snapshots: Arc<dyn SnapshotStore>,
    config: StoreConfig,
}

impl AggregateStore {
    /// Build a store with the default configuration.
    pub fn new(log: Arc<dyn EventLog>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self::with_config(log, snapshots, StoreConfig::default())
    }

    /// Build a store with explicit configuration.
    pub fn with_config(
        log: Arc<dyn EventLog>,
        snapshots: Arc<dyn SnapshotStore>,
        config: StoreConfig,
    ) -> Self {
        Self {
            log,
            snapshots,
            config,
        }
    }

    /// The event log backing this store.
    ///
    /// Exposed for dispatch bookkeeping (`undispatched` / `mark_dispatched`)
    /// and maintenance.
    pub fn log(&self) -> Arc<dyn EventLog> {
        Arc::clone(&self.log)
    }

    /// Load an aggregate.
    ///
    /// Starts from the last snapshot when one exists (any snapshot failure
    /// degrades to a full replay), then applies every commit with a newer
    /// version, in order.
    ///
    /// # Errors
    ///
    /// * [`StoreError::Log`] on log failures, including a
    ///   [`CommitError::StreamIntegrity`](crate::CommitError::StreamIntegrity)
    ///   when replay encounters a version gap.
    /// * [`StoreError::EventDecode`] when a stored event cannot be decoded.
    pub async fn get<A: Aggregate>(&self, instance_id: &str) -> Result<AggregateRoot<A>, StoreError> {
        let mut root = self.load_base::<A>(instance_id).await?;

        let commits = self.log.stream(root.id(), root.version() + 1).await?;
        let replayed = commits.len() as u64;
        for commit in &commits {
            root.apply_commit(commit)?;
        }

        // A long tail since the last snapshot means the next reader would
        // pay the same replay cost; refresh the snapshot now.
        if self.config.snapshot_interval > 0 && replayed >= self.config.snapshot_interval {
            self.offer_snapshot(&root).await;
        }

        Ok(root)
    }

    /// Commit the context's raised events as a single commit at
    /// `version + 1`.
    ///
    /// A context with no raised events is a no-op returning a receipt with
    /// `committed: false`. A [`SaveOutcome::Duplicate`] from the log is
    /// treated as success (logged, then applied locally like a clean
    /// commit). On success the events are applied to `root` in place; the
    /// caller owns the post-save instance and must copy beforehand if an
    /// unmodified reference is to be retained.
    ///
    /// # Errors
    ///
    /// * [`StoreError::TamperedAggregate`] when the root was mutated
    ///   outside the store's control since it was loaded.
    /// * [`StoreError::Log`] with a conflict when another writer claimed
    ///   the version first; propagated unchanged, never retried here.
    pub async fn save<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        ctx: &ExecutionContext,
    ) -> Result<SaveReceipt, StoreError> {
        root.verify_checksum()?;

        let events = ctx.raised();
        if events.is_empty() {
            return Ok(SaveReceipt {
                committed: false,
                version: root.version(),
                commit_id: None,
            });
        }

        let mut commit_headers = ctx.headers().clone();
        if root.version() == 0 {
            // Replay must know what to instantiate before any state exists.
            commit_headers.set(headers::AGGREGATE_TYPE, A::AGGREGATE_TYPE);
        }

        let commit = Commit::new(
            ctx.correlation_id(),
            root.id(),
            root.version() + 1,
            commit_headers,
            events,
        );
        let commit_id = commit.commit_id;

        match self.log.save(commit.clone()).await {
            Ok(SaveOutcome::Committed) => {}
            Ok(SaveOutcome::Duplicate) => {
                tracing::warn!(
                    stream_id = %root.id(),
                    version = commit.version,
                    "duplicate commit; treating as success"
                );
            }
            // Conflicts included: the store itself never retries.
            Err(e) => return Err(e.into()),
        }

        root.apply_commit(&commit)?;
        ctx.clear_raised();

        if self.config.snapshot_interval > 0 && root.version() % self.config.snapshot_interval == 0
        {
            self.offer_snapshot(root).await;
        }

        Ok(SaveReceipt {
            committed: true,
            version: root.version(),
            commit_id: Some(commit_id),
        })
    }

    /// Instantiate from the last snapshot, degrading to a fresh instance
    /// on any snapshot problem.
    async fn load_base<A: Aggregate>(&self, instance_id: &str) -> Result<AggregateRoot<A>, StoreError> {
        let probe = AggregateRoot::<A>::fresh(instance_id)?;
        let stream_id = probe.id();

        let snapshot = match self.snapshots.load(A::AGGREGATE_TYPE, stream_id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(
                    stream_id = %stream_id,
                    error = %e,
                    "snapshot load failed; replaying from version 0"
                );
                None
            }
        };

        let Some(snapshot) = snapshot else {
            return Ok(probe);
        };

        match AggregateRoot::<A>::from_snapshot(instance_id, snapshot.version, snapshot.state) {
            Ok(root) => Ok(root),
            Err(e) => {
                tracing::warn!(
                    stream_id = %stream_id,
                    error = %e,
                    "snapshot state did not deserialize; replaying from version 0"
                );
                Ok(probe)
            }
        }
    }

    /// Best-effort snapshot write: failures are logged, never surfaced.
    async fn offer_snapshot<A: Aggregate>(&self, root: &AggregateRoot<A>) {
        let state = match serde_json::to_value(root.state()) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    stream_id = %root.id(),
                    error = %e,
                    "aggregate state did not serialize for snapshotting"
                );
                return;
            }
        };
        let snapshot = Snapshot {
            stream_id: root.id(),
            version: root.version(),
            state,
        };
        match self.snapshots.save(A::AGGREGATE_TYPE, snapshot).await {
            Ok(()) => {
                tracing::debug!(
                    stream_id = %root.id(),
                    version = root.version(),
                    "snapshot written"
                );
            }
            Err(e) => {
                tracing::warn!(
                    stream_id = %root.id(),
                    error = %e,
                    "snapshot write failed; continuing without"
                );
            }
        }
    }
}

impl AggregateAccess for AggregateStore {
    async fn get<A: Aggregate>(&self, instance_id: &str) -> Result<AggregateRoot<A>, StoreError> {
        AggregateStore::get(self, instance_id).await
    }

    async fn save<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        ctx: &ExecutionContext,
    ) -> Result<SaveReceipt, StoreError> {
        AggregateStore::save(self, root, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::aggregate::encode_event;
    use crate::aggregate::test_fixtures::{Counter, CounterEvent};
    use crate::commit::stream_uuid;
    use crate::error::CommitError;
    use crate::headers::Headers;
    use crate::log::MemoryEventLog;
    use crate::snapshot::MemorySnapshotStore;

    fn store_with_interval(interval: u64) -> AggregateStore {
        AggregateStore::with_config(
            Arc::new(MemoryEventLog::new()),
            Arc::new(MemorySnapshotStore::new()),
            StoreConfig {
                snapshot_interval: interval,
            },
        )
    }

    fn raise_counter(ctx: &ExecutionContext, event: &CounterEvent) {
        ctx.raise(encode_event::<Counter>(event).expect("encode"));
    }

    #[tokio::test]
    async fn first_commit_gets_two_events_and_a_type_header() {
        let store = store_with_interval(0);
        let mut root = store.get::<Counter>("c-1").await.expect("get");
        assert_eq!(root.version(), 0);

        let ctx = ExecutionContext::open(Headers::new());
        raise_counter(&ctx, &CounterEvent::Incremented);
        raise_counter(&ctx, &CounterEvent::Added { amount: 4 });
        ctx.close().expect("close");

        let receipt = store.save(&mut root, &ctx).await.expect("save");
        assert!(receipt.committed);
        assert_eq!(receipt.version, 1);
        assert_eq!(root.state().value, 5);

        let commits = store
            .log()
            .stream(stream_uuid("counter", "c-1"), 1)
            .await
            .expect("stream");
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].events.len(), 2);
        assert_eq!(
            commits[0].headers.get(headers::AGGREGATE_TYPE),
            Some(&json!("counter"))
        );
        assert_eq!(commits[0].correlation_id, ctx.correlation_id());

        // A second get with no new commits sees the same state, in order.
        let reloaded = store.get::<Counter>("c-1").await.expect("reload");
        assert_eq!(reloaded.version(), 1);
        assert_eq!(reloaded.state().value, 5);
    }

    #[tokio::test]
    async fn later_commits_do_not_repeat_the_type_header() {
        let store = store_with_interval(0);
        let mut root = store.get::<Counter>("c-1").await.expect("get");

        for _ in 0..2 {
            let ctx = ExecutionContext::open(Headers::new());
            raise_counter(&ctx, &CounterEvent::Incremented);
            ctx.close().expect("close");
            store.save(&mut root, &ctx).await.expect("save");
        }

        let commits = store
            .log()
            .stream(stream_uuid("counter", "c-1"), 1)
            .await
            .expect("stream");
        assert!(commits[0].headers.contains(headers::AGGREGATE_TYPE));
        assert!(!commits[1].headers.contains(headers::AGGREGATE_TYPE));
    }

    #[tokio::test]
    async fn empty_context_save_is_a_noop() {
        let store = store_with_interval(0);
        let mut root = store.get::<Counter>("c-1").await.expect("get");

        let ctx = ExecutionContext::open(Headers::new());
        ctx.close().expect("close");

        let receipt = store.save(&mut root, &ctx).await.expect("save");
        assert!(!receipt.committed);
        assert_eq!(receipt.version, 0);
        assert_eq!(receipt.commit_id, None);
    }

    #[tokio::test]
    async fn concurrent_saves_one_wins_one_conflicts() {
        let store = store_with_interval(0);

        // Two units of work load the same aggregate at version 0.
        let mut first = store.get::<Counter>("c-1").await.expect("get");
        let mut second = store.get::<Counter>("c-1").await.expect("get");

        let ctx = ExecutionContext::open(Headers::new());
        raise_counter(&ctx, &CounterEvent::Incremented);
        ctx.close().expect("close");
        store.save(&mut first, &ctx).await.expect("winner saves");

        let ctx = ExecutionContext::open(Headers::new());
        raise_counter(&ctx, &CounterEvent::Incremented);
        ctx.close().expect("close");
        let err = store
            .save(&mut second, &ctx)
            .await
            .expect_err("loser conflicts");
        assert!(err.is_conflict());
        // The loser's instance is untouched by the failed save.
        assert_eq!(second.version(), 0);
    }

    #[tokio::test]
    async fn duplicate_from_the_log_counts_as_success() {
        /// Log stub that reports every save as an already-stored duplicate.
        struct DuplicatingLog;

        #[async_trait]
        impl EventLog for DuplicatingLog {
            async fn stream(
                &self,
                _stream_id: Uuid,
                _min_version: u64,
            ) -> Result<Vec<Commit>, CommitError> {
                Ok(Vec::new())
            }
            async fn save(&self, _commit: Commit) -> Result<SaveOutcome, CommitError> {
                Ok(SaveOutcome::Duplicate)
            }
            async fn mark_dispatched(&self, _commit_id: Uuid) -> Result<(), CommitError> {
                Ok(())
            }
            async fn undispatched(&self) -> Result<Vec<Commit>, CommitError> {
                Ok(Vec::new())
            }
            async fn delete_stream(&self, _stream_id: Uuid) -> Result<(), CommitError> {
                Ok(())
            }
            async fn purge(&self) -> Result<(), CommitError> {
                Ok(())
            }
        }

        let store = AggregateStore::new(
            Arc::new(DuplicatingLog),
            Arc::new(MemorySnapshotStore::new()),
        );
        let mut root = store.get::<Counter>("c-1").await.expect("get");

        let ctx = ExecutionContext::open(Headers::new());
        raise_counter(&ctx, &CounterEvent::Incremented);
        ctx.close().expect("close");

        let receipt = store.save(&mut root, &ctx).await.expect("save");
        assert!(receipt.committed, "duplicate is success for the caller");
        assert_eq!(root.version(), 1, "events still apply locally");
        assert_eq!(root.state().value, 1);
    }

    #[tokio::test]
    async fn tampered_aggregate_is_rejected_before_commit() {
        let store = store_with_interval(0);
        let mut root = store.get::<Counter>("c-1").await.expect("get");

        root.state_mut().value = 42;

        let ctx = ExecutionContext::open(Headers::new());
        raise_counter(&ctx, &CounterEvent::Incremented);
        ctx.close().expect("close");

        let err = store
            .save(&mut root, &ctx)
            .await
            .expect_err("tamper should be fatal");
        assert!(matches!(err, StoreError::TamperedAggregate { .. }));

        // Nothing reached the log.
        let commits = store
            .log()
            .stream(stream_uuid("counter", "c-1"), 1)
            .await
            .expect("stream");
        assert!(commits.is_empty());
    }

    #[tokio::test]
    async fn snapshot_written_on_interval_and_used_for_loading() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let store = AggregateStore::with_config(
            Arc::clone(&log),
            Arc::clone(&snapshots) as Arc<dyn SnapshotStore>,
            StoreConfig {
                snapshot_interval: 5,
            },
        );

        let mut root = store.get::<Counter>("c-1").await.expect("get");
        for _ in 0..5 {
            let ctx = ExecutionContext::open(Headers::new());
            raise_counter(&ctx, &CounterEvent::Incremented);
            ctx.close().expect("close");
            store.save(&mut root, &ctx).await.expect("save");
        }

        let snapshot = snapshots
            .load("counter", stream_uuid("counter", "c-1"))
            .await
            .expect("load")
            .expect("snapshot should exist after 5 saves");
        assert_eq!(snapshot.version, 5);

        // Loading from the snapshot replays nothing and matches the state.
        let reloaded = store.get::<Counter>("c-1").await.expect("reload");
        assert_eq!(reloaded.version(), 5);
        assert_eq!(reloaded.state().value, 5);
    }

    #[tokio::test]
    async fn snapshot_and_full_replay_agree() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());

        // One store snapshots aggressively, the other never.
        let snapshotting = AggregateStore::with_config(
            Arc::clone(&log),
            Arc::new(MemorySnapshotStore::new()),
            StoreConfig {
                snapshot_interval: 2,
            },
        );
        let replaying = AggregateStore::with_config(
            Arc::clone(&log),
            Arc::new(MemorySnapshotStore::new()),
            StoreConfig {
                snapshot_interval: 0,
            },
        );

        let mut root = snapshotting.get::<Counter>("c-1").await.expect("get");
        for amount in [3u64, 1, 4, 1, 5] {
            let ctx = ExecutionContext::open(Headers::new());
            raise_counter(&ctx, &CounterEvent::Added { amount });
            ctx.close().expect("close");
            snapshotting.save(&mut root, &ctx).await.expect("save");
        }

        let via_snapshot = snapshotting.get::<Counter>("c-1").await.expect("get");
        let via_replay = replaying.get::<Counter>("c-1").await.expect("get");

        assert_eq!(via_snapshot.version(), via_replay.version());
        assert_eq!(via_snapshot.state(), via_replay.state());
        assert_eq!(via_replay.state().value, 14);
    }

    #[tokio::test]
    async fn replay_gap_from_the_log_is_fatal() {
        /// Log stub that returns a stream starting past version 1.
        struct GappyLog;

        #[async_trait]
        impl EventLog for GappyLog {
            async fn stream(
                &self,
                stream_id: Uuid,
                _min_version: u64,
            ) -> Result<Vec<Commit>, CommitError> {
                Ok(vec![Commit::new(
                    Uuid::new_v4(),
                    stream_id,
                    2,
                    Headers::new(),
                    vec![
                        encode_event::<Counter>(&CounterEvent::Incremented).expect("encode"),
                    ],
                )])
            }
            async fn save(&self, _commit: Commit) -> Result<SaveOutcome, CommitError> {
                Ok(SaveOutcome::Committed)
            }
            async fn mark_dispatched(&self, _commit_id: Uuid) -> Result<(), CommitError> {
                Ok(())
            }
            async fn undispatched(&self) -> Result<Vec<Commit>, CommitError> {
                Ok(Vec::new())
            }
            async fn delete_stream(&self, _stream_id: Uuid) -> Result<(), CommitError> {
                Ok(())
            }
            async fn purge(&self) -> Result<(), CommitError> {
                Ok(())
            }
        }

        let store =
            AggregateStore::new(Arc::new(GappyLog), Arc::new(MemorySnapshotStore::new()));
        let err = store
            .get::<Counter>("c-1")
            .await
            .expect_err("gap should be fatal");
        assert!(matches!(
            err,
            StoreError::Log(CommitError::StreamIntegrity { expected: 1, found: 2, .. })
        ));
    }
}
