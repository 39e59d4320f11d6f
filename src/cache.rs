//! Caching decorator over the aggregate store with per-aggregate locking.
//!
//! The cache holds type-erased aggregate roots keyed by
//! `(aggregate_type, stream_id)` with a sliding expiration. Readers always
//! receive a clone, never the cached instance itself: mutation happens on
//! the caller's owned copy and the cache entry is atomically swapped after
//! a successful save. On any save failure the entry is evicted before the
//! error propagates, so the cache can never diverge from the log.
//!
//! A process-wide [`AggregateLockSet`] serializes cache traffic per
//! aggregate key, preventing duplicate loads and lost cache updates under
//! concurrent access.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::commit::stream_uuid;
use crate::context::ExecutionContext;
use crate::error::StoreError;
use crate::store::{AggregateAccess, AggregateStore, SaveReceipt};

/// Process-wide aggregate identity: `(aggregate_type, stream_id)`.
pub type AggregateKey = (&'static str, Uuid);

/// Tunables for the caching decorator.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an entry stays usable after its last touch. An entry not
    /// read or written within this window counts as a miss.
    pub sliding_expiration: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sliding_expiration: Duration::from_secs(300),
        }
    }
}

struct LockSlot {
    holders: usize,
    mutex: Arc<AsyncMutex<()>>,
}

/// A striped per-aggregate lock table.
///
/// Each key maps to a reference-counted async mutex. The map entry is
/// created on first use and removed when the last holder releases, so the
/// table never grows beyond the set of currently contended keys.
///
/// Acquisition is strictly RAII: the guard releases on drop, which makes
/// a release-without-acquire unrepresentable. A refcount underflow would
/// indicate a bookkeeping bug and is defended by a debug assertion.
#[derive(Clone, Default)]
pub struct AggregateLockSet {
    entries: Arc<DashMap<AggregateKey, LockSlot>>,
}

impl AggregateLockSet {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other holder is active for this exact key.
    pub async fn acquire(&self, key: AggregateKey) -> AggregateLockGuard {
        let mutex = {
            let mut slot = self.entries.entry(key).or_insert_with(|| LockSlot {
                holders: 0,
                mutex: Arc::new(AsyncMutex::new(())),
            });
            slot.holders += 1;
            Arc::clone(&slot.mutex)
        };
        // The map reference must be released before awaiting; only the
        // refcount keeps the slot alive while we wait.
        let permit = mutex.lock_owned().await;
        AggregateLockGuard {
            permit: Some(permit),
            entries: Arc::clone(&self.entries),
            key,
        }
    }

    /// Number of keys currently tracked. Empty once all holders release.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no key is currently held or waited on.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Holds one aggregate key exclusively until dropped.
pub struct AggregateLockGuard {
    permit: Option<OwnedMutexGuard<()>>,
    entries: Arc<DashMap<AggregateKey, LockSlot>>,
    key: AggregateKey,
}

impl Drop for AggregateLockGuard {
    fn drop(&mut self) {
        // Release the mutex before the refcount bookkeeping so a waiter
        // that proceeds immediately still finds holders > 0.
        self.permit.take();

        let mut remove = false;
        if let Some(mut slot) = self.entries.get_mut(&self.key) {
            debug_assert!(slot.holders > 0, "aggregate lock released without acquire");
            slot.holders = slot.holders.saturating_sub(1);
            remove = slot.holders == 0;
        }
        if remove {
            // Re-checked under the shard lock: a racing acquire that
            // registered in the meantime keeps the slot alive.
            self.entries.remove_if(&self.key, |_, slot| slot.holders == 0);
        }
    }
}

struct CacheEntry {
    root: Box<dyn Any + Send + Sync>,
    touched: Instant,
}

/// An [`AggregateStore`] decorator adding an expiring in-process cache.
///
/// `Clone` is cheap; clones share the cache, the lock table, and the
/// underlying store.
#[derive(Clone)]
pub struct CachedAggregateStore {
    inner: AggregateStore,
    entries: Arc<DashMap<AggregateKey, CacheEntry>>,
    locks: AggregateLockSet,
    config: CacheConfig,
}

impl CachedAggregateStore {
    /// Wrap a store with the default cache configuration.
    pub fn new(inner: AggregateStore) -> Self {
        Self::with_config(inner, CacheConfig::default())
    }

    /// Wrap a store with explicit cache configuration.
    pub fn with_config(inner: AggregateStore, config: CacheConfig) -> Self {
        Self {
            inner,
            entries: Arc::new(DashMap::new()),
            locks: AggregateLockSet::new(),
            config,
        }
    }

    /// The decorated store.
    pub fn inner(&self) -> &AggregateStore {
        &self.inner
    }

    /// Load an aggregate, serving from cache when the entry is fresh.
    ///
    /// Runs under the per-key aggregate lock, so concurrent gets for the
    /// same aggregate perform a single underlying load. The returned root
    /// is always the caller's own copy.
    pub async fn get<A: Aggregate>(&self, instance_id: &str) -> Result<AggregateRoot<A>, StoreError> {
        let key: AggregateKey = (A::AGGREGATE_TYPE, stream_uuid(A::AGGREGATE_TYPE, instance_id));
        let _held = self.locks.acquire(key).await;

        let mut hit: Option<AggregateRoot<A>> = None;
        if let Some(mut entry) = self.entries.get_mut(&key) {
            if entry.touched.elapsed() <= self.config.sliding_expiration {
                hit = entry.root.downcast_ref::<AggregateRoot<A>>().cloned();
                if hit.is_some() {
                    entry.touched = Instant::now();
                }
            }
        }
        if let Some(root) = hit {
            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                instance_id = %instance_id,
                "aggregate cache hit"
            );
            return Ok(root);
        }

        self.entries.remove(&key);
        let root = self.inner.get::<A>(instance_id).await?;
        self.sweep_expired();
        self.entries.insert(
            key,
            CacheEntry {
                root: Box::new(root.clone()),
                touched: Instant::now(),
            },
        );
        Ok(root)
    }

    /// Save through the underlying store and swap the cache entry.
    ///
    /// The save operates on the caller's copy, never the cached instance,
    /// so concurrent readers never observe partially-applied state. On
    /// success the entry is replaced with the post-save copy; on any
    /// error (conflicts included) the entry is evicted before the error
    /// propagates, because it is now known stale.
    pub async fn save<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        ctx: &ExecutionContext,
    ) -> Result<SaveReceipt, StoreError> {
        let key: AggregateKey = (A::AGGREGATE_TYPE, root.id());
        let _held = self.locks.acquire(key).await;

        match self.inner.save(root, ctx).await {
            Ok(receipt) => {
                self.entries.insert(
                    key,
                    CacheEntry {
                        root: Box::new(root.clone()),
                        touched: Instant::now(),
                    },
                );
                Ok(receipt)
            }
            Err(e) => {
                self.entries.remove(&key);
                if e.is_conflict() {
                    tracing::debug!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        stream_id = %root.id(),
                        "conflict on save; evicted cache entry"
                    );
                }
                Err(e)
            }
        }
    }

    /// Drop every entry whose sliding window has elapsed.
    fn sweep_expired(&self) {
        let ttl = self.config.sliding_expiration;
        self.entries.retain(|_, entry| entry.touched.elapsed() <= ttl);
    }
}

impl AggregateAccess for CachedAggregateStore {
    async fn get<A: Aggregate>(&self, instance_id: &str) -> Result<AggregateRoot<A>, StoreError> {
        CachedAggregateStore::get(self, instance_id).await
    }

    async fn save<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        ctx: &ExecutionContext,
    ) -> Result<SaveReceipt, StoreError> {
        CachedAggregateStore::save(self, root, ctx).await
    }
}
