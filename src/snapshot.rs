//! Snapshot persistence for aggregate state.
//!
//! Snapshots are a replay accelerator, never a correctness dependency: the
//! store treats every failure here as a cache miss and replays from
//! version 0. The file backend writes atomically via a temp-rename pattern
//! to prevent corruption from crashes mid-write.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A point-in-time copy of an aggregate's serialized state.
///
/// `version` records how many commits are folded into `state`, so replay
/// can resume from `version + 1`. A snapshot is never newer than the true
/// stream version and is always safe to discard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Stream the snapshot belongs to.
    pub stream_id: Uuid,
    /// Stream version at snapshot time.
    pub version: u64,
    /// Serialized aggregate state.
    pub state: Value,
}

/// Persistence of at most one snapshot per stream.
///
/// `save` has replace semantics; the only concurrency contract is last
/// write wins.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The most recent snapshot for a stream, if any.
    async fn load(&self, aggregate_type: &str, stream_id: Uuid) -> io::Result<Option<Snapshot>>;

    /// Store a snapshot, replacing any previous one for the same stream.
    async fn save(&self, aggregate_type: &str, snapshot: Snapshot) -> io::Result<()>;
}

/// In-memory snapshot store, keyed by `(aggregate_type, stream_id)`.
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<(String, Uuid), Snapshot>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, aggregate_type: &str, stream_id: Uuid) -> io::Result<Option<Snapshot>> {
        let entries = self.entries.lock();
        Ok(entries.get(&(aggregate_type.to_owned(), stream_id)).cloned())
    }

    async fn save(&self, aggregate_type: &str, snapshot: Snapshot) -> io::Result<()> {
        let mut entries = self.entries.lock();
        entries.insert((aggregate_type.to_owned(), snapshot.stream_id), snapshot);
        Ok(())
    }
}

/// File-based snapshot store.
///
/// Snapshots live at
/// `<base_dir>/snapshots/<aggregate_type>/<stream_id>/snapshot.json`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    base_dir: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store rooted at the given base directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Compute the filesystem path for a stream's snapshot file.
    fn snapshot_path(&self, aggregate_type: &str, stream_id: Uuid) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(aggregate_type)
            .join(stream_id.to_string())
            .join("snapshot.json")
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    /// Load a snapshot from disk.
    ///
    /// Returns `Ok(None)` when the file does not exist or contains invalid
    /// JSON; deserialization failures are logged as warnings and treated
    /// as a cache miss.
    async fn load(&self, aggregate_type: &str, stream_id: Uuid) -> io::Result<Option<Snapshot>> {
        let path = self.snapshot_path(aggregate_type, stream_id);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }

    /// Save a snapshot atomically to disk.
    ///
    /// Writes to a temporary file in the same directory, then renames it
    /// into place so readers never see a partially-written file.
    async fn save(&self, aggregate_type: &str, snapshot: Snapshot) -> io::Result<()> {
        let path = self.snapshot_path(aggregate_type, snapshot.stream_id);
        let dir = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "snapshot path has no parent"))?;
        std::fs::create_dir_all(dir)?;

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
