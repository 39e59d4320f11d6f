//! Durable, file-backed event log built on JSON-lines journals.
//!
//! Each stream owns a directory holding an append-only `commits.jsonl`;
//! dispatch bookkeeping lives in a `meta/dispatched.jsonl` shared by all
//! streams. The full index is loaded into memory at open, so conflict
//! detection never re-reads the disk. The journal assumes single-process
//! ownership of its base directory.
//!
//! Layout:
//! ```text
//! <base_dir>/
//!     streams/
//!         <stream_uuid>/
//!             commits.jsonl
//!     meta/
//!         dispatched.jsonl
//! ```

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::commit::Commit;
use crate::error::CommitError;
use crate::log::{EventLog, SaveOutcome, SavePlan, plan_save};

/// Manages the on-disk directory layout for the journal.
///
/// Cheap to clone (wraps a single `PathBuf`); provides path helpers plus
/// stream directory creation.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a layout rooted at the given base directory.
    ///
    /// The directory does not need to exist yet; it is created lazily on
    /// the first append.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the directory holding all stream journals.
    pub fn streams_dir(&self) -> PathBuf {
        self.base_dir.join("streams")
    }

    /// Returns the directory for a specific stream.
    pub fn stream_dir(&self, stream_id: Uuid) -> PathBuf {
        self.streams_dir().join(stream_id.to_string())
    }

    /// Returns the path of a stream's commit journal.
    pub fn commits_path(&self, stream_id: Uuid) -> PathBuf {
        self.stream_dir(stream_id).join("commits.jsonl")
    }

    /// Returns the metadata directory.
    pub fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    /// Returns the path of the dispatch bookkeeping journal.
    pub fn dispatched_path(&self) -> PathBuf {
        self.meta_dir().join("dispatched.jsonl")
    }

    /// Create the directory tree for a stream. Idempotent.
    fn ensure_stream(&self, stream_id: Uuid) -> std::io::Result<PathBuf> {
        let dir = self.stream_dir(stream_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

struct JournalState {
    streams: HashMap<Uuid, Vec<Commit>>,
    dispatched: HashSet<Uuid>,
}

/// File-backed [`EventLog`].
///
/// Commits append to per-stream JSONL journals; the in-memory index is
/// authoritative for conflict checks within the owning process.
pub struct JournalEventLog {
    layout: StreamLayout,
    state: Mutex<JournalState>,
}

impl std::fmt::Debug for JournalEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalEventLog").finish_non_exhaustive()
    }
}

impl JournalEventLog {
    /// Open (or initialize) a journal rooted at `base_dir`.
    ///
    /// Reads every stream journal into memory and verifies that each
    /// stream's versions are contiguous from 1.
    ///
    /// # Errors
    ///
    /// * [`CommitError::Io`] on filesystem failures.
    /// * [`CommitError::Codec`] when a journal line cannot be parsed.
    /// * [`CommitError::StreamIntegrity`] when a journal holds a version
    ///   gap, which indicates a corrupted log.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, CommitError> {
        let layout = StreamLayout::new(base_dir);
        let mut streams = HashMap::new();

        let streams_dir = layout.streams_dir();
        if streams_dir.exists() {
            for entry in fs::read_dir(&streams_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name();
                let Some(stream_id) = name.to_str().and_then(|s| Uuid::parse_str(s).ok()) else {
                    tracing::warn!(
                        dir = %entry.path().display(),
                        "skipping directory that is not a stream uuid"
                    );
                    continue;
                };
                let commits = read_journal(&layout.commits_path(stream_id))?;
                verify_contiguity(stream_id, &commits)?;
                streams.insert(stream_id, commits);
            }
        }

        let dispatched = read_dispatched(&layout.dispatched_path())?;

        Ok(Self {
            layout,
            state: Mutex::new(JournalState {
                streams,
                dispatched,
            }),
        })
    }

    /// The on-disk layout this journal writes into.
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    fn append_commit(&self, commit: &Commit) -> Result<(), CommitError> {
        self.layout.ensure_stream(commit.stream_id)?;
        let line = serde_json::to_string(commit)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.commits_path(commit.stream_id))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn append_dispatched(&self, commit_id: Uuid) -> Result<(), CommitError> {
        fs::create_dir_all(self.layout.meta_dir())?;
        let entry = serde_json::json!({ "commit_id": commit_id });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.dispatched_path())?;
        writeln!(file, "{entry}")?;
        Ok(())
    }
}

/// Read a commit journal, tolerating a missing file (empty stream).
fn read_journal(path: &Path) -> Result<Vec<Commit>, CommitError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);
    let mut commits = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        commits.push(serde_json::from_str::<Commit>(&line)?);
    }
    Ok(commits)
}

/// A journal must hold versions 1..=n with no gaps; anything else means
/// the log was corrupted out-of-band.
fn verify_contiguity(stream_id: Uuid, commits: &[Commit]) -> Result<(), CommitError> {
    for (index, commit) in commits.iter().enumerate() {
        let expected = index as u64 + 1;
        if commit.version != expected {
            return Err(CommitError::StreamIntegrity {
                stream_id,
                expected,
                found: commit.version,
            });
        }
    }
    Ok(())
}

fn read_dispatched(path: &Path) -> Result<HashSet<Uuid>, CommitError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);
    let mut dispatched = HashSet::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let entry: serde_json::Value = serde_json::from_str(&line)?;
        if let Some(id) = entry
            .get("commit_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            dispatched.insert(id);
        }
    }
    Ok(dispatched)
}

#[async_trait]
impl EventLog for JournalEventLog {
    async fn stream(&self, stream_id: Uuid, min_version: u64) -> Result<Vec<Commit>, CommitError> {
        let state = self.state.lock();
        let commits = state
            .streams
            .get(&stream_id)
            .map(|commits| {
                commits
                    .iter()
                    .filter(|c| c.version >= min_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(commits)
    }

    async fn save(&self, commit: Commit) -> Result<SaveOutcome, CommitError> {
        let mut state = self.state.lock();
        let existing = state.streams.entry(commit.stream_id).or_default();
        match plan_save(existing, &commit)? {
            SavePlan::Duplicate => Ok(SaveOutcome::Duplicate),
            SavePlan::Append => {
                // Disk first: a failed append must not leave the index
                // claiming a commit the journal never received.
                self.append_commit(&commit)?;
                state
                    .streams
                    .entry(commit.stream_id)
                    .or_default()
                    .push(commit);
                Ok(SaveOutcome::Committed)
            }
        }
    }

    async fn mark_dispatched(&self, commit_id: Uuid) -> Result<(), CommitError> {
        let mut state = self.state.lock();
        if state.dispatched.contains(&commit_id) {
            return Ok(());
        }
        self.append_dispatched(commit_id)?;
        state.dispatched.insert(commit_id);
        Ok(())
    }

    async fn undispatched(&self) -> Result<Vec<Commit>, CommitError> {
        let state = self.state.lock();
        let mut pending: Vec<Commit> = state
            .streams
            .values()
            .flatten()
            .filter(|c| !state.dispatched.contains(&c.commit_id))
            .cloned()
            .collect();
        // The per-stream journals have no shared sequence; reconstruct a
        // stable global order from timestamps, then stream identity.
        pending.sort_by_key(|c| (c.timestamp_ms, c.stream_id, c.version));
        Ok(pending)
    }

    async fn delete_stream(&self, stream_id: Uuid) -> Result<(), CommitError> {
        let mut state = self.state.lock();
        state.streams.remove(&stream_id);
        match fs::remove_dir_all(self.layout.stream_dir(stream_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn purge(&self) -> Result<(), CommitError> {
        let mut state = self.state.lock();
        state.streams.clear();
        state.dispatched.clear();
        for dir in [self.layout.streams_dir(), self.layout.meta_dir()] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
