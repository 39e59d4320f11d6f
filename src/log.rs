//! Append-only event log abstraction and the in-memory backend.
//!
//! The log is the single source of truth for an aggregate stream and the
//! only place true conflict detection happens. `save` is atomic per commit
//! and distinguishes three landings: a clean append, an exact duplicate of
//! an already-stored commit (idempotent retry), and a version taken by a
//! different commit (conflict).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::commit::Commit;
use crate::error::CommitError;

/// Outcome of a successful [`EventLog::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The commit was appended to the stream.
    Committed,
    /// An identical commit was already stored; the caller proceeds as if
    /// the save succeeded.
    Duplicate,
}

/// Append-only persistence of commits per aggregate stream.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Read a stream's commits with `version >= min_version`, in ascending
    /// version order. Never skips or reorders.
    async fn stream(&self, stream_id: Uuid, min_version: u64) -> Result<Vec<Commit>, CommitError>;

    /// Append a commit to its stream.
    ///
    /// # Errors
    ///
    /// * [`CommitError::Conflict`] - the commit's version is already taken
    ///   by a different commit (another writer won the race).
    /// * [`CommitError::StreamIntegrity`] - the commit's version is more
    ///   than one past the stream head.
    async fn save(&self, commit: Commit) -> Result<SaveOutcome, CommitError>;

    /// Record that a commit's events have been handed to downstream
    /// dispatch. Unknown ids are ignored.
    async fn mark_dispatched(&self, commit_id: Uuid) -> Result<(), CommitError>;

    /// Commits not yet marked dispatched, in commit order. Supports
    /// at-least-once downstream delivery after a process restart.
    async fn undispatched(&self) -> Result<Vec<Commit>, CommitError>;

    /// Remove a stream and all its commits.
    async fn delete_stream(&self, stream_id: Uuid) -> Result<(), CommitError>;

    /// Remove every stream. Maintenance only.
    async fn purge(&self) -> Result<(), CommitError>;
}

/// How an incoming commit lands on an existing stream.
pub(crate) enum SavePlan {
    Append,
    Duplicate,
}

/// Shared landing logic for log backends.
///
/// `existing` must hold the stream's commits contiguously from version 1,
/// which every backend in this crate maintains by construction.
pub(crate) fn plan_save(existing: &[Commit], commit: &Commit) -> Result<SavePlan, CommitError> {
    let head = existing.last().map(|c| c.version).unwrap_or(0);
    if commit.version == head + 1 {
        return Ok(SavePlan::Append);
    }
    if commit.version >= 1 && commit.version <= head {
        let occupant = &existing[(commit.version - 1) as usize];
        if occupant.commit_id == commit.commit_id {
            return Ok(SavePlan::Duplicate);
        }
        return Err(CommitError::Conflict {
            stream_id: commit.stream_id,
            attempted: commit.version,
        });
    }
    Err(CommitError::StreamIntegrity {
        stream_id: commit.stream_id,
        expected: head + 1,
        found: commit.version,
    })
}

#[derive(Default)]
struct LogState {
    streams: HashMap<Uuid, Vec<Commit>>,
    /// Global append order as `(stream_id, version)`, for dispatch tracking.
    order: Vec<(Uuid, u64)>,
    dispatched: HashSet<Uuid>,
}

/// In-memory event log.
///
/// The primary backend for tests and ephemeral deployments. All state is
/// process-local; cloning the handle shares the underlying log.
#[derive(Default)]
pub struct MemoryEventLog {
    state: Mutex<LogState>,
}

impl MemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
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
                let key = (commit.stream_id, commit.version);
                existing.push(commit);
                state.order.push(key);
                Ok(SaveOutcome::Committed)
            }
        }
    }

    async fn mark_dispatched(&self, commit_id: Uuid) -> Result<(), CommitError> {
        self.state.lock().dispatched.insert(commit_id);
        Ok(())
    }

    async fn undispatched(&self) -> Result<Vec<Commit>, CommitError> {
        let state = self.state.lock();
        let mut pending = Vec::new();
        for (stream_id, version) in &state.order {
            let Some(commits) = state.streams.get(stream_id) else {
                continue;
            };
            let Some(commit) = commits.iter().find(|c| c.version == *version) else {
                continue;
            };
            if !state.dispatched.contains(&commit.commit_id) {
                pending.push(commit.clone());
            }
        }
        Ok(pending)
    }

    async fn delete_stream(&self, stream_id: Uuid) -> Result<(), CommitError> {
        let mut state = self.state.lock();
        state.streams.remove(&stream_id);
        state.order.retain(|(s, _)| *s != stream_id);
        Ok(())
    }

    async fn purge(&self) -> Result<(), CommitError> {
        let mut state = self.state.lock();
        state.streams.clear();
        state.order.clear();
        state.dispatched.clear();
        Ok(())
    }
}
