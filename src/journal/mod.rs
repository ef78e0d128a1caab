//! The persistent Raft log plus cluster metadata.
//!
//! Entries carry a plain byte-string request rather than a generic payload
//! type, and the log and its metadata (term, vote, commit index, cluster
//! id, membership) share a single ordered key-value store with reserved
//! metadata keys disjoint from the entry key range.

mod keys;
mod mem;
mod rocks;

pub use mem::MemJournal;
pub use rocks::RocksJournal;

use async_trait::async_trait;

use crate::error::JournalError;
use crate::types::{Entry, LogIndex, Membership, NodeId, Request, Term};

/// The persistent log and cluster metadata store.
///
/// All mutating operations are internally serialised (single-writer); reads
/// may run concurrently with each other but see a consistent snapshot.
#[async_trait]
pub trait Journal: Send + Sync + 'static {
    /// Append one entry. Fails with `OutOfOrder` unless `index == log_size`,
    /// or `BadTerm` if `term` regresses relative to the last entry's term.
    async fn append(&self, index: LogIndex, term: Term, request: Request) -> Result<(), JournalError>;

    /// Fetch a single entry. `NotFound` if trimmed away or not yet appended.
    async fn fetch(&self, index: LogIndex) -> Result<Entry, JournalError>;

    /// Forward scan of up to `count` entries starting at `start`, optionally
    /// filtered by a glob pattern matched against the serialised request.
    /// Returns the scanned entries and a cursor for the next call, or `None`
    /// once the log is exhausted.
    async fn scan_contents(
        &self,
        start: LogIndex,
        count: usize,
        glob: Option<&str>,
    ) -> Result<(Vec<Entry>, Option<LogIndex>), JournalError>;

    /// Advance the commit index. `NonMonotonic` if it would regress,
    /// `AheadOfLog` if `index >= log_size`. Wakes any `wait_for_updates`
    /// waiter whose threshold has now been reached.
    async fn set_commit_index(&self, index: LogIndex) -> Result<(), JournalError>;

    /// Drop entries in `[log_start, index)`. A no-op if `index > commit_index`
    /// or a trimming block currently forbids it; callers that need a hard
    /// guarantee should check `get_commit_index` themselves first.
    async fn trim_until(&self, index: LogIndex);

    /// Truncate `[from_index, log_size)`. Refuses (returns
    /// `CommitSafetyViolation`) if any entry in that range is already
    /// committed. Rolls membership back to the previous snapshot if a
    /// removed entry changed it.
    async fn remove_entries(&self, from_index: LogIndex) -> Result<(), JournalError>;

    async fn current_term(&self) -> Term;

    /// Persist a vote for `candidate` at `term`. Idempotent if re-called
    /// with the same candidate at the same term.
    async fn vote_for(&self, term: Term, candidate: Option<NodeId>) -> Result<(), JournalError>;

    async fn voted_for(&self, term: Term) -> Option<NodeId>;

    async fn last_index_and_term(&self) -> (LogIndex, Term);

    async fn log_start(&self) -> LogIndex;

    /// The highest term known to have occupied an index that has since been
    /// trimmed away. Used by vote granting to veto a candidate whose log
    /// ends at or before `log_start` but is known to be missing entries from
    /// a later term than it claims.
    async fn trim_guard_term(&self) -> Term;

    async fn get_membership(&self) -> Membership;

    async fn get_commit_index(&self) -> LogIndex;

    async fn cluster_id(&self) -> String;

    /// Block until `commit_index >= threshold` or `timeout` elapses.
    /// Returns `true` if woken by reaching the threshold, `false` on
    /// timeout.
    async fn wait_for_updates(&self, threshold: LogIndex, timeout: std::time::Duration) -> bool;

    /// Test-only: irreversibly drop the top `k` entries and regress the
    /// commit index to match. Compiled out unless `test-hooks` is enabled.
    #[cfg(feature = "test-hooks")]
    async fn simulate_data_loss(&self, k: u64);

    /// Produce a consistent whole-state checkpoint as a set of named byte
    /// blobs, for transfer to a far-behind follower during resilvering.
    /// The "directory" is virtual: one entry per logical file the store
    /// would have written to disk.
    async fn checkpoint_files(&self) -> Result<Vec<(String, Vec<u8>)>, JournalError>;

    /// Replace this journal's entire contents with a checkpoint previously
    /// produced by [`Journal::checkpoint_files`] on another node. Used by the
    /// resilvering receiver once a transfer completes; the follower's own
    /// in-flight log is discarded.
    async fn restore_from_checkpoint(&self, files: Vec<(String, Vec<u8>)>) -> Result<(), JournalError>;
}

/// An RAII token preventing the trimmer from dropping entries below
/// `floor` while a replica tracker is reading historical entries to catch
/// a follower up. Held by the tracker, released on drop.
pub struct TrimmingBlock {
    floor: LogIndex,
    registry: std::sync::Arc<tokio::sync::Mutex<Vec<LogIndex>>>,
}

impl TrimmingBlock {
    pub fn new(floor: LogIndex, registry: std::sync::Arc<tokio::sync::Mutex<Vec<LogIndex>>>) -> Self {
        Self { floor, registry }
    }

    pub fn floor(&self) -> LogIndex {
        self.floor
    }
}

impl Drop for TrimmingBlock {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let floor = self.floor;
        tokio::spawn(async move {
            let mut guard = registry.lock().await;
            if let Some(pos) = guard.iter().position(|f| *f == floor) {
                guard.remove(pos);
            }
        });
    }
}
