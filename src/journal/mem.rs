//! In-memory journal used by unit and integration tests, so the core's
//! logic can be exercised without spinning up rocksdb. Mirrors
//! `RocksJournal`'s semantics exactly; only the backing store differs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::Journal;
use crate::error::JournalError;
use crate::types::{Entry, LogIndex, Membership, NodeId, Request, Term};

struct Inner {
    entries: VecDeque<Entry>,
    log_start: LogIndex,
    current_term: Term,
    voted_for: Option<(Term, NodeId)>,
    commit_index: LogIndex,
    membership: Membership,
    previous_membership: Option<Membership>,
    cluster_id: String,
    trim_guard_term: Term,
}

impl Inner {
    fn log_size(&self) -> LogIndex {
        self.log_start + self.entries.len() as LogIndex
    }

    fn position_of(&self, index: LogIndex) -> Option<usize> {
        if index < self.log_start {
            return None;
        }
        let offset = (index - self.log_start) as usize;
        if offset >= self.entries.len() {
            None
        } else {
            Some(offset)
        }
    }
}

pub struct MemJournal {
    inner: Mutex<Inner>,
    commit_changed: Notify,
}

impl MemJournal {
    pub fn new(cluster_id: impl Into<String>, initial_members: Vec<NodeId>) -> Self {
        let membership = Membership { members: initial_members, ..Default::default() };
        let genesis = Entry {
            index: 0,
            term: 0,
            request: vec![b"__genesis__".to_vec()],
        };
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::from(vec![genesis]),
                log_start: 0,
                current_term: 0,
                voted_for: None,
                commit_index: 0,
                membership,
                previous_membership: None,
                cluster_id: cluster_id.into(),
                trim_guard_term: 0,
            }),
            commit_changed: Notify::new(),
        }
    }
}

#[async_trait]
impl Journal for MemJournal {
    async fn append(&self, index: LogIndex, term: Term, request: Request) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().await;
        let log_size = inner.log_size();
        if index != log_size {
            return Err(JournalError::OutOfOrder { expected: log_size, got: index });
        }
        let last_term = inner.entries.back().map(|e| e.term).unwrap_or(0);
        if term < last_term {
            return Err(JournalError::BadTerm { index, term, last_term });
        }
        let is_membership = request.first().map(Vec::as_slice) == Some(b"__membership__" as &[u8]);
        if is_membership {
            let new_membership: Membership =
                serde_json::from_slice(&request[1]).map_err(|e| JournalError::Storage(e.into()))?;
            inner.previous_membership = Some(inner.membership.clone());
            inner.membership = new_membership;
        }
        inner.entries.push_back(Entry { index, term, request });
        Ok(())
    }

    async fn fetch(&self, index: LogIndex) -> Result<Entry, JournalError> {
        let inner = self.inner.lock().await;
        let pos = inner.position_of(index).ok_or(JournalError::NotFound(index))?;
        Ok(inner.entries[pos].clone())
    }

    async fn scan_contents(
        &self,
        start: LogIndex,
        count: usize,
        glob: Option<&str>,
    ) -> Result<(Vec<Entry>, Option<LogIndex>), JournalError> {
        let inner = self.inner.lock().await;
        let log_size = inner.log_size();
        let mut out = Vec::new();
        let mut idx = start;
        while idx < log_size && out.len() < count {
            if let Some(pos) = inner.position_of(idx) {
                let entry = &inner.entries[pos];
                let matches = match glob {
                    None => true,
                    Some(pattern) => {
                        let rendered = format!("{:?}", entry.request);
                        glob_match(pattern, &rendered)
                    }
                };
                if matches {
                    out.push(entry.clone());
                }
            }
            idx += 1;
        }
        let cursor = if idx < log_size { Some(idx) } else { None };
        Ok((out, cursor))
    }

    async fn set_commit_index(&self, index: LogIndex) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().await;
        if index < inner.commit_index {
            return Err(JournalError::NonMonotonic { current: inner.commit_index, requested: index });
        }
        let log_size = inner.log_size();
        if index >= log_size {
            return Err(JournalError::AheadOfLog { requested: index, log_size });
        }
        inner.commit_index = index;
        drop(inner);
        self.commit_changed.notify_waiters();
        Ok(())
    }

    async fn trim_until(&self, index: LogIndex) {
        let mut inner = self.inner.lock().await;
        if index > inner.commit_index {
            return;
        }
        while inner.log_start < index && !inner.entries.is_empty() {
            let trimmed = inner.entries.pop_front().unwrap();
            inner.trim_guard_term = inner.trim_guard_term.max(trimmed.term);
            inner.log_start += 1;
        }
    }

    async fn remove_entries(&self, from_index: LogIndex) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().await;
        if from_index <= inner.commit_index {
            return Err(JournalError::CommitSafetyViolation(from_index));
        }
        let mut rolled_back_membership = false;
        while inner.log_size() > from_index {
            if let Some(entry) = inner.entries.back() {
                if entry.request.first().map(Vec::as_slice) == Some(b"__membership__" as &[u8]) {
                    rolled_back_membership = true;
                }
            }
            inner.entries.pop_back();
        }
        if rolled_back_membership {
            if let Some(previous) = inner.previous_membership.take() {
                inner.membership = previous;
            }
        }
        Ok(())
    }

    async fn current_term(&self) -> Term {
        self.inner.lock().await.current_term
    }

    async fn vote_for(&self, term: Term, candidate: Option<NodeId>) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().await;
        if term > inner.current_term {
            inner.current_term = term;
            inner.voted_for = None;
        }
        match candidate {
            Some(candidate) => inner.voted_for = Some((term, candidate)),
            None => {
                if inner.voted_for.as_ref().map(|(t, _)| *t) == Some(term) {
                    inner.voted_for = None;
                }
            }
        }
        Ok(())
    }

    async fn voted_for(&self, term: Term) -> Option<NodeId> {
        let inner = self.inner.lock().await;
        inner.voted_for.as_ref().filter(|(t, _)| *t == term).map(|(_, n)| n.clone())
    }

    async fn last_index_and_term(&self) -> (LogIndex, Term) {
        let inner = self.inner.lock().await;
        let index = inner.log_size() - 1;
        let term = inner.entries.back().map(|e| e.term).unwrap_or(0);
        (index, term)
    }

    async fn log_start(&self) -> LogIndex {
        self.inner.lock().await.log_start
    }

    async fn trim_guard_term(&self) -> Term {
        self.inner.lock().await.trim_guard_term
    }

    async fn get_membership(&self) -> Membership {
        self.inner.lock().await.membership.clone()
    }

    async fn get_commit_index(&self) -> LogIndex {
        self.inner.lock().await.commit_index
    }

    async fn cluster_id(&self) -> String {
        self.inner.lock().await.cluster_id.clone()
    }

    async fn wait_for_updates(&self, threshold: LogIndex, timeout: Duration) -> bool {
        loop {
            if self.inner.lock().await.commit_index >= threshold {
                return true;
            }
            let notified = self.commit_changed.notified();
            if tokio::time::timeout(timeout, notified).await.is_err() {
                return self.inner.lock().await.commit_index >= threshold;
            }
        }
    }

    #[cfg(feature = "test-hooks")]
    async fn simulate_data_loss(&self, k: u64) {
        let mut inner = self.inner.lock().await;
        for _ in 0..k {
            if inner.entries.len() <= 1 {
                break;
            }
            inner.entries.pop_back();
        }
        let log_size = inner.log_size();
        if inner.commit_index >= log_size {
            inner.commit_index = log_size - 1;
        }
    }

    async fn checkpoint_files(&self) -> Result<Vec<(String, Vec<u8>)>, JournalError> {
        let inner = self.inner.lock().await;
        let entries: Vec<&Entry> = inner.entries.iter().collect();
        let encoded = serde_json::to_vec(&entries).map_err(|e| JournalError::Storage(e.into()))?;
        let metadata = serde_json::to_vec(&(
            inner.current_term,
            inner.log_start,
            inner.commit_index,
            &inner.membership,
            &inner.cluster_id,
            inner.trim_guard_term,
        ))
        .map_err(|e| JournalError::Storage(e.into()))?;
        Ok(vec![("journal.entries".to_string(), encoded), ("journal.meta".to_string(), metadata)])
    }

    async fn restore_from_checkpoint(&self, files: Vec<(String, Vec<u8>)>) -> Result<(), JournalError> {
        let mut entries_blob = None;
        let mut meta_blob = None;
        for (name, contents) in files {
            match name.as_str() {
                "journal.entries" => entries_blob = Some(contents),
                "journal.meta" => meta_blob = Some(contents),
                _ => {}
            }
        }
        let entries_blob = entries_blob.ok_or_else(|| JournalError::Storage(anyhow::anyhow!("checkpoint missing journal.entries")))?;
        let meta_blob = meta_blob.ok_or_else(|| JournalError::Storage(anyhow::anyhow!("checkpoint missing journal.meta")))?;

        let entries: Vec<Entry> = serde_json::from_slice(&entries_blob).map_err(|e| JournalError::Storage(e.into()))?;
        let (current_term, log_start, commit_index, membership, cluster_id, trim_guard_term): (
            Term,
            LogIndex,
            LogIndex,
            Membership,
            String,
            Term,
        ) = serde_json::from_slice(&meta_blob).map_err(|e| JournalError::Storage(e.into()))?;

        let mut inner = self.inner.lock().await;
        inner.entries = entries.into_iter().collect();
        inner.log_start = log_start;
        inner.current_term = current_term;
        inner.voted_for = None;
        inner.commit_index = commit_index;
        inner.membership = membership;
        inner.previous_membership = None;
        inner.cluster_id = cluster_id;
        inner.trim_guard_term = trim_guard_term;
        drop(inner);
        self.commit_changed.notify_waiters();
        Ok(())
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    text.contains(pattern.trim_matches('*'))
}

/// Convenience used by `Arc`-sharing call sites (director, replicator,
/// tests all hold the same journal).
pub fn shared(cluster_id: impl Into<String>, members: Vec<NodeId>) -> Arc<MemJournal> {
    Arc::new(MemJournal::new(cluster_id, members))
}
