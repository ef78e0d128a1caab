//! rocksdb-backed journal: the production implementation of [`Journal`].
//!
//! Hot metadata (term, vote, log bounds, commit index, membership) is
//! cached in memory behind a single mutex and mirrored to rocksdb on every
//! mutation inside one `WriteBatch`, so a crash mid-mutation leaves
//! rocksdb's on-disk state exactly as it was before the call.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use rocksdb::{IteratorMode, WriteBatch, DB};
use tokio::sync::{Mutex, Notify};

use super::keys;
use super::Journal;
use crate::error::JournalError;
use crate::types::{Entry, LogIndex, Membership, NodeId, Request, Term};

struct Cache {
    current_term: Term,
    voted_for: Option<(Term, NodeId)>,
    log_size: LogIndex,
    log_start: LogIndex,
    last_term: Term,
    commit_index: LogIndex,
    membership: Membership,
    previous_membership: Option<Membership>,
    cluster_id: String,
    trim_guard_term: Term,
}

pub struct RocksJournal {
    db: Arc<DB>,
    cache: Mutex<Cache>,
    commit_changed: Notify,
}

impl RocksJournal {
    /// Open (or create) a journal rooted at `path`, matching the
    /// `<database>/current/raft-journal` layout from the persisted state
    /// layout section.
    pub fn open(path: impl AsRef<Path>, cluster_id: impl Into<String>) -> Result<Self, JournalError> {
        let db = DB::open_default(path).map_err(|e| JournalError::Storage(e.into()))?;
        let cluster_id = db
            .get(keys::CLUSTER_ID)
            .map_err(|e| JournalError::Storage(e.into()))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|| cluster_id.into());

        let current_term = read_u64(&db, keys::CURRENT_TERM)?.unwrap_or(0);
        let log_size = read_u64(&db, keys::LOG_SIZE)?.unwrap_or(0);
        let log_start = read_u64(&db, keys::LOG_START)?.unwrap_or(0);
        let commit_index = read_u64(&db, keys::COMMIT_INDEX)?.unwrap_or(0);
        let voted_for = db
            .get(keys::VOTED_FOR)
            .map_err(|e| JournalError::Storage(e.into()))?
            .and_then(|bytes| serde_json::from_slice::<(Term, NodeId)>(&bytes).ok());
        let membership = db
            .get(keys::MEMBERS)
            .map_err(|e| JournalError::Storage(e.into()))?
            .and_then(|bytes| serde_json::from_slice::<Membership>(&bytes).ok())
            .unwrap_or_default();
        let previous_membership = db
            .get(keys::PREVIOUS_MEMBERS)
            .map_err(|e| JournalError::Storage(e.into()))?
            .and_then(|bytes| serde_json::from_slice::<Membership>(&bytes).ok());
        let trim_guard_term = read_u64(&db, keys::TRIM_GUARD_TERM)?.unwrap_or(0);

        let last_term = if log_size > log_start {
            db.get(keys::entry_key(log_size - 1))
                .map_err(|e| JournalError::Storage(e.into()))?
                .and_then(|bytes| serde_json::from_slice::<Entry>(&bytes).ok())
                .map(|e| e.term)
                .unwrap_or(0)
        } else {
            0
        };

        let bootstrap = log_size == 0;
        let journal = Self {
            db: Arc::new(db),
            cache: Mutex::new(Cache {
                current_term,
                voted_for,
                log_size,
                log_start,
                last_term,
                commit_index,
                membership,
                previous_membership,
                cluster_id,
                trim_guard_term,
            }),
            commit_changed: Notify::new(),
        };

        if bootstrap {
            journal.write_genesis()?;
        }
        Ok(journal)
    }

    fn write_genesis(&self) -> Result<(), JournalError> {
        let entry = Entry { index: 0, term: 0, request: vec![b"__genesis__".to_vec()] };
        let mut batch = WriteBatch::default();
        batch.put(keys::entry_key(0), serde_json::to_vec(&entry).map_err(|e| JournalError::Storage(e.into()))?);
        batch.put(keys::LOG_SIZE, 1u64.to_be_bytes());
        batch.put(keys::CLUSTER_ID, self.cache.blocking_lock().cluster_id.as_bytes());
        self.db.write(batch).map_err(|e| JournalError::Storage(e.into()))?;
        Ok(())
    }
}

fn read_u64(db: &DB, key: &[u8]) -> Result<Option<u64>, JournalError> {
    Ok(db
        .get(key)
        .map_err(|e| JournalError::Storage(e.into()))?
        .map(|bytes| BigEndian::read_u64(&bytes)))
}

#[async_trait]
impl Journal for RocksJournal {
    async fn append(&self, index: LogIndex, term: Term, request: Request) -> Result<(), JournalError> {
        let mut cache = self.cache.lock().await;
        if index != cache.log_size {
            return Err(JournalError::OutOfOrder { expected: cache.log_size, got: index });
        }
        if term < cache.last_term {
            return Err(JournalError::BadTerm { index, term, last_term: cache.last_term });
        }

        let is_membership = request.first().map(Vec::as_slice) == Some(b"__membership__" as &[u8]);
        let new_membership = if is_membership {
            Some(serde_json::from_slice::<Membership>(&request[1]).map_err(|e| JournalError::Storage(e.into()))?)
        } else {
            None
        };

        let entry = Entry { index, term, request };
        let mut batch = WriteBatch::default();
        batch.put(keys::entry_key(index), serde_json::to_vec(&entry).map_err(|e| JournalError::Storage(e.into()))?);
        batch.put(keys::LOG_SIZE, (index + 1).to_be_bytes());
        if let Some(ref membership) = new_membership {
            batch.put(
                keys::PREVIOUS_MEMBERS,
                serde_json::to_vec(&cache.membership).map_err(|e| JournalError::Storage(e.into()))?,
            );
            batch.put(keys::PREVIOUS_MEMBERSHIP_EPOCH, cache.membership.membership_epoch.to_be_bytes());
            batch.put(keys::MEMBERS, serde_json::to_vec(membership).map_err(|e| JournalError::Storage(e.into()))?);
            batch.put(keys::MEMBERSHIP_EPOCH, membership.membership_epoch.to_be_bytes());
        }
        self.db.write(batch).map_err(|e| JournalError::Storage(e.into()))?;

        cache.log_size = index + 1;
        cache.last_term = term;
        if let Some(membership) = new_membership {
            cache.previous_membership = Some(cache.membership.clone());
            cache.membership = membership;
        }
        Ok(())
    }

    async fn fetch(&self, index: LogIndex) -> Result<Entry, JournalError> {
        let cache = self.cache.lock().await;
        if index < cache.log_start || index >= cache.log_size {
            return Err(JournalError::NotFound(index));
        }
        drop(cache);
        let bytes = self.db.get(keys::entry_key(index)).map_err(|e| JournalError::Storage(e.into()))?;
        match bytes {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| JournalError::Storage(e.into())),
            None => Err(JournalError::NotFound(index)),
        }
    }

    async fn scan_contents(
        &self,
        start: LogIndex,
        count: usize,
        glob: Option<&str>,
    ) -> Result<(Vec<Entry>, Option<LogIndex>), JournalError> {
        let log_size = self.cache.lock().await.log_size;
        let mut out = Vec::new();
        let iter = self.db.iterator(IteratorMode::From(&keys::entry_key(start), rocksdb::Direction::Forward));
        let mut next_cursor = None;
        for item in iter {
            let (key, value) = item.map_err(|e| JournalError::Storage(e.into()))?;
            let Some(index) = keys::entry_index(&key) else { break };
            if index >= log_size {
                break;
            }
            if out.len() >= count {
                next_cursor = Some(index);
                break;
            }
            let entry: Entry = serde_json::from_slice(&value).map_err(|e| JournalError::Storage(e.into()))?;
            let matches = match glob {
                None => true,
                Some(pattern) => {
                    let rendered = format!("{:?}", entry.request);
                    pattern == "*" || rendered.contains(pattern.trim_matches('*'))
                }
            };
            if matches {
                out.push(entry);
            }
        }
        Ok((out, next_cursor))
    }

    async fn set_commit_index(&self, index: LogIndex) -> Result<(), JournalError> {
        let mut cache = self.cache.lock().await;
        if index < cache.commit_index {
            return Err(JournalError::NonMonotonic { current: cache.commit_index, requested: index });
        }
        if index >= cache.log_size {
            return Err(JournalError::AheadOfLog { requested: index, log_size: cache.log_size });
        }
        self.db.put(keys::COMMIT_INDEX, index.to_be_bytes()).map_err(|e| JournalError::Storage(e.into()))?;
        cache.commit_index = index;
        drop(cache);
        self.commit_changed.notify_waiters();
        Ok(())
    }

    async fn trim_until(&self, index: LogIndex) {
        let mut cache = self.cache.lock().await;
        if index > cache.commit_index {
            return;
        }
        let mut batch = WriteBatch::default();
        let mut cursor = cache.log_start;
        let mut guard_term = cache.trim_guard_term;
        while cursor < index {
            if let Ok(Some(bytes)) = self.db.get(keys::entry_key(cursor)) {
                if let Ok(entry) = serde_json::from_slice::<Entry>(&bytes) {
                    guard_term = guard_term.max(entry.term);
                }
            }
            batch.delete(keys::entry_key(cursor));
            cursor += 1;
        }
        batch.put(keys::LOG_START, index.to_be_bytes());
        batch.put(keys::TRIM_GUARD_TERM, guard_term.to_be_bytes());
        if self.db.write(batch).is_ok() {
            cache.log_start = index;
            cache.trim_guard_term = guard_term;
        }
    }

    async fn remove_entries(&self, from_index: LogIndex) -> Result<(), JournalError> {
        let mut cache = self.cache.lock().await;
        if from_index <= cache.commit_index {
            return Err(JournalError::CommitSafetyViolation(from_index));
        }
        let mut batch = WriteBatch::default();
        let mut rolled_back_membership = false;
        let mut cursor = from_index;
        while cursor < cache.log_size {
            if let Some(bytes) = self.db.get(keys::entry_key(cursor)).map_err(|e| JournalError::Storage(e.into()))? {
                if let Ok(entry) = serde_json::from_slice::<Entry>(&bytes) {
                    if entry.request.first().map(Vec::as_slice) == Some(b"__membership__" as &[u8]) {
                        rolled_back_membership = true;
                    }
                }
            }
            batch.delete(keys::entry_key(cursor));
            cursor += 1;
        }
        batch.put(keys::LOG_SIZE, from_index.to_be_bytes());
        if rolled_back_membership {
            if let Some(previous) = cache.previous_membership.clone() {
                batch.put(keys::MEMBERS, serde_json::to_vec(&previous).map_err(|e| JournalError::Storage(e.into()))?);
                batch.put(keys::MEMBERSHIP_EPOCH, previous.membership_epoch.to_be_bytes());
            }
        }
        self.db.write(batch).map_err(|e| JournalError::Storage(e.into()))?;

        cache.log_size = from_index;
        if rolled_back_membership {
            if let Some(previous) = cache.previous_membership.take() {
                cache.membership = previous;
            }
        }
        Ok(())
    }

    async fn current_term(&self) -> Term {
        self.cache.lock().await.current_term
    }

    async fn vote_for(&self, term: Term, candidate: Option<NodeId>) -> Result<(), JournalError> {
        let mut cache = self.cache.lock().await;
        let mut batch = WriteBatch::default();
        if term > cache.current_term {
            batch.put(keys::CURRENT_TERM, term.to_be_bytes());
            cache.current_term = term;
            cache.voted_for = None;
        }
        match &candidate {
            Some(candidate) => {
                let encoded = serde_json::to_vec(&(term, candidate.clone())).map_err(|e| JournalError::Storage(e.into()))?;
                batch.put(keys::VOTED_FOR, encoded);
                cache.voted_for = Some((term, candidate.clone()));
            }
            None => {
                if cache.voted_for.as_ref().map(|(t, _)| *t) == Some(term) {
                    batch.delete(keys::VOTED_FOR);
                    cache.voted_for = None;
                }
            }
        }
        self.db.write(batch).map_err(|e| JournalError::Storage(e.into()))?;
        Ok(())
    }

    async fn voted_for(&self, term: Term) -> Option<NodeId> {
        let cache = self.cache.lock().await;
        cache.voted_for.as_ref().filter(|(t, _)| *t == term).map(|(_, n)| n.clone())
    }

    async fn last_index_and_term(&self) -> (LogIndex, Term) {
        let cache = self.cache.lock().await;
        (cache.log_size - 1, cache.last_term)
    }

    async fn log_start(&self) -> LogIndex {
        self.cache.lock().await.log_start
    }

    async fn trim_guard_term(&self) -> Term {
        self.cache.lock().await.trim_guard_term
    }

    async fn get_membership(&self) -> Membership {
        self.cache.lock().await.membership.clone()
    }

    async fn get_commit_index(&self) -> LogIndex {
        self.cache.lock().await.commit_index
    }

    async fn cluster_id(&self) -> String {
        self.cache.lock().await.cluster_id.clone()
    }

    async fn wait_for_updates(&self, threshold: LogIndex, timeout: Duration) -> bool {
        loop {
            if self.cache.lock().await.commit_index >= threshold {
                return true;
            }
            let notified = self.commit_changed.notified();
            if tokio::time::timeout(timeout, notified).await.is_err() {
                return self.cache.lock().await.commit_index >= threshold;
            }
        }
    }

    #[cfg(feature = "test-hooks")]
    async fn simulate_data_loss(&self, k: u64) {
        let mut cache = self.cache.lock().await;
        let mut batch = WriteBatch::default();
        let mut dropped = 0;
        while dropped < k && cache.log_size > cache.log_start + 1 {
            cache.log_size -= 1;
            batch.delete(keys::entry_key(cache.log_size));
            dropped += 1;
        }
        if cache.commit_index >= cache.log_size {
            cache.commit_index = cache.log_size - 1;
        }
        batch.put(keys::LOG_SIZE, cache.log_size.to_be_bytes());
        batch.put(keys::COMMIT_INDEX, cache.commit_index.to_be_bytes());
        let _ = self.db.write(batch);
    }

    async fn checkpoint_files(&self) -> Result<Vec<(String, Vec<u8>)>, JournalError> {
        let cache = self.cache.lock().await;
        let mut entries = Vec::new();
        let iter = self.db.iterator(IteratorMode::From(&keys::entry_prefix(), rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| JournalError::Storage(e.into()))?;
            if keys::entry_index(&key).is_none() {
                break;
            }
            entries.push(value.to_vec());
        }
        let metadata = serde_json::to_vec(&(
            cache.current_term,
            cache.log_start,
            cache.commit_index,
            &cache.membership,
            &cache.cluster_id,
            cache.trim_guard_term,
        ))
        .map_err(|e| JournalError::Storage(e.into()))?;
        let mut files = vec![("journal.meta".to_string(), metadata)];
        for (i, entry_bytes) in entries.into_iter().enumerate() {
            files.push((format!("journal.entries/{i:020}"), entry_bytes));
        }
        Ok(files)
    }

    async fn restore_from_checkpoint(&self, files: Vec<(String, Vec<u8>)>) -> Result<(), JournalError> {
        let mut cache = self.cache.lock().await;

        let mut meta_blob = None;
        let mut entry_blobs: Vec<(String, Vec<u8>)> = Vec::new();
        for (name, contents) in files {
            if name == "journal.meta" {
                meta_blob = Some(contents);
            } else if name.starts_with("journal.entries/") {
                entry_blobs.push((name, contents));
            }
        }
        entry_blobs.sort_by(|a, b| a.0.cmp(&b.0));

        let meta_blob = meta_blob.ok_or_else(|| JournalError::Storage(anyhow::anyhow!("checkpoint missing journal.meta")))?;
        let (current_term, log_start, commit_index, membership, cluster_id, trim_guard_term): (
            Term,
            LogIndex,
            LogIndex,
            Membership,
            String,
            Term,
        ) = serde_json::from_slice(&meta_blob).map_err(|e| JournalError::Storage(e.into()))?;

        let mut batch = WriteBatch::default();
        let old_iter = self.db.iterator(IteratorMode::From(&keys::entry_prefix(), rocksdb::Direction::Forward));
        for item in old_iter {
            let (key, _) = item.map_err(|e| JournalError::Storage(e.into()))?;
            if keys::entry_index(&key).is_none() {
                break;
            }
            batch.delete(key);
        }

        let mut last_term = 0;
        let mut index = log_start;
        for (_, bytes) in &entry_blobs {
            let entry: Entry = serde_json::from_slice(bytes).map_err(|e| JournalError::Storage(e.into()))?;
            last_term = entry.term;
            batch.put(keys::entry_key(index), bytes.as_slice());
            index += 1;
        }
        let log_size = index;

        batch.put(keys::CURRENT_TERM, current_term.to_be_bytes());
        batch.put(keys::LOG_SIZE, log_size.to_be_bytes());
        batch.put(keys::LOG_START, log_start.to_be_bytes());
        batch.put(keys::COMMIT_INDEX, commit_index.to_be_bytes());
        batch.put(keys::MEMBERS, serde_json::to_vec(&membership).map_err(|e| JournalError::Storage(e.into()))?);
        batch.put(keys::MEMBERSHIP_EPOCH, membership.membership_epoch.to_be_bytes());
        batch.put(keys::TRIM_GUARD_TERM, trim_guard_term.to_be_bytes());
        batch.delete(keys::VOTED_FOR);
        batch.delete(keys::PREVIOUS_MEMBERS);
        batch.delete(keys::PREVIOUS_MEMBERSHIP_EPOCH);
        batch.put(keys::CLUSTER_ID, cluster_id.as_bytes());
        self.db.write(batch).map_err(|e| JournalError::Storage(e.into()))?;

        cache.current_term = current_term;
        cache.voted_for = None;
        cache.log_size = log_size;
        cache.log_start = log_start;
        cache.last_term = last_term;
        cache.commit_index = commit_index;
        cache.membership = membership;
        cache.previous_membership = None;
        cache.cluster_id = cluster_id;
        cache.trim_guard_term = trim_guard_term;
        drop(cache);
        self.commit_changed.notify_waiters();
        Ok(())
    }
}
