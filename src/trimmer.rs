//! Periodic journal garbage collection, gated by replication progress.
//!
//! The `TrimmingBlock` RAII token reuses the same register/deregister-on-drop
//! idiom as [`crate::commit_tracker`]: a tracker holds one for as long as it
//! needs historical entries, and dropping it is how it stops blocking the gc.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::journal::{Journal, TrimmingBlock};
use crate::shutdown::ShutdownHandle;
use crate::types::{LogIndex, NodeId};

pub struct TrimmerConfig {
    pub keep_at_least: u64,
    pub interval: Duration,
}

pub struct Trimmer {
    journal: Arc<dyn Journal>,
    config: TrimmerConfig,
    last_applied: AtomicU64,
    replica_match: Mutex<HashMap<NodeId, LogIndex>>,
    blocks: Arc<Mutex<Vec<LogIndex>>>,
}

impl Trimmer {
    pub fn new(journal: Arc<dyn Journal>, config: TrimmerConfig) -> Arc<Self> {
        Arc::new(Self {
            journal,
            config,
            last_applied: AtomicU64::new(0),
            replica_match: Mutex::new(HashMap::new()),
            blocks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn note_applied(&self, index: LogIndex) {
        self.last_applied.fetch_max(index, Ordering::AcqRel);
    }

    /// Report a replica's current match index, so a follower that never
    /// catches up doesn't get trimmed out from under it. The gc floor uses
    /// the minimum across every node that has ever reported here.
    pub async fn note_min_replica_match(&self, node: NodeId, index: LogIndex) {
        self.replica_match.lock().await.insert(node, index);
    }

    /// Acquire an RAII token that prevents trimming below `floor` until it
    /// is dropped. Held by a replica tracker while it reads historical
    /// entries to catch a lagging follower up.
    pub async fn block(self: &Arc<Self>, floor: LogIndex) -> TrimmingBlock {
        self.blocks.lock().await.push(floor);
        TrimmingBlock::new(floor, self.blocks.clone())
    }

    async fn floor_from_blocks(&self) -> Option<LogIndex> {
        self.blocks.lock().await.iter().copied().min()
    }

    async fn run_once(&self) {
        let commit_index = self.journal.get_commit_index().await;
        let last_applied = self.last_applied.load(Ordering::Acquire);
        let min_match = self.replica_match.lock().await.values().copied().min().unwrap_or(u64::MAX);

        let mut target = commit_index.min(last_applied).min(min_match);
        if let Some(block_floor) = self.floor_from_blocks().await {
            target = target.min(block_floor);
        }
        let target = target.saturating_sub(self.config.keep_at_least);
        if target > 0 {
            self.journal.trim_until(target).await;
        }
    }

    /// Spawn the periodic GC loop, stopping as soon as `shutdown` is
    /// signalled rather than waiting out the current tick.
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_once().await,
                    _ = shutdown.stopped() => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemJournal;

    async fn journal_with_committed_entries(count: u64) -> Arc<MemJournal> {
        let journal = Arc::new(MemJournal::new("cluster", vec!["n0:1".into()]));
        for i in 1..=count {
            journal.append(i, 1, vec![b"noop".to_vec()]).await.unwrap();
        }
        journal.set_commit_index(count).await.unwrap();
        journal
    }

    #[tokio::test]
    async fn with_no_replicas_reported_the_gc_floor_is_bounded_only_by_commit_and_applied() {
        let journal = journal_with_committed_entries(20).await;
        let trimmer = Trimmer::new(journal.clone(), TrimmerConfig { keep_at_least: 0, interval: Duration::from_secs(60) });
        trimmer.note_applied(20);
        trimmer.run_once().await;
        assert_eq!(journal.log_start().await, 20);
    }

    #[tokio::test]
    async fn a_lagging_replica_blocks_trimming_past_its_own_match_index() {
        let journal = journal_with_committed_entries(20).await;
        let trimmer = Trimmer::new(journal.clone(), TrimmerConfig { keep_at_least: 0, interval: Duration::from_secs(60) });
        trimmer.note_applied(20);
        trimmer.note_min_replica_match("n1:1".into(), 5).await;
        trimmer.note_min_replica_match("n2:1".into(), 15).await;
        trimmer.run_once().await;
        assert_eq!(journal.log_start().await, 5);
    }

    #[tokio::test]
    async fn keep_at_least_holds_back_the_floor_even_further() {
        let journal = journal_with_committed_entries(20).await;
        let trimmer = Trimmer::new(journal.clone(), TrimmerConfig { keep_at_least: 10, interval: Duration::from_secs(60) });
        trimmer.note_applied(20);
        trimmer.note_min_replica_match("n1:1".into(), 18).await;
        trimmer.run_once().await;
        assert_eq!(journal.log_start().await, 8);
    }
}
