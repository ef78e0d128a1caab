//! Leader-side match-index bookkeeping and commit-index advancement.
//!
//! A handle per tracked node updates a shared map cheaply (no lookup on the
//! hot path beyond taking the mutex) and deregisters itself on drop. A
//! tracker recomputes the commit index from a quorum of match indices
//! whenever any of them changes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::journal::Journal;
use crate::types::{LogIndex, NodeId, Term};

struct Inner {
    match_index: HashMap<NodeId, LogIndex>,
    quorum: usize,
}

pub struct CommitTracker {
    journal: Arc<dyn Journal>,
    inner: Mutex<Inner>,
}

impl CommitTracker {
    pub fn new(journal: Arc<dyn Journal>, quorum: usize) -> Arc<Self> {
        Arc::new(Self {
            journal,
            inner: Mutex::new(Inner { match_index: HashMap::new(), quorum }),
        })
    }

    pub async fn update_quorum(&self, new_quorum: usize) {
        let mut inner = self.inner.lock().await;
        inner.quorum = new_quorum;
        drop(inner);
        self.recalculate(0).await;
    }

    /// Register a node for match-index tracking, returning an RAII handle
    /// that deregisters the node when dropped.
    pub fn register(self: &Arc<Self>, node: NodeId) -> MatchIndexHandle {
        MatchIndexHandle { tracker: self.clone(), node: Some(node) }
    }

    async fn updated(&self, _value: LogIndex, current_term: Term) {
        self.recalculate(current_term).await;
    }

    async fn recalculate(&self, current_term: Term) {
        let self_match_index = self.journal.last_index_and_term().await.0;
        let (candidate, quorum) = {
            let inner = self.inner.lock().await;
            let mut values: Vec<LogIndex> = inner.match_index.values().copied().collect();
            values.push(self_match_index);
            values.sort_unstable_by(|a, b| b.cmp(a));
            let quorum = inner.quorum.min(values.len());
            if quorum == 0 {
                return;
            }
            (values[quorum - 1], inner.quorum)
        };
        let _ = quorum;

        let commit_index = self.journal.get_commit_index().await;
        if candidate <= commit_index {
            return;
        }
        // Raft §5.4.2: never commit an entry from a previous term merely
        // because a quorum has replicated it; only commit entries from the
        // leader's own current term (the leadership marker is the first
        // such entry in every term, so this is never a deadlock).
        if current_term != 0 {
            match self.journal.fetch(candidate).await {
                Ok(entry) if entry.term == current_term => {}
                _ => return,
            }
        }
        let _ = self.journal.set_commit_index(candidate).await;
    }

    async fn deregister(&self, node: &NodeId) {
        self.inner.lock().await.match_index.remove(node);
    }

    /// A point-in-time copy of every currently-registered node's match
    /// index, for callers (membership-change admission) that need a
    /// snapshot to consult synchronously.
    pub async fn snapshot(&self) -> HashMap<NodeId, LogIndex> {
        self.inner.lock().await.match_index.clone()
    }
}

/// RAII handle returned by [`CommitTracker::register`]. Updating it is
/// cheap: a single map insert under the tracker's lock, no further lookups.
pub struct MatchIndexHandle {
    tracker: Arc<CommitTracker>,
    node: Option<NodeId>,
}

impl MatchIndexHandle {
    pub async fn update(&self, new_match_index: LogIndex, current_term: Term) {
        let Some(node) = &self.node else { return };
        let mut inner = self.tracker.inner.lock().await;
        let entry = inner.match_index.entry(node.clone()).or_insert(0);
        if new_match_index <= *entry {
            return;
        }
        *entry = new_match_index;
        drop(inner);
        self.tracker.updated(new_match_index, current_term).await;
    }
}

impl Drop for MatchIndexHandle {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            let tracker = self.tracker.clone();
            tokio::spawn(async move {
                tracker.deregister(&node).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemJournal;

    async fn setup(members: usize) -> (Arc<MemJournal>, Arc<CommitTracker>) {
        let ids: Vec<NodeId> = (0..members).map(|i| format!("n{i}:1").as_str().into()).collect();
        let journal = Arc::new(MemJournal::new("cluster", ids.clone()));
        for i in 1..=5u64 {
            journal.append(i, 1, vec![b"noop".to_vec()]).await.unwrap();
        }
        let tracker = CommitTracker::new(journal.clone(), members / 2 + 1);
        (journal, tracker)
    }

    #[tokio::test]
    async fn commit_index_does_not_advance_on_self_alone() {
        let (journal, tracker) = setup(3).await;
        let _h1 = tracker.register("n1:1".into());
        let _h2 = tracker.register("n2:1".into());
        // Neither follower has reported yet: self alone is only 1 of a
        // quorum of 2 out of 3.
        tracker.recalculate(1).await;
        assert_eq!(journal.get_commit_index().await, 0);
    }

    #[tokio::test]
    async fn a_single_matching_follower_reaches_quorum_with_self() {
        let (journal, tracker) = setup(3).await;
        let h1 = tracker.register("n1:1".into());
        let _h2 = tracker.register("n2:1".into());

        // Self (the leader) is always caught up, so self + one follower is
        // already a quorum of 2 out of 3: a single down follower must not
        // block commits.
        h1.update(5, 1).await;
        assert_eq!(journal.get_commit_index().await, 5);
    }

    #[tokio::test]
    async fn deregistering_a_lagging_node_does_not_regress_the_commit_index() {
        let (journal, tracker) = setup(3).await;
        let h1 = tracker.register("n1:1".into());
        {
            let h2 = tracker.register("n2:1".into());
            h1.update(5, 1).await;
            h2.update(3, 1).await;
        }
        assert_eq!(journal.get_commit_index().await, 5);
    }

    #[tokio::test]
    async fn never_commits_an_entry_from_an_older_term_via_quorum_alone() {
        let ids: Vec<NodeId> = vec!["n0:1".into(), "n1:1".into(), "n2:1".into()];
        let journal = Arc::new(MemJournal::new("cluster", ids));
        journal.append(1, 1, vec![b"noop".to_vec()]).await.unwrap();
        journal.append(2, 2, vec![b"noop".to_vec()]).await.unwrap();
        let tracker = CommitTracker::new(journal.clone(), 2);
        let h1 = tracker.register("n1:1".into());
        let h2 = tracker.register("n2:1".into());
        h1.update(1, 2).await;
        h2.update(1, 2).await;
        assert_eq!(journal.get_commit_index().await, 0, "entry 1 is term 1, current term is 2");
    }
}
