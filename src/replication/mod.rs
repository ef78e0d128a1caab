//! The leader's replicator: one [`ReplicaTracker`] task per other cluster
//! member, each streaming the journal outward with an adaptively-sized
//! batch and falling back to whole-state resilvering when a follower has
//! fallen behind the leader's retained log.
//!
//! `ReplicaTracker::run` dispatches to either `streaming_round` (the common
//! case: send whatever new entries exist since the follower's match index)
//! or `catch_up_round` (the follower's next-needed entry has already been
//! trimmed, so fall back to `resilver` instead). Entries are concrete byte
//! strings and the network is the crate's own `RaftTalker`, not a trait
//! object parameterized over application data. Resilvering transfers a
//! directory of files one at a time rather than a single opaque snapshot
//! blob.

pub mod resilver;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::commit_tracker::{CommitTracker, MatchIndexHandle};
use crate::journal::Journal;
use crate::lease::Lease;
use crate::network::{AppendEntriesRequest, RaftTalker};
use crate::trimmer::Trimmer;
use crate::types::{Entry, LogIndex, NodeId, Term};

const MIN_PAYLOAD: usize = 1;
const MAX_PAYLOAD: usize = 1024;
const STREAMING_THRESHOLD: usize = 8;

/// Events pushed onto a tracker's channel by the leader state (new entries
/// to replicate, commit-index advances, or a request to stop).
pub enum RaftEvent {
    Replicate { entry: Arc<Entry>, commit_index: LogIndex },
    UpdateCommitIndex { commit_index: LogIndex },
    Terminate,
}

/// A handle the leader keeps for a spawned tracker.
pub struct ReplicationStream {
    pub repl_tx: mpsc::UnboundedSender<RaftEvent>,
    pub join: tokio::task::JoinHandle<()>,
    pub online: Arc<std::sync::atomic::AtomicBool>,
}

pub struct ReplicationConfig {
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub resilver_timeout: Duration,
}

enum RoundOutcome {
    Continue,
    NeedsResilvering,
    ObservedHigherTerm(Term),
    Stop,
}

/// Per-follower replication task.
pub struct ReplicaTracker {
    target: NodeId,
    leader_id: NodeId,
    term: Term,
    journal: Arc<dyn Journal>,
    talker: Arc<dyn RaftTalker>,
    lease: Arc<Lease>,
    trimmer: Arc<Trimmer>,
    match_handle: Option<MatchIndexHandle>,
    higher_term_tx: mpsc::UnboundedSender<Term>,
    repl_rx: mpsc::UnboundedReceiver<RaftEvent>,
    config: ReplicationConfig,
    next_index: LogIndex,
    payload_limit: usize,
    commit_index: LogIndex,
    online: Arc<std::sync::atomic::AtomicBool>,
    outbound: VecDeque<Arc<Entry>>,
}

impl ReplicaTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        target: NodeId,
        leader_id: NodeId,
        term: Term,
        journal: Arc<dyn Journal>,
        talker: Arc<dyn RaftTalker>,
        lease: Arc<Lease>,
        trimmer: Arc<Trimmer>,
        commit_tracker: Arc<CommitTracker>,
        is_voting_member: bool,
        higher_term_tx: mpsc::UnboundedSender<Term>,
        start_index: LogIndex,
        config: ReplicationConfig,
    ) -> ReplicationStream {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let online = Arc::new(std::sync::atomic::AtomicBool::new(false));
        // Observers replicate but never count toward commit quorum.
        let match_handle = is_voting_member.then(|| commit_tracker.register(target.clone()));
        let tracker = Self {
            target,
            leader_id,
            term,
            journal,
            talker,
            lease,
            trimmer,
            match_handle,
            higher_term_tx,
            repl_rx,
            config,
            next_index: start_index,
            payload_limit: MIN_PAYLOAD,
            commit_index: 0,
            online: online.clone(),
            outbound: VecDeque::new(),
        };
        let join = tokio::spawn(tracker.run());
        ReplicationStream { repl_tx, join, online }
    }

    async fn run(mut self) {
        loop {
            let outcome = if self.payload_limit >= STREAMING_THRESHOLD && self.online.load(Ordering::Acquire) {
                self.streaming_round().await
            } else {
                self.catch_up_round().await
            };
            match outcome {
                RoundOutcome::Continue => {}
                RoundOutcome::NeedsResilvering => {
                    let _block = self.trimmer.block(self.next_index).await;
                    match resilver::run(&self.target, &self.talker, &self.journal, self.config.resilver_timeout).await
                    {
                        Ok(last_index) => {
                            self.next_index = last_index + 1;
                            self.payload_limit = MIN_PAYLOAD;
                        }
                        Err(err) => {
                            tracing::warn!(target = %self.target, error = %err, "resilvering failed, will retry");
                            tokio::time::sleep(self.config.heartbeat_interval).await;
                        }
                    }
                }
                RoundOutcome::ObservedHigherTerm(term) => {
                    let _ = self.higher_term_tx.send(term);
                    return;
                }
                RoundOutcome::Stop => return,
            }
            if self.drain_events().await {
                return;
            }
        }
    }

    /// Drain pending events without blocking; returns true if told to stop.
    async fn drain_events(&mut self) -> bool {
        loop {
            match self.repl_rx.try_recv() {
                Ok(RaftEvent::Replicate { entry, commit_index }) => {
                    self.outbound.push_back(entry);
                    self.commit_index = commit_index;
                }
                Ok(RaftEvent::UpdateCommitIndex { commit_index }) => self.commit_index = commit_index,
                Ok(RaftEvent::Terminate) => return true,
                Err(mpsc::error::TryRecvError::Empty) => return false,
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
            }
        }
    }

    async fn wait_for_work(&mut self) -> bool {
        let log_size = self.last_index_and_term().await.0 + 1;
        if self.next_index < log_size {
            return false;
        }
        tokio::select! {
            event = self.repl_rx.recv() => {
                match event {
                    Some(RaftEvent::Replicate { entry, commit_index }) => {
                        self.outbound.push_back(entry);
                        self.commit_index = commit_index;
                        false
                    }
                    Some(RaftEvent::UpdateCommitIndex { commit_index }) => {
                        self.commit_index = commit_index;
                        false
                    }
                    Some(RaftEvent::Terminate) | None => true,
                }
            }
            _ = tokio::time::sleep(self.config.heartbeat_interval) => false,
        }
    }

    async fn last_index_and_term(&self) -> (LogIndex, Term) {
        self.journal.last_index_and_term().await
    }

    async fn catch_up_round(&mut self) -> RoundOutcome {
        if self.wait_for_work().await {
            return RoundOutcome::Stop;
        }

        let prev_index = self.next_index.saturating_sub(1);
        let prev_term = if self.next_index == 0 {
            0
        } else {
            match self.journal.fetch(prev_index).await {
                Ok(entry) => entry.term,
                Err(_) => return RoundOutcome::NeedsResilvering,
            }
        };

        let (mut batch, _cursor) = match self
            .journal
            .scan_contents(self.next_index, self.payload_limit.max(1), None)
            .await
        {
            Ok(result) => result,
            Err(_) => return RoundOutcome::NeedsResilvering,
        };
        if batch.is_empty() {
            while let Some(entry) = self.outbound.pop_front() {
                batch.push((*entry).clone());
                if batch.len() >= self.payload_limit.max(1) {
                    break;
                }
            }
        }

        let req = AppendEntriesRequest {
            term: self.term,
            leader_id: self.leader_id.clone(),
            prev_index,
            prev_term,
            commit_index: self.commit_index,
            entries: batch,
        };
        self.send_append_entries(req).await
    }

    async fn streaming_round(&mut self) -> RoundOutcome {
        if self.drain_events().await {
            return RoundOutcome::Stop;
        }
        if self.outbound.is_empty() {
            if self.wait_for_work().await {
                return RoundOutcome::Stop;
            }
        }

        let prev_index = self.next_index.saturating_sub(1);
        let prev_term = match self.journal.fetch(prev_index).await {
            Ok(entry) => entry.term,
            Err(_) if prev_index == 0 => 0,
            Err(_) => return RoundOutcome::NeedsResilvering,
        };

        let mut batch = Vec::new();
        while let Some(entry) = self.outbound.pop_front() {
            batch.push((*entry).clone());
            if batch.len() >= self.payload_limit {
                break;
            }
        }

        let req = AppendEntriesRequest {
            term: self.term,
            leader_id: self.leader_id.clone(),
            prev_index,
            prev_term,
            commit_index: self.commit_index,
            entries: batch,
        };
        self.send_append_entries(req).await
    }

    async fn send_append_entries(&mut self, req: AppendEntriesRequest) -> RoundOutcome {
        let sent_upto = req.prev_index + req.entries.len() as u64;
        let result = self.talker.send_append_entries(&self.target, req, self.config.rpc_timeout).await;
        match result {
            Err(err) => {
                tracing::debug!(target = %self.target, error = %err, "append entries failed, target offline");
                self.online.store(false, Ordering::Release);
                self.payload_limit = MIN_PAYLOAD;
                RoundOutcome::Continue
            }
            Ok(response) => {
                self.lease.record_contact(self.target.clone()).await;
                if response.term > self.term {
                    return RoundOutcome::ObservedHigherTerm(response.term);
                }
                if response.log_size <= self.journal.log_start().await && response.log_size < self.next_index {
                    return RoundOutcome::NeedsResilvering;
                }
                if response.outcome {
                    self.online.store(true, Ordering::Release);
                    self.next_index = sent_upto.max(response.log_size);
                    let matched = self.next_index.saturating_sub(1);
                    if let Some(handle) = &self.match_handle {
                        handle.update(matched, self.term).await;
                    }
                    self.trimmer.note_min_replica_match(self.target.clone(), matched).await;
                    self.payload_limit = (self.payload_limit * 2).min(MAX_PAYLOAD).max(MIN_PAYLOAD);
                } else {
                    self.online.store(true, Ordering::Release);
                    if self.next_index >= 2 && self.next_index <= response.log_size {
                        self.next_index -= 1;
                    } else {
                        self.next_index = response.log_size;
                    }
                    self.payload_limit = MIN_PAYLOAD;
                }
                RoundOutcome::Continue
            }
        }
    }
}

/// Leader-side registry of replication streams, diff-updated on membership
/// changes.
pub struct Replicator {
    streams: tokio::sync::Mutex<std::collections::HashMap<NodeId, ReplicationStream>>,
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_event_id() -> u64 {
    NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)
}

impl Replicator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { streams: tokio::sync::Mutex::new(std::collections::HashMap::new()) })
    }

    pub async fn insert(&self, node: NodeId, stream: ReplicationStream) {
        self.streams.lock().await.insert(node, stream);
    }

    pub async fn broadcast(&self, entry: Arc<Entry>, commit_index: LogIndex) {
        let streams = self.streams.lock().await;
        for stream in streams.values() {
            let _ = stream.repl_tx.send(RaftEvent::Replicate { entry: entry.clone(), commit_index });
        }
    }

    pub async fn update_commit_index(&self, commit_index: LogIndex) {
        let streams = self.streams.lock().await;
        for stream in streams.values() {
            let _ = stream.repl_tx.send(RaftEvent::UpdateCommitIndex { commit_index });
        }
    }

    /// Stop and join every tracker, e.g. on stepping down.
    pub async fn stop_all(&self) {
        let mut streams = self.streams.lock().await;
        for (_, stream) in streams.drain() {
            let _ = stream.repl_tx.send(RaftEvent::Terminate);
            let _ = stream.join.await;
        }
    }

    pub async fn targets(&self) -> Vec<NodeId> {
        self.streams.lock().await.keys().cloned().collect()
    }

    pub async fn remove(&self, node: &NodeId) {
        if let Some(stream) = self.streams.lock().await.remove(node) {
            let _ = stream.repl_tx.send(RaftEvent::Terminate);
            let _ = stream.join.await;
        }
    }
}

impl Default for Replicator {
    fn default() -> Self {
        Self { streams: tokio::sync::Mutex::new(std::collections::HashMap::new()) }
    }
}
