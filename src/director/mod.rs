//! The top-level role loop: follower / candidate / leader, commit
//! application, and membership changes.
//!
//! Each role runs its own `tokio::select!`-driven loop until it steps down
//! or observes a higher term. Client requests are tracked by a `oneshot`
//! channel per pending index, released by the commit applier once the entry
//! is actually committed. Membership-change admission is handled by
//! [`membership::admit`].

pub mod membership;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::commit_tracker::CommitTracker;
use crate::election::{self};
use crate::error::{RaftError, RaftResult};
use crate::heartbeat::{HeartbeatTracker, TimeoutOutcome};
use crate::journal::Journal;
use crate::lease::Lease;
use crate::network::{
    AppendEntriesRequest, AppendEntriesResponse, RaftTalker, VotePhase, VoteRequest, VoteResponse,
};
use crate::replication::{ReplicaTracker, ReplicationConfig, Replicator};
use crate::statemachine::StateMachine;
use crate::trimmer::Trimmer;
use crate::types::{Entry, LogIndex, Membership, NodeId, Request, Role, Term, VoteOutcome};

use membership::MembershipChange;

pub struct DirectorConfig {
    pub election_timeout_low: Duration,
    pub election_timeout_high: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub resilver_timeout: Duration,
}

pub struct Director {
    me: NodeId,
    journal: Arc<dyn Journal>,
    state: Arc<crate::state::State>,
    heartbeat: Arc<HeartbeatTracker>,
    talker: Arc<dyn RaftTalker>,
    lease: Arc<Lease>,
    trimmer: Arc<Trimmer>,
    state_machine: Arc<dyn StateMachine>,
    config: DirectorConfig,
    last_applied: AtomicU64,
    pending: Mutex<HashMap<LogIndex, oneshot::Sender<RaftResult<Vec<u8>>>>>,
    membership_change_in_flight: std::sync::atomic::AtomicBool,
    active_commit_tracker: Mutex<Option<Arc<CommitTracker>>>,
}

impl Director {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        me: NodeId,
        journal: Arc<dyn Journal>,
        talker: Arc<dyn RaftTalker>,
        trimmer: Arc<Trimmer>,
        state_machine: Arc<dyn StateMachine>,
        config: DirectorConfig,
    ) -> Arc<Self> {
        let heartbeat = Arc::new(HeartbeatTracker::new(config.election_timeout_low, config.election_timeout_high));
        let lease = Arc::new(Lease::new(Arc::new(crate::timekeeper::Timekeeper::new()), config.election_timeout_low));
        Arc::new(Self {
            me,
            journal,
            state: Arc::new(crate::state::State::new()),
            heartbeat,
            talker,
            lease,
            trimmer,
            state_machine,
            config,
            last_applied: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            membership_change_in_flight: std::sync::atomic::AtomicBool::new(false),
            active_commit_tracker: Mutex::new(None),
        })
    }

    pub fn state(&self) -> &Arc<crate::state::State> {
        &self.state
    }

    /// Force an immediate election attempt, independent of the heartbeat
    /// timer. A no-op if this node isn't currently a follower.
    pub async fn attempt_coup(&self) {
        if self.state.role().await == Role::Follower {
            self.heartbeat.trigger_artificial_timeout().await;
        }
    }

    /// The role loop. Runs until the node transitions to `Shutdown`.
    ///
    /// Candidate and Leader are entered and fully lived out synchronously
    /// inside `act_as_follower` (via `run_for_leader`/`become_leader`), so
    /// this outer loop only ever actually suspends in the Follower arm; the
    /// other two arms exist solely so the match stays exhaustive as `Role`
    /// evolves.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.state.role().await {
                Role::Follower => self.act_as_follower().await,
                Role::Candidate | Role::Leader => tokio::task::yield_now().await,
                Role::Shutdown => return,
            }
        }
    }

    async fn act_as_follower(self: &Arc<Self>) {
        loop {
            if self.state.role().await != Role::Follower {
                return;
            }
            let remaining = self.heartbeat.remaining().await;
            tokio::time::sleep(remaining).await;

            match self.heartbeat.timeout().await {
                TimeoutOutcome::No => continue,
                TimeoutOutcome::Yes | TimeoutOutcome::Artificial => {
                    let membership = self.journal.get_membership().await;
                    if membership.is_full_member(&self.me) {
                        self.run_for_leader(membership).await;
                    }
                    self.heartbeat.refresh_random_timeout().await;
                    if self.state.role().await != Role::Follower {
                        return;
                    }
                }
            }
        }
    }

    async fn run_for_leader(self: &Arc<Self>, membership: Membership) {
        let snapshot = self.state.snapshot().await;
        let (last_index, last_term) = self.journal.last_index_and_term().await;
        let candidate_term = snapshot.term + 1;

        let pre = election::run_round(
            &self.talker,
            VotePhase::PreVote,
            candidate_term,
            self.me.clone(),
            last_index,
            last_term,
            &membership,
            self.config.rpc_timeout,
        )
        .await;
        if !matches!(pre, crate::types::ElectionOutcome::Elected) {
            tracing::debug!(term = candidate_term, "pre-vote failed to reach quorum");
            return;
        }

        if !self.state.become_candidate(candidate_term, self.me.clone()).await {
            return;
        }
        if self.journal.vote_for(candidate_term, Some(self.me.clone())).await.is_err() {
            self.state.step_down().await;
            return;
        }

        let outcome = election::run_round(
            &self.talker,
            VotePhase::Vote,
            candidate_term,
            self.me.clone(),
            last_index,
            last_term,
            &membership,
            self.config.rpc_timeout,
        )
        .await;

        match outcome {
            crate::types::ElectionOutcome::Elected => {
                if self.state.ascend(candidate_term, self.me.clone()).await {
                    self.become_leader(candidate_term, membership).await;
                }
            }
            crate::types::ElectionOutcome::Vetoed => {
                tracing::warn!(term = candidate_term, "election vetoed, a quorum would lose committed entries");
                self.state.step_down().await;
            }
            crate::types::ElectionOutcome::NotElected => {
                self.state.step_down().await;
            }
        }
    }

    async fn become_leader(self: &Arc<Self>, term: Term, membership: Membership) {
        tracing::info!(term, "ascended to leader");
        self.lease.clear().await;

        // §4.7: append the leadership marker immediately on ascension so
        // that no read in this term is served until it is committed.
        let marker_index = match self.append_internal(term, vec![b"__leader__".to_vec()]).await {
            Ok(entry) => entry.index,
            Err(err) => {
                tracing::error!(error = %err, "failed to append leadership marker");
                self.state.step_down().await;
                return;
            }
        };
        self.state.set_leadership_marker(marker_index).await;

        let commit_tracker = CommitTracker::new(self.journal.clone(), membership.quorum_size());
        *self.active_commit_tracker.lock().await = Some(commit_tracker.clone());
        let replicator = Replicator::new();
        let (higher_term_tx, mut higher_term_rx) = mpsc::unbounded_channel();
        let (next_index, _) = self.journal.last_index_and_term().await;
        let next_index = next_index + 1;

        for target in membership.members.iter().chain(membership.observers.iter()).filter(|n| **n != self.me) {
            let is_voting_member = membership.members.iter().any(|m| m == target);
            let stream = ReplicaTracker::spawn(
                target.clone(),
                self.me.clone(),
                term,
                self.journal.clone(),
                self.talker.clone(),
                self.lease.clone(),
                self.trimmer.clone(),
                commit_tracker.clone(),
                is_voting_member,
                higher_term_tx.clone(),
                next_index,
                ReplicationConfig {
                    heartbeat_interval: self.config.heartbeat_interval,
                    rpc_timeout: self.config.rpc_timeout,
                    resilver_timeout: self.config.resilver_timeout,
                },
            );
            replicator.insert(target.clone(), stream).await;
        }

        loop {
            if self.state.role().await != Role::Leader {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                    self.apply_commits().await;
                }
                maybe_term = higher_term_rx.recv() => {
                    if let Some(observed_term) = maybe_term {
                        self.state.observed(observed_term, None).await;
                        break;
                    }
                }
            }
            if !self.lease.is_valid(&membership.members, membership.quorum_size()).await {
                tracing::warn!("leader lease expired, stepping down");
                self.state.step_down().await;
                break;
            }
        }

        replicator.stop_all().await;
        *self.active_commit_tracker.lock().await = None;
        self.fail_pending_not_yet_leader().await;
    }

    /// Apply every committed-but-not-yet-applied entry to the state
    /// machine, releasing any pending client reply waiting on it.
    async fn apply_commits(self: &Arc<Self>) {
        let commit_index = self.journal.get_commit_index().await;
        let mut last_applied = self.last_applied.load(Ordering::Acquire);
        while last_applied < commit_index {
            let next = last_applied + 1;
            let entry = match self.journal.fetch(next).await {
                Ok(entry) => entry,
                Err(_) => break,
            };
            let result = if entry.is_membership_change() || entry.request.first().map(Vec::as_slice) == Some(b"__leader__" as &[u8]) {
                Ok(Vec::new())
            } else {
                self.state_machine.apply(&entry).await.map_err(|e| RaftError::Journal(e.into()))
            };
            self.trimmer.note_applied(next);
            last_applied = next;
            self.last_applied.store(last_applied, Ordering::Release);

            if let Some(tx) = self.pending.lock().await.remove(&next) {
                let _ = tx.send(result);
            }
        }
    }

    async fn fail_pending_not_yet_leader(&self) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(RaftError::NotLeader(None)));
        }
    }

    async fn append_internal(&self, term: Term, request: Request) -> RaftResult<Entry> {
        let (last_index, _) = self.journal.last_index_and_term().await;
        let index = last_index + 1;
        self.journal.append(index, term, request.clone()).await?;
        Ok(Entry { index, term, request })
    }

    /// Client write entry point. Appends to the log and waits for the entry
    /// to be committed and applied.
    pub async fn propose(self: &Arc<Self>, request: Request) -> RaftResult<Vec<u8>> {
        let snapshot = self.state.snapshot().await;
        if snapshot.role != Role::Leader {
            return Err(RaftError::NotLeader(snapshot.leader));
        }
        let entry = self.append_internal(snapshot.term, request).await?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(entry.index, tx);
        self.apply_commits().await;
        rx.await.unwrap_or(Err(RaftError::ShuttingDown))
    }

    /// Leader-only: propose a membership change. See [`membership::admit`]
    /// for the safety rules.
    pub async fn change_membership(self: &Arc<Self>, change: MembershipChange) -> RaftResult<()> {
        let snapshot = self.state.snapshot().await;
        if snapshot.role != Role::Leader {
            return Err(RaftError::NotLeader(snapshot.leader));
        }
        if self
            .membership_change_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RaftError::MembershipChangeInFlight);
        }

        let result = self.change_membership_inner(change).await;
        self.membership_change_in_flight.store(false, Ordering::Release);
        result
    }

    async fn change_membership_inner(self: &Arc<Self>, change: MembershipChange) -> RaftResult<()> {
        let current = self.journal.get_membership().await;
        let commit_index = self.journal.get_commit_index().await;
        let match_indices = match &*self.active_commit_tracker.lock().await {
            Some(tracker) => tracker.snapshot().await,
            None => HashMap::new(),
        };
        let new_membership = membership::admit(&change, &current, commit_index, |node| match_indices.get(node).copied())?;

        let payload = serde_json::to_vec(&new_membership)
            .map_err(|e| RaftError::Journal(crate::error::JournalError::Storage(anyhow::Error::from(e))))?;
        self.propose(vec![b"__membership__".to_vec(), payload]).await?;
        Ok(())
    }

    /// Inbound AppendEntries handler (follower side).
    pub async fn handle_append_entries(self: &Arc<Self>, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let current_term = self.journal.current_term().await;
        if req.term < current_term {
            return AppendEntriesResponse { term: current_term, outcome: false, log_size: self.log_size().await };
        }

        self.heartbeat.refresh().await;
        self.state.observed(req.term, Some(&req.leader_id)).await;
        if req.term > current_term {
            let _ = self.journal.vote_for(req.term, None).await;
        }

        let (last_index, last_term) = self.journal.last_index_and_term().await;
        let log_matches = if req.prev_index == 0 {
            true
        } else if req.prev_index > last_index {
            false
        } else {
            match self.journal.fetch(req.prev_index).await {
                Ok(entry) => entry.term == req.prev_term,
                Err(_) => false,
            }
        };

        if !log_matches {
            if last_term == req.prev_term {
                // Term matches at a shorter log than the leader expected:
                // nothing to roll back, just report our actual size.
            } else if req.prev_index <= last_index {
                let _ = self.journal.remove_entries(req.prev_index.max(1)).await;
            }
            return AppendEntriesResponse { term: req.term, outcome: false, log_size: self.log_size().await };
        }

        let mut next_index = req.prev_index + 1;
        for entry in req.entries {
            match self.journal.fetch(next_index).await {
                Ok(existing) if existing.term == entry.term => {}
                Ok(_) => {
                    if self.journal.remove_entries(next_index).await.is_ok() {
                        let _ = self.journal.append(next_index, entry.term, entry.request).await;
                    }
                }
                Err(_) => {
                    let _ = self.journal.append(next_index, entry.term, entry.request).await;
                }
            }
            next_index += 1;
        }

        let log_size = self.log_size().await;
        if req.commit_index > self.journal.get_commit_index().await {
            let target = req.commit_index.min(log_size.saturating_sub(1));
            let _ = self.journal.set_commit_index(target).await;
            self.apply_commits().await;
        }

        AppendEntriesResponse { term: req.term, outcome: true, log_size }
    }

    /// Inbound RequestVote / pre-vote handler.
    pub async fn handle_vote_request(self: &Arc<Self>, req: VoteRequest) -> VoteResponse {
        self.state.observed(req.term, None).await;
        let current_term = self.journal.current_term().await;
        let (last_index, last_term) = self.journal.last_index_and_term().await;
        let commit_index = self.journal.get_commit_index().await;
        let commit_term = self.journal.fetch(commit_index).await.map(|e| e.term).unwrap_or(0);
        let already_voted_for = self.journal.voted_for(req.term).await;
        let log_start = self.journal.log_start().await;
        let trim_guard_term = self.journal.trim_guard_term().await;

        let outcome = election::grant_rule(
            req.term,
            current_term,
            already_voted_for.as_ref(),
            &req.candidate,
            req.last_index,
            req.last_term,
            last_index,
            last_term,
            commit_index,
            commit_term,
            log_start,
            trim_guard_term,
        );

        if matches!(req.phase, VotePhase::Vote) && matches!(outcome, VoteOutcome::Granted) {
            let _ = self.journal.vote_for(req.term, Some(req.candidate.clone())).await;
            self.heartbeat.refresh().await;
        }

        let responded_term = current_term.max(req.term);
        VoteResponse { term: responded_term, outcome }
    }

    async fn log_size(&self) -> LogIndex {
        self.journal.last_index_and_term().await.0 + 1
    }
}
