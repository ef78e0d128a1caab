//! Routes inbound wire frames to the director, the replicator's resilvering
//! receiver, or the state machine.
//!
//! One command per inbound RESP frame, dispatched through a wire-level
//! command table. The resilvering receiver tracks begin/continue/finalize
//! state across calls, reassembling the directory-of-named-files a sender
//! produces via `Journal::checkpoint_files`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::director::membership::MembershipChange;
use crate::director::Director;
use crate::error::{DispatchError, RaftError};
use crate::journal::Journal;
use crate::network::{AppendEntriesRequest, VotePhase, VoteRequest};
use crate::protocol::Frame;
use crate::statemachine::StateMachine;
use crate::types::{Entry, NodeId, VoteOutcome};

/// In-flight and lifetime request counts, exposed through `RAFT_INFO`.
#[derive(Default)]
pub struct RequestCounter {
    in_flight: AtomicU64,
    total: AtomicU64,
}

impl RequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> RequestGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::AcqRel);
        RequestGuard { counter: self }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }
}

/// RAII guard decrementing `in_flight` when a request finishes, win or lose.
pub struct RequestGuard<'a> {
    counter: &'a RequestCounter,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.counter.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct ResilverState {
    event_id: u64,
    files: Vec<(String, Vec<u8>)>,
}

pub struct Dispatcher {
    me: NodeId,
    cluster_id: String,
    director: Arc<Director>,
    journal: Arc<dyn Journal>,
    state_machine: Arc<dyn StateMachine>,
    requests: RequestCounter,
    resilvering: Mutex<Option<ResilverState>>,
}

impl Dispatcher {
    pub fn new(
        me: NodeId,
        cluster_id: String,
        director: Arc<Director>,
        journal: Arc<dyn Journal>,
        state_machine: Arc<dyn StateMachine>,
    ) -> Self {
        Self { me, cluster_id, director, journal, state_machine, requests: RequestCounter::new(), resilvering: Mutex::new(None) }
    }

    pub fn requests(&self) -> &RequestCounter {
        &self.requests
    }

    pub async fn dispatch(&self, frame: Frame) -> Frame {
        let _guard = self.requests.begin();
        match self.dispatch_inner(frame).await {
            Ok(reply) => reply,
            // A write landed on a non-leader: redirect the client to the
            // known leader rather than leaking the raw error, or reply nil
            // so it can back off and retry if no leader is known yet.
            Err(DispatchError::Raft(RaftError::NotLeader(Some(leader)))) => Frame::error(format!("MOVED {leader}")),
            Err(DispatchError::Raft(RaftError::NotLeader(None))) => Frame::nil(),
            Err(err) => Frame::error(format!("ERR {err}")),
        }
    }

    async fn dispatch_inner(&self, frame: Frame) -> Result<Frame, DispatchError> {
        let parts = frame.into_command()?;
        let Some(command) = parts.first() else {
            return Err(DispatchError::Protocol("empty command".into()));
        };
        match command.to_ascii_uppercase().as_slice() {
            b"RAFT_HANDSHAKE" => self.handshake(&parts),
            b"RAFT_APPEND_ENTRIES" => self.append_entries(&parts).await,
            b"RAFT_PRE_VOTE" => self.vote_request(&parts, VotePhase::PreVote).await,
            b"RAFT_REQUEST_VOTE" => self.vote_request(&parts, VotePhase::Vote).await,
            b"RAFT_FETCH" => self.fetch(&parts).await,
            b"RAFT_FETCH_LAST" => self.fetch_last(&parts).await,
            b"RAFT_ADD_OBSERVER" => self.membership_change(&parts, |n| MembershipChange::AddObserver(n)).await,
            b"RAFT_PROMOTE_OBSERVER" => self.membership_change(&parts, |n| MembershipChange::PromoteObserver(n)).await,
            b"RAFT_REMOVE_MEMBER" => self.membership_change(&parts, |n| MembershipChange::RemoveMember(n)).await,
            b"RAFT_ATTEMPT_COUP" => self.attempt_coup().await,
            b"RAFT_INFO" => self.info().await,
            b"RAFT_CHECKPOINT" => self.checkpoint().await,
            b"RAFT_CHECKPOINT_BEGIN" => self.checkpoint_begin(&parts).await,
            b"RAFT_CHECKPOINT_CHUNK" => self.checkpoint_chunk(&parts).await,
            b"RAFT_CHECKPOINT_END" => self.checkpoint_end(&parts).await,
            b"RAFT_CHECKPOINT_CANCEL" => self.checkpoint_cancel(&parts).await,
            b"RAFT_JOURNAL_SCAN" => self.journal_scan(&parts).await,
            b"SET" | b"DEL" => self.client_write(parts).await,
            b"GET" => self.client_get(&parts).await,
            other => Err(DispatchError::UnknownCommand(String::from_utf8_lossy(other).into_owned())),
        }
    }

    fn handshake(&self, parts: &[Vec<u8>]) -> Result<Frame, DispatchError> {
        let cluster_id = parts.get(2).map(|b| String::from_utf8_lossy(b).into_owned());
        match cluster_id {
            Some(id) if id == self.cluster_id => Ok(Frame::ok()),
            Some(other) => Ok(Frame::error(format!("cluster id mismatch: expected {}, got {other}", self.cluster_id))),
            None => Err(DispatchError::Protocol("RAFT_HANDSHAKE requires a cluster id".into())),
        }
    }

    async fn append_entries(&self, parts: &[Vec<u8>]) -> Result<Frame, DispatchError> {
        let leader_id: NodeId = String::from_utf8_lossy(parts.get(1).ok_or_else(|| proto("missing leader id"))?).as_ref().into();
        let header = parts.get(2).ok_or_else(|| proto("missing header"))?;
        if header.len() != 40 {
            return Err(proto("malformed AppendEntries header"));
        }
        let read_u64 = |offset: usize| u64::from_be_bytes(header[offset..offset + 8].try_into().unwrap());
        let term = read_u64(0);
        let prev_index = read_u64(8);
        let prev_term = read_u64(16);
        let commit_index = read_u64(24);
        let entry_count = read_u64(32) as usize;

        let mut entries = Vec::with_capacity(entry_count);
        for raw in parts.iter().skip(3).take(entry_count) {
            let entry: Entry = serde_json::from_slice(raw).map_err(|e| DispatchError::Protocol(e.to_string()))?;
            entries.push(entry);
        }

        let response = self
            .director
            .handle_append_entries(AppendEntriesRequest { term, leader_id, prev_index, prev_term, commit_index, entries })
            .await;
        Ok(Frame::array(vec![
            Frame::Integer(response.term as i64),
            Frame::Integer(response.outcome as i64),
            Frame::Integer(response.log_size as i64),
        ]))
    }

    async fn vote_request(&self, parts: &[Vec<u8>], phase: VotePhase) -> Result<Frame, DispatchError> {
        let term: u64 = parse_int(parts.get(1))?;
        let candidate: NodeId = String::from_utf8_lossy(parts.get(2).ok_or_else(|| proto("missing candidate"))?).as_ref().into();
        let last_index: u64 = parse_int(parts.get(3))?;
        let last_term: u64 = parse_int(parts.get(4))?;

        let response = self.director.handle_vote_request(VoteRequest { phase, term, candidate, last_index, last_term }).await;
        let kind = match response.outcome {
            VoteOutcome::Granted => "GRANTED",
            VoteOutcome::Refused => "REFUSED",
            VoteOutcome::Veto => "VETO",
        };
        Ok(Frame::array(vec![Frame::Integer(response.term as i64), Frame::Simple(kind.to_string())]))
    }

    async fn fetch(&self, parts: &[Vec<u8>]) -> Result<Frame, DispatchError> {
        let index: u64 = parse_int(parts.get(1))?;
        match self.journal.fetch(index).await {
            Ok(entry) => Ok(Frame::bulk(serde_json::to_vec(&entry).map_err(|e| DispatchError::Protocol(e.to_string()))?)),
            Err(_) => Ok(Frame::nil()),
        }
    }

    async fn fetch_last(&self, parts: &[Vec<u8>]) -> Result<Frame, DispatchError> {
        let count: u64 = parse_int(parts.get(1))?;
        let (last_index, _) = self.journal.last_index_and_term().await;
        let start = last_index.saturating_sub(count.saturating_sub(1));
        let (entries, _) = self.journal.scan_contents(start, count as usize, None).await.map_err(|e| DispatchError::Protocol(e.to_string()))?;
        let frames: Vec<Frame> = entries
            .iter()
            .map(|e| serde_json::to_vec(e).map(Frame::bulk).map_err(|err| DispatchError::Protocol(err.to_string())))
            .collect::<Result<_, _>>()?;
        Ok(Frame::array(frames))
    }

    async fn journal_scan(&self, parts: &[Vec<u8>]) -> Result<Frame, DispatchError> {
        let start: u64 = parse_int(parts.get(1))?;
        let count: u64 = parts.get(2).map(|b| parse_int(Some(b))).transpose()?.unwrap_or(100);
        let glob = parts.get(3).map(|b| String::from_utf8_lossy(b).into_owned());
        let (entries, cursor) =
            self.journal.scan_contents(start, count as usize, glob.as_deref()).await.map_err(|e| DispatchError::Protocol(e.to_string()))?;
        let mut frames: Vec<Frame> = entries
            .iter()
            .map(|e| serde_json::to_vec(e).map(Frame::bulk).map_err(|err| DispatchError::Protocol(err.to_string())))
            .collect::<Result<_, _>>()?;
        frames.push(match cursor {
            Some(c) => Frame::Integer(c as i64),
            None => Frame::nil(),
        });
        Ok(Frame::array(frames))
    }

    async fn membership_change(
        &self,
        parts: &[Vec<u8>],
        build: impl FnOnce(NodeId) -> MembershipChange,
    ) -> Result<Frame, DispatchError> {
        let node: NodeId = String::from_utf8_lossy(parts.get(1).ok_or_else(|| proto("missing node address"))?).as_ref().into();
        self.director.change_membership(build(node)).await?;
        Ok(Frame::ok())
    }

    async fn attempt_coup(&self) -> Result<Frame, DispatchError> {
        self.director.attempt_coup().await;
        Ok(Frame::ok())
    }

    async fn info(&self) -> Result<Frame, DispatchError> {
        let snapshot = self.director.state().snapshot().await;
        let (last_index, last_term) = self.journal.last_index_and_term().await;
        let fields: Vec<Frame> = vec![
            Frame::bulk(b"me".to_vec()),
            Frame::bulk(self.me.0.clone()),
            Frame::bulk(b"role".to_vec()),
            Frame::bulk(format!("{:?}", snapshot.role)),
            Frame::bulk(b"term".to_vec()),
            Frame::Integer(snapshot.term as i64),
            Frame::bulk(b"leader".to_vec()),
            match &snapshot.leader {
                Some(leader) => Frame::bulk(leader.0.clone()),
                None => Frame::nil(),
            },
            Frame::bulk(b"last_index".to_vec()),
            Frame::Integer(last_index as i64),
            Frame::bulk(b"last_term".to_vec()),
            Frame::Integer(last_term as i64),
            Frame::bulk(b"commit_index".to_vec()),
            Frame::Integer(self.journal.get_commit_index().await as i64),
            Frame::bulk(b"requests_in_flight".to_vec()),
            Frame::Integer(self.requests.in_flight() as i64),
            Frame::bulk(b"requests_total".to_vec()),
            Frame::Integer(self.requests.total() as i64),
        ];
        Ok(Frame::array(fields))
    }

    async fn checkpoint(&self) -> Result<Frame, DispatchError> {
        let files = self.journal.checkpoint_files().await.map_err(|e| DispatchError::Protocol(e.to_string()))?;
        Ok(Frame::Integer(files.len() as i64))
    }

    async fn checkpoint_begin(&self, parts: &[Vec<u8>]) -> Result<Frame, DispatchError> {
        let event_id: u64 = parse_int(parts.get(1))?;
        *self.resilvering.lock().await = Some(ResilverState { event_id, files: Vec::new() });
        Ok(Frame::ok())
    }

    async fn checkpoint_chunk(&self, parts: &[Vec<u8>]) -> Result<Frame, DispatchError> {
        let event_id: u64 = parse_int(parts.get(1))?;
        let relative_path = String::from_utf8_lossy(parts.get(2).ok_or_else(|| proto("missing chunk path"))?).into_owned();
        let contents = parts.get(3).ok_or_else(|| proto("missing chunk contents"))?.clone();

        let mut state = self.resilvering.lock().await;
        match state.as_mut() {
            Some(s) if s.event_id == event_id => {
                s.files.push((relative_path, contents));
                Ok(Frame::ok())
            }
            _ => Err(proto("resilver chunk for an event that was never begun")),
        }
    }

    async fn checkpoint_end(&self, parts: &[Vec<u8>]) -> Result<Frame, DispatchError> {
        let event_id: u64 = parse_int(parts.get(1))?;
        let state = self.resilvering.lock().await.take();
        match state {
            Some(s) if s.event_id == event_id => {
                self.journal.restore_from_checkpoint(s.files).await.map_err(|e| DispatchError::Protocol(e.to_string()))?;
                Ok(Frame::ok())
            }
            _ => Err(proto("resilver end for an event that was never begun")),
        }
    }

    async fn checkpoint_cancel(&self, parts: &[Vec<u8>]) -> Result<Frame, DispatchError> {
        let event_id: u64 = parse_int(parts.get(1))?;
        let reason = parts.get(2).map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
        let mut state = self.resilvering.lock().await;
        if matches!(state.as_ref(), Some(s) if s.event_id == event_id) {
            tracing::warn!(event_id, reason, "resilvering cancelled by sender");
            *state = None;
        }
        Ok(Frame::ok())
    }

    async fn client_write(&self, parts: Vec<Vec<u8>>) -> Result<Frame, DispatchError> {
        let result = self.director.propose(parts).await?;
        Ok(Frame::bulk(result))
    }

    async fn client_get(&self, parts: &[Vec<u8>]) -> Result<Frame, DispatchError> {
        let key = parts.get(1).ok_or_else(|| proto("GET requires a key"))?;
        match self.state_machine.get(key).await {
            Some(value) => Ok(Frame::bulk(value)),
            None => Ok(Frame::nil()),
        }
    }
}

fn proto(message: &str) -> DispatchError {
    DispatchError::Protocol(message.to_string())
}

fn parse_int(part: Option<&Vec<u8>>) -> Result<u64, DispatchError> {
    let bytes = part.ok_or_else(|| proto("missing integer argument"))?;
    std::str::from_utf8(bytes).ok().and_then(|s| s.parse().ok()).ok_or_else(|| proto("malformed integer argument"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::director::DirectorConfig;
    use crate::journal::MemJournal;
    use crate::network::RaftTalker;
    use std::time::Duration;

    struct NoopTalker;

    #[async_trait::async_trait]
    impl RaftTalker for NoopTalker {
        async fn handshake(&self, _: &NodeId, _: &str, _: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_append_entries(
            &self,
            _: &NodeId,
            _: AppendEntriesRequest,
            _: Duration,
        ) -> anyhow::Result<crate::network::AppendEntriesResponse> {
            anyhow::bail!("no peers in this test")
        }
        async fn send_vote_request(&self, _: &NodeId, _: VoteRequest, _: Duration) -> anyhow::Result<crate::network::VoteResponse> {
            anyhow::bail!("no peers in this test")
        }
        async fn start_resilvering(&self, _: &NodeId, _: crate::network::ResilverStart, _: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_resilver_chunk(&self, _: &NodeId, _: crate::network::ResilverChunk, _: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn finish_resilvering(&self, _: &NodeId, _: u64, _: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn cancel_resilvering(&self, _: &NodeId, _: u64, _: &str, _: Duration) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        let me: NodeId = "n0:1".into();
        let journal = Arc::new(MemJournal::new("cluster-a", vec![me.clone()]));
        let director = Director::new(
            me.clone(),
            journal.clone(),
            Arc::new(NoopTalker),
            crate::trimmer::Trimmer::new(journal.clone(), crate::trimmer::TrimmerConfig { keep_at_least: 10, interval: Duration::from_secs(60) }),
            Arc::new(crate::statemachine::KvStateMachine::new()),
            DirectorConfig {
                election_timeout_low: Duration::from_millis(150),
                election_timeout_high: Duration::from_millis(300),
                heartbeat_interval: Duration::from_millis(50),
                rpc_timeout: Duration::from_millis(100),
                resilver_timeout: Duration::from_secs(5),
            },
        );
        Dispatcher::new(me, "cluster-a".to_string(), director, journal, Arc::new(crate::statemachine::KvStateMachine::new()))
    }

    #[tokio::test]
    async fn handshake_accepts_matching_cluster_id() {
        let d = dispatcher();
        let reply = d.dispatch(crate::protocol::command(&[b"RAFT_HANDSHAKE", b"1", b"cluster-a"])).await;
        assert_eq!(reply, Frame::ok());
    }

    #[tokio::test]
    async fn handshake_rejects_mismatched_cluster_id() {
        let d = dispatcher();
        let reply = d.dispatch(crate::protocol::command(&[b"RAFT_HANDSHAKE", b"1", b"cluster-b"])).await;
        assert!(matches!(reply, Frame::Error(_)));
    }

    #[tokio::test]
    async fn unknown_command_is_reported_as_an_error() {
        let d = dispatcher();
        let reply = d.dispatch(crate::protocol::command(&[b"NOT_A_COMMAND"])).await;
        assert!(matches!(reply, Frame::Error(_)));
    }

    #[tokio::test]
    async fn a_write_with_no_known_leader_gets_a_nil_reply() {
        let d = dispatcher();
        let reply = d.dispatch(crate::protocol::command(&[b"SET", b"k", b"v"])).await;
        assert_eq!(reply, Frame::nil());
    }

    #[tokio::test]
    async fn a_write_on_a_follower_is_redirected_to_the_known_leader() {
        let d = dispatcher();
        // Observe an AppendEntries from some other node so this one learns
        // who the leader is without becoming leader itself.
        d.dispatch(crate::protocol::command(&[
            b"RAFT_APPEND_ENTRIES",
            b"n1:1",
            &[0u8; 40],
        ]))
        .await;
        let reply = d.dispatch(crate::protocol::command(&[b"SET", b"k", b"v"])).await;
        assert_eq!(reply, Frame::error("MOVED n1:1"));
    }

    #[tokio::test]
    async fn request_counter_tracks_total_requests() {
        let d = dispatcher();
        d.dispatch(crate::protocol::command(&[b"RAFT_INFO"])).await;
        d.dispatch(crate::protocol::command(&[b"RAFT_INFO"])).await;
        assert_eq!(d.requests().total(), 2);
        assert_eq!(d.requests().in_flight(), 0);
    }
}
