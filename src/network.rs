//! The outbound, node-to-node side of the wire protocol: dialing a peer,
//! handshaking, and issuing the Raft RPCs.
//!
//! One async method per RPC kind, leaving implementations free to pool
//! connections however they like. The frame format itself is a RESP-like
//! array of bulk strings, implemented concretely by [`crate::protocol`].

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt as _};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::protocol::{command, Frame, RespCodec};
use crate::types::{Entry, LogIndex, NodeId, Term, VoteOutcome};

#[derive(Clone, Debug)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_index: LogIndex,
    pub prev_term: Term,
    pub commit_index: LogIndex,
    pub entries: Vec<Entry>,
}

#[derive(Clone, Debug)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub outcome: bool,
    pub log_size: LogIndex,
}

#[derive(Clone, Copy, Debug)]
pub enum VotePhase {
    PreVote,
    Vote,
}

#[derive(Clone, Debug)]
pub struct VoteRequest {
    pub phase: VotePhase,
    pub term: Term,
    pub candidate: NodeId,
    pub last_index: LogIndex,
    pub last_term: Term,
}

#[derive(Clone, Debug)]
pub struct VoteResponse {
    pub term: Term,
    pub outcome: VoteOutcome,
}

#[derive(Clone, Debug)]
pub struct ResilverStart {
    pub event_id: u64,
}

#[derive(Clone, Debug)]
pub struct ResilverChunk {
    pub event_id: u64,
    pub relative_path: String,
    pub contents: Vec<u8>,
}

/// One node's view of how to talk to the rest of the cluster.
/// Implementations are expected to pool a persistent connection per target
/// rather than dialing fresh for every RPC.
#[async_trait]
pub trait RaftTalker: Send + Sync + 'static {
    async fn handshake(&self, target: &NodeId, cluster_id: &str, timeout: Duration) -> anyhow::Result<()>;

    async fn send_append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest,
        timeout: Duration,
    ) -> anyhow::Result<AppendEntriesResponse>;

    async fn send_vote_request(
        &self,
        target: &NodeId,
        req: VoteRequest,
        timeout: Duration,
    ) -> anyhow::Result<VoteResponse>;

    async fn start_resilvering(&self, target: &NodeId, req: ResilverStart, timeout: Duration) -> anyhow::Result<()>;

    async fn send_resilver_chunk(&self, target: &NodeId, chunk: ResilverChunk, timeout: Duration) -> anyhow::Result<()>;

    async fn finish_resilvering(&self, target: &NodeId, event_id: u64, timeout: Duration) -> anyhow::Result<()>;

    async fn cancel_resilvering(
        &self,
        target: &NodeId,
        event_id: u64,
        reason: &str,
        timeout: Duration,
    ) -> anyhow::Result<()>;
}

/// A TCP-backed `RaftTalker`: one pooled, handshaken connection per target,
/// reconnecting lazily on the next call after any I/O error. Issues `RAFT_*`
/// command arrays over the [`crate::protocol`] codec.
pub struct TcpTalker {
    cluster_id: String,
    connections: tokio::sync::Mutex<std::collections::HashMap<NodeId, Framed<TcpStream, RespCodec>>>,
}

impl TcpTalker {
    pub fn new(cluster_id: String) -> Self {
        Self { cluster_id, connections: tokio::sync::Mutex::new(std::collections::HashMap::new()) }
    }

    async fn connection(&self, target: &NodeId, timeout: Duration) -> anyhow::Result<Framed<TcpStream, RespCodec>> {
        let mut pool = self.connections.lock().await;
        if let Some(conn) = pool.remove(target) {
            return Ok(conn);
        }
        drop(pool);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&target.0)).await??;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, RespCodec);
        let hello = command(&[b"RAFT_HANDSHAKE", b"1", self.cluster_id.as_bytes()]);
        tokio::time::timeout(timeout, framed.send(hello)).await??;
        match tokio::time::timeout(timeout, framed.next()).await?? {
            Frame::Simple(_) => Ok(framed),
            Frame::Error(reason) => {
                anyhow::bail!("handshake with {target} rejected: {reason}")
            }
            other => anyhow::bail!("unexpected handshake reply from {target}: {other:?}"),
        }
    }

    async fn release(&self, target: &NodeId, conn: Framed<TcpStream, RespCodec>) {
        self.connections.lock().await.insert(target.clone(), conn);
    }

    async fn roundtrip(&self, target: &NodeId, request: Frame, timeout: Duration) -> anyhow::Result<Frame> {
        let mut conn = self.connection(target, timeout).await?;
        tokio::time::timeout(timeout, conn.send(request)).await??;
        let reply = tokio::time::timeout(timeout, conn.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection to {target} closed"))??;
        self.release(target, conn).await;
        Ok(reply)
    }
}

#[async_trait]
impl RaftTalker for TcpTalker {
    async fn handshake(&self, target: &NodeId, _cluster_id: &str, timeout: Duration) -> anyhow::Result<()> {
        let conn = self.connection(target, timeout).await?;
        self.release(target, conn).await;
        Ok(())
    }

    async fn send_append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest,
        timeout: Duration,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let mut header = Vec::with_capacity(40);
        header.extend_from_slice(&req.term.to_be_bytes());
        header.extend_from_slice(&req.prev_index.to_be_bytes());
        header.extend_from_slice(&req.prev_term.to_be_bytes());
        header.extend_from_slice(&req.commit_index.to_be_bytes());
        header.extend_from_slice(&(req.entries.len() as u64).to_be_bytes());

        let mut parts: Vec<Vec<u8>> = vec![b"RAFT_APPEND_ENTRIES".to_vec(), req.leader_id.0.into_bytes(), header];
        for entry in &req.entries {
            parts.push(serde_json::to_vec(entry)?);
        }
        let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        let reply = self.roundtrip(target, command(&refs), timeout).await?;
        parse_append_entries_reply(reply)
    }

    async fn send_vote_request(
        &self,
        target: &NodeId,
        req: VoteRequest,
        timeout: Duration,
    ) -> anyhow::Result<VoteResponse> {
        let cmd_name: &[u8] = match req.phase {
            VotePhase::PreVote => b"RAFT_PRE_VOTE",
            VotePhase::Vote => b"RAFT_REQUEST_VOTE",
        };
        let reply = self
            .roundtrip(
                target,
                command(&[
                    cmd_name,
                    req.term.to_string().as_bytes(),
                    req.candidate.0.as_bytes(),
                    req.last_index.to_string().as_bytes(),
                    req.last_term.to_string().as_bytes(),
                ]),
                timeout,
            )
            .await?;
        parse_vote_reply(reply)
    }

    async fn start_resilvering(&self, target: &NodeId, req: ResilverStart, timeout: Duration) -> anyhow::Result<()> {
        let reply = self
            .roundtrip(target, command(&[b"RAFT_CHECKPOINT_BEGIN", req.event_id.to_string().as_bytes()]), timeout)
            .await?;
        expect_ok(reply)
    }

    async fn send_resilver_chunk(&self, target: &NodeId, chunk: ResilverChunk, timeout: Duration) -> anyhow::Result<()> {
        let reply = self
            .roundtrip(
                target,
                command(&[
                    b"RAFT_CHECKPOINT_CHUNK",
                    chunk.event_id.to_string().as_bytes(),
                    chunk.relative_path.as_bytes(),
                    &chunk.contents,
                ]),
                timeout,
            )
            .await?;
        expect_ok(reply)
    }

    async fn finish_resilvering(&self, target: &NodeId, event_id: u64, timeout: Duration) -> anyhow::Result<()> {
        let reply = self
            .roundtrip(target, command(&[b"RAFT_CHECKPOINT_END", event_id.to_string().as_bytes()]), timeout)
            .await?;
        expect_ok(reply)
    }

    async fn cancel_resilvering(
        &self,
        target: &NodeId,
        event_id: u64,
        reason: &str,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let reply = self
            .roundtrip(
                target,
                command(&[b"RAFT_CHECKPOINT_CANCEL", event_id.to_string().as_bytes(), reason.as_bytes()]),
                timeout,
            )
            .await?;
        expect_ok(reply)
    }
}

fn expect_ok(reply: Frame) -> anyhow::Result<()> {
    match reply {
        Frame::Simple(_) => Ok(()),
        Frame::Error(reason) => anyhow::bail!(reason),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}

fn parse_append_entries_reply(reply: Frame) -> anyhow::Result<AppendEntriesResponse> {
    match reply {
        Frame::Array(Some(items)) if items.len() >= 3 => {
            let term = frame_to_u64(&items[0])?;
            let outcome = frame_to_u64(&items[1])? != 0;
            let log_size = frame_to_u64(&items[2])?;
            Ok(AppendEntriesResponse { term, outcome, log_size })
        }
        other => anyhow::bail!("malformed AppendEntries reply: {other:?}"),
    }
}

fn parse_vote_reply(reply: Frame) -> anyhow::Result<VoteResponse> {
    match reply {
        Frame::Array(Some(items)) if items.len() >= 2 => {
            let term = frame_to_u64(&items[0])?;
            let kind = match &items[1] {
                Frame::Simple(s) => s.clone(),
                Frame::Bulk(Some(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
                other => anyhow::bail!("malformed vote kind: {other:?}"),
            };
            let outcome = match kind.as_str() {
                "GRANTED" => VoteOutcome::Granted,
                "VETO" => VoteOutcome::Veto,
                _ => VoteOutcome::Refused,
            };
            Ok(VoteResponse { term, outcome })
        }
        other => anyhow::bail!("malformed vote reply: {other:?}"),
    }
}

fn frame_to_u64(frame: &Frame) -> anyhow::Result<u64> {
    match frame {
        Frame::Integer(value) => Ok(*value as u64),
        Frame::Bulk(Some(bytes)) => Ok(std::str::from_utf8(bytes)?.parse()?),
        other => anyhow::bail!("expected integer, got {other:?}"),
    }
}
