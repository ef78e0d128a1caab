//! End-to-end exercises against a 3-node cluster wired entirely in-process:
//! an `InProcessTalker` dispatches each RPC straight to the target
//! `Director`'s handler, skipping sockets and the wire codec so election,
//! replication, and commit scenarios stay deterministic and fast. TLS/auth,
//! resilvering and real TCP are left to a manual/integration harness, per
//! DESIGN.md's "Tests" plan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use quarkraft::director::{Director, DirectorConfig};
use quarkraft::journal::MemJournal;
use quarkraft::network::{
    AppendEntriesRequest, AppendEntriesResponse, RaftTalker, ResilverChunk, ResilverStart, VoteRequest, VoteResponse,
};
use quarkraft::statemachine::{KvStateMachine, StateMachine};
use quarkraft::trimmer::{Trimmer, TrimmerConfig};
use quarkraft::types::{NodeId, Role};

struct InProcessTalker {
    directors: RwLock<HashMap<NodeId, Arc<Director>>>,
}

impl InProcessTalker {
    fn new() -> Arc<Self> {
        Arc::new(Self { directors: RwLock::new(HashMap::new()) })
    }

    async fn register(&self, node: NodeId, director: Arc<Director>) {
        self.directors.write().await.insert(node, director);
    }

    async fn director(&self, node: &NodeId) -> anyhow::Result<Arc<Director>> {
        self.directors.read().await.get(node).cloned().ok_or_else(|| anyhow::anyhow!("unknown node {node}"))
    }
}

#[async_trait]
impl RaftTalker for InProcessTalker {
    async fn handshake(&self, _target: &NodeId, _cluster_id: &str, _timeout: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest,
        _timeout: Duration,
    ) -> anyhow::Result<AppendEntriesResponse> {
        Ok(self.director(target).await?.handle_append_entries(req).await)
    }

    async fn send_vote_request(&self, target: &NodeId, req: VoteRequest, _timeout: Duration) -> anyhow::Result<VoteResponse> {
        Ok(self.director(target).await?.handle_vote_request(req).await)
    }

    async fn start_resilvering(&self, _target: &NodeId, _req: ResilverStart, _timeout: Duration) -> anyhow::Result<()> {
        anyhow::bail!("resilvering is not exercised by this in-process harness")
    }

    async fn send_resilver_chunk(&self, _target: &NodeId, _chunk: ResilverChunk, _timeout: Duration) -> anyhow::Result<()> {
        anyhow::bail!("resilvering is not exercised by this in-process harness")
    }

    async fn finish_resilvering(&self, _target: &NodeId, _event_id: u64, _timeout: Duration) -> anyhow::Result<()> {
        anyhow::bail!("resilvering is not exercised by this in-process harness")
    }

    async fn cancel_resilvering(&self, _target: &NodeId, _event_id: u64, _reason: &str, _timeout: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Node {
    id: NodeId,
    state_machine: Arc<KvStateMachine>,
    director: Arc<Director>,
}

fn director_config() -> DirectorConfig {
    DirectorConfig {
        election_timeout_low: Duration::from_millis(40),
        election_timeout_high: Duration::from_millis(80),
        heartbeat_interval: Duration::from_millis(15),
        rpc_timeout: Duration::from_millis(200),
        resilver_timeout: Duration::from_secs(5),
    }
}

async fn spin_cluster(n: usize) -> (Arc<InProcessTalker>, Vec<Node>) {
    let talker = InProcessTalker::new();
    let ids: Vec<NodeId> = (0..n).map(|i| NodeId(format!("n{i}:1"))).collect();

    let mut nodes = Vec::new();
    for id in &ids {
        let journal = Arc::new(MemJournal::new("cluster-a", ids.clone()));
        let state_machine = Arc::new(KvStateMachine::new());
        let trimmer = Trimmer::new(journal.clone(), TrimmerConfig { keep_at_least: 1000, interval: Duration::from_secs(3600) });
        let director = Director::new(id.clone(), journal, talker.clone(), trimmer, state_machine.clone(), director_config());
        nodes.push(Node { id: id.clone(), state_machine, director });
    }
    for node in &nodes {
        talker.register(node.id.clone(), node.director.clone()).await;
    }
    for node in &nodes {
        tokio::spawn(node.director.clone().run());
    }
    (talker, nodes)
}

async fn wait_for_leader(nodes: &[Node]) -> &Node {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            for node in nodes {
                if node.director.state().snapshot().await.role == Role::Leader {
                    return node;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a leader should have been elected")
}

#[tokio::test]
async fn a_leader_is_elected_among_three_nodes() {
    let (_talker, nodes) = spin_cluster(3).await;
    let leader = wait_for_leader(&nodes).await;
    assert_eq!(leader.director.state().snapshot().await.role, Role::Leader);
}

#[tokio::test]
async fn at_most_one_leader_is_ever_observed_per_term() {
    let (_talker, nodes) = spin_cluster(3).await;
    let _ = wait_for_leader(&nodes).await;

    for _ in 0..20 {
        let mut leaders_by_term: HashMap<u64, usize> = HashMap::new();
        for node in &nodes {
            let snapshot = node.director.state().snapshot().await;
            if snapshot.role == Role::Leader {
                *leaders_by_term.entry(snapshot.term).or_insert(0) += 1;
            }
        }
        for (term, count) in leaders_by_term {
            assert_eq!(count, 1, "term {term} had {count} simultaneous leaders");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn a_committed_write_is_visible_on_every_node() {
    let (_talker, nodes) = spin_cluster(3).await;
    let leader = wait_for_leader(&nodes).await;

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        leader.director.propose(vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]),
    )
    .await
    .expect("propose should not hang")
    .expect("the leader should accept the write");
    assert_eq!(result, b"OK".to_vec());

    for node in &nodes {
        let value = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(value) = node.state_machine.get(b"k").await {
                    return value;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("node {} never applied the committed write", node.id));
        assert_eq!(value, b"v".to_vec());
    }
}

#[tokio::test]
async fn a_write_proposed_to_a_follower_is_rejected_as_not_leader() {
    let (_talker, nodes) = spin_cluster(3).await;
    let leader = wait_for_leader(&nodes).await;
    let follower = nodes.iter().find(|n| n.id != leader.id).expect("a follower must exist alongside the leader");

    let err = follower.director.propose(vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]).await.unwrap_err();
    assert!(matches!(err, quarkraft::RaftError::NotLeader(_)));
}
