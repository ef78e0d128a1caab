//! The Raft state triple (term, vote, role, leader) plus the leadership
//! marker index, exposed as immutable snapshots to callers.
//!
//! Small owned state behind a lock, handed out as cheap snapshots so readers
//! never hold the lock across an await. Only one role is ever active at a
//! time; observing a second leader at the same term is treated as fatal
//! rather than reconciled.

use tokio::sync::RwLock;

use crate::types::{NodeId, Role, StateSnapshot, Term};

pub struct State {
    inner: RwLock<Inner>,
}

struct Inner {
    term: Term,
    voted_for: Option<NodeId>,
    role: Role,
    leader: Option<NodeId>,
    leadership_marker_index: Option<u64>,
}

impl State {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                term: 0,
                voted_for: None,
                role: Role::Follower,
                leader: None,
                leadership_marker_index: None,
            }),
        }
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read().await;
        StateSnapshot {
            term: inner.term,
            voted_for: inner.voted_for.clone(),
            role: inner.role,
            leader: inner.leader.clone(),
            leadership_marker_index: inner.leadership_marker_index,
        }
    }

    /// Apply the "observed term/leader" contract from every inbound Raft
    /// message: ignore stale terms, step down to follower on newer terms,
    /// and panic on two distinct leaders claiming the same term (a broken
    /// safety invariant, not a recoverable condition).
    pub async fn observed(&self, term: Term, leader: Option<&NodeId>) -> bool {
        let mut inner = self.inner.write().await;
        if term < inner.term {
            return false;
        }
        if term > inner.term {
            inner.term = term;
            inner.voted_for = None;
            inner.leader = None;
            inner.role = Role::Follower;
            inner.leadership_marker_index = None;
        }
        if let Some(leader) = leader {
            match &inner.leader {
                Some(existing) if existing != leader => {
                    panic!(
                        "fatal: observed two distinct leaders ({existing} and {leader}) in the same term {}",
                        inner.term
                    );
                }
                _ => inner.leader = Some(leader.clone()),
            }
        }
        true
    }

    pub async fn grant_vote(&self, term: Term, candidate: NodeId) -> bool {
        let mut inner = self.inner.write().await;
        if term < inner.term {
            return false;
        }
        if term > inner.term {
            inner.term = term;
            inner.voted_for = None;
            inner.leader = None;
            inner.role = Role::Follower;
        }
        match &inner.voted_for {
            Some(existing) => existing == &candidate,
            None => {
                inner.voted_for = Some(candidate);
                true
            }
        }
    }

    pub async fn become_candidate(&self, term: Term, me: NodeId) -> bool {
        let mut inner = self.inner.write().await;
        if inner.leader.is_some() && inner.term == term {
            return false;
        }
        inner.term = term;
        inner.voted_for = Some(me);
        inner.leader = None;
        inner.role = Role::Candidate;
        true
    }

    pub async fn ascend(&self, term: Term, me: NodeId) -> bool {
        let mut inner = self.inner.write().await;
        if inner.term != term || inner.role != Role::Candidate {
            return false;
        }
        inner.role = Role::Leader;
        inner.leader = Some(me);
        true
    }

    pub async fn set_leadership_marker(&self, index: u64) {
        self.inner.write().await.leadership_marker_index = Some(index);
    }

    pub async fn step_down(&self) {
        let mut inner = self.inner.write().await;
        inner.role = Role::Follower;
        inner.leadership_marker_index = None;
    }

    pub async fn shutdown(&self) {
        self.inner.write().await.role = Role::Shutdown;
    }

    pub async fn role(&self) -> Role {
        self.inner.read().await.role
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observing_higher_term_resets_vote_and_leader() {
        let state = State::new();
        let a: NodeId = "a:1".into();
        state.grant_vote(1, a.clone()).await;
        assert!(state.observed(2, None).await);
        let snap = state.snapshot().await;
        assert_eq!(snap.term, 2);
        assert!(snap.voted_for.is_none());
        assert!(snap.leader.is_none());
    }

    #[tokio::test]
    async fn stale_term_is_ignored() {
        let state = State::new();
        state.observed(5, None).await;
        assert!(!state.observed(3, None).await);
        assert_eq!(state.snapshot().await.term, 5);
    }

    #[tokio::test]
    #[should_panic(expected = "observed two distinct leaders")]
    async fn two_leaders_same_term_is_fatal() {
        let state = State::new();
        let a: NodeId = "a:1".into();
        let b: NodeId = "b:1".into();
        state.observed(1, Some(&a)).await;
        state.observed(1, Some(&b)).await;
    }

    #[tokio::test]
    async fn vote_grant_is_idempotent_for_same_candidate() {
        let state = State::new();
        let a: NodeId = "a:1".into();
        assert!(state.grant_vote(1, a.clone()).await);
        assert!(state.grant_vote(1, a.clone()).await);
        let b: NodeId = "b:1".into();
        assert!(!state.grant_vote(1, b).await);
    }
}
