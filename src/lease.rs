//! Leader-lease bookkeeping: per-follower last-contact time and overall
//! lease validity.
//!
//! Follows the same "shared map behind one lock, quorum computed on read"
//! idiom as [`crate::commit_tracker`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::timekeeper::Timekeeper;
use crate::types::NodeId;

pub struct Lease {
    timekeeper: std::sync::Arc<Timekeeper>,
    timeout_low: Duration,
    last_contact: RwLock<HashMap<NodeId, Instant>>,
}

impl Lease {
    pub fn new(timekeeper: std::sync::Arc<Timekeeper>, timeout_low: Duration) -> Self {
        Self { timekeeper, timeout_low, last_contact: RwLock::new(HashMap::new()) }
    }

    pub async fn record_contact(&self, node: NodeId) {
        let now = self.timekeeper.now();
        self.last_contact.write().await.insert(node, now);
    }

    pub async fn clear(&self) {
        self.last_contact.write().await.clear();
    }

    /// The lease is valid as long as a quorum of `members` (excluding self,
    /// which is always trivially "in contact") has been heard from within
    /// `timeout_low`.
    pub async fn is_valid(&self, members: &[NodeId], quorum: usize) -> bool {
        if quorum <= 1 {
            return true;
        }
        let now = self.timekeeper.now();
        let contacts = self.last_contact.read().await;
        let fresh = members
            .iter()
            .filter(|node| contacts.get(*node).map(|t| now.duration_since(*t) <= self.timeout_low).unwrap_or(false))
            .count();
        // +1 for self.
        fresh + 1 >= quorum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_invalid_until_quorum_heard_from() {
        let tk = std::sync::Arc::new(Timekeeper::new());
        let lease = Lease::new(tk, Duration::from_secs(5));
        let members = vec!["a:1".into(), "b:1".into()];
        assert!(!lease.is_valid(&members, 2).await);
        lease.record_contact("a:1".into()).await;
        assert!(lease.is_valid(&members, 2).await);
    }

    #[tokio::test]
    async fn single_node_cluster_always_has_a_valid_lease() {
        let tk = std::sync::Arc::new(Timekeeper::new());
        let lease = Lease::new(tk, Duration::from_secs(5));
        assert!(lease.is_valid(&[], 1).await);
    }
}
