//! Membership-change admission rules.
//!
//! Only one server may be added or removed at a time; a change takes effect
//! as soon as it is appended to the log rather than waiting for commit (see
//! the Open Question entry in DESIGN.md for why joint consensus was not
//! adopted here).

use crate::error::RaftError;
use crate::types::{LogIndex, Membership, NodeId};

#[derive(Clone, Debug)]
pub enum MembershipChange {
    AddObserver(NodeId),
    PromoteObserver(NodeId),
    RemoveMember(NodeId),
}

/// Validate a proposed change against the current membership and the
/// leader's knowledge of replication progress. Returns the new membership
/// on success.
pub fn admit(
    change: &MembershipChange,
    current: &Membership,
    commit_index: LogIndex,
    match_index: impl Fn(&NodeId) -> Option<LogIndex>,
) -> Result<Membership, RaftError> {
    match change {
        MembershipChange::AddObserver(node) => {
            let mut next = current.clone();
            if !next.observers.contains(node) && !next.members.contains(node) {
                next.observers.push(node.clone());
                next.membership_epoch += 1;
            }
            Ok(next)
        }
        MembershipChange::PromoteObserver(node) => {
            let caught_up = match_index(node).map(|idx| idx >= commit_index).unwrap_or(false);
            if !caught_up {
                return Err(RaftError::ObserverNotCaughtUp(node.clone()));
            }
            let mut next = current.clone();
            next.observers.retain(|o| o != node);
            if !next.members.contains(node) {
                next.members.push(node.clone());
            }
            next.membership_epoch += 1;
            Ok(next)
        }
        MembershipChange::RemoveMember(node) => {
            let mut next = current.clone();
            next.members.retain(|m| m != node);

            // After removal, the remaining full members must still be able
            // to form a quorum with a peer already matching the leader's
            // commit index (counting the leader itself as always caught up).
            let quorum = next.quorum_size();
            let caught_up_count = next
                .members
                .iter()
                .filter(|m| match_index(m).map(|idx| idx >= commit_index).unwrap_or(false))
                .count()
                + 1; // the leader
            if caught_up_count < quorum {
                return Err(RaftError::MembershipWouldLoseQuorum);
            }
            next.membership_epoch += 1;
            Ok(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(members: &[&str]) -> Membership {
        Membership { members: members.iter().map(|m| (*m).into()).collect(), ..Default::default() }
    }

    #[test]
    fn add_observer_is_always_allowed() {
        let current = membership(&["a:1", "b:1", "c:1"]);
        let result = admit(&MembershipChange::AddObserver("d:1".into()), &current, 10, |_| None).unwrap();
        assert!(result.observers.contains(&"d:1".into()));
    }

    #[test]
    fn promote_observer_requires_it_to_be_caught_up() {
        let current =
            Membership { members: vec!["a:1".into()], observers: vec!["b:1".into()], ..Default::default() };
        let err = admit(&MembershipChange::PromoteObserver("b:1".into()), &current, 10, |_| Some(3));
        assert!(err.is_err());
        let ok = admit(&MembershipChange::PromoteObserver("b:1".into()), &current, 10, |_| Some(10));
        assert!(ok.unwrap().members.contains(&"b:1".into()));
    }

    #[test]
    fn remove_member_rejected_if_quorum_would_be_lost() {
        // 5-node cluster, only 2 reachable/caught-up (plus leader = 3), need
        // quorum of 3 after removing one of the two unreachable nodes -> ok;
        // removing a caught-up node drops below quorum.
        let current = membership(&["leader", "a", "b", "c", "d"]);
        let match_index = |node: &NodeId| -> Option<LogIndex> {
            match node.0.as_str() {
                "a" => Some(10),
                "b" => Some(10),
                _ => Some(0),
            }
        };
        // Removing "c" (not caught up) still leaves leader+a+b caught up = 3, quorum of 4 is 3: ok.
        let ok = admit(&MembershipChange::RemoveMember("c".into()), &current, 10, match_index);
        assert!(ok.is_ok());

        // Removing "a" leaves leader+b = 2 caught up, quorum of 4 is 3: rejected.
        let rejected = admit(&MembershipChange::RemoveMember("a".into()), &current, 10, match_index);
        assert!(rejected.is_err());
    }
}
