//! Core identifiers and value types shared across the crate.
//!
//! Kept concrete and non-generic: this core never needs to know the shape of
//! the application payload it is replicating, so a log entry's request is
//! just an ordered sequence of opaque byte strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A node's address, `host:port`. Used as both its wire identity and its
/// dial target.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

pub type Term = u64;
pub type LogIndex = u64;

/// A single command: an ordered sequence of opaque byte strings, matching
/// the RESP array-of-bulk-strings shape a client would have sent.
pub type Request = Vec<Vec<u8>>;

/// One entry of the replicated log.
///
/// `term=0, index=0` is reserved for the initial membership-declaration
/// entry written when a journal is first created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub index: LogIndex,
    pub term: Term,
    pub request: Request,
}

impl Entry {
    pub fn is_membership_change(&self) -> bool {
        matches!(self.request.first().map(Vec::as_slice), Some(b"__membership__"))
    }
}

/// The cluster's membership at a point in the log.
///
/// `membership_epoch` increments on every admitted change, so a node can
/// tell two memberships with the same member set apart (e.g. a member
/// removed and re-added).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub members: Vec<NodeId>,
    pub observers: Vec<NodeId>,
    pub membership_epoch: u64,
}

impl Membership {
    pub fn is_full_member(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    pub fn is_observer(&self, node: &NodeId) -> bool {
        self.observers.contains(node)
    }

    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

/// The role a node currently believes itself to be playing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

/// A snapshot of the Raft state triple plus bookkeeping, as returned by
/// `State::snapshot()`. Immutable once handed out; a new transition produces
/// a new snapshot rather than mutating this one.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub role: Role,
    pub leader: Option<NodeId>,
    pub leadership_marker_index: Option<LogIndex>,
}

/// Outcome of a vote request, including the commit-safety veto: a refusal
/// that also tells the candidate its log is behind rather than merely that
/// the vote was withheld.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    Granted,
    Refused,
    Veto,
}

/// Outcome of a completed voting round across the full membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionOutcome {
    Elected,
    NotElected,
    Vetoed,
}
