//! Error types shared across the journal, election, replication and
//! dispatcher layers.

use thiserror::Error;

use crate::types::{LogIndex, NodeId, Term};

/// Errors produced by [`crate::journal::Journal`] operations.
///
/// `NotFound` is recoverable (it tells a replicator to resilver); the rest
/// signal a broken invariant and should bring the node down rather than be
/// papered over.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("append at index {got} is out of order, expected {expected}")]
    OutOfOrder { expected: LogIndex, got: LogIndex },

    #[error("append at index {index} carries term {term}, which is lower than the last term {last_term}")]
    BadTerm { index: LogIndex, term: Term, last_term: Term },

    #[error("index {0} has been trimmed away or does not exist yet")]
    NotFound(LogIndex),

    #[error("refusing to move commit index backwards: current {current}, requested {requested}")]
    NonMonotonic { current: LogIndex, requested: LogIndex },

    #[error("requested commit index {requested} is ahead of the log (size {log_size})")]
    AheadOfLog { requested: LogIndex, log_size: LogIndex },

    #[error("refusing to truncate committed entry at index {0}")]
    CommitSafetyViolation(LogIndex),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Errors raised while running the Raft core (election, replication,
/// director).
#[derive(Error, Debug)]
pub enum RaftError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("not the leader; last known leader is {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("no leader is currently known")]
    LeaderUnknown,

    #[error("shutting down")]
    ShuttingDown,

    #[error("network error talking to {target}: {source}")]
    Network {
        target: NodeId,
        #[source]
        source: anyhow::Error,
    },

    #[error("handshake with {target} failed: {reason}")]
    HandshakeFailed { target: NodeId, reason: String },

    #[error("membership update blocked, new cluster would not have an up-to-date quorum")]
    MembershipWouldLoseQuorum,

    #[error("membership update blocked, another membership change is already in flight")]
    MembershipChangeInFlight,

    #[error("cannot promote {0}, it has not caught up to the current commit index")]
    ObserverNotCaughtUp(NodeId),
}

pub type RaftResult<T> = Result<T, RaftError>;

/// Errors surfaced while parsing the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("missing required configuration key '{0}'")]
    MissingKey(&'static str),

    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("'password' and 'password_file' are mutually exclusive")]
    ConflictingPasswordOptions,
}

/// Errors produced while dispatching an inbound wire-protocol frame.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error(transparent)]
    Raft(#[from] RaftError),
}
