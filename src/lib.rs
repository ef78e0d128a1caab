//! A replicated, strongly-consistent key-value store built on a Raft
//! journal.
//!
//! The core (journal, state, heartbeat, election, commit tracking,
//! replication, trimming, the director role loop) is transport-agnostic;
//! [`network`] and [`protocol`] supply the concrete wire format, and
//! [`dispatcher`] and [`server`] wire everything up into a runnable process.

pub mod commit_tracker;
pub mod config;
pub mod dispatcher;
pub mod director;
pub mod election;
pub mod error;
pub mod heartbeat;
pub mod journal;
pub mod lease;
pub mod network;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod statemachine;
pub mod timekeeper;
pub mod trimmer;
pub mod types;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use director::{Director, DirectorConfig};
pub use error::{ConfigError, DispatchError, JournalError, RaftError, RaftResult};
pub use journal::{Journal, MemJournal, RocksJournal};
pub use network::{RaftTalker, TcpTalker};
pub use shutdown::ShutdownHandle;
pub use statemachine::{KvStateMachine, StateMachine};
pub use types::{Entry, LogIndex, Membership, NodeId, Request, Role, Term};
