//! Structured error taxonomy.
//!
//! Persistence errors are fatal by policy (spec.md §7): anything that leaves
//! durable state ambiguous propagates as [`FatalError`] and is expected to
//! terminate the process at the boot/`main` boundary, never via an `exit()`
//! call buried in the middle of the call stack.

use thiserror::Error;

use crate::NodeId;

/// The persistent circular log ran out of free space for a requested append.
///
/// Recoverable from the leader's perspective (it retries later), but
/// sustained `LogFull` is a known limitation: compaction beyond
/// [`crate::plog::CircularLog::poll_head`] is a non-goal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("persistent log is full: requested {requested} bytes, {free} free")]
pub struct LogFull {
    pub requested: usize,
    pub free: usize,
}

/// Errors a [`crate::bridge::HostBridge`] impl may report back to `RaftCore`.
#[derive(Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    LogFull(#[from] LogFull),

    /// A transaction aborted for a reason other than exhaustion (I/O, torn
    /// write detected on recovery, allocator failure). Always fatal.
    #[error("durable write failed: {0}")]
    PersistFailed(String),
}

/// Errors the [`crate::dispatcher::DispatcherContext`] reports to a client RPC.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// `client_txid` did not match `seen_client_txid + 1`, or a status query
    /// named a `client_txid` not yet seen. Carries the authoritative value
    /// so the client can resynchronize.
    #[error("invalid client_txid, expected {expected}")]
    InvalidTxid { expected: u64 },

    /// The contacted replica is not the current leader.
    #[error("not leader, known leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },
}

/// Configuration-file errors, reported at boot rather than panicking.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("config file is not valid INI: {0}")]
    Parse(String),

    #[error("missing required key [{section}] {key}")]
    MissingKey { section: &'static str, key: String },

    #[error("invalid value for [{section}] {key}: {value}")]
    InvalidValue {
        section: &'static str,
        key: String,
        value: String,
    },
}

/// Any error that must terminate the process (spec.md §6: exit code -1).
///
/// Bubbled up to the top-level boot function, which is the only place
/// allowed to call `std::process::exit`.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("durable write failed: {0}")]
    PersistFailed(String),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("i/o error opening persistent store: {0}")]
    Io(#[from] std::io::Error),

    /// This node applied a `REMOVE` entry naming itself. The only voluntary
    /// termination path (spec.md §4.2).
    #[error("removed self from cluster, exiting")]
    RemovedSelf,
}

impl From<HostError> for FatalError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::LogFull(_) => {
                unreachable!("LogFull must be handled by the caller, never escalated to fatal")
            }
            HostError::PersistFailed(s) => FatalError::PersistFailed(s),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
pub type HostResult<T> = Result<T, HostError>;
pub type FatalResult<T> = Result<T, FatalError>;
