//! Error types for GTID state tracking
//!
//! Parse failures and strict-mode rejections are returned to the caller and
//! never mutate global state. Wait outcomes (`Reached`/`Timeout`/`Cancelled`)
//! are not errors and live in [`crate::wait::WaitStatus`]; only an
//! interrupted duplicate-ownership wait surfaces here as [`GtidError::WaitCancelled`].

use crate::gtid::Gtid;
use thiserror::Error;

/// Errors produced by the GTID state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GtidError {
    /// A GTID could not be parsed from text
    #[error("malformed GTID: {0:?}")]
    MalformedGtid(String),

    /// A GTID list contained the same domain twice where domains must be unique
    #[error("duplicate domain {0} in GTID list")]
    DuplicateDomainInList(u32),

    /// An empty GTID list was given where at least one entry is required
    #[error("empty GTID list")]
    EmptyGtidList,

    /// A binary GTID list record ended before the declared entry count
    #[error("truncated GTID list record: expected {expected} entries, got {got}")]
    TruncatedGtidList { expected: u32, got: u32 },

    /// Strict mode: the domain already holds an equal or higher sequence number
    #[error("out-of-order GTID {gtid} in strict mode, domain already at {current}")]
    OutOfOrderSeq { gtid: Gtid, current: u64 },

    /// Strict mode: the sequence number is not exactly one above the domain maximum
    #[error("non-monotonic GTID {gtid} in strict mode, expected seq_no {expected}")]
    NonMonotonicSeq { gtid: Gtid, expected: u64 },

    /// No position table is available for the engine and no default is loaded
    #[error("no GTID position table available for recording")]
    NoPositionTable,

    /// A domain cannot be dropped while the cluster snapshot is ahead of this node
    #[error("cannot drop domain {domain}: snapshot contains {snapshot_gtid} ahead of local state")]
    DomainDropActive { domain: u32, snapshot_gtid: Gtid },

    /// Conflicting filter construction (e.g. whitelist over an existing blacklist)
    #[error("filter conflict: {0}")]
    FilterConflict(String),

    /// A blocking duplicate-ownership wait was interrupted by session kill
    #[error("wait cancelled by session kill")]
    WaitCancelled,
}

impl GtidError {
    /// Create a malformed-GTID error from the offending text
    pub fn malformed(text: impl Into<String>) -> Self {
        Self::MalformedGtid(text.into())
    }

    /// Create a filter-conflict error
    pub fn filter_conflict(msg: impl Into<String>) -> Self {
        Self::FilterConflict(msg.into())
    }
}

/// Result type for GTID state operations
pub type Result<T> = std::result::Result<T, GtidError>;
