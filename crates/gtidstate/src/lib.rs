//! # gtidstate - GTID replication state tracking
//!
//! The replication state machine of a multi-source, multi-domain database:
//! per-stream transaction positions on primary and replica, blocking
//! position waiters, strict sequence ordering and composable GTID stream
//! filters.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  exclude?   ┌─────────────┐  record     ┌─────────────┐
//! │ Replication │────────────▶│ FilterTree  │────────────▶│ SlaveState  │
//! │   reader    │             │ (filter.rs) │   apply     │ (slave.rs)  │
//! └─────────────┘             └─────────────┘             └──────┬──────┘
//!                                                                │ applied
//!                                                                ▼
//! ┌─────────────┐  next seq   ┌─────────────┐  satisfy   ┌─────────────┐
//! │   Primary   │────────────▶│ BinlogState │            │ WaitRegistry│
//! │   writer    │  snapshot   │ (binlog.rs) │            │  (wait.rs)  │
//! └─────────────┘             └─────────────┘            └─────────────┘
//! ```
//!
//! A GTID is the triple `(domain_id, server_id, seq_no)`: the domain names
//! an independent replication stream, the sequence number a position within
//! it, and the server the origin of the transaction.
//!
//! ## Quick start
//!
//! ```rust
//! use gtidstate::{Gtid, Session, SlaveState, WaitStatus};
//! use std::time::Duration;
//!
//! let slave = SlaveState::new();
//! slave.record(&Gtid::new(0, 1, 10), slave.next_sub_id(), None);
//!
//! let session = Session::new();
//! let status = slave.waiters().wait_for_pos(
//!     &slave,
//!     &session,
//!     "0-1-10",
//!     Some(Duration::from_secs(1)),
//! ).unwrap();
//! assert_eq!(status, WaitStatus::Reached);
//! ```

pub mod binlog;
pub mod connection;
pub mod error;
pub mod filter;
pub mod gtid;
pub mod session;
pub mod slave;
pub mod wait;

pub use binlog::BinlogState;
pub use connection::{ConnectionEntry, SlaveConnectionState};
pub use error::{GtidError, Result};
pub use filter::{DelegatingFilter, GtidEventFilter, GtidFilterConfig, WindowFilter};
pub use gtid::{
    decode_gtid_list, encode_gtid_list, gtid_list_to_string, parse_gtid_list,
    parse_gtid_list_unique_domains, Gtid, GTID_MAX_STR_LENGTH,
};
pub use session::Session;
pub use slave::{
    AppliedEntry, Engine, EngineRef, GtidDecision, GtidPosTableSpec, GtidPosTableState,
    SlaveState, SourceConnection,
};
pub use wait::{DomainWaitStats, WaitRegistry, WaitStatus};
