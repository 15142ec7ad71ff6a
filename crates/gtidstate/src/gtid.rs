//! GTID core type and codecs
//!
//! A GTID names one transaction inside a multi-source replication topology
//! as the triple `(domain_id, server_id, seq_no)`. Sequence numbers are
//! monotonic within a domain and independent across domains; `server_id`
//! records the origin server only.
//!
//! Two codecs live here:
//!
//! - **Text**: `D-S-Q` in minimal decimal digits, lists comma-separated with
//!   optional whitespace (`0-1-100, 1-2-577`).
//! - **Binary**: the GTID list record written at the start of every binlog
//!   file — little-endian `u32` count followed by `count` triples of
//!   `(u32 domain, u32 server, u64 seq)`.

use crate::error::{GtidError, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum textual length of one GTID: two u32s, one u64, two dashes.
pub const GTID_MAX_STR_LENGTH: usize = 10 + 1 + 10 + 1 + 20;

/// One global transaction identifier.
///
/// Equality is triple-equality. Within a domain, `(domain_id, seq_no)`
/// uniquely identifies a committed transaction; two GTIDs that differ only
/// in `server_id` name different origins of the same stream position and
/// compare unequal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    /// Independent replication stream this transaction belongs to
    pub domain_id: u32,
    /// Server that originally committed the transaction
    pub server_id: u32,
    /// Position within the domain, monotonic per domain
    pub seq_no: u64,
}

impl Gtid {
    /// Create a GTID from its parts
    pub fn new(domain_id: u32, server_id: u32, seq_no: u64) -> Self {
        Self {
            domain_id,
            server_id,
            seq_no,
        }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.seq_no)
    }
}

impl FromStr for Gtid {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('-');
        let (d, srv, seq) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(srv), Some(seq), None) => (d, srv, seq),
            _ => return Err(GtidError::malformed(s)),
        };
        let domain_id: u32 = d.parse().map_err(|_| GtidError::malformed(s))?;
        let server_id: u32 = srv.parse().map_err(|_| GtidError::malformed(s))?;
        let seq_no: u64 = seq.parse().map_err(|_| GtidError::malformed(s))?;
        Ok(Self::new(domain_id, server_id, seq_no))
    }
}

/// Parse a comma-separated GTID list.
///
/// Accepts the empty string (empty list). Whitespace around entries and
/// commas is tolerated: `"0-1-10 , 1-1-5"` parses the same as `"0-1-10,1-1-5"`.
pub fn parse_gtid_list(text: &str) -> Result<Vec<Gtid>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed.split(',').map(|item| item.trim().parse()).collect()
}

/// Parse a GTID list that must contain each domain at most once.
///
/// Used where a list defines one position per replication stream, e.g. a
/// slave connection request or a replica position ledger.
pub fn parse_gtid_list_unique_domains(text: &str) -> Result<Vec<Gtid>> {
    let list = parse_gtid_list(text)?;
    let mut seen = std::collections::HashSet::with_capacity(list.len());
    for gtid in &list {
        if !seen.insert(gtid.domain_id) {
            return Err(GtidError::DuplicateDomainInList(gtid.domain_id));
        }
    }
    Ok(list)
}

/// Render a GTID list as comma-separated text.
pub fn gtid_list_to_string(list: &[Gtid]) -> String {
    let mut out = String::with_capacity(list.len() * (GTID_MAX_STR_LENGTH + 1));
    for (i, gtid) in list.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&gtid.to_string());
    }
    out
}

/// Encode a GTID list as the binary log-start record.
pub fn encode_gtid_list(list: &[Gtid], buf: &mut impl BufMut) {
    buf.put_u32_le(list.len() as u32);
    for gtid in list {
        buf.put_u32_le(gtid.domain_id);
        buf.put_u32_le(gtid.server_id);
        buf.put_u64_le(gtid.seq_no);
    }
}

/// Decode a binary log-start GTID list record.
///
/// Fails with [`GtidError::TruncatedGtidList`] when the buffer ends before
/// the declared entry count.
pub fn decode_gtid_list(buf: &mut impl Buf) -> Result<Vec<Gtid>> {
    if buf.remaining() < 4 {
        return Err(GtidError::TruncatedGtidList {
            expected: 0,
            got: 0,
        });
    }
    let count = buf.get_u32_le();
    let mut list = Vec::with_capacity(count as usize);
    for i in 0..count {
        if buf.remaining() < 16 {
            return Err(GtidError::TruncatedGtidList {
                expected: count,
                got: i,
            });
        }
        let domain_id = buf.get_u32_le();
        let server_id = buf.get_u32_le();
        let seq_no = buf.get_u64_le();
        list.push(Gtid::new(domain_id, server_id, seq_no));
    }
    Ok(list)
}
