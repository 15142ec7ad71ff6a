//! Primary-side binlog GTID state
//!
//! Tracks the most recent GTID written to the local transaction log for
//! every distinct `(domain_id, server_id)` pair, plus a per-domain sequence
//! counter used to allocate the next `seq_no`. The full state is emitted as
//! a GTID list record at the start of every new log file, which lets readers
//! locate the file containing a given GTID by scanning file headers
//! backwards until a lower `seq_no` is found for the domain.
//!
//! Strict mode enforces gap-free, in-order sequence numbers per domain: a
//! commit is rejected when its `seq_no` is not exactly one above the domain
//! maximum.

use crate::error::{GtidError, Result};
use crate::gtid::{decode_gtid_list, encode_gtid_list, Gtid};
use crate::slave::SlaveState;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Per-domain slice of the binlog state.
#[derive(Debug, Default)]
struct BinlogDomain {
    /// Most recent GTID logged for each origin server in this domain.
    servers: HashMap<u32, Gtid>,
    /// The most recently inserted GTID, any server.
    last_gtid: Option<Gtid>,
    /// Highest seq_no ever logged in this domain; next allocation is +1.
    seq_no_counter: u64,
}

/// The binlog GTID state of a primary.
///
/// One writer at a time mutates the state (serialized by the caller's commit
/// ordering); readers may query concurrently.
#[derive(Debug, Default)]
pub struct BinlogState {
    domains: Mutex<BTreeMap<u32, BinlogDomain>>,
}

impl BinlogState {
    /// Create an empty binlog state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard all state, e.g. after `RESET MASTER`.
    pub fn reset(&self) {
        self.domains.lock().clear();
    }

    /// Record `gtid` as the most recent GTID of its `(domain, server)` slot.
    ///
    /// In strict mode the update is rejected when the domain already holds
    /// an equal or higher sequence number ([`GtidError::OutOfOrderSeq`]) or
    /// when the new sequence number leaves a gap
    /// ([`GtidError::NonMonotonicSeq`]).
    pub fn update(&self, gtid: &Gtid, strict: bool) -> Result<()> {
        let mut domains = self.domains.lock();
        Self::update_nolock(&mut domains, gtid, strict)
    }

    fn update_nolock(
        domains: &mut BTreeMap<u32, BinlogDomain>,
        gtid: &Gtid,
        strict: bool,
    ) -> Result<()> {
        if let Some(dom) = domains.get_mut(&gtid.domain_id) {
            if strict {
                if dom.seq_no_counter >= gtid.seq_no {
                    return Err(GtidError::OutOfOrderSeq {
                        gtid: *gtid,
                        current: dom.seq_no_counter,
                    });
                }
                if gtid.seq_no != dom.seq_no_counter + 1 {
                    return Err(GtidError::NonMonotonicSeq {
                        gtid: *gtid,
                        expected: dom.seq_no_counter + 1,
                    });
                }
            }
            dom.servers.insert(gtid.server_id, *gtid);
            dom.last_gtid = Some(*gtid);
            dom.seq_no_counter = dom.seq_no_counter.max(gtid.seq_no);
        } else {
            let mut dom = BinlogDomain {
                seq_no_counter: gtid.seq_no,
                last_gtid: Some(*gtid),
                ..Default::default()
            };
            dom.servers.insert(gtid.server_id, *gtid);
            domains.insert(gtid.domain_id, dom);
        }
        Ok(())
    }

    /// The next sequence number a commit in `domain` would be allocated.
    ///
    /// Does not commit the advance; a subsequent [`update`](Self::update)
    /// for the domain does.
    pub fn next_seq_for(&self, domain: u32) -> u64 {
        let domains = self.domains.lock();
        domains.get(&domain).map_or(0, |d| d.seq_no_counter) + 1
    }

    /// Allocate the next sequence number in `domain` and record the
    /// resulting GTID in one step.
    pub fn update_with_next_gtid(&self, domain: u32, server: u32) -> Gtid {
        let mut domains = self.domains.lock();
        let seq_no = domains.get(&domain).map_or(0, |d| d.seq_no_counter) + 1;
        let gtid = Gtid::new(domain, server, seq_no);
        Self::update_nolock(&mut domains, &gtid, false)
            .expect("non-strict binlog update cannot fail");
        gtid
    }

    /// Validate a declared GTID against strict-mode sequence ordering
    /// before it is written.
    pub fn check_strict_sequence(&self, domain: u32, server: u32, seq_no: u64) -> Result<()> {
        let domains = self.domains.lock();
        if let Some(dom) = domains.get(&domain) {
            if dom.seq_no_counter >= seq_no {
                return Err(GtidError::OutOfOrderSeq {
                    gtid: Gtid::new(domain, server, seq_no),
                    current: dom.seq_no_counter,
                });
            }
        }
        Ok(())
    }

    /// Ensure the domain's sequence counter is at least `seq_no`.
    ///
    /// Used when an externally allocated sequence number must not be
    /// reallocated by this primary.
    pub fn bump_seq_no_if_needed(&self, domain: u32, seq_no: u64) {
        let mut domains = self.domains.lock();
        let dom = domains.entry(domain).or_default();
        dom.seq_no_counter = dom.seq_no_counter.max(seq_no);
    }

    /// Most recent GTID logged for `(domain, server)`, if any.
    pub fn find(&self, domain: u32, server: u32) -> Option<Gtid> {
        self.domains
            .lock()
            .get(&domain)
            .and_then(|d| d.servers.get(&server).copied())
    }

    /// Most recently logged GTID in `domain`, regardless of server.
    pub fn most_recent(&self, domain: u32) -> Option<Gtid> {
        self.domains.lock().get(&domain).and_then(|d| d.last_gtid)
    }

    /// Number of `(domain, server)` slots held.
    pub fn count(&self) -> usize {
        self.domains.lock().values().map(|d| d.servers.len()).sum()
    }

    /// True when no GTID has been logged.
    pub fn is_empty(&self) -> bool {
        self.domains.lock().is_empty()
    }

    /// Every `(domain, server)` slot, sorted by `(domain, server)` for
    /// determinism. This is the GTID list emitted on log-file rotation.
    pub fn snapshot(&self) -> Vec<Gtid> {
        let domains = self.domains.lock();
        let mut list = Vec::with_capacity(domains.values().map(|d| d.servers.len()).sum());
        for dom in domains.values() {
            let mut entries: Vec<Gtid> = dom.servers.values().copied().collect();
            entries.sort_by_key(|g| g.server_id);
            list.extend(entries);
        }
        list
    }

    /// Serialize the snapshot as the binary log-start record.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        encode_gtid_list(&self.snapshot(), buf);
    }

    /// Replace the state with a previously serialized snapshot record.
    pub fn read_from(&self, buf: &mut impl Buf) -> Result<()> {
        let list = decode_gtid_list(buf)?;
        self.load(&list);
        Ok(())
    }

    /// Replace the state with the given GTID list.
    pub fn load(&self, list: &[Gtid]) {
        let mut domains = self.domains.lock();
        domains.clear();
        for gtid in list {
            Self::update_nolock(&mut domains, gtid, false)
                .expect("non-strict binlog update cannot fail");
        }
        debug!(entries = list.len(), "loaded binlog GTID state");
    }

    /// Seed the binlog state from a replica's applied-position ledger, e.g.
    /// when the replica is promoted to primary.
    pub fn load_from_slave_state(&self, slave: &SlaveState) {
        self.load(&slave.gtid_list(&[]));
    }

    /// Append one most-recent GTID per domain, comma-separated, to `out`.
    ///
    /// This is the position a newly attached replica would resume from.
    pub fn append_pos(&self, out: &mut String) {
        let domains = self.domains.lock();
        let mut first = out.is_empty();
        for dom in domains.values() {
            if let Some(gtid) = dom.last_gtid {
                if !first {
                    out.push(',');
                }
                out.push_str(&gtid.to_string());
                first = false;
            }
        }
    }

    /// Append every `(domain, server)` slot, comma-separated, to `out`.
    pub fn append_state(&self, out: &mut String) {
        let mut first = out.is_empty();
        for gtid in self.snapshot() {
            if !first {
                out.push(',');
            }
            out.push_str(&gtid.to_string());
            first = false;
        }
    }

    /// Remove the listed domains from the binlog state.
    ///
    /// Refuses when `snapshot` (the cluster-wide GTID list, e.g. from the
    /// newest log-start record) still carries a sequence number in one of
    /// the listed domains above what this node has logged: dropping such a
    /// domain would lose the ability to serve those transactions.
    pub fn drop_domain(&self, ids: &[u32], snapshot: &[Gtid]) -> Result<()> {
        let mut domains = self.domains.lock();
        for &id in ids {
            let local_max = domains.get(&id).map_or(0, |d| d.seq_no_counter);
            if let Some(ahead) = snapshot
                .iter()
                .filter(|g| g.domain_id == id && g.seq_no > local_max)
                .max_by_key(|g| g.seq_no)
            {
                return Err(GtidError::DomainDropActive {
                    domain: id,
                    snapshot_gtid: *ahead,
                });
            }
        }
        for &id in ids {
            if domains.remove(&id).is_some() {
                debug!(domain = id, "dropped domain from binlog state");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_strict_sequence_rejections() {
        let state = BinlogState::new();
        state.update(&Gtid::new(1, 1, 5), true).unwrap();

        let err = state.update(&Gtid::new(1, 1, 5), true).unwrap_err();
        assert!(matches!(err, GtidError::OutOfOrderSeq { .. }));

        let err = state.update(&Gtid::new(1, 1, 7), true).unwrap_err();
        assert!(matches!(err, GtidError::NonMonotonicSeq { .. }));

        state.update(&Gtid::new(1, 1, 6), true).unwrap();
        assert_eq!(state.most_recent(1), Some(Gtid::new(1, 1, 6)));
    }

    #[test]
    fn test_non_strict_accepts_out_of_order() {
        let state = BinlogState::new();
        state.update(&Gtid::new(1, 1, 5), false).unwrap();
        state.update(&Gtid::new(1, 2, 3), false).unwrap();
        // Counter keeps the max, not the latest.
        assert_eq!(state.next_seq_for(1), 6);
        assert_eq!(state.most_recent(1), Some(Gtid::new(1, 2, 3)));
    }

    #[test]
    fn test_next_seq_for_fresh_domain() {
        let state = BinlogState::new();
        assert_eq!(state.next_seq_for(9), 1);
        // Querying does not commit the advance.
        assert_eq!(state.next_seq_for(9), 1);
    }

    #[test]
    fn test_update_with_next_gtid_commits() {
        let state = BinlogState::new();
        assert_eq!(state.update_with_next_gtid(2, 10), Gtid::new(2, 10, 1));
        assert_eq!(state.update_with_next_gtid(2, 11), Gtid::new(2, 11, 2));
        assert_eq!(state.next_seq_for(2), 3);
    }

    #[test]
    fn test_check_strict_sequence() {
        let state = BinlogState::new();
        state.update(&Gtid::new(0, 1, 10), false).unwrap();
        assert!(state.check_strict_sequence(0, 1, 10).is_err());
        assert!(state.check_strict_sequence(0, 1, 11).is_ok());
        assert!(state.check_strict_sequence(5, 1, 1).is_ok());
    }

    #[test]
    fn test_bump_seq_no() {
        let state = BinlogState::new();
        state.bump_seq_no_if_needed(3, 50);
        assert_eq!(state.next_seq_for(3), 51);
        state.bump_seq_no_if_needed(3, 20);
        assert_eq!(state.next_seq_for(3), 51);
    }

    #[test]
    fn test_snapshot_sorted_by_domain_server() {
        let state = BinlogState::new();
        state.update(&Gtid::new(1, 2, 4), false).unwrap();
        state.update(&Gtid::new(0, 9, 7), false).unwrap();
        state.update(&Gtid::new(1, 1, 3), false).unwrap();
        state.update(&Gtid::new(0, 1, 2), false).unwrap();

        assert_eq!(
            state.snapshot(),
            vec![
                Gtid::new(0, 1, 2),
                Gtid::new(0, 9, 7),
                Gtid::new(1, 1, 3),
                Gtid::new(1, 2, 4),
            ]
        );
    }

    #[test]
    fn test_update_replaces_server_slot() {
        let state = BinlogState::new();
        state.update(&Gtid::new(0, 1, 1), false).unwrap();
        state.update(&Gtid::new(0, 1, 8), false).unwrap();
        assert_eq!(state.find(0, 1), Some(Gtid::new(0, 1, 8)));
        assert_eq!(state.count(), 1);
    }

    #[test]
    fn test_binary_snapshot_round_trip() {
        let state = BinlogState::new();
        state.update(&Gtid::new(0, 1, 100), false).unwrap();
        state.update(&Gtid::new(1, 2, 50), false).unwrap();

        let mut buf = BytesMut::new();
        state.write_to(&mut buf);

        let restored = BinlogState::new();
        restored.read_from(&mut buf.freeze()).unwrap();
        assert_eq!(restored.snapshot(), state.snapshot());
    }

    #[test]
    fn test_append_pos_and_state() {
        let state = BinlogState::new();
        state.update(&Gtid::new(0, 1, 1), false).unwrap();
        state.update(&Gtid::new(0, 2, 5), false).unwrap();
        state.update(&Gtid::new(1, 1, 9), false).unwrap();

        let mut pos = String::new();
        state.append_pos(&mut pos);
        assert_eq!(pos, "0-2-5,1-1-9");

        let mut full = String::new();
        state.append_state(&mut full);
        assert_eq!(full, "0-1-1,0-2-5,1-1-9");
    }

    #[test]
    fn test_drop_domain_refuses_when_snapshot_ahead() {
        let state = BinlogState::new();
        state.update(&Gtid::new(4, 1, 10), false).unwrap();

        let snapshot = vec![Gtid::new(4, 2, 12)];
        let err = state.drop_domain(&[4], &snapshot).unwrap_err();
        assert_eq!(
            err,
            GtidError::DomainDropActive {
                domain: 4,
                snapshot_gtid: Gtid::new(4, 2, 12),
            }
        );
        assert!(!state.is_empty());
    }

    #[test]
    fn test_drop_domain_removes_when_caught_up() {
        let state = BinlogState::new();
        state.update(&Gtid::new(4, 1, 10), false).unwrap();
        state.update(&Gtid::new(5, 1, 3), false).unwrap();

        state
            .drop_domain(&[4], &[Gtid::new(4, 2, 10)])
            .unwrap();
        assert_eq!(state.most_recent(4), None);
        assert_eq!(state.most_recent(5), Some(Gtid::new(5, 1, 3)));

        // Dropping an unknown domain is a no-op.
        state.drop_domain(&[99], &[]).unwrap();
    }

    #[test]
    fn test_reset_clears_everything() {
        let state = BinlogState::new();
        state.update(&Gtid::new(1, 1, 1), false).unwrap();
        state.reset();
        assert!(state.is_empty());
        assert_eq!(state.next_seq_for(1), 1);
    }
}
