//! Slave connection start state
//!
//! When a replica connects to a primary it sends the GTID position it wants
//! the event stream to start from: at most one GTID per domain. This module
//! holds that request on the primary side while the dump thread scans
//! backwards for the right log file, and tracks per-domain flags about how
//! the position was obtained.

use crate::error::{GtidError, Result};
use crate::gtid::{gtid_list_to_string, parse_gtid_list_unique_domains, Gtid};
use crate::slave::SlaveState;
use std::collections::HashMap;

/// One requested per-domain start position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEntry {
    pub gtid: Gtid,
    /// Position came from the replica's own applied state rather than an
    /// explicit override.
    pub own_slave_pos: bool,
    /// Start at the beginning of a domain the replica has never seen.
    pub on_empty_domain: bool,
}

/// The GTID state a slave connection requests streaming from.
#[derive(Debug, Clone, Default)]
pub struct SlaveConnectionState {
    entries: HashMap<u32, ConnectionEntry>,
}

impl SlaveConnectionState {
    /// Create an empty request state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the state with positions parsed from `text`.
    ///
    /// The request defines one start position per replication stream, so a
    /// repeated domain is rejected with
    /// [`GtidError::DuplicateDomainInList`].
    pub fn load(&mut self, text: &str) -> Result<()> {
        let list = parse_gtid_list_unique_domains(text)?;
        self.entries.clear();
        for gtid in list {
            self.entries.insert(
                gtid.domain_id,
                ConnectionEntry {
                    gtid,
                    own_slave_pos: false,
                    on_empty_domain: false,
                },
            );
        }
        Ok(())
    }

    /// Replace the state with an already parsed list.
    pub fn load_list(&mut self, list: &[Gtid]) -> Result<()> {
        self.entries.clear();
        for gtid in list {
            if self.entries.contains_key(&gtid.domain_id) {
                self.entries.clear();
                return Err(GtidError::DuplicateDomainInList(gtid.domain_id));
            }
            self.entries.insert(
                gtid.domain_id,
                ConnectionEntry {
                    gtid: *gtid,
                    own_slave_pos: false,
                    on_empty_domain: false,
                },
            );
        }
        Ok(())
    }

    /// The requested start GTID for `domain`, if any.
    pub fn find(&self, domain: u32) -> Option<Gtid> {
        self.entries.get(&domain).map(|e| e.gtid)
    }

    /// The full entry for `domain`, flags included.
    pub fn entry(&self, domain: u32) -> Option<&ConnectionEntry> {
        self.entries.get(&domain)
    }

    /// Mutable entry access for flag updates.
    pub fn entry_mut(&mut self, domain: u32) -> Option<&mut ConnectionEntry> {
        self.entries.get_mut(&domain)
    }

    /// Set or replace the position for the GTID's domain. Existing flags
    /// are preserved on replacement.
    pub fn update(&mut self, gtid: Gtid) {
        self.entries
            .entry(gtid.domain_id)
            .and_modify(|e| e.gtid = gtid)
            .or_insert(ConnectionEntry {
                gtid,
                own_slave_pos: false,
                on_empty_domain: false,
            });
    }

    /// Remove the domain entry matching `gtid` exactly.
    pub fn remove(&mut self, gtid: &Gtid) {
        let entry = self.entries.get(&gtid.domain_id);
        assert!(
            entry.is_some_and(|e| e.gtid == *gtid),
            "removing a connection entry that is not present"
        );
        self.entries.remove(&gtid.domain_id);
    }

    /// Remove the domain entry if it matches `gtid` exactly; no-op
    /// otherwise.
    pub fn remove_if_present(&mut self, gtid: &Gtid) {
        if self.entries.get(&gtid.domain_id).map(|e| e.gtid) == Some(*gtid) {
            self.entries.remove(&gtid.domain_id);
        }
    }

    /// Number of requested domains.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// True when no position is requested.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The requested positions sorted by domain.
    pub fn gtid_list(&self) -> Vec<Gtid> {
        let mut list: Vec<Gtid> = self.entries.values().map(|e| e.gtid).collect();
        list.sort_by_key(|g| g.domain_id);
        list
    }

    /// Render the request as comma-separated text, sorted by domain.
    pub fn to_list_string(&self) -> String {
        gtid_list_to_string(&self.gtid_list())
    }

    /// Has the replica applied every requested position?
    pub fn is_pos_reached(&self, slave: &SlaveState) -> bool {
        self.entries
            .values()
            .all(|e| slave.highest_seq_no(e.gtid.domain_id) >= e.gtid.seq_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_rejects_duplicate_domains() {
        let mut state = SlaveConnectionState::new();
        let err = state.load("0-1-10,0-2-20").unwrap_err();
        assert_eq!(err, GtidError::DuplicateDomainInList(0));
        assert!(state.is_empty());
    }

    #[test]
    fn test_load_and_find() {
        let mut state = SlaveConnectionState::new();
        state.load("1-1-10, 0-2-5").unwrap();
        assert_eq!(state.count(), 2);
        assert_eq!(state.find(1), Some(Gtid::new(1, 1, 10)));
        assert_eq!(state.find(9), None);
        assert_eq!(state.to_list_string(), "0-2-5,1-1-10");
    }

    #[test]
    fn test_update_replaces_and_inserts() {
        let mut state = SlaveConnectionState::new();
        state.load("0-1-10").unwrap();
        state.entry_mut(0).unwrap().own_slave_pos = true;

        state.update(Gtid::new(0, 1, 20));
        let entry = state.entry(0).unwrap();
        assert_eq!(entry.gtid, Gtid::new(0, 1, 20));
        assert!(entry.own_slave_pos);

        state.update(Gtid::new(2, 1, 1));
        assert_eq!(state.count(), 2);
    }

    #[test]
    fn test_remove_if_present() {
        let mut state = SlaveConnectionState::new();
        state.load("0-1-10").unwrap();

        // Mismatched seq_no leaves the entry alone.
        state.remove_if_present(&Gtid::new(0, 1, 11));
        assert_eq!(state.count(), 1);

        state.remove_if_present(&Gtid::new(0, 1, 10));
        assert!(state.is_empty());
    }

    #[test]
    fn test_is_pos_reached() {
        let slave = SlaveState::new();
        let mut state = SlaveConnectionState::new();
        state.load("0-1-5,1-1-3").unwrap();
        assert!(!state.is_pos_reached(&slave));

        slave.load("0-1-5,1-1-2", false).unwrap();
        assert!(!state.is_pos_reached(&slave));

        slave.load("1-1-3", false).unwrap();
        assert!(state.is_pos_reached(&slave));

        // An empty request is trivially reached.
        assert!(SlaveConnectionState::new().is_pos_reached(&slave));
    }

    #[test]
    fn test_load_list_duplicate() {
        let mut state = SlaveConnectionState::new();
        let err = state
            .load_list(&[Gtid::new(1, 1, 1), Gtid::new(1, 2, 2)])
            .unwrap_err();
        assert_eq!(err, GtidError::DuplicateDomainInList(1));
        assert!(state.is_empty());
    }
}
