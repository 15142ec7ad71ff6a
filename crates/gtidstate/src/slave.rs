//! Replica-side applied-position ledger
//!
//! For every independent replication stream (domain) this remembers the
//! GTIDs applied on the replica: a pending list of `(sub_id, gtid, engine)`
//! entries awaiting background purge, the highest applied sequence number,
//! and the duplicate-ignoring ownership state used when multiple source
//! connections carry the same domain.
//!
//! The ledger also owns the registry of position tables. The apply path has
//! to pick an engine-matching table for every recorded row without taking
//! the state lock, so the table list is a singly linked chain published
//! through an atomic head pointer: writers store with release semantics,
//! readers load with acquire. Destructive reconfiguration requires a
//! quiescent apply path and the state lock; retired nodes are kept until
//! the ledger is dropped.

use crate::error::{GtidError, Result};
use crate::gtid::{parse_gtid_list, Gtid};
use crate::session::Session;
use crate::wait::WaitRegistry;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque storage engine handle. Engines are compared by identity, never
/// by content; the ledger uses the handle only to tag rows and match
/// position tables.
#[derive(Debug)]
pub struct Engine {
    name: String,
}

/// Shared engine handle; identity is the `Arc` allocation.
pub type EngineRef = Arc<Engine>;

impl Engine {
    /// Create an engine handle.
    pub fn new(name: impl Into<String>) -> EngineRef {
        Arc::new(Self { name: name.into() })
    }

    /// Engine name, for diagnostics only.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One source connection feeding this replica. Used as the ownership token
/// in duplicate-ignoring mode; compared by its process-unique id.
#[derive(Debug)]
pub struct SourceConnection {
    id: u64,
    name: String,
}

impl SourceConnection {
    /// Create a source-connection handle with a fresh id.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        })
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Connection name, for diagnostics only.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of a duplicate check: replay the transaction or skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtidDecision {
    /// This connection should apply the transaction.
    Apply,
    /// The transaction was (or will be) applied by another connection.
    Skip,
}

/// One applied GTID awaiting purge from the position tables.
#[derive(Debug, Clone)]
pub struct AppliedEntry {
    /// Process-monotonic counter allocated at record time; orders
    /// conflicting writes across domains in the position tables.
    pub sub_id: u64,
    pub gtid: Gtid,
    /// Engine whose position table holds the row; `None` when the position
    /// was seeded from text rather than an applied transaction.
    pub engine: Option<EngineRef>,
}

/// Lifecycle of a position table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GtidPosTableState {
    /// Table should be created on demand when its engine is first used.
    AutoCreate = 0,
    /// Creation has been queued.
    CreateRequested = 1,
    /// Creation is running.
    CreateInProgress = 2,
    /// Table exists and accepts rows.
    Available = 3,
}

impl GtidPosTableState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::AutoCreate,
            1 => Self::CreateRequested,
            2 => Self::CreateInProgress,
            3 => Self::Available,
            _ => unreachable!("invalid position table state {v}"),
        }
    }
}

/// Specification of one position table for [`SlaveState::reconfigure`].
#[derive(Debug, Clone)]
pub struct GtidPosTableSpec {
    pub name: String,
    pub engine: EngineRef,
    pub state: GtidPosTableState,
}

/// Node in the atomic position-table chain. `next` is written before the
/// node is published and never changes afterwards.
struct GtidPosTable {
    engine: EngineRef,
    name: String,
    state: AtomicU8,
    next: *const GtidPosTable,
}

/// State kept for one domain.
#[derive(Default)]
struct DomainState {
    /// Applied entries since the last purge, unordered.
    applied: Vec<AppliedEntry>,
    /// Highest seq_no ever successfully recorded in this domain.
    highest_seq_no: u64,
    /// The GTID that set `highest_seq_no`; survives purges.
    latest: Option<Gtid>,
    /// Source connection currently permitted to apply this domain
    /// (duplicate-ignoring mode), and its active applier count.
    owner: Option<u64>,
    owner_count: u32,
    /// Broadcast when the owner releases or the position advances.
    /// Paired with the slave-state lock.
    owner_cond: Arc<Condvar>,
}

#[derive(Default)]
struct SlaveInner {
    domains: HashMap<u32, DomainState>,
    /// Entries accumulated since the last purge of position-table rows.
    pending_gtid_count: usize,
}

/// The replica's applied-position ledger.
pub struct SlaveState {
    inner: Mutex<SlaveInner>,
    last_sub_id: AtomicU64,
    waiters: Arc<WaitRegistry>,
    /// Head of the position-table chain; acquire/release published.
    pos_tables: AtomicPtr<GtidPosTable>,
    /// The default position table, usually the auto-created one.
    default_pos_table: AtomicPtr<GtidPosTable>,
    /// Every node ever allocated; reclaimed when the ledger drops.
    retired: Mutex<Vec<*mut GtidPosTable>>,
}

// The raw pointers in `pos_tables`/`retired` reference heap nodes that are
// only mutated through atomics after publication and only freed on drop,
// when no other reference can exist.
unsafe impl Send for SlaveState {}
unsafe impl Sync for SlaveState {}

impl Default for SlaveState {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaveState {
    /// Create an empty ledger with its own wait registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlaveInner::default()),
            last_sub_id: AtomicU64::new(0),
            waiters: Arc::new(WaitRegistry::new()),
            pos_tables: AtomicPtr::new(ptr::null_mut()),
            default_pos_table: AtomicPtr::new(ptr::null_mut()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// The wait registry satisfied by this ledger's applies.
    pub fn waiters(&self) -> &Arc<WaitRegistry> {
        &self.waiters
    }

    /// Allocate the next globally monotonic sub_id.
    pub fn next_sub_id(&self) -> u64 {
        self.last_sub_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record an applied GTID.
    ///
    /// Appends the entry to the domain's pending list, advances the
    /// domain's highest applied position and forwards the new position to
    /// the wait registry (which may complete blocked position waits).
    pub fn record(&self, gtid: &Gtid, sub_id: u64, engine: Option<EngineRef>) {
        let mut inner = self.inner.lock();
        let dom = inner.domains.entry(gtid.domain_id).or_default();
        dom.applied.push(AppliedEntry {
            sub_id,
            gtid: *gtid,
            engine,
        });
        if gtid.seq_no >= dom.highest_seq_no {
            dom.highest_seq_no = gtid.seq_no;
            dom.latest = Some(*gtid);
        }
        if dom.owner.is_some() {
            // A foreign connection may be parked in check_duplicate waiting
            // for this position to move.
            dom.owner_cond.notify_all();
        }
        inner.pending_gtid_count += 1;
        drop(inner);
        self.waiters.gtid_applied(gtid.domain_id, gtid.seq_no);
    }

    /// Highest seq_no recorded in `domain`, 0 if the domain is unknown.
    pub fn highest_seq_no(&self, domain: u32) -> u64 {
        self.inner
            .lock()
            .domains
            .get(&domain)
            .map_or(0, |d| d.highest_seq_no)
    }

    /// The GTID holding the domain's applied position, if any.
    pub fn domain_to_gtid(&self, domain: u32) -> Option<Gtid> {
        self.inner.lock().domains.get(&domain).and_then(|d| d.latest)
    }

    /// Number of applied entries not yet purged.
    pub fn pending_gtid_count(&self) -> usize {
        self.inner.lock().pending_gtid_count
    }

    /// Number of domains tracked.
    pub fn count(&self) -> usize {
        self.inner.lock().domains.len()
    }

    /// True when no position has ever been recorded or loaded.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().domains.is_empty()
    }

    /// Atomically detach every pending entry for background deletion.
    ///
    /// Subsequent records start fresh lists; the caller owns the returned
    /// entries and normally deletes the matching position-table rows.
    pub fn grab_pending_delete_list(&self) -> Vec<AppliedEntry> {
        let mut inner = self.inner.lock();
        let mut list = Vec::with_capacity(inner.pending_gtid_count);
        for dom in inner.domains.values_mut() {
            list.append(&mut dom.applied);
        }
        inner.pending_gtid_count = 0;
        debug!(entries = list.len(), "grabbed pending GTID delete list");
        list
    }

    /// Re-attach entries whose background deletion failed so a later purge
    /// retries them.
    pub fn put_back(&self, entries: Vec<AppliedEntry>) {
        let mut inner = self.inner.lock();
        inner.pending_gtid_count += entries.len();
        for entry in entries {
            inner
                .domains
                .entry(entry.gtid.domain_id)
                .or_default()
                .applied
                .push(entry);
        }
    }

    /// Clear all per-domain positions while keeping the domain shells and
    /// table registry, e.g. for `RESET SLAVE`.
    pub fn truncate(&self) {
        let mut inner = self.inner.lock();
        for dom in inner.domains.values_mut() {
            dom.applied.clear();
            dom.highest_seq_no = 0;
            dom.latest = None;
        }
        inner.pending_gtid_count = 0;
        info!("truncated replica GTID state");
    }

    /// Seed the ledger from a textual position list.
    ///
    /// With `reset`, existing positions are discarded first. Loaded entries
    /// carry no engine; they only establish positions.
    pub fn load(&self, text: &str, reset: bool) -> Result<()> {
        let list = parse_gtid_list(text)?;
        if reset {
            self.truncate();
        }
        for gtid in &list {
            self.record(gtid, self.next_sub_id(), None);
        }
        debug!(entries = list.len(), reset, "loaded replica GTID state");
        Ok(())
    }

    /// Merge the per-domain ledger with `extra`, deduplicating by
    /// `(domain, server)` preferring the highest seq_no. Unordered.
    fn merged(&self, extra: &[Gtid]) -> HashMap<(u32, u32), Gtid> {
        let mut best: HashMap<(u32, u32), Gtid> = HashMap::new();
        {
            let inner = self.inner.lock();
            for dom in inner.domains.values() {
                if let Some(gtid) = dom.latest {
                    best.insert((gtid.domain_id, gtid.server_id), gtid);
                }
            }
        }
        for gtid in extra {
            best.entry((gtid.domain_id, gtid.server_id))
                .and_modify(|cur| {
                    if gtid.seq_no > cur.seq_no {
                        *cur = *gtid;
                    }
                })
                .or_insert(*gtid);
        }
        best
    }

    /// The merged position list: the per-domain ledger plus `extra`
    /// entries, deduplicated by `(domain, server)` preferring the highest
    /// seq_no, sorted by `(domain, server)`.
    pub fn gtid_list(&self, extra: &[Gtid]) -> Vec<Gtid> {
        let mut list: Vec<Gtid> = self.merged(extra).into_values().collect();
        list.sort_by_key(|g| (g.domain_id, g.server_id));
        list
    }

    /// Visit the merged position list; `sort` selects `(domain, server)`
    /// ordering over arbitrary merge order.
    pub fn iterate<F: FnMut(&Gtid)>(&self, mut f: F, extra: &[Gtid], sort: bool) {
        let mut list: Vec<Gtid> = self.merged(extra).into_values().collect();
        if sort {
            list.sort_by_key(|g| (g.domain_id, g.server_id));
        }
        for gtid in &list {
            f(gtid);
        }
    }

    /// Render the merged position list as comma-separated text.
    pub fn position_string(&self, extra: &[Gtid]) -> String {
        crate::gtid::gtid_list_to_string(&self.gtid_list(extra))
    }

    /// Wake a session blocked in [`check_duplicate`](Self::check_duplicate).
    ///
    /// Sets the kill flag under the state lock so the wakeup cannot race
    /// the session parking.
    pub fn cancel(&self, session: &Session) {
        let _inner = self.inner.lock();
        session.kill();
    }

    /// Duplicate-ignoring mode: decide whether `source` should apply the
    /// transaction `gtid` or skip it because another connection carries the
    /// domain.
    ///
    /// Transactions at or below the applied position are skipped outright.
    /// Above it, the first connection to ask becomes the domain owner;
    /// foreign connections block until the owner either applies past `gtid`
    /// (skip) or releases the domain (take ownership and apply).
    /// Cancellable by session kill.
    pub fn check_duplicate(
        &self,
        gtid: &Gtid,
        source: &Arc<SourceConnection>,
        session: &Arc<Session>,
    ) -> Result<GtidDecision> {
        let mut inner = self.inner.lock();
        loop {
            let dom = inner.domains.entry(gtid.domain_id).or_default();
            if dom.owner == Some(source.id()) {
                dom.owner_count += 1;
                return Ok(GtidDecision::Apply);
            }
            if gtid.seq_no <= dom.highest_seq_no {
                return Ok(GtidDecision::Skip);
            }
            match dom.owner {
                None => {
                    dom.owner = Some(source.id());
                    dom.owner_count = 1;
                    debug!(
                        domain = gtid.domain_id,
                        source = source.name(),
                        "took domain ownership"
                    );
                    return Ok(GtidDecision::Apply);
                }
                Some(_) => {
                    if session.is_killed() {
                        return Err(GtidError::WaitCancelled);
                    }
                    let cond = dom.owner_cond.clone();
                    session.enter_cond(cond.clone());
                    cond.wait(&mut inner);
                    session.exit_cond();
                }
            }
        }
    }

    /// Drop one applier reference of `source` on `domain`; at zero the
    /// ownership clears and blocked foreign connections re-evaluate.
    pub fn release_domain_owner(&self, domain: u32, source: &Arc<SourceConnection>) {
        let mut inner = self.inner.lock();
        let Some(dom) = inner.domains.get_mut(&domain) else {
            return;
        };
        if dom.owner != Some(source.id()) {
            return;
        }
        dom.owner_count -= 1;
        if dom.owner_count == 0 {
            dom.owner = None;
            debug!(domain, source = source.name(), "released domain ownership");
            dom.owner_cond.notify_all();
        }
    }

    // --- position table registry -----------------------------------------

    /// Push a position table onto the chain head.
    pub fn add_gtid_pos_table(
        &self,
        name: impl Into<String>,
        engine: EngineRef,
        state: GtidPosTableState,
    ) {
        let _inner = self.inner.lock();
        let node = Box::into_raw(Box::new(GtidPosTable {
            engine,
            name: name.into(),
            state: AtomicU8::new(state as u8),
            next: self.pos_tables.load(Ordering::Acquire),
        }));
        self.retired.lock().push(node);
        // Publish after `next` is in place.
        self.pos_tables.store(node, Ordering::Release);
    }

    /// Replace the whole table list.
    ///
    /// Requires a quiescent apply path: no concurrent `record` or
    /// `select_gtid_pos_table` callers racing the swap may rely on the old
    /// entries afterwards. Retired nodes stay allocated until drop.
    pub fn reconfigure(&self, specs: Vec<GtidPosTableSpec>, default_name: Option<&str>) {
        let _inner = self.inner.lock();
        let mut head: *mut GtidPosTable = ptr::null_mut();
        let mut default: *mut GtidPosTable = ptr::null_mut();
        let mut retired = self.retired.lock();
        // Build back to front so the chain keeps the given order.
        for spec in specs.into_iter().rev() {
            let is_default = default_name == Some(spec.name.as_str());
            let node = Box::into_raw(Box::new(GtidPosTable {
                engine: spec.engine,
                name: spec.name,
                state: AtomicU8::new(spec.state as u8),
                next: head,
            }));
            retired.push(node);
            head = node;
            if is_default {
                default = node;
            }
        }
        self.default_pos_table.store(default, Ordering::Release);
        self.pos_tables.store(head, Ordering::Release);
        info!("reconfigured GTID position tables");
    }

    /// Pick the position table for `engine` without taking the state lock.
    ///
    /// The first available chain entry with the same engine identity wins;
    /// otherwise the default table is used when available.
    pub fn select_gtid_pos_table(&self, engine: &EngineRef) -> Result<String> {
        let mut p = self.pos_tables.load(Ordering::Acquire);
        while !p.is_null() {
            let node = unsafe { &*p };
            if Arc::ptr_eq(&node.engine, engine)
                && node.state.load(Ordering::Acquire) == GtidPosTableState::Available as u8
            {
                return Ok(node.name.clone());
            }
            p = node.next as *mut _;
        }
        let d = self.default_pos_table.load(Ordering::Acquire);
        if !d.is_null() {
            let node = unsafe { &*d };
            if node.state.load(Ordering::Acquire) == GtidPosTableState::Available as u8 {
                return Ok(node.name.clone());
            }
        }
        Err(GtidError::NoPositionTable)
    }

    /// Update the lifecycle state of the named table, e.g. when its
    /// creation completes.
    pub fn set_gtid_pos_table_state(&self, name: &str, state: GtidPosTableState) -> bool {
        let mut p = self.pos_tables.load(Ordering::Acquire);
        while !p.is_null() {
            let node = unsafe { &*p };
            if node.name == name {
                node.state.store(state as u8, Ordering::Release);
                return true;
            }
            p = node.next as *mut _;
        }
        false
    }

    /// Names and states of the chained tables, head first.
    pub fn gtid_pos_tables(&self) -> Vec<(String, GtidPosTableState)> {
        let mut out = Vec::new();
        let mut p = self.pos_tables.load(Ordering::Acquire);
        while !p.is_null() {
            let node = unsafe { &*p };
            out.push((
                node.name.clone(),
                GtidPosTableState::from_u8(node.state.load(Ordering::Acquire)),
            ));
            p = node.next as *mut _;
        }
        out
    }
}

impl Drop for SlaveState {
    fn drop(&mut self) {
        for &node in self.retired.lock().iter() {
            // Exclusive access at drop; every node was allocated by us.
            drop(unsafe { Box::from_raw(node) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_highest_seq_no_is_max_of_records() {
        let slave = SlaveState::new();
        for seq in [3u64, 7, 5, 6] {
            slave.record(&Gtid::new(1, 1, seq), slave.next_sub_id(), None);
        }
        assert_eq!(slave.highest_seq_no(1), 7);
        assert_eq!(slave.domain_to_gtid(1), Some(Gtid::new(1, 1, 7)));
        assert_eq!(slave.highest_seq_no(2), 0);
    }

    #[test]
    fn test_sub_ids_are_monotonic() {
        let slave = SlaveState::new();
        let a = slave.next_sub_id();
        let b = slave.next_sub_id();
        assert!(b > a);
    }

    #[test]
    fn test_grab_and_put_back() {
        let slave = SlaveState::new();
        let engine = Engine::new("innodb");
        slave.record(&Gtid::new(0, 1, 1), slave.next_sub_id(), Some(engine.clone()));
        slave.record(&Gtid::new(1, 1, 2), slave.next_sub_id(), Some(engine));
        assert_eq!(slave.pending_gtid_count(), 2);

        let grabbed = slave.grab_pending_delete_list();
        assert_eq!(grabbed.len(), 2);
        assert_eq!(slave.pending_gtid_count(), 0);
        // Positions survive the grab.
        assert_eq!(slave.highest_seq_no(0), 1);
        assert_eq!(slave.domain_to_gtid(1), Some(Gtid::new(1, 1, 2)));

        slave.put_back(grabbed);
        assert_eq!(slave.pending_gtid_count(), 2);
    }

    #[test]
    fn test_load_and_truncate() {
        let slave = SlaveState::new();
        slave.load("0-1-100, 1-2-50", false).unwrap();
        assert_eq!(slave.count(), 2);
        assert_eq!(slave.highest_seq_no(0), 100);

        slave.load("0-1-200", true).unwrap();
        assert_eq!(slave.highest_seq_no(0), 200);
        assert_eq!(slave.highest_seq_no(1), 0);

        slave.truncate();
        assert_eq!(slave.highest_seq_no(0), 0);
        assert_eq!(slave.pending_gtid_count(), 0);
    }

    #[test]
    fn test_position_string_merges_and_dedups() {
        let slave = SlaveState::new();
        slave.load("1-1-10,0-2-5", false).unwrap();

        // Extra entries: one losing duplicate, one winning duplicate, one new.
        let extra = [
            Gtid::new(1, 1, 3),
            Gtid::new(0, 2, 9),
            Gtid::new(2, 1, 1),
        ];
        assert_eq!(slave.position_string(&extra), "0-2-9,1-1-10,2-1-1");
        assert_eq!(slave.position_string(&[]), "0-2-5,1-1-10");
    }

    #[test]
    fn test_iterate_visits_merged_list() {
        let slave = SlaveState::new();
        slave.load("3-1-4", false).unwrap();
        let mut seen = Vec::new();
        slave.iterate(|g| seen.push(*g), &[Gtid::new(0, 1, 1)], true);
        assert_eq!(seen, vec![Gtid::new(0, 1, 1), Gtid::new(3, 1, 4)]);
    }

    #[test]
    fn test_select_pos_table_by_engine() {
        let slave = SlaveState::new();
        let innodb = Engine::new("innodb");
        let rocksdb = Engine::new("rocksdb");

        slave.add_gtid_pos_table("gtid_pos", innodb.clone(), GtidPosTableState::Available);
        slave.add_gtid_pos_table(
            "gtid_pos_rocksdb",
            rocksdb.clone(),
            GtidPosTableState::Available,
        );

        assert_eq!(
            slave.select_gtid_pos_table(&rocksdb).unwrap(),
            "gtid_pos_rocksdb"
        );
        assert_eq!(slave.select_gtid_pos_table(&innodb).unwrap(), "gtid_pos");
    }

    #[test]
    fn test_select_pos_table_falls_back_to_default() {
        let slave = SlaveState::new();
        let innodb = Engine::new("innodb");
        let aria = Engine::new("aria");

        slave.reconfigure(
            vec![GtidPosTableSpec {
                name: "gtid_pos".into(),
                engine: innodb.clone(),
                state: GtidPosTableState::Available,
            }],
            Some("gtid_pos"),
        );

        // No aria-specific table: the default serves.
        assert_eq!(slave.select_gtid_pos_table(&aria).unwrap(), "gtid_pos");
    }

    #[test]
    fn test_select_pos_table_unavailable() {
        let slave = SlaveState::new();
        let innodb = Engine::new("innodb");
        assert_eq!(
            slave.select_gtid_pos_table(&innodb),
            Err(GtidError::NoPositionTable)
        );

        slave.add_gtid_pos_table("gtid_pos", innodb.clone(), GtidPosTableState::AutoCreate);
        assert_eq!(
            slave.select_gtid_pos_table(&innodb),
            Err(GtidError::NoPositionTable)
        );

        assert!(slave.set_gtid_pos_table_state("gtid_pos", GtidPosTableState::Available));
        assert_eq!(slave.select_gtid_pos_table(&innodb).unwrap(), "gtid_pos");
    }

    #[test]
    fn test_reconfigure_replaces_chain() {
        let slave = SlaveState::new();
        let innodb = Engine::new("innodb");
        slave.add_gtid_pos_table("old", innodb.clone(), GtidPosTableState::Available);

        slave.reconfigure(
            vec![
                GtidPosTableSpec {
                    name: "new_a".into(),
                    engine: innodb.clone(),
                    state: GtidPosTableState::Available,
                },
                GtidPosTableSpec {
                    name: "new_b".into(),
                    engine: innodb.clone(),
                    state: GtidPosTableState::AutoCreate,
                },
            ],
            None,
        );

        assert_eq!(
            slave.gtid_pos_tables(),
            vec![
                ("new_a".to_string(), GtidPosTableState::Available),
                ("new_b".to_string(), GtidPosTableState::AutoCreate),
            ]
        );
    }

    #[test]
    fn test_check_duplicate_same_source_reenters() {
        let slave = SlaveState::new();
        let source = SourceConnection::new("m1");
        let session = Session::new();

        assert_eq!(
            slave
                .check_duplicate(&Gtid::new(1, 1, 5), &source, &session)
                .unwrap(),
            GtidDecision::Apply
        );
        assert_eq!(
            slave
                .check_duplicate(&Gtid::new(1, 1, 6), &source, &session)
                .unwrap(),
            GtidDecision::Apply
        );

        slave.release_domain_owner(1, &source);
        slave.release_domain_owner(1, &source);
    }

    #[test]
    fn test_check_duplicate_foreign_skips_applied() {
        let slave = SlaveState::new();
        let owner = SourceConnection::new("m1");
        let other = SourceConnection::new("m2");
        let session = Session::new();

        slave
            .check_duplicate(&Gtid::new(1, 1, 5), &owner, &session)
            .unwrap();
        slave.record(&Gtid::new(1, 1, 5), slave.next_sub_id(), None);

        // Already applied by the owner: skip without blocking.
        assert_eq!(
            slave
                .check_duplicate(&Gtid::new(1, 2, 5), &other, &session)
                .unwrap(),
            GtidDecision::Skip
        );
    }

    #[test]
    fn test_check_duplicate_foreign_waits_for_owner() {
        let slave = Arc::new(SlaveState::new());
        let owner = SourceConnection::new("m1");
        let session = Session::new();
        slave
            .check_duplicate(&Gtid::new(1, 1, 5), &owner, &session)
            .unwrap();

        let s = slave.clone();
        let blocked = thread::spawn(move || {
            let other = SourceConnection::new("m2");
            let session = Session::new();
            s.check_duplicate(&Gtid::new(1, 2, 5), &other, &session)
                .unwrap()
        });

        // Give the foreign connection time to park, then apply past it.
        thread::sleep(Duration::from_millis(50));
        slave.record(&Gtid::new(1, 1, 5), slave.next_sub_id(), None);
        assert_eq!(blocked.join().unwrap(), GtidDecision::Skip);
    }

    #[test]
    fn test_check_duplicate_takeover_after_release() {
        let slave = Arc::new(SlaveState::new());
        let owner = SourceConnection::new("m1");
        let session = Session::new();
        slave
            .check_duplicate(&Gtid::new(1, 1, 5), &owner, &session)
            .unwrap();

        let s = slave.clone();
        let blocked = thread::spawn(move || {
            let other = SourceConnection::new("m2");
            let session = Session::new();
            s.check_duplicate(&Gtid::new(1, 2, 5), &other, &session)
                .unwrap()
        });

        thread::sleep(Duration::from_millis(50));
        // Owner releases without applying seq 5: the foreign connection
        // takes over and applies.
        slave.release_domain_owner(1, &owner);
        assert_eq!(blocked.join().unwrap(), GtidDecision::Apply);
    }

    #[test]
    fn test_check_duplicate_cancelled_by_kill() {
        let slave = Arc::new(SlaveState::new());
        let owner = SourceConnection::new("m1");
        let session = Session::new();
        slave
            .check_duplicate(&Gtid::new(1, 1, 5), &owner, &session)
            .unwrap();

        let victim = Session::new();
        let s = slave.clone();
        let v = victim.clone();
        let blocked = thread::spawn(move || {
            let other = SourceConnection::new("m2");
            s.check_duplicate(&Gtid::new(1, 2, 5), &other, &v)
        });

        thread::sleep(Duration::from_millis(50));
        slave.cancel(&victim);
        assert_eq!(blocked.join().unwrap(), Err(GtidError::WaitCancelled));
    }

    #[test]
    fn test_release_is_idempotent_for_non_owner() {
        let slave = SlaveState::new();
        let owner = SourceConnection::new("m1");
        let other = SourceConnection::new("m2");
        let session = Session::new();

        slave
            .check_duplicate(&Gtid::new(1, 1, 5), &owner, &session)
            .unwrap();
        // Releasing a domain one does not own is a no-op.
        slave.release_domain_owner(1, &other);
        slave.release_domain_owner(99, &owner);
    }
}
