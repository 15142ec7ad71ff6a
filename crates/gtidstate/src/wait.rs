//! Position waiters: block until a domain reaches a GTID
//!
//! Coordinates sessions blocked in "wait until GTID >= X in domain D" with
//! the apply path. The design goal is that under N waiters in one domain the
//! apply path does O(1) work per event and never holds the registry lock
//! across session wakeups. Exactly one waiter per domain, the *small
//! waiter*, sleeps on the domain condvar and takes on the work of scanning
//! the priority queue and waking its peers whenever the applied position
//! crosses the smallest waited-for sequence number.
//!
//! The registry owns all waiter storage: a slab arena per domain plus an
//! intrusive binary min-heap of slot indices keyed by `wait_seq_no`. A
//! session never holds pointers into the queue; it blocks on a condvar and
//! observes its waiter's `done` flag under the registry lock.
//!
//! The apply-path hook ([`WaitRegistry::gtid_applied`]) bumps the domain's
//! applied-mirror atomic and compares it against the minimum waited-for
//! sequence number without any lock; only when the threshold is crossed does
//! it take the queue lock to signal the domain condvar. Every condvar in
//! this module is signalled while holding the queue lock, so a session
//! checking its state under that lock can never park past its own wakeup.

use crate::error::Result;
use crate::gtid::{parse_gtid_list, Gtid};
use crate::session::Session;
use crate::slave::SlaveState;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Outcome of a position wait. Not an error in any direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The domain reached the waited-for sequence number.
    Reached,
    /// The deadline expired first.
    Timeout,
    /// The session was killed while waiting.
    Cancelled,
}

/// Hot-path view of one domain, shared between the apply path and waiters.
struct DomainWait {
    /// Mirror of the domain's highest applied seq_no. Only ever grows.
    highest_applied: AtomicU64,
    /// Smallest seq_no any queued waiter is waiting for; `u64::MAX` if none.
    min_wait_seq_no: AtomicU64,
    /// The small waiter parks here. Paired with the registry queue lock.
    cond: Arc<Condvar>,
}

/// One registered waiter. Lives in the domain arena for the duration of a
/// single blocking call; the owning session frees the slot on return.
struct Waiter {
    session: Arc<Session>,
    wait_seq_no: u64,
    /// Index into the domain heap while queued. Stale once `done`.
    heap_pos: usize,
    /// This waiter holds the small-wait responsibility.
    small: bool,
    /// Set when the wait completed; a waiter is queued iff `done` is false.
    done: bool,
}

/// Per-domain waiter arena and priority queue.
#[derive(Default)]
struct DomainQueue {
    slots: Vec<Option<Waiter>>,
    free: Vec<usize>,
    /// Binary min-heap of slot indices, keyed by `wait_seq_no`.
    heap: Vec<usize>,
    /// Slot currently holding the small-wait responsibility.
    small_slot: Option<usize>,
}

impl DomainQueue {
    fn waiter(&self, slot: usize) -> &Waiter {
        self.slots[slot].as_ref().expect("waiter slot is live")
    }

    fn waiter_mut(&mut self, slot: usize) -> &mut Waiter {
        self.slots[slot].as_mut().expect("waiter slot is live")
    }

    fn alloc(&mut self, waiter: Waiter) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(waiter);
                slot
            }
            None => {
                self.slots.push(Some(waiter));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = None;
        self.free.push(slot);
    }

    fn seq_at(&self, heap_pos: usize) -> u64 {
        self.waiter(self.heap[heap_pos]).wait_seq_no
    }

    fn set_heap_pos(&mut self, heap_pos: usize) {
        let slot = self.heap[heap_pos];
        self.waiter_mut(slot).heap_pos = heap_pos;
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.seq_at(pos) >= self.seq_at(parent) {
                break;
            }
            self.heap.swap(pos, parent);
            self.set_heap_pos(pos);
            self.set_heap_pos(parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            if left >= self.heap.len() {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < self.heap.len() && self.seq_at(right) < self.seq_at(left) {
                child = right;
            }
            if self.seq_at(pos) <= self.seq_at(child) {
                break;
            }
            self.heap.swap(pos, child);
            self.set_heap_pos(pos);
            self.set_heap_pos(child);
            pos = child;
        }
    }

    fn heap_insert(&mut self, slot: usize) {
        self.heap.push(slot);
        let pos = self.heap.len() - 1;
        self.set_heap_pos(pos);
        self.sift_up(pos);
    }

    fn heap_remove(&mut self, slot: usize) {
        let pos = self.waiter(slot).heap_pos;
        let last = self.heap.len() - 1;
        self.heap.swap(pos, last);
        self.heap.pop();
        if pos < self.heap.len() {
            self.set_heap_pos(pos);
            self.sift_down(pos);
            self.sift_up(pos);
        }
    }

    fn head(&self) -> Option<usize> {
        self.heap.first().copied()
    }
}

/// Per-domain wait statistics, in the spirit of the other `*Stats` snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainWaitStats {
    pub domain_id: u32,
    /// Number of sessions currently queued.
    pub waiters: usize,
    /// Smallest waited-for seq_no, if any waiter is queued.
    pub min_wait_seq_no: Option<u64>,
    /// The seq_no the current small waiter is waiting for, if any.
    pub small_wait_seq_no: Option<u64>,
    /// The domain's applied-position mirror.
    pub highest_applied: u64,
}

/// Registry of sessions blocked on replication positions.
pub struct WaitRegistry {
    /// All per-domain queues. One lock; never held across a session wakeup.
    queues: Mutex<HashMap<u32, DomainQueue>>,
    /// Hot-path view per domain, readable without the queue lock.
    shared: RwLock<HashMap<u32, Arc<DomainWait>>>,
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            shared: RwLock::new(HashMap::new()),
        }
    }

    fn domain_shared(&self, domain: u32) -> Arc<DomainWait> {
        if let Some(dw) = self.shared.read().get(&domain) {
            return dw.clone();
        }
        self.shared
            .write()
            .entry(domain)
            .or_insert_with(|| {
                Arc::new(DomainWait {
                    highest_applied: AtomicU64::new(0),
                    min_wait_seq_no: AtomicU64::new(u64::MAX),
                    cond: Arc::new(Condvar::new()),
                })
            })
            .clone()
    }

    /// Apply-path hook: a transaction with `seq_no` was recorded in `domain`.
    ///
    /// Called by [`SlaveState::record`] after its ledger update; the mirror
    /// is monotonic, so hook ordering across concurrent records does not
    /// matter. The fast path is two atomics; the queue lock is taken only
    /// when the applied position crosses the wait threshold, and only to
    /// signal, never across a wakeup. The store of the applied mirror must
    /// precede the load of the threshold, matching the reverse order in
    /// registration, so no wakeup is lost.
    pub fn gtid_applied(&self, domain: u32, seq_no: u64) {
        let shared = self.shared.read();
        let Some(dw) = shared.get(&domain) else {
            return;
        };
        dw.highest_applied.fetch_max(seq_no, Ordering::SeqCst);
        if seq_no >= dw.min_wait_seq_no.load(Ordering::SeqCst) {
            let _queues = self.queues.lock();
            dw.cond.notify_all();
        }
    }

    /// Wake a session blocked in [`wait_for_gtid`](Self::wait_for_gtid).
    ///
    /// Sets the session's kill flag under the queue lock so the wakeup
    /// cannot race the session parking; the waiter removes itself and
    /// returns [`WaitStatus::Cancelled`].
    pub fn cancel(&self, session: &Session) {
        let _queues = self.queues.lock();
        session.kill();
    }

    /// Number of sessions currently queued in `domain`.
    pub fn waiter_count(&self, domain: u32) -> usize {
        self.queues
            .lock()
            .get(&domain)
            .map_or(0, |q| q.heap.len())
    }

    /// Snapshot of one domain's wait state, if the domain has ever been
    /// waited on or applied to.
    pub fn domain_stats(&self, domain: u32) -> Option<DomainWaitStats> {
        let dw = self.shared.read().get(&domain)?.clone();
        let queues = self.queues.lock();
        let queue = queues.get(&domain);
        let min_wait = dw.min_wait_seq_no.load(Ordering::SeqCst);
        Some(DomainWaitStats {
            domain_id: domain,
            waiters: queue.map_or(0, |q| q.heap.len()),
            min_wait_seq_no: (min_wait != u64::MAX).then_some(min_wait),
            small_wait_seq_no: queue.and_then(|q| {
                q.small_slot.map(|slot| q.waiter(slot).wait_seq_no)
            }),
            highest_applied: dw.highest_applied.load(Ordering::SeqCst),
        })
    }

    /// Block until every domain listed in `gtid_list_text` has applied the
    /// listed sequence number.
    ///
    /// Returns `Err` only for parse failures; wait outcomes are the
    /// [`WaitStatus`] values. An empty list is trivially reached.
    pub fn wait_for_pos(
        &self,
        slave: &SlaveState,
        session: &Arc<Session>,
        gtid_list_text: &str,
        timeout: Option<Duration>,
    ) -> Result<WaitStatus> {
        let list = parse_gtid_list(gtid_list_text)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        for gtid in &list {
            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        Some(Duration::ZERO)
                    } else {
                        Some(d - now)
                    }
                }
                None => None,
            };
            match self.wait_for_gtid(slave, session, gtid, remaining) {
                WaitStatus::Reached => {}
                other => return Ok(other),
            }
        }
        Ok(WaitStatus::Reached)
    }

    /// Block until `wait_gtid.domain_id` has applied `wait_gtid.seq_no`.
    pub fn wait_for_gtid(
        &self,
        slave: &SlaveState,
        session: &Arc<Session>,
        wait_gtid: &Gtid,
        timeout: Option<Duration>,
    ) -> WaitStatus {
        let domain = wait_gtid.domain_id;
        let dw = self.domain_shared(domain);

        // Seed the mirror from the ledger. The shared entry exists before
        // this read, so any concurrent apply lands in the mirror too.
        dw.highest_applied
            .fetch_max(slave.highest_seq_no(domain), Ordering::SeqCst);
        if dw.highest_applied.load(Ordering::SeqCst) >= wait_gtid.seq_no {
            return WaitStatus::Reached;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queues = self.queues.lock();
        let slot = {
            let queue = queues.entry(domain).or_default();
            let slot = queue.alloc(Waiter {
                session: session.clone(),
                wait_seq_no: wait_gtid.seq_no,
                heap_pos: 0,
                small: false,
                done: false,
            });
            queue.heap_insert(slot);
            Self::repair(queue, &dw);
            slot
        };
        trace!(domain, seq_no = wait_gtid.seq_no, "registered position waiter");

        // Registration stored the new threshold; re-check the mirror so an
        // apply that raced the registration is not missed.
        if dw.highest_applied.load(Ordering::SeqCst) >= wait_gtid.seq_no {
            let queue = queues.get_mut(&domain).expect("domain queue exists");
            Self::process_queue(queue, &dw);
        }

        loop {
            let queue = queues.get_mut(&domain).expect("domain queue exists");
            if queue.waiter(slot).done {
                queue.release(slot);
                return WaitStatus::Reached;
            }
            if session.is_killed() {
                Self::withdraw(queue, &dw, slot);
                debug!(domain, seq_no = wait_gtid.seq_no, "position wait cancelled");
                return WaitStatus::Cancelled;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    Self::withdraw(queue, &dw, slot);
                    debug!(domain, seq_no = wait_gtid.seq_no, "position wait timed out");
                    return WaitStatus::Timeout;
                }
            }

            let small = queue.waiter(slot).small;
            let cond = if small {
                dw.cond.clone()
            } else {
                session.wakeup_cond().clone()
            };
            session.enter_cond(cond.clone());
            match deadline {
                Some(d) => {
                    let _ = cond.wait_until(&mut queues, d);
                }
                None => cond.wait(&mut queues),
            }
            session.exit_cond();

            if small {
                let queue = queues.get_mut(&domain).expect("domain queue exists");
                // Small-waiter duty: scan the queue head against the applied
                // mirror and complete every satisfied peer.
                if !queue.waiter(slot).done {
                    Self::process_queue(queue, &dw);
                }
            }
        }
    }

    /// Pop every satisfied waiter off the queue head, mark it done and
    /// signal its session. Runs under the queue lock; the signalled sessions
    /// only make progress once the lock is released.
    fn process_queue(queue: &mut DomainQueue, dw: &DomainWait) {
        let applied = dw.highest_applied.load(Ordering::SeqCst);
        while let Some(head) = queue.head() {
            if queue.waiter(head).wait_seq_no > applied {
                break;
            }
            queue.heap_remove(head);
            if queue.small_slot == Some(head) {
                queue.small_slot = None;
            }
            let waiter = queue.waiter_mut(head);
            assert!(!waiter.done, "completed waiter found in wait queue");
            waiter.done = true;
            waiter.small = false;
            waiter.session.wakeup_cond().notify_all();
        }
        Self::repair(queue, dw);
    }

    /// Remove a waiter that timed out or was cancelled, then restore the
    /// queue invariants.
    fn withdraw(queue: &mut DomainQueue, dw: &DomainWait, slot: usize) {
        queue.heap_remove(slot);
        if queue.small_slot == Some(slot) {
            queue.small_slot = None;
        }
        queue.release(slot);
        Self::repair(queue, dw);
    }

    /// Restore the two queue invariants after any change: the wait
    /// threshold equals the head's seq_no, and the head is the one small
    /// waiter. A newly promoted small waiter is woken so it re-parks on the
    /// domain condvar; a demoted one is woken so it re-parks on its session
    /// condvar.
    fn repair(queue: &mut DomainQueue, dw: &DomainWait) {
        match queue.head() {
            Some(head) => {
                dw.min_wait_seq_no
                    .store(queue.waiter(head).wait_seq_no, Ordering::SeqCst);
                if queue.small_slot != Some(head) {
                    if let Some(old) = queue.small_slot.take() {
                        queue.waiter_mut(old).small = false;
                    }
                    queue.small_slot = Some(head);
                    let waiter = queue.waiter_mut(head);
                    waiter.small = true;
                    waiter.session.wakeup_cond().notify_all();
                    dw.cond.notify_all();
                }
            }
            None => {
                dw.min_wait_seq_no.store(u64::MAX, Ordering::SeqCst);
                if let Some(old) = queue.small_slot.take() {
                    queue.waiter_mut(old).small = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::SlaveState;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_already_satisfied_returns_without_enqueue() {
        let slave = SlaveState::new();
        let session = Session::new();
        slave.record(&Gtid::new(1, 1, 11), slave.next_sub_id(), None);

        let status = slave.waiters().wait_for_gtid(
            &slave,
            &session,
            &Gtid::new(1, 1, 10),
            Some(Duration::from_secs(1)),
        );
        assert_eq!(status, WaitStatus::Reached);
        assert_eq!(slave.waiters().waiter_count(1), 0);
    }

    #[test]
    fn test_single_waiter_satisfied_by_record() {
        let slave = Arc::new(SlaveState::new());

        let s = slave.clone();
        let waiter = thread::spawn(move || {
            let session = Session::new();
            s.waiters().wait_for_gtid(
                &s,
                &session,
                &Gtid::new(1, 1, 10),
                Some(Duration::from_secs(10)),
            )
        });

        wait_until(|| slave.waiters().waiter_count(1) == 1);

        // Below the target: must not complete the wait.
        slave.record(&Gtid::new(1, 1, 9), slave.next_sub_id(), None);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(slave.waiters().waiter_count(1), 1);

        slave.record(&Gtid::new(1, 1, 10), slave.next_sub_id(), None);
        assert_eq!(waiter.join().unwrap(), WaitStatus::Reached);
    }

    #[test]
    fn test_timeout_expires() {
        let slave = SlaveState::new();
        let session = Session::new();
        let status = slave.waiters().wait_for_gtid(
            &slave,
            &session,
            &Gtid::new(2, 1, 100),
            Some(Duration::from_millis(50)),
        );
        assert_eq!(status, WaitStatus::Timeout);
        assert_eq!(slave.waiters().waiter_count(2), 0);
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let slave = Arc::new(SlaveState::new());
        let session = Session::new();

        let s = slave.clone();
        let sess = session.clone();
        let waiter = thread::spawn(move || {
            s.waiters()
                .wait_for_gtid(&s, &sess, &Gtid::new(3, 1, 100), None)
        });

        wait_until(|| slave.waiters().waiter_count(3) == 1);
        slave.waiters().cancel(&session);
        assert_eq!(waiter.join().unwrap(), WaitStatus::Cancelled);
        assert_eq!(slave.waiters().waiter_count(3), 0);
    }

    #[test]
    fn test_wait_for_pos_multiple_domains() {
        let slave = Arc::new(SlaveState::new());
        slave.record(&Gtid::new(0, 1, 5), slave.next_sub_id(), None);

        let s = slave.clone();
        let waiter = thread::spawn(move || {
            let session = Session::new();
            s.waiters()
                .wait_for_pos(&s, &session, "0-1-5, 1-1-2", Some(Duration::from_secs(10)))
                .unwrap()
        });

        wait_until(|| slave.waiters().waiter_count(1) == 1);
        slave.record(&Gtid::new(1, 1, 2), slave.next_sub_id(), None);
        assert_eq!(waiter.join().unwrap(), WaitStatus::Reached);
    }

    #[test]
    fn test_wait_for_pos_parse_error() {
        let slave = SlaveState::new();
        let session = Session::new();
        assert!(slave
            .waiters()
            .wait_for_pos(&slave, &session, "0-1", Some(Duration::ZERO))
            .is_err());
    }

    #[test]
    fn test_small_waiter_is_queue_head() {
        let slave = Arc::new(SlaveState::new());
        let mut handles = Vec::new();
        for seq in [30u64, 10, 20] {
            let s = slave.clone();
            handles.push(thread::spawn(move || {
                let session = Session::new();
                s.waiters().wait_for_gtid(
                    &s,
                    &session,
                    &Gtid::new(7, 1, seq),
                    Some(Duration::from_secs(10)),
                )
            }));
        }
        wait_until(|| slave.waiters().waiter_count(7) == 3);

        // The small waiter is always the head: the smallest wait position.
        let stats = slave.waiters().domain_stats(7).unwrap();
        assert_eq!(stats.min_wait_seq_no, Some(10));
        assert_eq!(stats.small_wait_seq_no, Some(10));

        // A partial apply wakes only the satisfied prefix.
        slave.record(&Gtid::new(7, 1, 20), slave.next_sub_id(), None);
        wait_until(|| slave.waiters().waiter_count(7) == 1);
        let stats = slave.waiters().domain_stats(7).unwrap();
        assert_eq!(stats.min_wait_seq_no, Some(30));
        assert_eq!(stats.small_wait_seq_no, Some(30));

        slave.record(&Gtid::new(7, 1, 30), slave.next_sub_id(), None);
        for h in handles {
            assert_eq!(h.join().unwrap(), WaitStatus::Reached);
        }
    }

    #[test]
    fn test_timeout_of_small_waiter_promotes_successor() {
        let slave = Arc::new(SlaveState::new());

        let s = slave.clone();
        let short = thread::spawn(move || {
            let session = Session::new();
            s.waiters().wait_for_gtid(
                &s,
                &session,
                &Gtid::new(8, 1, 1),
                Some(Duration::from_millis(500)),
            )
        });
        wait_until(|| slave.waiters().waiter_count(8) == 1);

        let s = slave.clone();
        let long = thread::spawn(move || {
            let session = Session::new();
            s.waiters().wait_for_gtid(
                &s,
                &session,
                &Gtid::new(8, 1, 2),
                Some(Duration::from_secs(10)),
            )
        });
        wait_until(|| slave.waiters().waiter_count(8) == 2);

        assert_eq!(short.join().unwrap(), WaitStatus::Timeout);
        // The surviving waiter must have inherited the small-wait duty.
        wait_until(|| {
            slave
                .waiters()
                .domain_stats(8)
                .is_some_and(|s| s.small_wait_seq_no == Some(2))
        });

        slave.record(&Gtid::new(8, 1, 2), slave.next_sub_id(), None);
        assert_eq!(long.join().unwrap(), WaitStatus::Reached);
    }
}
