//! Session handles consumed by blocking GTID operations
//!
//! The surrounding server owns the real session object; the state machine
//! only needs a narrow view of it: a stable identifier, a kill flag that can
//! be observed while blocked, the condition variable the session is
//! currently parked on, and the auto-increment configuration pair that the
//! row-persistence layer saves and restores around position-table writes.
//!
//! Blocking paths register the condvar they are about to sleep on via
//! [`Session::enter_cond`]; [`Session::kill`] then wakes whichever condvar
//! the session holds at that moment. Every blocking loop re-checks
//! [`Session::is_killed`] after each wakeup.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One client or applier session, as seen by the GTID state machine.
pub struct Session {
    id: u64,
    killed: AtomicBool,
    /// Completion channel: signalled when a wait this session registered is done.
    wakeup: Arc<Condvar>,
    /// The condvar this session is currently blocked on, if any.
    current_cond: Mutex<Option<Arc<Condvar>>>,
    auto_increment_increment: AtomicU64,
    auto_increment_offset: AtomicU64,
}

impl Session {
    /// Create a session with a fresh process-unique id.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            killed: AtomicBool::new(false),
            wakeup: Arc::new(Condvar::new()),
            current_cond: Mutex::new(None),
            auto_increment_increment: AtomicU64::new(1),
            auto_increment_offset: AtomicU64::new(1),
        })
    }

    /// Stable identifier of this session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The per-session completion condvar.
    pub(crate) fn wakeup_cond(&self) -> &Arc<Condvar> {
        &self.wakeup
    }

    /// Mark the session killed and wake it wherever it is blocked.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.wakeup.notify_all();
        if let Some(cond) = self.current_cond.lock().clone() {
            cond.notify_all();
        }
    }

    /// True once [`kill`](Self::kill) has been called.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Clear the kill flag, e.g. when the session is reused from a pool.
    pub fn reset_kill(&self) {
        self.killed.store(false, Ordering::SeqCst);
    }

    /// Record the condvar this session is about to block on.
    pub(crate) fn enter_cond(&self, cond: Arc<Condvar>) {
        *self.current_cond.lock() = Some(cond);
    }

    /// Forget the registered condvar after waking up.
    pub(crate) fn exit_cond(&self) {
        *self.current_cond.lock() = None;
    }

    /// The session's `(auto_increment_increment, auto_increment_offset)` pair.
    pub fn auto_increment(&self) -> (u64, u64) {
        (
            self.auto_increment_increment.load(Ordering::Relaxed),
            self.auto_increment_offset.load(Ordering::Relaxed),
        )
    }

    /// Set the auto-increment configuration pair.
    pub fn set_auto_increment(&self, increment: u64, offset: u64) {
        self.auto_increment_increment
            .store(increment, Ordering::Relaxed);
        self.auto_increment_offset.store(offset, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("killed", &self.is_killed())
            .finish()
    }
}
