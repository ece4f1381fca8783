//! Monitor records: the inflated representation of a lock.
//!
//! A record's `status` word packs the owner's small id with a biased count of
//! threads blocked trying to enter:
//!
//! ```text
//!  | 63 ......................... 32 | 31 ............. 0 |
//!  |  entry count + 0x7FFF_FFFF      |  owner small id    |
//! ```
//!
//! The bias puts bit 63 exactly at "one or more entry waiters", so `exit` can
//! decide whether to signal with a single test on the word it swapped out.
use crate::{
    error::{MonitorError, WaitOutcome},
    sync::{
        wait::{WaitHandle, WaitState},
        ObjectMonitor,
    },
    threading::{Deadline, Timeout},
    utils::{
        sync::{
            Arc, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Backoff, Condvar, Mutex, OnceLock,
            Ordering,
        },
        SmallId,
    },
};
use std::{collections::VecDeque, time::Instant};
use tracing::{trace, warn};

const OWNER_MASK: u64 = 0xFFFF_FFFF;
const ENTRY_COUNT_SHIFT: u32 = 32;
const ENTRY_COUNT_ZERO: u64 = 0x7FFF_FFFF;
const ENTRY_COUNT_UNIT: u64 = 1 << ENTRY_COUNT_SHIFT;
const WAITERS: u64 = 1 << 63;

const UNOWNED: u64 = ENTRY_COUNT_ZERO << ENTRY_COUNT_SHIFT;

const HASH_PRESENT: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status(u64);

impl Status {
    fn owner(self) -> SmallId {
        SmallId::new((self.0 & OWNER_MASK) as u32)
    }

    fn with_owner(self, owner: SmallId) -> Status {
        Status((self.0 & !OWNER_MASK) | owner.as_u32() as u64)
    }

    fn entry_count(self) -> i64 {
        (self.0 >> ENTRY_COUNT_SHIFT) as i64 - ENTRY_COUNT_ZERO as i64
    }

    fn has_waiters(self) -> bool {
        self.0 & WAITERS != 0
    }

    fn inc_entry_count(self) -> Status {
        debug_assert!(self.entry_count() >= 0, "entry count underflow: {}", self.entry_count());
        debug_assert!(self.0 >> ENTRY_COUNT_SHIFT < u32::MAX as u64, "entry count overflow");
        Status(self.0 + ENTRY_COUNT_UNIT)
    }

    fn dec_entry_count(self) -> Status {
        debug_assert!(self.entry_count() > 0, "entry count underflow: {}", self.entry_count());
        Status(self.0 - ENTRY_COUNT_UNIT)
    }
}

/// Mutex/condvar pair contended enters block on. Created on first contention
/// and kept across record reuse.
#[derive(Debug, Default)]
struct EntryGate {
    lock: Mutex<()>,
    cond: Condvar,
}

enum BlockedEnter {
    Acquired,
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct MonitorRecord {
    status: AtomicU64,
    /// Recursion depth. Written only by the owner.
    nest: AtomicU32,
    /// Cached identity hash, `HASH_PRESENT | hash` once set.
    hash_code: AtomicU64,
    /// Address of the object this record protects, 0 while free.
    object: AtomicUsize,
    generation: AtomicU32,
    entry_gate: OnceLock<Arc<EntryGate>>,
    wait_list: Mutex<VecDeque<Arc<WaitHandle>>>,
}

impl Default for MonitorRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorRecord {
    pub(crate) fn new() -> Self {
        Self::with_generation(0)
    }

    pub(crate) fn with_generation(generation: u32) -> Self {
        Self {
            status: AtomicU64::new(UNOWNED),
            nest: AtomicU32::new(0),
            hash_code: AtomicU64::new(0),
            object: AtomicUsize::new(0),
            generation: AtomicU32::new(generation),
            entry_gate: OnceLock::new(),
            wait_list: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Prepare a free record to take over the lock word of the object at
    /// `object` before it is published. `nest` is zero when `owner` is `NONE`.
    pub(crate) fn configure(&self, object: usize, owner: SmallId, nest: u32, hash: Option<i32>) {
        debug_assert_eq!(owner.is_none(), nest == 0, "owner {} with nest {}", owner, nest);
        self.object.store(object, Ordering::Relaxed);
        self.status
            .store(Status(UNOWNED).with_owner(owner).0, Ordering::Relaxed);
        self.nest.store(nest, Ordering::Relaxed);
        self.hash_code.store(
            hash.map_or(0, |h| HASH_PRESENT | h as u32 as u64),
            Ordering::Relaxed,
        );
    }

    /// Return the record to its pristine state and invalidate every
    /// outstanding handle to it.
    pub(crate) fn retire(&self) {
        debug_assert!(
            self.wait_list.lock().iter().all(|h| !h.is_waiting()),
            "retiring a record with live waiters"
        );
        self.status.store(UNOWNED, Ordering::Relaxed);
        self.nest.store(0, Ordering::Relaxed);
        self.hash_code.store(0, Ordering::Relaxed);
        self.object.store(0, Ordering::Relaxed);
        self.wait_list.lock().clear();
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Whether this record was configured for the object at `address`.
    pub(crate) fn protects(&self, address: usize) -> bool {
        self.object.load(Ordering::Relaxed) == address
    }

    pub fn owner(&self) -> SmallId {
        Status(self.status.load(Ordering::Acquire)).owner()
    }

    pub fn nest(&self) -> u32 {
        self.nest.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> u32 {
        Status(self.status.load(Ordering::Relaxed)).entry_count().max(0) as u32
    }

    pub fn hash_code(&self) -> Option<i32> {
        let bits = self.hash_code.load(Ordering::Acquire);
        (bits & HASH_PRESENT != 0).then_some(bits as u32 as i32)
    }

    /// Cache `hash` unless one is already set. Returns the cached value.
    pub(crate) fn set_hash_code(&self, hash: i32) -> i32 {
        match self.hash_code.compare_exchange(
            0,
            HASH_PRESENT | hash as u32 as u64,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => hash,
            Err(existing) => existing as u32 as i32,
        }
    }

    pub fn waiting_threads(&self) -> Vec<SmallId> {
        self.wait_list
            .lock()
            .iter()
            .filter(|h| h.is_waiting())
            .map(|h| h.thread())
            .collect()
    }

    fn entry_gate(&self) -> &Arc<EntryGate> {
        self.entry_gate.get_or_init(Default::default)
    }

    /// One acquisition attempt. Retries only while the lock stays unowned, so
    /// it never waits on another thread.
    fn try_acquire(&self, me: SmallId) -> bool {
        let mut current = Status(self.status.load(Ordering::Relaxed));
        while current.owner().is_none() {
            match self.status.compare_exchange_weak(
                current.0,
                current.with_owner(me).0,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.nest.store(1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = Status(actual),
            }
        }
        false
    }

    /// Fat-lock enter. `Ok(false)` on timeout, `Err(Cancelled)` when an
    /// interruptible enter is interrupted.
    pub(crate) fn enter(
        &self,
        monitor: &ObjectMonitor,
        me: SmallId,
        timeout: Timeout,
        interruptible: bool,
    ) -> Result<bool, MonitorError> {
        if self.owner() == me {
            let nest = self.nest.load(Ordering::Relaxed);
            debug_assert!(nest >= 1 && nest < u32::MAX, "owner with nest {}", nest);
            self.nest.store(nest + 1, Ordering::Relaxed);
            return Ok(true);
        }

        if self.try_acquire(me) {
            return Ok(true);
        }
        if timeout.is_zero() {
            monitor.metrics.record_enter_timeout();
            return Ok(false);
        }

        let deadline = Deadline::after(monitor.clock(), timeout);

        let backoff = Backoff::new();
        while backoff.steps() < monitor.config.spin_count {
            backoff.snooze();
            if self.try_acquire(me) {
                return Ok(true);
            }
        }

        match self.enter_blocking(monitor, me, deadline, interruptible) {
            BlockedEnter::Acquired => Ok(true),
            BlockedEnter::TimedOut => {
                monitor.metrics.record_enter_timeout();
                Ok(false)
            }
            BlockedEnter::Cancelled => {
                monitor.collaborators.interrupts.clear_interrupt(me);
                monitor.metrics.record_enter_cancellation();
                Err(MonitorError::Cancelled)
            }
        }
    }

    /// Re-acquire after a wait. Cannot time out or be cancelled.
    fn reenter(&self, monitor: &ObjectMonitor, me: SmallId) {
        if self.try_acquire(me) {
            return;
        }
        match self.enter_blocking(monitor, me, Deadline::never(), false) {
            BlockedEnter::Acquired => {}
            BlockedEnter::TimedOut | BlockedEnter::Cancelled => {
                unreachable!("uninterruptible enter without a deadline gave up")
            }
        }
    }

    fn enter_blocking(
        &self,
        monitor: &ObjectMonitor,
        me: SmallId,
        deadline: Deadline,
        interruptible: bool,
    ) -> BlockedEnter {
        let gate = self.entry_gate().clone();
        let interrupted = Arc::new(AtomicBool::new(false));

        let token = if interruptible {
            let gate = gate.clone();
            let flag = interrupted.clone();
            let wake = Box::new(move || {
                flag.store(true, Ordering::Release);
                let _guard = gate.lock.lock();
                gate.cond.notify_all();
            });
            match monitor.collaborators.interrupts.install_interrupt(me, wake) {
                Ok(token) => Some(token),
                Err(_) => return BlockedEnter::Cancelled,
            }
        } else {
            None
        };

        let started = Instant::now();
        let mut current = Status(self.status.load(Ordering::Relaxed));
        loop {
            match self.status.compare_exchange_weak(
                current.0,
                current.inc_entry_count().0,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = Status(actual),
            }
        }

        let clock = monitor.clock();
        let mut guard = gate.lock.lock();
        let outcome = loop {
            if interrupted.load(Ordering::Acquire) {
                break BlockedEnter::Cancelled;
            }

            let current = Status(self.status.load(Ordering::Relaxed));
            if current.owner().is_none() {
                // Take the lock and drop out of the entry count in one step.
                if self
                    .status
                    .compare_exchange(
                        current.0,
                        current.with_owner(me).dec_entry_count().0,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    self.nest.store(1, Ordering::Relaxed);
                    break BlockedEnter::Acquired;
                }
                continue;
            }

            match deadline.remaining(clock) {
                None => gate.cond.wait(&mut guard),
                Some(left) if left.is_zero() => break BlockedEnter::TimedOut,
                Some(left) => {
                    gate.cond.wait_for(&mut guard, left);
                }
            }
        };
        drop(guard);

        if let Some(token) = token {
            monitor.collaborators.interrupts.uninstall_interrupt(token);
        }

        if let BlockedEnter::Acquired = outcome {
            let blocked = started.elapsed();
            monitor.metrics.record_lock_contention(blocked);
            if blocked.as_millis() as u64 >= monitor.config.slow_contention_warn_ms {
                warn!("thread {} blocked {:?} entering a contended monitor", me, blocked);
            }
            return outcome;
        }

        self.leave_entry_queue(&gate);
        outcome
    }

    /// Undo the entry-count registration of an enter that gave up.
    fn leave_entry_queue(&self, gate: &EntryGate) {
        let mut current = Status(self.status.load(Ordering::Relaxed));
        let after = loop {
            let next = current.dec_entry_count();
            match self.status.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break next,
                Err(actual) => current = Status(actual),
            }
        };
        // A release may have signalled us rather than a waiter that is still
        // queued; pass the wakeup on.
        if after.owner().is_none() && after.has_waiters() {
            let _guard = gate.lock.lock();
            gate.cond.notify_one();
        }
    }

    pub(crate) fn exit(&self, me: SmallId, operation: &'static str) -> Result<(), MonitorError> {
        let mut current = Status(self.status.load(Ordering::Acquire));
        if current.owner() != me {
            return Err(MonitorError::OwnershipViolation { operation });
        }

        let nest = self.nest.load(Ordering::Relaxed);
        debug_assert!(nest >= 1, "owned record with nest 0");
        if nest > 1 {
            self.nest.store(nest - 1, Ordering::Relaxed);
            return Ok(());
        }

        self.nest.store(0, Ordering::Relaxed);
        loop {
            match self.status.compare_exchange_weak(
                current.0,
                current.with_owner(SmallId::NONE).0,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = Status(actual),
            }
        }

        if current.has_waiters() {
            if let Some(gate) = self.entry_gate.get() {
                let _guard = gate.lock.lock();
                gate.cond.notify_one();
            }
        }
        Ok(())
    }

    /// Release completely, block until pulsed, timed out or interrupted, then
    /// take the lock back at its previous depth.
    pub(crate) fn wait(
        &self,
        monitor: &ObjectMonitor,
        me: SmallId,
        timeout: Timeout,
        interruptible: bool,
    ) -> Result<WaitOutcome, MonitorError> {
        if self.owner() != me {
            return Err(MonitorError::OwnershipViolation {
                operation: "Monitor.Wait",
            });
        }

        let clock = monitor.clock();
        let deadline = Deadline::after(clock, timeout);
        let handle = Arc::new(WaitHandle::new(me));
        self.wait_list.lock().push_back(handle.clone());
        trace!("thread {} waiting on record gen {}", me, self.generation());

        let saved_nest = self.nest.load(Ordering::Relaxed);
        self.nest.store(1, Ordering::Relaxed);
        self.exit(me, "Monitor.Wait")?;

        let interrupts = &monitor.collaborators.interrupts;
        let token = if interruptible {
            let target = handle.clone();
            match interrupts.install_interrupt(
                me,
                Box::new(move || {
                    target.interrupt();
                }),
            ) {
                Ok(token) => Some(token),
                Err(_) => {
                    handle.interrupt();
                    None
                }
            }
        } else {
            None
        };

        let state = handle.block(deadline, clock);

        if let Some(token) = token {
            interrupts.uninstall_interrupt(token);
        }

        self.reenter(monitor, me);
        self.nest.store(saved_nest, Ordering::Relaxed);

        {
            let mut list = self.wait_list.lock();
            if let Some(pos) = list.iter().position(|h| Arc::ptr_eq(h, &handle)) {
                list.remove(pos);
            }
        }
        trace!("thread {} left wait with {:?}", me, state);

        Ok(match state {
            WaitState::Signaled => WaitOutcome::Pulsed,
            WaitState::TimedOut => {
                monitor.metrics.record_wait_timeout();
                WaitOutcome::TimedOut
            }
            WaitState::Interrupted => {
                interrupts.clear_interrupt(me);
                monitor.metrics.record_wait_cancellation();
                WaitOutcome::Cancelled
            }
            WaitState::Waiting => unreachable!("wait handle still waiting after block"),
        })
    }

    /// Wake the longest-waiting thread, or every waiter when `all`.
    /// Returns the number woken.
    pub(crate) fn pulse(&self, me: SmallId, all: bool) -> Result<u64, MonitorError> {
        if self.owner() != me {
            return Err(MonitorError::OwnershipViolation {
                operation: if all { "Monitor.PulseAll" } else { "Monitor.Pulse" },
            });
        }

        let mut list = self.wait_list.lock();
        let mut woken = 0;
        while let Some(handle) = list.pop_front() {
            // Waiters that timed out or were cancelled dequeue themselves
            // once they re-acquire; skip them.
            if handle.signal() {
                woken += 1;
                if !all {
                    break;
                }
            }
        }
        Ok(woken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bias() {
        let s = Status(UNOWNED);
        assert_eq!(s.owner(), SmallId::NONE);
        assert_eq!(s.entry_count(), 0);
        assert!(!s.has_waiters());

        let s = s.inc_entry_count().with_owner(SmallId(12));
        assert_eq!(s.entry_count(), 1);
        assert!(s.has_waiters());
        assert_eq!(s.owner(), SmallId(12));

        let s = s.dec_entry_count();
        assert_eq!(s.entry_count(), 0);
        assert!(!s.has_waiters());
        assert_eq!(s.owner(), SmallId(12));
    }

    #[test]
    fn test_configure_and_retire() {
        let record = MonitorRecord::new();
        record.configure(0x1000, SmallId(4), 3, Some(77));
        assert_eq!(record.owner(), SmallId(4));
        assert_eq!(record.nest(), 3);
        assert_eq!(record.hash_code(), Some(77));
        assert!(record.protects(0x1000));

        let generation = record.generation();
        record.retire();
        assert_eq!(record.owner(), SmallId::NONE);
        assert_eq!(record.hash_code(), None);
        assert!(!record.protects(0x1000));
        assert_eq!(record.generation(), generation + 1);
    }

    #[test]
    fn test_hash_is_set_once() {
        let record = MonitorRecord::new();
        assert_eq!(record.set_hash_code(5), 5);
        assert_eq!(record.set_hash_code(6), 5);
        assert_eq!(record.hash_code(), Some(5));
    }

    #[test]
    fn test_exit_by_non_owner_fails() {
        let record = MonitorRecord::new();
        record.configure(0x1000, SmallId(1), 1, None);
        assert_eq!(
            record.exit(SmallId(2), "Monitor.Exit"),
            Err(MonitorError::OwnershipViolation {
                operation: "Monitor.Exit"
            })
        );
        assert_eq!(record.exit(SmallId(1), "Monitor.Exit"), Ok(()));
        assert_eq!(record.owner(), SmallId::NONE);
    }

    #[test]
    fn test_pulse_skips_abandoned_waiters() {
        let record = MonitorRecord::new();
        record.configure(0x1000, SmallId(1), 1, None);
        let gone = Arc::new(WaitHandle::new(SmallId(2)));
        let live = Arc::new(WaitHandle::new(SmallId(3)));
        gone.interrupt();
        record.wait_list.lock().extend([gone.clone(), live.clone()]);

        assert_eq!(record.waiting_threads(), vec![SmallId(3)]);
        assert_eq!(record.pulse(SmallId(1), false), Ok(1));
        assert!(!live.is_waiting());
        assert_eq!(record.pulse(SmallId(1), true), Ok(0));
    }
}
