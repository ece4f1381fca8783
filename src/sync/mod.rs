//! The object monitor.
//!
//! Every lockable object carries one 64-bit lock word. An uncontended lock
//! lives entirely in that word ("thin"); contention, deep recursion or a
//! `wait` move it permanently onto a [`MonitorRecord`] drawn from the
//! [`MonitorArena`] ("inflated"), where threads block on a mutex/condvar pair
//! and waiters queue on private events.
//!
//! # Example
//!
//! ```
//! use objmon::{MonitorOps, ObjectMonitor, ObjectRef, Timeout};
//!
//! let monitor = ObjectMonitor::default();
//! let obj = ObjectRef::new_object("System.Object");
//!
//! monitor.enter(&obj).unwrap();
//! assert!(monitor.is_entered_by_current(&obj).unwrap());
//! assert!(monitor.try_enter(&obj, Timeout::ZERO).unwrap());
//! monitor.exit(&obj).unwrap();
//! monitor.exit(&obj).unwrap();
//! assert!(!monitor.is_entered_by_anyone(&obj).unwrap());
//! ```
use crate::{
    config::MonitorConfig,
    error::{MonitorError, WaitOutcome},
    metrics::{MetricsSnapshot, MonitorMetrics},
    object::{object_address, Lockable, ObjectRef},
    threading::{Clock, Collaborators, Timeout},
    utils::{
        sync::{Arc, Ordering},
        RecordHandle, SmallId,
    },
};
use serde::Serialize;

mod arena;
mod dump;
mod hash;
mod inflate;
mod lock_word;
mod record;
mod thin;
mod wait;

pub use arena::MonitorArena;
pub use dump::{LockDump, LockRecordInfo};
pub use lock_word::{LockWord, MAX_RECORD_INDEX, MAX_THIN_NEST};
pub use record::MonitorRecord;

use thin::{ThinEnter, ThinExit};

/// Current holder of a lock and its recursion depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockOwner {
    pub thread: SmallId,
    pub nest: u32,
}

/// `System.Threading.Monitor` operations over lockable objects.
pub trait MonitorOps {
    fn enter<T: Lockable>(&self, object: &ObjectRef<T>) -> Result<(), MonitorError>;

    /// `Monitor.Enter(object, ref bool)`: `lock_taken` is set once the lock
    /// is held and left untouched on error.
    fn enter_reliable<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
        lock_taken: &mut bool,
    ) -> Result<(), MonitorError>;

    /// `Ok(false)` if the lock could not be taken in time. A zero timeout
    /// never blocks.
    fn try_enter<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
        timeout: Timeout,
    ) -> Result<bool, MonitorError>;

    /// Like `try_enter`, but an interruption of the calling thread while it
    /// is blocked ends the attempt with `MonitorError::Cancelled`.
    fn try_enter_interruptible<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
        timeout: Timeout,
    ) -> Result<bool, MonitorError>;

    fn exit<T: Lockable>(&self, object: &ObjectRef<T>) -> Result<(), MonitorError>;

    /// Release the lock, wait for a pulse, then re-acquire it at the same
    /// depth. The lock is held again on every `Ok` return.
    fn wait<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
        timeout: Timeout,
        interruptible: bool,
    ) -> Result<WaitOutcome, MonitorError>;

    fn pulse<T: Lockable>(&self, object: &ObjectRef<T>) -> Result<(), MonitorError>;

    fn pulse_all<T: Lockable>(&self, object: &ObjectRef<T>) -> Result<(), MonitorError>;

    fn is_entered_by_current<T: Lockable>(&self, object: &ObjectRef<T>)
        -> Result<bool, MonitorError>;

    fn is_entered_by_anyone<T: Lockable>(&self, object: &ObjectRef<T>)
        -> Result<bool, MonitorError>;

    fn lock_owner<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
    ) -> Result<Option<LockOwner>, MonitorError>;

    /// Stable for the object's lifetime, whatever state its lock is in.
    fn get_identity_hash<T: Lockable>(&self, object: &ObjectRef<T>) -> Result<i32, MonitorError>;
}

pub struct ObjectMonitor {
    pub(crate) config: MonitorConfig,
    pub(crate) collaborators: Collaborators,
    pub(crate) metrics: MonitorMetrics,
    pub(crate) arena: MonitorArena,
}

impl Default for ObjectMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl ObjectMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_collaborators(config, Collaborators::default())
    }

    pub fn with_collaborators(config: MonitorConfig, collaborators: Collaborators) -> Self {
        let arena = MonitorArena::new(&config);
        Self {
            config,
            collaborators,
            metrics: MonitorMetrics::new(),
            arena,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn arena(&self) -> &MonitorArena {
        &self.arena
    }

    /// Recycle the records of objects that have died. Also runs implicitly
    /// when inflation finds the free list empty.
    pub fn reclaim_dead_records(&self) -> usize {
        self.arena.reclaim_dead_records(&self.metrics)
    }

    /// Every inflated lock, or only the held ones.
    pub fn dump_locks(&self, include_unheld: bool) -> LockDump {
        let mut dump = LockDump {
            arena_capacity: self.arena.capacity(),
            ..LockDump::default()
        };
        self.arena.for_each_in_use(|handle, record, address| {
            dump.records_in_use += 1;
            let info = LockRecordInfo::capture(handle, record, address);
            if include_unheld || info.is_held() {
                dump.records.push(info);
            }
        });
        dump
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.collaborators.clock.as_ref()
    }

    fn current_thread(&self) -> SmallId {
        let me = self.collaborators.threads.current_thread_small_id();
        debug_assert!(!me.is_none(), "thread identity returned the reserved id 0");
        me
    }

    /// The record an inflated lock word of `object` names. A live object's
    /// record is never recycled, so a miss means the word was inflated by
    /// another monitor and the handle points into a different arena.
    pub(crate) fn record_for<T: Lockable>(
        &self,
        object: &Arc<T>,
        handle: RecordHandle,
        operation: &'static str,
    ) -> Result<&MonitorRecord, MonitorError> {
        self.arena
            .resolve(handle)
            .filter(|record| record.protects(object_address(object)))
            .ok_or(MonitorError::ForeignMonitor { operation })
    }

    fn lock_word<T: Lockable>(&self, object: &Arc<T>) -> LockWord {
        LockWord::decode(object.header().lock_word().load(Ordering::Acquire))
    }

    fn enter_object<T: Lockable>(
        &self,
        object: &Arc<T>,
        timeout: Timeout,
        interruptible: bool,
        operation: &'static str,
    ) -> Result<bool, MonitorError> {
        let me = self.current_thread();
        loop {
            match thin::try_enter(object.header(), me) {
                ThinEnter::Acquired => return Ok(true),
                ThinEnter::Inflated(handle) => {
                    return self
                        .record_for(object, handle, operation)?
                        .enter(self, me, timeout, interruptible)
                }
                ThinEnter::NestOverflow => {
                    inflate::inflate_owned(self, object, me, operation)?;
                }
                ThinEnter::Busy if timeout.is_zero() => {
                    self.metrics.record_enter_timeout();
                    return Ok(false);
                }
                ThinEnter::Busy | ThinEnter::NeedsInflation => {
                    inflate::inflate(self, object, operation)?;
                }
            }
        }
    }

    /// The record of a lock the caller must hold, inflating a thin one.
    fn owned_record<T: Lockable>(
        &self,
        object: &Arc<T>,
        me: SmallId,
        operation: &'static str,
    ) -> Result<&MonitorRecord, MonitorError> {
        match self.lock_word(object) {
            LockWord::Thin { owner, .. } if owner == me => {
                Ok(inflate::inflate_owned(self, object, me, operation)?.1)
            }
            LockWord::Inflated { record, .. } => {
                let record = self.record_for(object, record, operation)?;
                if record.owner() == me {
                    Ok(record)
                } else {
                    Err(MonitorError::OwnershipViolation { operation })
                }
            }
            LockWord::Free | LockWord::Hashed { .. } | LockWord::Thin { .. } => {
                Err(MonitorError::OwnershipViolation { operation })
            }
        }
    }

    fn pulse_object<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
        all: bool,
        operation: &'static str,
    ) -> Result<(), MonitorError> {
        let object = object.require(operation)?;
        let me = self.current_thread();
        match self.lock_word(object) {
            // A thin lock has never been waited on.
            LockWord::Thin { owner, .. } if owner == me => Ok(()),
            LockWord::Inflated { record, .. } => {
                let woken = self.record_for(object, record, operation)?.pulse(me, all)?;
                self.metrics.record_pulses_delivered(woken);
                Ok(())
            }
            LockWord::Free | LockWord::Hashed { .. } | LockWord::Thin { .. } => {
                Err(MonitorError::OwnershipViolation { operation })
            }
        }
    }
}

impl MonitorOps for ObjectMonitor {
    fn enter<T: Lockable>(&self, object: &ObjectRef<T>) -> Result<(), MonitorError> {
        const OPERATION: &str = "Monitor.Enter";
        let object = object.require(OPERATION)?;
        self.enter_object(object, Timeout::Infinite, false, OPERATION)?;
        Ok(())
    }

    fn enter_reliable<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
        lock_taken: &mut bool,
    ) -> Result<(), MonitorError> {
        const OPERATION: &str = "Monitor.Enter";
        let object = object.require(OPERATION)?;
        *lock_taken = self.enter_object(object, Timeout::Infinite, false, OPERATION)?;
        Ok(())
    }

    fn try_enter<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
        timeout: Timeout,
    ) -> Result<bool, MonitorError> {
        const OPERATION: &str = "Monitor.TryEnter";
        let object = object.require(OPERATION)?;
        self.enter_object(object, timeout, false, OPERATION)
    }

    fn try_enter_interruptible<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
        timeout: Timeout,
    ) -> Result<bool, MonitorError> {
        const OPERATION: &str = "Monitor.TryEnter";
        let object = object.require(OPERATION)?;
        self.enter_object(object, timeout, true, OPERATION)
    }

    fn exit<T: Lockable>(&self, object: &ObjectRef<T>) -> Result<(), MonitorError> {
        const OPERATION: &str = "Monitor.Exit";
        let object = object.require(OPERATION)?;
        let me = self.current_thread();
        match thin::exit(object.header(), me) {
            ThinExit::Released => Ok(()),
            ThinExit::NotOwner => Err(MonitorError::OwnershipViolation {
                operation: OPERATION,
            }),
            ThinExit::Inflated(handle) => self
                .record_for(object, handle, OPERATION)?
                .exit(me, OPERATION),
        }
    }

    fn wait<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
        timeout: Timeout,
        interruptible: bool,
    ) -> Result<WaitOutcome, MonitorError> {
        const OPERATION: &str = "Monitor.Wait";
        let object = object.require(OPERATION)?;
        let me = self.current_thread();
        let record = self.owned_record(object, me, OPERATION)?;
        self.metrics.record_wait();
        record.wait(self, me, timeout, interruptible)
    }

    fn pulse<T: Lockable>(&self, object: &ObjectRef<T>) -> Result<(), MonitorError> {
        self.pulse_object(object, false, "Monitor.Pulse")
    }

    fn pulse_all<T: Lockable>(&self, object: &ObjectRef<T>) -> Result<(), MonitorError> {
        self.pulse_object(object, true, "Monitor.PulseAll")
    }

    fn is_entered_by_current<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
    ) -> Result<bool, MonitorError> {
        const OPERATION: &str = "Monitor.IsEntered";
        let object = object.require(OPERATION)?;
        let me = self.current_thread();
        Ok(self
            .lock_owner_of(object, OPERATION)?
            .is_some_and(|o| o.thread == me))
    }

    fn is_entered_by_anyone<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
    ) -> Result<bool, MonitorError> {
        const OPERATION: &str = "Monitor.IsEntered";
        let object = object.require(OPERATION)?;
        Ok(self.lock_owner_of(object, OPERATION)?.is_some())
    }

    fn lock_owner<T: Lockable>(
        &self,
        object: &ObjectRef<T>,
    ) -> Result<Option<LockOwner>, MonitorError> {
        const OPERATION: &str = "Monitor.GetOwner";
        let object = object.require(OPERATION)?;
        self.lock_owner_of(object, OPERATION)
    }

    fn get_identity_hash<T: Lockable>(&self, object: &ObjectRef<T>) -> Result<i32, MonitorError> {
        const OPERATION: &str = "RuntimeHelpers.GetHashCode";
        let object = object.require(OPERATION)?;
        hash::identity_hash(self, object, OPERATION)
    }
}

impl ObjectMonitor {
    fn lock_owner_of<T: Lockable>(
        &self,
        object: &Arc<T>,
        operation: &'static str,
    ) -> Result<Option<LockOwner>, MonitorError> {
        Ok(match self.lock_word(object) {
            LockWord::Thin { owner, nest, .. } => Some(LockOwner {
                thread: owner,
                nest,
            }),
            LockWord::Inflated { record, .. } => {
                let record = self.record_for(object, record, operation)?;
                let thread = record.owner();
                (!thread.is_none()).then(|| LockOwner {
                    thread,
                    nest: record.nest(),
                })
            }
            LockWord::Free | LockWord::Hashed { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HeapObject;
    use std::thread;

    fn word(obj: &ObjectRef<HeapObject>) -> LockWord {
        LockWord::decode(obj.0.as_ref().unwrap().header().raw_lock_word())
    }

    #[test]
    fn test_uncontended_enter_stays_thin() {
        let monitor = ObjectMonitor::default();
        let obj = ObjectRef::new_object("Foo");
        monitor.enter(&obj).unwrap();
        assert!(matches!(word(&obj), LockWord::Thin { nest: 1, .. }));
        monitor.exit(&obj).unwrap();
        assert_eq!(word(&obj), LockWord::Free);
        assert_eq!(monitor.metrics().inflations, 0);
    }

    #[test]
    fn test_nest_overflow_inflates_and_keeps_depth() {
        let monitor = ObjectMonitor::default();
        let obj = ObjectRef::new_object("Foo");
        for _ in 0..MAX_THIN_NEST + 10 {
            monitor.enter(&obj).unwrap();
        }
        assert!(matches!(word(&obj), LockWord::Inflated { .. }));
        assert_eq!(
            monitor.lock_owner(&obj).unwrap().map(|o| o.nest),
            Some(MAX_THIN_NEST + 10)
        );
        for _ in 0..MAX_THIN_NEST + 10 {
            monitor.exit(&obj).unwrap();
        }
        assert_eq!(monitor.lock_owner(&obj).unwrap(), None);
        assert!(monitor.exit(&obj).is_err());
    }

    #[test]
    fn test_wait_on_thin_lock_inflates() {
        let monitor = ObjectMonitor::default();
        let obj = ObjectRef::new_object("Foo");
        monitor.enter(&obj).unwrap();
        monitor.enter(&obj).unwrap();
        assert_eq!(
            monitor.wait(&obj, Timeout::Millis(10), false).unwrap(),
            WaitOutcome::TimedOut
        );
        assert!(matches!(word(&obj), LockWord::Inflated { .. }));
        assert_eq!(monitor.lock_owner(&obj).unwrap().map(|o| o.nest), Some(2));
        monitor.exit(&obj).unwrap();
        monitor.exit(&obj).unwrap();
    }

    #[test]
    fn test_hashed_word_inflates_on_enter() {
        let monitor = ObjectMonitor::default();
        let obj = ObjectRef::new_object("Foo");
        let hash = monitor.get_identity_hash(&obj).unwrap();
        assert_eq!(word(&obj), LockWord::Hashed { hash });

        monitor.enter(&obj).unwrap();
        assert!(matches!(word(&obj), LockWord::Inflated { has_hash: true, .. }));
        assert_eq!(monitor.get_identity_hash(&obj).unwrap(), hash);
        monitor.exit(&obj).unwrap();
    }

    #[test]
    fn test_zero_timeout_does_not_inflate_thin_lock() {
        let monitor = Arc::new(ObjectMonitor::default());
        let obj = ObjectRef::new_object("Foo");
        monitor.enter(&obj).unwrap();

        let taken = {
            let (monitor, obj) = (monitor.clone(), obj.clone());
            thread::spawn(move || monitor.try_enter(&obj, Timeout::ZERO).unwrap())
                .join()
                .unwrap()
        };
        assert!(!taken);
        assert!(matches!(word(&obj), LockWord::Thin { .. }));
        monitor.exit(&obj).unwrap();
    }

    #[test]
    fn test_pulse_requires_ownership() {
        let monitor = ObjectMonitor::default();
        let obj = ObjectRef::new_object("Foo");
        assert_eq!(
            monitor.pulse(&obj),
            Err(MonitorError::OwnershipViolation {
                operation: "Monitor.Pulse"
            })
        );
        monitor.enter(&obj).unwrap();
        assert_eq!(monitor.pulse_all(&obj), Ok(()));
        monitor.exit(&obj).unwrap();
    }

    #[test]
    fn test_dump_lists_inflated_locks() {
        let monitor = ObjectMonitor::default();
        let held = ObjectRef::new_object("Held");
        let idle = ObjectRef::new_object("Idle");
        for obj in [&held, &idle] {
            monitor.enter(obj).unwrap();
            monitor.wait(obj, Timeout::ZERO, false).unwrap();
        }
        monitor.exit(&idle).unwrap();

        let dump = monitor.dump_locks(false);
        assert_eq!(dump.records.len(), 1);
        assert_eq!(dump.records[0].object_address, held.address());
        assert_eq!(dump.records_in_use, 2);
        assert_eq!(monitor.dump_locks(true).records.len(), 2);
        monitor.exit(&held).unwrap();
    }
}
