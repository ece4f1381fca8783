use crate::{
    error::{ArenaError, MonitorError},
    object::{object_address, Lockable},
    sync::{lock_word::LockWord, record::MonitorRecord, ObjectMonitor},
    utils::{
        sync::{Arc, Ordering},
        RecordHandle, SmallId,
    },
};
use tracing::{error, trace};

/// Inflate a lock the caller may or may not hold. Returns the record the
/// object's word points at afterwards, whoever installed it.
pub(crate) fn inflate<'m, T: Lockable>(
    monitor: &'m ObjectMonitor,
    object: &Arc<T>,
    operation: &'static str,
) -> Result<(RecordHandle, &'m MonitorRecord), MonitorError> {
    let observed = object.header().lock_word().load(Ordering::Acquire);
    inflate_from(monitor, object, observed, None, operation)
}

/// Inflate a lock the caller holds, for nest overflow or a wait. Ownership
/// and nesting carry over to the record.
pub(crate) fn inflate_owned<'m, T: Lockable>(
    monitor: &'m ObjectMonitor,
    object: &Arc<T>,
    me: SmallId,
    operation: &'static str,
) -> Result<(RecordHandle, &'m MonitorRecord), MonitorError> {
    let observed = object.header().lock_word().load(Ordering::Acquire);
    let (handle, record) = inflate_from(monitor, object, observed, Some(me), operation)?;
    debug_assert_eq!(record.owner(), me, "owner lost across inflation");
    Ok((handle, record))
}

/// Move the lock word last seen as `observed` onto a record. A stale
/// observation only costs a failed CAS.
fn inflate_from<'m, T: Lockable>(
    monitor: &'m ObjectMonitor,
    object: &Arc<T>,
    observed: u64,
    owned_by: Option<SmallId>,
    operation: &'static str,
) -> Result<(RecordHandle, &'m MonitorRecord), MonitorError> {
    let word = object.header().lock_word();
    let mut fresh: Option<(RecordHandle, &'m MonitorRecord)> = None;
    let mut bits = observed;

    loop {
        let (owner, nest, hash) = match LockWord::decode(bits) {
            LockWord::Inflated { record, .. } => {
                if let Some((spare, _)) = fresh {
                    monitor.metrics.record_inflation_race_lost();
                    trace!("lost inflation race for {}; returning {}", record, spare);
                    monitor.arena.release(spare);
                }
                let installed = monitor.record_for(object, record, operation)?;
                return Ok((record, installed));
            }
            LockWord::Free => (SmallId::NONE, 0, None),
            LockWord::Hashed { hash } => (SmallId::NONE, 0, Some(hash)),
            LockWord::Thin { owner, nest, hash } => (owner, nest, hash),
        };

        let (handle, record) = match fresh {
            Some(allocated) => allocated,
            None => {
                let allocated = allocate_or_abort(monitor, object);
                fresh = Some(allocated);
                allocated
            }
        };
        record.configure(object_address(object), owner, nest, hash);

        let inflated = LockWord::Inflated {
            record: handle,
            has_hash: hash.is_some(),
        };
        match word.compare_exchange(bits, inflated.encode(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                monitor.metrics.record_inflation();
                trace!(
                    "inflated {:?} into {} ({})",
                    LockWord::decode(bits),
                    handle,
                    if owned_by.is_some() { "owned" } else { "not owned" }
                );
                return Ok((handle, record));
            }
            Err(actual) => bits = actual,
        }
    }
}

fn allocate_or_abort<'m, T: Lockable>(
    monitor: &'m ObjectMonitor,
    object: &Arc<T>,
) -> (RecordHandle, &'m MonitorRecord) {
    match monitor
        .arena
        .allocate(Box::new(Arc::downgrade(object)), &monitor.metrics)
    {
        Ok(allocated) => allocated,
        Err(err @ ArenaError::Exhausted { .. }) => {
            error!("cannot inflate monitor for {}: {}", object.type_name(), err);
            std::process::abort()
        }
    }
}
