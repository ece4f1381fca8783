use crate::{
    error::MonitorError,
    object::{object_address, Lockable},
    sync::{
        lock_word::{LockWord, HASH_MASK},
        ObjectMonitor,
    },
    utils::sync::{Arc, Ordering},
};

/// Knuth's multiplicative constant; the low three address bits are always
/// zero for heap objects and are dropped first.
const HASH_MULTIPLIER: u64 = 2_654_435_761;

pub(crate) fn hash_of_address(address: usize) -> i32 {
    (((address as u64) >> 3).wrapping_mul(HASH_MULTIPLIER) & HASH_MASK as u64) as i32
}

pub(crate) fn identity_hash<T: Lockable>(
    monitor: &ObjectMonitor,
    object: &Arc<T>,
    operation: &'static str,
) -> Result<i32, MonitorError> {
    let word = object.header().lock_word();
    let computed = hash_of_address(object_address(object));
    let mut bits = word.load(Ordering::Acquire);

    loop {
        let next = match LockWord::decode(bits) {
            LockWord::Hashed { hash } | LockWord::Thin { hash: Some(hash), .. } => return Ok(hash),
            LockWord::Free => LockWord::Hashed { hash: computed },
            LockWord::Thin { owner, nest, hash: None } => LockWord::Thin {
                owner,
                nest,
                hash: Some(computed),
            },
            LockWord::Inflated { record, has_hash } => {
                let hash = monitor
                    .record_for(object, record, operation)?
                    .set_hash_code(computed);
                if !has_hash {
                    // Only a hint; the record is authoritative.
                    let _ = word.compare_exchange(
                        bits,
                        LockWord::Inflated {
                            record,
                            has_hash: true,
                        }
                        .encode(),
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                }
                return Ok(hash);
            }
        };
        match word.compare_exchange(bits, next.encode(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(computed),
            Err(actual) => bits = actual,
        }
    }
}
