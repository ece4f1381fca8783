use crate::{
    object::ObjectHeader,
    sync::lock_word::{LockWord, MAX_THIN_NEST},
    utils::{sync::Ordering, RecordHandle, SmallId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThinEnter {
    Acquired,
    /// Thin-locked by another thread.
    Busy,
    /// Free-word race lost, or a hashed word: needs a record.
    NeedsInflation,
    /// Caller owns the lock at the deepest thin nesting.
    NestOverflow,
    Inflated(RecordHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThinExit {
    Released,
    NotOwner,
    Inflated(RecordHandle),
}

pub(crate) fn try_enter(header: &ObjectHeader, me: SmallId) -> ThinEnter {
    let word = header.lock_word();
    let mut bits = word.load(Ordering::Acquire);
    loop {
        match LockWord::decode(bits) {
            LockWord::Free => {
                let thin = LockWord::Thin {
                    owner: me,
                    nest: 1,
                    hash: None,
                };
                return match word.compare_exchange(
                    bits,
                    thin.encode(),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => ThinEnter::Acquired,
                    Err(_) => ThinEnter::NeedsInflation,
                };
            }
            LockWord::Thin { owner, nest, hash } if owner == me => {
                if nest == MAX_THIN_NEST {
                    return ThinEnter::NestOverflow;
                }
                let deeper = LockWord::Thin {
                    owner,
                    nest: nest + 1,
                    hash,
                };
                // Other threads may still inflate or hash the word under us.
                match word.compare_exchange(bits, deeper.encode(), Ordering::Relaxed, Ordering::Acquire) {
                    Ok(_) => return ThinEnter::Acquired,
                    Err(actual) => bits = actual,
                }
            }
            LockWord::Thin { .. } => return ThinEnter::Busy,
            LockWord::Hashed { .. } => return ThinEnter::NeedsInflation,
            LockWord::Inflated { record, .. } => return ThinEnter::Inflated(record),
        }
    }
}

pub(crate) fn exit(header: &ObjectHeader, me: SmallId) -> ThinExit {
    let word = header.lock_word();
    let mut bits = word.load(Ordering::Acquire);
    loop {
        let next = match LockWord::decode(bits) {
            LockWord::Thin { owner, nest, hash } if owner == me => {
                if nest > 1 {
                    LockWord::Thin {
                        owner,
                        nest: nest - 1,
                        hash,
                    }
                } else {
                    hash.map_or(LockWord::Free, |hash| LockWord::Hashed { hash })
                }
            }
            LockWord::Inflated { record, .. } => return ThinExit::Inflated(record),
            LockWord::Free | LockWord::Hashed { .. } | LockWord::Thin { .. } => {
                return ThinExit::NotOwner
            }
        };
        match word.compare_exchange(bits, next.encode(), Ordering::Release, Ordering::Acquire) {
            Ok(_) => return ThinExit::Released,
            Err(actual) => bits = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_of(header: &ObjectHeader) -> LockWord {
        LockWord::decode(header.raw_lock_word())
    }

    #[test]
    fn test_enter_exit_nesting() {
        let header = ObjectHeader::new();
        let me = SmallId(7);
        assert_eq!(try_enter(&header, me), ThinEnter::Acquired);
        assert_eq!(try_enter(&header, me), ThinEnter::Acquired);
        assert_eq!(
            word_of(&header),
            LockWord::Thin {
                owner: me,
                nest: 2,
                hash: None
            }
        );
        assert_eq!(exit(&header, me), ThinExit::Released);
        assert_eq!(exit(&header, me), ThinExit::Released);
        assert_eq!(word_of(&header), LockWord::Free);
        assert_eq!(exit(&header, me), ThinExit::NotOwner);
    }

    #[test]
    fn test_other_thread_is_busy() {
        let header = ObjectHeader::new();
        assert_eq!(try_enter(&header, SmallId(1)), ThinEnter::Acquired);
        assert_eq!(try_enter(&header, SmallId(2)), ThinEnter::Busy);
        assert_eq!(exit(&header, SmallId(2)), ThinExit::NotOwner);
    }

    #[test]
    fn test_nest_overflow_reported() {
        let header = ObjectHeader::new();
        let me = SmallId(3);
        for _ in 0..MAX_THIN_NEST {
            assert_eq!(try_enter(&header, me), ThinEnter::Acquired);
        }
        assert_eq!(try_enter(&header, me), ThinEnter::NestOverflow);
    }

    #[test]
    fn test_exit_keeps_hash() {
        let header = ObjectHeader::new();
        header.lock_word().store(
            LockWord::Thin {
                owner: SmallId(4),
                nest: 1,
                hash: Some(1234),
            }
            .encode(),
            Ordering::Relaxed,
        );
        assert_eq!(exit(&header, SmallId(4)), ThinExit::Released);
        assert_eq!(word_of(&header), LockWord::Hashed { hash: 1234 });
        assert_eq!(try_enter(&header, SmallId(4)), ThinEnter::NeedsInflation);
    }
}
