use crate::{
    threading::{Clock, Deadline},
    utils::{
        sync::{Condvar, Mutex},
        SmallId,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitState {
    Waiting,
    Signaled,
    TimedOut,
    Interrupted,
}

/// Private event a thread blocks on inside `wait`.
///
/// Leaves `Waiting` exactly once. Whichever of pulse, timeout or interrupt
/// gets there first decides how the wait ended.
#[derive(Debug)]
pub(crate) struct WaitHandle {
    thread: SmallId,
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl WaitHandle {
    pub(crate) fn new(thread: SmallId) -> Self {
        Self {
            thread,
            state: Mutex::new(WaitState::Waiting),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn thread(&self) -> SmallId {
        self.thread
    }

    fn finish(&self, to: WaitState) -> bool {
        let mut state = self.state.lock();
        if *state != WaitState::Waiting {
            return false;
        }
        *state = to;
        self.cond.notify_one();
        true
    }

    /// Wake for a pulse. False if the waiter had already given up.
    pub(crate) fn signal(&self) -> bool {
        self.finish(WaitState::Signaled)
    }

    pub(crate) fn interrupt(&self) -> bool {
        self.finish(WaitState::Interrupted)
    }

    pub(crate) fn is_waiting(&self) -> bool {
        *self.state.lock() == WaitState::Waiting
    }

    /// Block until the handle leaves `Waiting`, marking it timed out if the
    /// deadline passes first.
    pub(crate) fn block(&self, deadline: Deadline, clock: &dyn Clock) -> WaitState {
        let mut state = self.state.lock();
        loop {
            if *state != WaitState::Waiting {
                return *state;
            }
            match deadline.remaining(clock) {
                None => self.cond.wait(&mut state),
                Some(left) if left.is_zero() => {
                    *state = WaitState::TimedOut;
                    return WaitState::TimedOut;
                }
                Some(left) => {
                    self.cond.wait_for(&mut state, left);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        threading::{MonotonicClock, Timeout},
        utils::sync::Arc,
    };
    use std::{thread, time::Duration};

    #[test]
    fn test_first_transition_wins() {
        let handle = WaitHandle::new(SmallId(1));
        assert!(handle.is_waiting());
        assert!(handle.interrupt());
        assert!(!handle.signal());
        let clock = MonotonicClock::new();
        assert_eq!(handle.block(Deadline::never(), &clock), WaitState::Interrupted);
    }

    #[test]
    fn test_block_times_out() {
        let clock = MonotonicClock::new();
        let handle = WaitHandle::new(SmallId(1));
        let deadline = Deadline::after(&clock, Timeout::Millis(20));
        assert_eq!(handle.block(deadline, &clock), WaitState::TimedOut);
        // A late pulse finds nobody to wake.
        assert!(!handle.signal());
    }

    #[test]
    fn test_signal_wakes_blocked_thread() {
        let handle = Arc::new(WaitHandle::new(SmallId(2)));
        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || handle.block(Deadline::never(), &MonotonicClock::new()))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(handle.signal());
        assert_eq!(waiter.join().unwrap(), WaitState::Signaled);
    }
}
