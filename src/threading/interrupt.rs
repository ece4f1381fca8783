use crate::utils::{
    sync::{AtomicU64, Ordering},
    SmallId,
};
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Run once, on the interrupting thread, to wake a blocked waiter.
pub type InterruptCallback = Box<dyn FnOnce() + Send + Sync>;

/// Proof of an installed callback, handed back to `uninstall_interrupt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptToken {
    thread: SmallId,
    serial: u64,
}

impl InterruptToken {
    pub fn thread(&self) -> SmallId {
        self.thread
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("thread {0} already has an interruption pending")]
pub struct AlreadyInterrupted(pub SmallId);

pub trait InterruptSource: Send + Sync {
    /// Register `callback` to run if `thread` is interrupted before the
    /// token is uninstalled. Fails without installing anything when an
    /// interruption is already pending.
    fn install_interrupt(
        &self,
        thread: SmallId,
        callback: InterruptCallback,
    ) -> Result<InterruptToken, AlreadyInterrupted>;

    /// Remove the callback if it has not fired. Returns whether an
    /// interruption is pending for the token's thread.
    fn uninstall_interrupt(&self, token: InterruptToken) -> bool;

    fn is_interrupt_pending(&self, thread: SmallId) -> bool;

    /// Consume a pending interruption.
    fn clear_interrupt(&self, thread: SmallId);
}

#[derive(Default)]
struct ThreadInterruptState {
    pending: bool,
    installed: Option<(u64, InterruptCallback)>,
}

/// Default [`InterruptSource`]: per-thread pending flags and callbacks.
#[derive(Default)]
pub struct InterruptRegistry {
    threads: DashMap<SmallId, ThreadInterruptState>,
    next_serial: AtomicU64,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `thread` interrupted and wake it if it is blocked in the monitor.
    /// Returns whether a blocked waiter was woken.
    pub fn interrupt(&self, thread: SmallId) -> bool {
        let callback = {
            let mut state = self.threads.entry(thread).or_default();
            state.pending = true;
            state.installed.take()
        };
        // Shard lock released: the callback takes monitor locks.
        match callback {
            Some((serial, callback)) => {
                debug!("delivering interrupt to thread {} (token {})", thread, serial);
                callback();
                true
            }
            None => {
                debug!("thread {} interrupted while not blocked", thread);
                false
            }
        }
    }
}

impl InterruptSource for InterruptRegistry {
    fn install_interrupt(
        &self,
        thread: SmallId,
        callback: InterruptCallback,
    ) -> Result<InterruptToken, AlreadyInterrupted> {
        let mut state = self.threads.entry(thread).or_default();
        if state.pending {
            return Err(AlreadyInterrupted(thread));
        }
        debug_assert!(state.installed.is_none(), "nested interrupt install");
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        state.installed = Some((serial, callback));
        Ok(InterruptToken { thread, serial })
    }

    fn uninstall_interrupt(&self, token: InterruptToken) -> bool {
        let Some(mut state) = self.threads.get_mut(&token.thread) else {
            return false;
        };
        if matches!(state.installed, Some((serial, _)) if serial == token.serial) {
            state.installed = None;
        }
        state.pending
    }

    fn is_interrupt_pending(&self, thread: SmallId) -> bool {
        self.threads.get(&thread).is_some_and(|s| s.pending)
    }

    fn clear_interrupt(&self, thread: SmallId) {
        if let Some(mut state) = self.threads.get_mut(&thread) {
            state.pending = false;
        }
    }
}
