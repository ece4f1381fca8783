//! Collaborators the monitor consumes from the surrounding runtime.
//!
//! The monitor never creates threads, runs a collector or keeps time on its
//! own. It needs four narrow services, each behind a trait so an embedding
//! runtime can supply its own:
//!
//! - [`ThreadIdentity`]: a small, stable integer for the calling thread.
//! - [`crate::object::WeakLink`]: whether a monitor record's object is still reachable.
//! - [`InterruptSource`]: a way for another thread to wake a blocked waiter.
//! - [`Clock`]: monotonic milliseconds for timeout bookkeeping.
//!
//! [`Collaborators::default`] wires up the in-crate implementations: the
//! process-global small-id allocator, an [`InterruptRegistry`] and a
//! [`MonotonicClock`].
use crate::utils::{sync::Arc, SmallId};

mod clock;
mod interrupt;
mod small_id;

pub use clock::{Clock, Deadline, MonotonicClock, Timeout};
pub use interrupt::{
    AlreadyInterrupted, InterruptCallback, InterruptRegistry, InterruptSource, InterruptToken,
};
pub use small_id::{
    attach_current_thread, current_small_id, detach_current_thread, live_thread_count,
    CurrentThread, MAX_SMALL_ID,
};

pub trait ThreadIdentity: Send + Sync {
    /// Small id of the calling thread, never [`SmallId::NONE`].
    fn current_thread_small_id(&self) -> SmallId;
}

#[derive(Clone)]
pub struct Collaborators {
    pub threads: Arc<dyn ThreadIdentity>,
    pub interrupts: Arc<dyn InterruptSource>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Defaults, but with interrupts delivered through `registry`.
    pub fn with_interrupts(registry: Arc<InterruptRegistry>) -> Self {
        Self {
            interrupts: registry,
            ..Self::default()
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            threads: Arc::new(CurrentThread),
            interrupts: Arc::new(InterruptRegistry::new()),
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}
