//! Basic synchronization primitives.
//!
//! Every module in the crate takes its locks, condition variables and atomics
//! from here, so the monitor code never mixes `std::sync` and `parking_lot`
//! guards by accident.
use std::{cell::Cell, thread};

pub use parking_lot::{Condvar, Mutex};
pub use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    Arc, OnceLock, Weak,
};

const SPIN_LIMIT: u32 = 6;

/// Exponential backoff for CAS retry loops.
///
/// The first few steps busy-spin with `spin_loop` hints, doubling each time;
/// after that each step yields the processor. Callers bound the number of
/// steps themselves and fall back to a blocking path once they give up.
#[derive(Debug, Default)]
pub struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `snooze` calls made so far.
    pub fn steps(&self) -> u32 {
        self.step.get()
    }

    pub fn snooze(&self) {
        let step = self.step.get();
        if step <= SPIN_LIMIT {
            for _ in 0..1u32 << step {
                std::hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        self.step.set(step.saturating_add(1));
    }
}
