use crate::error::MonitorError;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Milliseconds on a monotonic timeline with an arbitrary origin.
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// How long an enter or wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    Millis(u32),
}

impl Timeout {
    pub const ZERO: Timeout = Timeout::Millis(0);

    /// `System.Threading.Timeout` convention: -1 is infinite, other negative
    /// values are rejected.
    pub fn from_millis_i64(ms: i64) -> Result<Self, MonitorError> {
        match ms {
            -1 => Ok(Timeout::Infinite),
            0..=0xFFFF_FFFE => Ok(Timeout::Millis(ms as u32)),
            _ => Err(MonitorError::InvalidTimeout(ms)),
        }
    }

    pub fn is_zero(self) -> bool {
        self == Timeout::ZERO
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::Millis(d.as_millis().min(u32::MAX as u128) as u32)
    }
}

/// A timeout pinned to a point on a [`Clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at_ms: Option<u64>,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, timeout: Timeout) -> Self {
        let at_ms = match timeout {
            Timeout::Infinite => None,
            Timeout::Millis(ms) => Some(clock.now_ms().saturating_add(ms as u64)),
        };
        Self { at_ms }
    }

    pub fn never() -> Self {
        Self { at_ms: None }
    }

    /// `None` for an infinite deadline, otherwise the time left (possibly zero).
    pub fn remaining(&self, clock: &dyn Clock) -> Option<Duration> {
        self.at_ms
            .map(|at| Duration::from_millis(at.saturating_sub(clock.now_ms())))
    }
}
