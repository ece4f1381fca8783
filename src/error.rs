use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MonitorError {
    /// `exit`, `wait`, `pulse` or `pulse_all` called by a thread that does not
    /// hold the lock.
    #[error("SynchronizationLockException: {operation} called on an object not locked by the current thread")]
    OwnershipViolation { operation: &'static str },

    #[error("ArgumentNullException: {operation} called with a null object")]
    NullTarget { operation: &'static str },

    /// A blocked enter was woken by an external interruption request.
    #[error("ThreadInterruptedException: monitor enter was interrupted")]
    Cancelled,

    #[error("ArgumentOutOfRangeException: timeout of {0} ms is neither infinite (-1) nor non-negative")]
    InvalidTimeout(i64),

    /// The object's lock was inflated by a different `ObjectMonitor`.
    #[error("InvalidOperationException: {operation} called on an object locked through another monitor")]
    ForeignMonitor { operation: &'static str },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ArenaError {
    #[error("monitor record arena exhausted ({capacity} records)")]
    Exhausted { capacity: usize },
}

/// How a `wait` call ended. The lock is held again in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum WaitOutcome {
    Pulsed,
    TimedOut,
    Cancelled,
}
