use crate::utils::sync::{AtomicU64, Ordering};
use serde::Serialize;
use std::time::Duration;

/// Point-in-time copy of [`MonitorMetrics`].
#[derive(Debug, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub inflations: u64,
    pub inflation_races_lost: u64,
    pub lock_contention_count: u64,
    pub lock_contention_total_us: u64,
    pub enter_timeouts: u64,
    pub enter_cancellations: u64,
    pub waits: u64,
    pub pulses_delivered: u64,
    pub wait_timeouts: u64,
    pub wait_cancellations: u64,
    pub arena_blocks_allocated: u64,
    pub records_reclaimed: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Monitor Statistics:")?;
        writeln!(f, "  Inflations:             {:>10}", self.inflations)?;
        writeln!(f, "  Inflation races lost:   {:>10}", self.inflation_races_lost)?;
        writeln!(
            f,
            "  Contended enters:       {:>10} ({} us blocked)",
            self.lock_contention_count, self.lock_contention_total_us
        )?;
        writeln!(f, "  Enter timeouts:         {:>10}", self.enter_timeouts)?;
        writeln!(f, "  Enter cancellations:    {:>10}", self.enter_cancellations)?;
        writeln!(f, "  Waits:                  {:>10}", self.waits)?;
        writeln!(f, "  Pulses delivered:       {:>10}", self.pulses_delivered)?;
        writeln!(f, "  Wait timeouts:          {:>10}", self.wait_timeouts)?;
        writeln!(f, "  Wait cancellations:     {:>10}", self.wait_cancellations)?;
        writeln!(f, "  Arena blocks allocated: {:>10}", self.arena_blocks_allocated)?;
        writeln!(f, "  Records reclaimed:      {:>10}", self.records_reclaimed)?;
        Ok(())
    }
}

/// Monitor counters.
///
/// All counters use `Ordering::Relaxed` because they are independent and do not
/// synchronize memory between threads.
#[derive(Debug, Default)]
pub struct MonitorMetrics {
    pub inflations: AtomicU64,
    pub inflation_races_lost: AtomicU64,
    /// Number of times a thread had to block waiting for a fat lock
    pub lock_contention_count: AtomicU64,
    /// Total time spent blocked on fat locks (in microseconds)
    pub lock_contention_total_us: AtomicU64,
    pub enter_timeouts: AtomicU64,
    pub enter_cancellations: AtomicU64,
    pub waits: AtomicU64,
    pub pulses_delivered: AtomicU64,
    pub wait_timeouts: AtomicU64,
    pub wait_cancellations: AtomicU64,
    pub arena_blocks_allocated: AtomicU64,
    pub records_reclaimed: AtomicU64,
}

impl MonitorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_inflation(&self) {
        self.inflations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inflation_race_lost(&self) {
        self.inflation_races_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self, duration: Duration) {
        self.lock_contention_count.fetch_add(1, Ordering::Relaxed);
        self.lock_contention_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_enter_timeout(&self) {
        self.enter_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enter_cancellation(&self) {
        self.enter_cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pulses_delivered(&self, count: u64) {
        if count > 0 {
            self.pulses_delivered.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_cancellation(&self) {
        self.wait_cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_arena_block(&self) {
        self.arena_blocks_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, count: u64) {
        if count > 0 {
            self.records_reclaimed.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inflations: self.inflations.load(Ordering::Relaxed),
            inflation_races_lost: self.inflation_races_lost.load(Ordering::Relaxed),
            lock_contention_count: self.lock_contention_count.load(Ordering::Relaxed),
            lock_contention_total_us: self.lock_contention_total_us.load(Ordering::Relaxed),
            enter_timeouts: self.enter_timeouts.load(Ordering::Relaxed),
            enter_cancellations: self.enter_cancellations.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            pulses_delivered: self.pulses_delivered.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            wait_cancellations: self.wait_cancellations.load(Ordering::Relaxed),
            arena_blocks_allocated: self.arena_blocks_allocated.load(Ordering::Relaxed),
            records_reclaimed: self.records_reclaimed.load(Ordering::Relaxed),
        }
    }
}
