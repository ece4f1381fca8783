//! Monitor tuning knobs.
//!
//! ## Environment Variables
//!
//! - `OBJMON_SPIN_COUNT`: CAS attempts a contended enter makes before it
//!   registers as an entry waiter and blocks (default: 30)
//! - `OBJMON_ARENA_BLOCK_SIZE`: monitor records allocated per arena block (default: 64)
//! - `OBJMON_MAX_RECORDS`: arena capacity, at most 2^30 (default: 1048576)
//! - `OBJMON_SLOW_CONTENTION_WARN_MS`: blocked-enter duration after which a
//!   warning is logged (default: 1000)
//!
//! Unparseable or out-of-range values are ignored and the default is kept.
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

/// Largest record index an inflated lock word can carry.
pub const MAX_ARENA_RECORDS: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub spin_count: u32,
    pub arena_block_size: usize,
    pub max_records: usize,
    pub slow_contention_warn_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            spin_count: 30,
            arena_block_size: 64,
            max_records: 1 << 20,
            slow_contention_warn_ms: 1000,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `OBJMON_*` variables that are set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_value::<u32>("OBJMON_SPIN_COUNT") {
            config.spin_count = v;
        }
        if let Some(v) = env_value::<usize>("OBJMON_ARENA_BLOCK_SIZE") {
            if v > 0 {
                config.arena_block_size = v;
            } else {
                warn!("OBJMON_ARENA_BLOCK_SIZE must be positive, keeping {}", config.arena_block_size);
            }
        }
        if let Some(v) = env_value::<usize>("OBJMON_MAX_RECORDS") {
            if v > 0 && v <= MAX_ARENA_RECORDS {
                config.max_records = v;
            } else {
                warn!(
                    "OBJMON_MAX_RECORDS must be in 1..={}, keeping {}",
                    MAX_ARENA_RECORDS, config.max_records
                );
            }
        }
        if let Some(v) = env_value::<u64>("OBJMON_SLOW_CONTENTION_WARN_MS") {
            config.slow_contention_warn_ms = v;
        }
        config
    }

    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    pub fn with_arena_block_size(mut self, block_size: usize) -> Self {
        self.arena_block_size = block_size.max(1);
        self
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.clamp(1, MAX_ARENA_RECORDS);
        self
    }

    pub fn with_slow_contention_warn_ms(mut self, ms: u64) -> Self {
        self.slow_contention_warn_ms = ms;
        self
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {}={:?}: not a valid number", name, raw);
            None
        }
    }
}
