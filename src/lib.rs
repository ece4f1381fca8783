//! # objmon
//!
//! Per-object reentrant monitors in the style of `System.Threading.Monitor`:
//! lock any heap object, wait on it, pulse it, and ask it for a stable
//! identity hash.
//!
//! Locks start out "thin", encoded entirely in a 64-bit word in the object's
//! [`ObjectHeader`], and only move to a heap-allocated [`MonitorRecord`] when
//! they are contended, nested too deeply or waited on. Records come from a
//! block arena and are recycled once the object they protect has died.
//!
//! ## Environment Variables
//!
//! [`MonitorConfig::from_env`] reads `OBJMON_SPIN_COUNT`,
//! `OBJMON_ARENA_BLOCK_SIZE`, `OBJMON_MAX_RECORDS` and
//! `OBJMON_SLOW_CONTENTION_WARN_MS`; see [`config`].
//!
//! The library logs through `tracing` and never installs a subscriber itself.
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod object;
pub mod sync;
pub mod threading;
pub mod utils;

pub use config::MonitorConfig;
pub use error::{ArenaError, MonitorError, WaitOutcome};
pub use metrics::{MetricsSnapshot, MonitorMetrics};
pub use object::{HeapObject, Lockable, ObjectHeader, ObjectRef, WeakLink};
pub use sync::{LockDump, LockOwner, LockRecordInfo, MonitorOps, MonitorRecord, ObjectMonitor};
pub use threading::{Collaborators, InterruptRegistry, Timeout};
pub use utils::{RecordHandle, SmallId};
