//! Shared newtypes and synchronization re-exports.

pub mod newtypes;
pub mod sync;

pub use newtypes::{RecordHandle, SmallId};
