use crate::{
    sync::record::MonitorRecord,
    utils::{RecordHandle, SmallId},
};
use serde::Serialize;
use std::fmt;

/// One inflated lock, as seen by `dump_locks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecordInfo {
    pub record: RecordHandle,
    /// `None` once the object has died but before its record is reclaimed.
    pub object_address: Option<usize>,
    pub owner: Option<SmallId>,
    pub nest: u32,
    pub entry_waiters: u32,
    pub waiting_threads: Vec<SmallId>,
    pub hash_code: Option<i32>,
}

impl LockRecordInfo {
    pub(crate) fn capture(
        record: RecordHandle,
        state: &MonitorRecord,
        object_address: Option<usize>,
    ) -> Self {
        let owner = Some(state.owner()).filter(|o| !o.is_none());
        Self {
            record,
            object_address,
            owner,
            nest: if owner.is_some() { state.nest() } else { 0 },
            entry_waiters: state.entry_count(),
            waiting_threads: state.waiting_threads(),
            hash_code: state.hash_code(),
        }
    }

    pub fn is_held(&self) -> bool {
        self.owner.is_some()
    }
}

impl fmt::Display for LockRecordInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock {}", self.record)?;
        match self.object_address {
            Some(addr) => write!(f, " object {:#x}", addr)?,
            None => write!(f, " object <dead>")?,
        }
        match self.owner {
            Some(owner) => write!(f, ": owned by thread {}, nest {}", owner, self.nest)?,
            None => write!(f, ": not held")?,
        }
        if self.entry_waiters > 0 {
            write!(f, ", {} trying to enter", self.entry_waiters)?;
        }
        if !self.waiting_threads.is_empty() {
            let waiting: Vec<String> = self.waiting_threads.iter().map(|t| t.to_string()).collect();
            write!(f, ", waiting: [{}]", waiting.join(", "))?;
        }
        if let Some(hash) = self.hash_code {
            write!(f, ", hash {:#010x}", hash)?;
        }
        Ok(())
    }
}

/// Snapshot of the arena's inflated locks. Thin locks have no record and are
/// not listed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LockDump {
    pub records: Vec<LockRecordInfo>,
    pub records_in_use: usize,
    pub arena_capacity: usize,
}

impl LockDump {
    pub fn held(&self) -> impl Iterator<Item = &LockRecordInfo> {
        self.records.iter().filter(|r| r.is_held())
    }
}

impl fmt::Display for LockDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{}", record)?;
        }
        write!(
            f,
            "Total locks (in {} of {} monitor records): {}",
            self.records_in_use,
            self.arena_capacity,
            self.held().count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_line() {
        let info = LockRecordInfo {
            record: RecordHandle::new(3, 1),
            object_address: Some(0x1000),
            owner: Some(SmallId(2)),
            nest: 2,
            entry_waiters: 1,
            waiting_threads: vec![SmallId(5), SmallId(6)],
            hash_code: None,
        };
        assert_eq!(
            info.to_string(),
            "Lock #3@1 object 0x1000: owned by thread 2, nest 2, 1 trying to enter, waiting: [5, 6]"
        );
    }

    #[test]
    fn test_dump_counts_held() {
        let free = LockRecordInfo {
            record: RecordHandle::new(0, 0),
            object_address: None,
            owner: None,
            nest: 0,
            entry_waiters: 0,
            waiting_threads: vec![],
            hash_code: Some(9),
        };
        let dump = LockDump {
            records: vec![free],
            records_in_use: 1,
            arena_capacity: 64,
        };
        assert_eq!(dump.held().count(), 0);
        assert!(dump.to_string().ends_with("Total locks (in 1 of 64 monitor records): 0"));
        assert!(dump.to_string().starts_with("Lock #0@0 object <dead>: not held, hash 0x00000009"));
    }
}
