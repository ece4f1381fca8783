use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Small integer identifying a live thread to the monitor.
///
/// Ids are dense, start at 1 and are reused once the owning thread exits.
/// `SmallId::NONE` (0) is the "unowned" marker inside lock and status words.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SmallId(pub u32);

impl Display for SmallId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SmallId {
    fn from(id: u32) -> Self {
        SmallId(id)
    }
}

impl From<SmallId> for u32 {
    fn from(id: SmallId) -> Self {
        id.0
    }
}

impl SmallId {
    pub const NONE: Self = SmallId(0);

    pub fn new(id: u32) -> Self {
        SmallId(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Generation-checked reference to a slot in the monitor record arena.
///
/// The generation is bumped every time a slot goes back to the free list, so a
/// handle that outlived its record never resolves to the slot's next tenant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct RecordHandle {
    pub index: u32,
    pub generation: u32,
}

impl Display for RecordHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

impl RecordHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        RecordHandle { index, generation }
    }

    pub fn as_usize(self) -> usize {
        self.index as usize
    }
}
