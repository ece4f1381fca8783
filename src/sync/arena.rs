//! Block arena of monitor records.
//!
//! Records live in fixed-size blocks that are never freed or moved, so a
//! `&MonitorRecord` resolved from a live object's lock word stays valid for
//! as long as the arena does. Lookups are lock-free: the block directory is a
//! slice of `OnceLock`s sized for the configured capacity up front. The
//! free list, the per-slot back references and growth all sit behind one
//! mutex, which only inflation and reclamation scans take.
use crate::{
    config::{MonitorConfig, MAX_ARENA_RECORDS},
    error::ArenaError,
    metrics::MonitorMetrics,
    object::WeakLink,
    sync::record::MonitorRecord,
    utils::{
        sync::{AtomicU32, Mutex, OnceLock, Ordering},
        RecordHandle,
    },
};
use tracing::{debug, warn};

#[derive(Default)]
struct Slot {
    /// Object the record currently protects. `None` while on the free list.
    link: Option<Box<dyn WeakLink>>,
    next_free: Option<u32>,
}

#[derive(Default)]
struct ArenaState {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    /// Slots past this index have never been handed out.
    next_unused: usize,
    blocks_allocated: usize,
    in_use: usize,
}

/// Source of each arena's first record generation.
static NEXT_ARENA: AtomicU32 = AtomicU32::new(0);

/// Spreads consecutive arena ids across the generation space.
const GENERATION_STRIDE: u32 = 0x9E37_79B9;

pub struct MonitorArena {
    blocks: Box<[OnceLock<Box<[MonitorRecord]>>]>,
    block_size: usize,
    capacity: usize,
    /// Generation every record of this arena starts at, so that handles
    /// minted by another arena rarely match one of ours.
    first_generation: u32,
    state: Mutex<ArenaState>,
}

impl MonitorArena {
    /// Out-of-range geometry from a deserialized or hand-built config is
    /// clamped: at least one record per block and no more records than an
    /// inflated lock word can index.
    pub fn new(config: &MonitorConfig) -> Self {
        let block_size = config.arena_block_size.max(1);
        let capacity = config.max_records.clamp(1, MAX_ARENA_RECORDS);
        if block_size != config.arena_block_size || capacity != config.max_records {
            warn!(
                "monitor arena geometry {} x {} out of range, using {} x {}",
                config.arena_block_size, config.max_records, block_size, capacity
            );
        }
        let blocks = (0..capacity.div_ceil(block_size))
            .map(|_| OnceLock::new())
            .collect();
        let arena_id = NEXT_ARENA.fetch_add(1, Ordering::Relaxed);
        Self {
            blocks,
            block_size,
            capacity,
            first_generation: arena_id.wrapping_mul(GENERATION_STRIDE),
            state: Mutex::new(ArenaState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently protecting an object.
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Records backed by allocated blocks, in use or free.
    pub fn allocated(&self) -> usize {
        self.state.lock().slots.len()
    }

    fn record_at(&self, index: usize) -> Option<&MonitorRecord> {
        self.blocks
            .get(index / self.block_size)?
            .get()?
            .get(index % self.block_size)
    }

    /// The record `handle` names, unless it has been recycled since.
    pub fn resolve(&self, handle: RecordHandle) -> Option<&MonitorRecord> {
        let record = self.record_at(handle.as_usize())?;
        (record.generation() == handle.generation).then_some(record)
    }

    /// Take a free record and tie it to `link`. Falls back to a reclamation
    /// scan, then to growing by one block, before reporting exhaustion.
    pub fn allocate(
        &self,
        link: Box<dyn WeakLink>,
        metrics: &MonitorMetrics,
    ) -> Result<(RecordHandle, &MonitorRecord), ArenaError> {
        let mut state = self.state.lock();

        let index = match self.take_slot(&mut state) {
            Some(index) => index,
            None => {
                let reclaimed = self.reclaim_locked(&mut state);
                metrics.record_reclaimed(reclaimed as u64);
                if reclaimed == 0 {
                    self.grow(&mut state, metrics)?;
                }
                self.take_slot(&mut state).ok_or(ArenaError::Exhausted {
                    capacity: self.capacity,
                })?
            }
        };

        let slot = &mut state.slots[index];
        debug_assert!(slot.link.is_none(), "slot {} handed out twice", index);
        slot.link = Some(link);
        state.in_use += 1;

        let record = self.record_at(index).ok_or(ArenaError::Exhausted {
            capacity: self.capacity,
        })?;
        Ok((RecordHandle::new(index as u32, record.generation()), record))
    }

    fn take_slot(&self, state: &mut ArenaState) -> Option<usize> {
        if let Some(head) = state.free_head {
            state.free_head = state.slots[head as usize].next_free.take();
            return Some(head as usize);
        }
        if state.next_unused < state.slots.len() {
            state.next_unused += 1;
            return Some(state.next_unused - 1);
        }
        None
    }

    fn grow(&self, state: &mut ArenaState, metrics: &MonitorMetrics) -> Result<(), ArenaError> {
        let block_index = state.blocks_allocated;
        let start = state.slots.len();
        if block_index >= self.blocks.len() || start >= self.capacity {
            return Err(ArenaError::Exhausted {
                capacity: self.capacity,
            });
        }

        let len = self.block_size.min(self.capacity - start);
        let records: Box<[MonitorRecord]> = (0..len)
            .map(|_| MonitorRecord::with_generation(self.first_generation))
            .collect();
        let installed = self.blocks[block_index].set(records).is_ok();
        debug_assert!(installed, "arena block {} allocated twice", block_index);

        state.slots.extend((0..len).map(|_| Slot::default()));
        state.blocks_allocated += 1;
        metrics.record_arena_block();
        debug!(
            "monitor arena grew to {} blocks ({} of {} records)",
            state.blocks_allocated,
            state.slots.len(),
            self.capacity
        );
        if state.slots.len() >= self.capacity - self.capacity / 10 {
            warn!(
                "monitor arena at {} of {} records",
                state.slots.len(),
                self.capacity
            );
        }
        Ok(())
    }

    /// Return a record to the free list. False if `handle` is already stale.
    pub fn release(&self, handle: RecordHandle) -> bool {
        let mut state = self.state.lock();
        match self.resolve(handle) {
            Some(_) => {
                self.free_slot(&mut state, handle.as_usize());
                true
            }
            None => false,
        }
    }

    fn free_slot(&self, state: &mut ArenaState, index: usize) {
        if let Some(record) = self.record_at(index) {
            record.retire();
        }
        let head = state.free_head;
        let slot = &mut state.slots[index];
        slot.link = None;
        slot.next_free = head;
        state.free_head = Some(index as u32);
        state.in_use -= 1;
    }

    /// Recycle every record whose object is no longer reachable.
    pub fn reclaim_dead_records(&self, metrics: &MonitorMetrics) -> usize {
        let mut state = self.state.lock();
        let reclaimed = self.reclaim_locked(&mut state);
        metrics.record_reclaimed(reclaimed as u64);
        reclaimed
    }

    fn reclaim_locked(&self, state: &mut ArenaState) -> usize {
        let dead: Vec<usize> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.link.as_ref().is_some_and(|l| !l.is_target_alive()))
            .map(|(index, _)| index)
            .collect();
        for &index in &dead {
            self.free_slot(state, index);
        }
        if !dead.is_empty() {
            debug!("reclaimed {} monitor records of dead objects", dead.len());
        }
        dead.len()
    }

    /// Visit every in-use record with the address of the object it protects,
    /// if that object is still alive.
    pub fn for_each_in_use(&self, mut f: impl FnMut(RecordHandle, &MonitorRecord, Option<usize>)) {
        let state = self.state.lock();
        for (index, slot) in state.slots.iter().enumerate() {
            let (Some(link), Some(record)) = (&slot.link, self.record_at(index)) else {
                continue;
            };
            f(
                RecordHandle::new(index as u32, record.generation()),
                record,
                link.target_address(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sync::{Arc, AtomicBool};

    struct FakeLink(Arc<AtomicBool>);

    impl WeakLink for FakeLink {
        fn is_target_alive(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn arena(block_size: usize, max_records: usize) -> MonitorArena {
        MonitorArena::new(
            &MonitorConfig::new()
                .with_arena_block_size(block_size)
                .with_max_records(max_records),
        )
    }

    fn live() -> (Arc<AtomicBool>, Box<dyn WeakLink>) {
        let flag = Arc::new(AtomicBool::new(true));
        (flag.clone(), Box::new(FakeLink(flag)))
    }

    #[test]
    fn test_grows_one_block_at_a_time() {
        let arena = arena(4, 16);
        let metrics = MonitorMetrics::new();
        let mut flags = Vec::new();
        for _ in 0..5 {
            let (flag, link) = live();
            flags.push(flag);
            arena.allocate(link, &metrics).unwrap();
        }
        assert_eq!(arena.allocated(), 8);
        assert_eq!(arena.in_use(), 5);
        assert_eq!(metrics.snapshot().arena_blocks_allocated, 2);
    }

    #[test]
    fn test_exhaustion_after_failed_reclaim() {
        let arena = arena(2, 3);
        let metrics = MonitorMetrics::new();
        let mut flags = Vec::new();
        for _ in 0..3 {
            let (flag, link) = live();
            flags.push(flag);
            arena.allocate(link, &metrics).unwrap();
        }
        let (_flag, link) = live();
        assert_eq!(
            arena.allocate(link, &metrics).unwrap_err(),
            ArenaError::Exhausted { capacity: 3 }
        );
    }

    #[test]
    fn test_allocation_reclaims_dead_records() {
        let arena = arena(2, 2);
        let metrics = MonitorMetrics::new();
        let (a, link_a) = live();
        let (_b, link_b) = live();
        let (first, _) = arena.allocate(link_a, &metrics).unwrap();
        arena.allocate(link_b, &metrics).unwrap();

        a.store(false, Ordering::SeqCst);
        let (_c, link_c) = live();
        let (reused, _) = arena.allocate(link_c, &metrics).unwrap();

        assert_eq!(reused.index, first.index);
        assert_ne!(reused.generation, first.generation);
        assert!(arena.resolve(first).is_none());
        assert!(arena.resolve(reused).is_some());
        assert_eq!(metrics.snapshot().records_reclaimed, 1);
    }

    #[test]
    fn test_release_recycles_and_invalidates() {
        let arena = arena(8, 8);
        let metrics = MonitorMetrics::new();
        let (_a, link) = live();
        let (handle, _) = arena.allocate(link, &metrics).unwrap();

        assert!(arena.release(handle));
        assert!(!arena.release(handle));
        assert_eq!(arena.in_use(), 0);

        let (_b, link) = live();
        let (again, _) = arena.allocate(link, &metrics).unwrap();
        assert_eq!(again.index, handle.index);
        assert_eq!(again.generation, handle.generation.wrapping_add(1));
    }

    #[test]
    fn test_explicit_reclaim_scan() {
        let arena = arena(4, 8);
        let metrics = MonitorMetrics::new();
        let (a, link_a) = live();
        let (_b, link_b) = live();
        arena.allocate(link_a, &metrics).unwrap();
        arena.allocate(link_b, &metrics).unwrap();

        assert_eq!(arena.reclaim_dead_records(&metrics), 0);
        a.store(false, Ordering::SeqCst);
        assert_eq!(arena.reclaim_dead_records(&metrics), 1);
        assert_eq!(arena.in_use(), 1);

        let mut seen = 0;
        arena.for_each_in_use(|_, _, _| seen += 1);
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_out_of_range_geometry_is_clamped() {
        let zero_blocks = MonitorArena::new(&MonitorConfig {
            arena_block_size: 0,
            max_records: 3,
            ..MonitorConfig::default()
        });
        let metrics = MonitorMetrics::new();
        let mut flags = Vec::new();
        for expected in 0..3 {
            let (flag, link) = live();
            flags.push(flag);
            let (handle, _) = zero_blocks.allocate(link, &metrics).unwrap();
            assert_eq!(handle.index, expected);
        }
        assert_eq!(zero_blocks.allocated(), 3);
        assert_eq!(metrics.snapshot().arena_blocks_allocated, 3);

        let too_wide = MonitorArena::new(&MonitorConfig {
            arena_block_size: 1 << 16,
            max_records: usize::MAX,
            ..MonitorConfig::default()
        });
        assert_eq!(too_wide.capacity(), MAX_ARENA_RECORDS);
    }

    #[test]
    fn test_separate_arenas_start_at_different_generations() {
        let first = arena(4, 4);
        let second = arena(4, 4);
        let metrics = MonitorMetrics::new();
        let (_a, link_a) = live();
        let (_b, link_b) = live();
        let (ours, _) = first.allocate(link_a, &metrics).unwrap();
        let (theirs, _) = second.allocate(link_b, &metrics).unwrap();

        assert_eq!(ours.index, theirs.index);
        assert_ne!(ours.generation, theirs.generation);
        assert!(first.resolve(theirs).is_none());
        assert!(second.resolve(ours).is_none());
    }
}
