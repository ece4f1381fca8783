use crate::{
    threading::ThreadIdentity,
    utils::{sync::Mutex, SmallId},
};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeSet,
    sync::LazyLock,
};
use tracing::{error, trace};

/// Largest id a thin lock word can record as its owner.
pub const MAX_SMALL_ID: u32 = (1 << 22) - 1;

#[derive(Debug, Default)]
struct AllocatorState {
    /// Ids returned by exited threads, handed out again lowest-first.
    released: BTreeSet<u32>,
    /// Next never-used id.
    next: u32,
    live: usize,
}

/// Process-global allocator so that every monitor in the process agrees on
/// which small id belongs to which thread.
static SMALL_IDS: LazyLock<Mutex<AllocatorState>> = LazyLock::new(|| {
    Mutex::new(AllocatorState {
        next: 1, // 0 is SmallId::NONE
        ..Default::default()
    })
});

thread_local! {
    /// Cached small id for the current thread
    static CURRENT_SMALL_ID: Cell<SmallId> = const { Cell::new(SmallId::NONE) };
    /// Returns the id to the allocator when the thread exits
    static ATTACHMENT: RefCell<Option<Attachment>> = const { RefCell::new(None) };
}

struct Attachment(SmallId);

impl Drop for Attachment {
    fn drop(&mut self) {
        release(self.0);
        let _ = CURRENT_SMALL_ID.try_with(|id| id.set(SmallId::NONE));
    }
}

fn allocate() -> SmallId {
    let mut state = SMALL_IDS.lock();
    let id = match state.released.pop_first() {
        Some(id) => id,
        None => {
            let id = state.next;
            if id > MAX_SMALL_ID {
                error!("small id space exhausted: {} live threads", state.live);
                panic!("too many live threads for the monitor's small id space");
            }
            state.next += 1;
            id
        }
    };
    state.live += 1;
    SmallId::new(id)
}

fn release(id: SmallId) {
    let mut state = SMALL_IDS.lock();
    debug_assert!(!state.released.contains(&id.as_u32()), "small id {} released twice", id);
    state.released.insert(id.as_u32());
    state.live -= 1;
    trace!("released small id {}", id);
}

/// Register the calling thread, returning its id. Idempotent.
pub fn attach_current_thread() -> SmallId {
    let cached = CURRENT_SMALL_ID.get();
    if !cached.is_none() {
        return cached;
    }

    let id = allocate();
    ATTACHMENT.with(|slot| *slot.borrow_mut() = Some(Attachment(id)));
    CURRENT_SMALL_ID.set(id);
    trace!("attached thread {:?} as small id {}", std::thread::current().id(), id);
    id
}

/// Give the calling thread's id back early. Any lock still held under that id
/// keeps the id as its owner until released.
pub fn detach_current_thread() -> Option<SmallId> {
    ATTACHMENT.with(|slot| slot.borrow_mut().take()).map(|attachment| {
        let id = attachment.0;
        drop(attachment);
        id
    })
}

/// Small id of the calling thread, attaching it on first use.
pub fn current_small_id() -> SmallId {
    attach_current_thread()
}

pub fn live_thread_count() -> usize {
    SMALL_IDS.lock().live
}

/// [`ThreadIdentity`] backed by the process-global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentThread;

impl ThreadIdentity for CurrentThread {
    #[inline]
    fn current_thread_small_id(&self) -> SmallId {
        current_small_id()
    }
}
