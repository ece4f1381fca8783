//! The object-model boundary.
//!
//! The monitor only needs two things from a heap object: one atomically
//! updatable word to hold its lock state, and a stable address to derive an
//! identity hash from. Everything else about object layout belongs to the
//! surrounding runtime.
use crate::{
    error::MonitorError,
    utils::sync::{Arc, AtomicU64, Ordering, Weak},
};
use std::{borrow::Cow, fmt};

/// Per-object header slot owned by the monitor.
#[derive(Debug, Default)]
pub struct ObjectHeader {
    lock_word: AtomicU64,
}

impl ObjectHeader {
    pub const fn new() -> Self {
        Self {
            lock_word: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn lock_word(&self) -> &AtomicU64 {
        &self.lock_word
    }

    /// Raw lock word bits, for diagnostics.
    pub fn raw_lock_word(&self) -> u64 {
        self.lock_word.load(Ordering::Relaxed)
    }
}

/// Anything the monitor can lock.
pub trait Lockable: Send + Sync + 'static {
    fn header(&self) -> &ObjectHeader;

    fn type_name(&self) -> &str {
        "System.Object"
    }
}

/// Reclamation-side view of the object a monitor record protects.
///
/// The arena holds one of these per in-use record and asks it whether the
/// object is still reachable; it never takes the object's lock to do so.
pub trait WeakLink: Send + Sync {
    fn is_target_alive(&self) -> bool;

    fn target_address(&self) -> Option<usize> {
        None
    }
}

impl<T: Lockable> WeakLink for Weak<T> {
    fn is_target_alive(&self) -> bool {
        self.strong_count() > 0
    }

    fn target_address(&self) -> Option<usize> {
        self.is_target_alive()
            .then(|| self.as_ptr() as *const () as usize)
    }
}

/// A plain lockable heap object.
#[derive(Debug)]
pub struct HeapObject {
    header: ObjectHeader,
    type_name: Cow<'static, str>,
}

impl HeapObject {
    pub fn new(type_name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            header: ObjectHeader::new(),
            type_name: type_name.into(),
        }
    }
}

impl Default for HeapObject {
    fn default() -> Self {
        Self::new("System.Object")
    }
}

impl Lockable for HeapObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }
}

/// Nullable strong reference to a lockable object.
pub struct ObjectRef<T: Lockable = HeapObject>(pub Option<Arc<T>>);

impl<T: Lockable> ObjectRef<T> {
    pub fn new(value: T) -> Self {
        ObjectRef(Some(Arc::new(value)))
    }

    pub fn from_arc(value: Arc<T>) -> Self {
        ObjectRef(Some(value))
    }

    pub fn null() -> Self {
        ObjectRef(None)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    /// The referenced object, or `NullTarget` naming the operation.
    pub fn require(&self, operation: &'static str) -> Result<&Arc<T>, MonitorError> {
        self.0.as_ref().ok_or(MonitorError::NullTarget { operation })
    }

    pub fn downgrade(&self) -> Option<Weak<T>> {
        self.0.as_ref().map(Arc::downgrade)
    }

    /// Address the identity hash is derived from.
    pub fn address(&self) -> Option<usize> {
        self.0.as_ref().map(object_address)
    }
}

impl ObjectRef<HeapObject> {
    pub fn new_object(type_name: impl Into<Cow<'static, str>>) -> Self {
        Self::new(HeapObject::new(type_name))
    }
}

impl<T: Lockable> Clone for ObjectRef<T> {
    fn clone(&self) -> Self {
        ObjectRef(self.0.clone())
    }
}

impl<T: Lockable> Default for ObjectRef<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Lockable> PartialEq for ObjectRef<T> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: Lockable> fmt::Debug for ObjectRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(o) => write!(f, "{}@{:#x}", o.type_name(), object_address(o)),
            None => write!(f, "null"),
        }
    }
}

pub(crate) fn object_address<T: Lockable>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_ref_reports_operation() {
        let null: ObjectRef = ObjectRef::null();
        assert_eq!(
            null.require("Monitor.Enter").unwrap_err(),
            MonitorError::NullTarget {
                operation: "Monitor.Enter"
            }
        );
    }

    #[test]
    fn test_weak_link_tracks_liveness() {
        let obj = ObjectRef::new_object("Foo");
        let weak = obj.downgrade().unwrap();
        assert!(weak.is_target_alive());
        assert_eq!(weak.target_address(), obj.address());
        drop(obj);
        assert!(!weak.is_target_alive());
        assert_eq!(weak.target_address(), None);
    }

    #[test]
    fn test_clone_is_same_identity() {
        let a = ObjectRef::new_object("Foo");
        let b = a.clone();
        let c = ObjectRef::new_object("Foo");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.address(), b.address());
    }
}
