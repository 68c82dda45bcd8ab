//! Identity-compared strong and weak handles
//!
//! Hosts own tiles, grass types and exclusion owners through [`Shared`]. The
//! grass system only ever keeps [`WeakHandle`]s to them, so it never extends
//! their lifetime and can ask whether they are still alive. Equality and
//! hashing go through the [`HandleId`] assigned at creation, never through
//! the pointed-to value.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a shared object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Strong, host-owned reference with a stable identity
pub struct Shared<T: ?Sized> {
    id: HandleId,
    inner: Arc<T>,
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self {
            id: HandleId::next(),
            inner: Arc::new(value),
        }
    }
}

impl<T: ?Sized> Shared<T> {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Weak handle with the same identity
    pub fn downgrade(&self) -> WeakHandle<T> {
        WeakHandle {
            id: self.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn arc(&self) -> &Arc<T> {
        &self.inner
    }
}

impl<T: Any + Send + Sync> Shared<T> {
    /// Type-erased weak handle, used to key exclusion boxes by owner
    pub fn owner_handle(&self) -> OwnerHandle {
        let erased: Arc<dyn Any + Send + Sync> = self.inner.clone();
        WeakHandle {
            id: self.id,
            inner: Arc::downgrade(&erased),
        }
    }
}

impl<T: ?Sized> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared({})", self.id.0)
    }
}

/// Weak reference compared by identity
///
/// The referent may be dropped at any time by its owner; [`WeakHandle::is_alive`]
/// reports whether it still exists.
pub struct WeakHandle<T: ?Sized> {
    id: HandleId,
    inner: Weak<T>,
}

/// Weak handle to an arbitrary exclusion-box owner
pub type OwnerHandle = WeakHandle<dyn Any + Send + Sync>;

impl<T: ?Sized> WeakHandle<T> {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<Arc<T>> {
        self.inner.upgrade()
    }
}

impl<T: ?Sized> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> PartialEq for WeakHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: ?Sized> Eq for WeakHandle<T> {}

impl<T: ?Sized> Hash for WeakHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_alive() { "alive" } else { "dead" };
        write!(f, "WeakHandle({}, {})", self.id.0, state)
    }
}
