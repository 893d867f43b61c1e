use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::{RecycleError, Stack};

/// Stamp value of a handle that is not recycled (held by a caller or freshly created).
pub(crate) const IDLE: u64 = 0;

/// Stamp value of a handle recycled by the thread that owns its stack.
pub(crate) const OWN_THREAD_ID: u64 = 1;

/// Stamp value of a handle recycled by a foreign thread that was not allowed to park it.
/// The object is dropped but the stamp still guards against a second recycle of an alias.
pub(crate) const DISCARDED_ID: u64 = 2;

static ID_GENERATOR: AtomicU64 = AtomicU64::new(DISCARDED_ID + 1);

/// Returns a process-unique identifier for a recycler, stack or queue.
///
/// Identifiers never collide with the reserved stamp values above.
#[must_use]
pub(crate) fn next_id() -> u64 {
    ID_GENERATOR.fetch_add(1, Ordering::Relaxed)
}

/// A type whose instances can be recycled by a [`Recycler`][crate::Recycler].
///
/// The recycler constructs instances via a factory that receives a fresh [`Handle`]. The instance
/// is expected to store that handle and return it from [`handle()`][Self::handle] for its entire
/// lifetime. The handle is how the pool recognizes the object when it is recycled.
///
/// # Example
///
/// ```
/// use thread_recycler::{Handle, Recyclable};
///
/// struct Buffer {
///     handle: Handle<Buffer>,
///     bytes: Vec<u8>,
/// }
///
/// impl Recyclable for Buffer {
///     fn handle(&self) -> &Handle<Self> {
///         &self.handle
///     }
/// }
/// ```
pub trait Recyclable: Sized + Send + 'static {
    /// Returns the handle this instance was constructed with.
    fn handle(&self) -> &Handle<Self>;
}

/// The recycling token of one pooled object.
///
/// A handle is created by the [`Recycler`][crate::Recycler] when it constructs a new object and
/// stays with that object for its whole life. Returning the object to the pool is done via
/// [`recycle()`][Self::recycle], which may be called from any thread.
///
/// Cloning a handle is cheap and yields a handle that refers to the same pooled object.
pub struct Handle<T> {
    state: Arc<HandleState<T>>,
}

impl<T> Handle<T> {
    pub(crate) fn new(stack: &Arc<Stack<T>>, recycler_id: u64) -> Self {
        Self::with_stack(Arc::downgrade(stack), recycler_id, true)
    }

    /// A handle for a recycler with pooling disabled. Recycling through it does nothing.
    pub(crate) fn disabled(recycler_id: u64) -> Self {
        Self::with_stack(Weak::new(), recycler_id, false)
    }

    /// A handle created when the calling thread can no longer host a stack (e.g. it is
    /// shutting down). Recycling through it drops the object.
    pub(crate) fn detached(recycler_id: u64) -> Self {
        Self::with_stack(Weak::new(), recycler_id, true)
    }

    fn with_stack(stack: Weak<Stack<T>>, recycler_id: u64, recyclable: bool) -> Self {
        Self {
            state: Arc::new(HandleState {
                recycle_id: AtomicU64::new(IDLE),
                last_recycled_id: AtomicU64::new(IDLE),
                has_been_recycled: AtomicBool::new(false),
                stack,
                recycler_id,
                recyclable,
            }),
        }
    }

    /// Whether recycling through this handle can ever make the object reusable.
    ///
    /// This is `false` for objects created by a recycler whose per-thread capacity is zero.
    #[must_use]
    pub fn is_recyclable(&self) -> bool {
        self.state.recyclable
    }

    /// Whether two handles refer to the same pooled object.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn state(&self) -> &HandleState<T> {
        &self.state
    }

    pub(crate) fn recycler_id(&self) -> u64 {
        self.state.recycler_id
    }
}

impl<T> Handle<T>
where
    T: Recyclable,
{
    /// Returns `value` to the pool it was obtained from.
    ///
    /// If called on the thread that obtained the object, the object is made available to the next
    /// [`get()`][crate::Recycler::get] on that thread right away. If called on any other thread,
    /// the object is queued and becomes available to the owning thread during one of its later
    /// `get()` calls.
    ///
    /// The pool may decide to drop the object instead of keeping it (e.g. because it is at
    /// capacity). This is not reported as an error.
    ///
    /// # Errors
    ///
    /// * [`RecycleError::InvalidArgument`] if `value` is not the object this handle manages.
    /// * [`RecycleError::InvariantViolation`] if the object has already been recycled and has not
    ///   been handed out by the pool since.
    ///
    /// In both cases the pool is left untouched and the value is returned inside the error.
    pub fn recycle(&self, value: T) -> Result<(), RecycleError<T>> {
        if !value.handle().ptr_eq(self) {
            return Err(RecycleError::InvalidArgument(value));
        }

        if !self.state.recyclable {
            return Ok(());
        }

        let Some(stack) = self.state.stack.upgrade() else {
            // The owning thread is gone and nobody can hand the object out again.
            drop(value);
            return Ok(());
        };

        stack.push(value)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("recycler_id", &self.state.recycler_id)
            .field("recyclable", &self.state.recyclable)
            .field("recycle_id", &self.state.recycle_id.load(Ordering::Relaxed))
            .field(
                "last_recycled_id",
                &self.state.last_recycled_id.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Recycling bookkeeping shared by all clones of a [`Handle`].
///
/// `last_recycled_id` is claimed (idle -> stamp) by whoever recycles the object. `recycle_id` is
/// set to the same stamp once the object lands in its stack's free-list: immediately for
/// same-thread recycling, during transfer for objects coming from a queue. The two are equal
/// whenever the object sits in a free-list and are reset to idle when it is handed out.
pub(crate) struct HandleState<T> {
    recycle_id: AtomicU64,
    last_recycled_id: AtomicU64,

    /// Only touched by the thread owning the stack. Atomic only to keep the handle `Sync`.
    has_been_recycled: AtomicBool,

    stack: Weak<Stack<T>>,
    recycler_id: u64,
    recyclable: bool,
}

impl<T> HandleState<T> {
    /// Marks the handle as recycled with the given stamp.
    ///
    /// Returns `false` if the handle is not idle, which means this is a second recycle.
    #[must_use]
    pub(crate) fn claim(&self, stamp: u64) -> bool {
        self.last_recycled_id
            .compare_exchange(IDLE, stamp, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the handle for a recycle on the owning thread, which completes immediately.
    #[must_use]
    pub(crate) fn claim_for_owner(&self) -> bool {
        if !self.claim(OWN_THREAD_ID) {
            return false;
        }

        self.recycle_id.store(OWN_THREAD_ID, Ordering::Relaxed);
        true
    }

    /// Completes a recycle that went through a queue.
    ///
    /// Returns `false` if the handle was recycled through a different path in the meantime,
    /// in which case the object must not be handed out again.
    #[must_use]
    pub(crate) fn complete_transfer(&self) -> bool {
        let last_recycled_id = self.last_recycled_id.load(Ordering::Acquire);
        let recycle_id = self.recycle_id.load(Ordering::Relaxed);

        if recycle_id == IDLE {
            self.recycle_id.store(last_recycled_id, Ordering::Relaxed);
            return true;
        }

        recycle_id == last_recycled_id
    }

    /// Whether the stamps agree, as they must for any handle sitting in a free-list.
    #[must_use]
    pub(crate) fn is_settled(&self) -> bool {
        self.recycle_id.load(Ordering::Relaxed) == self.last_recycled_id.load(Ordering::Acquire)
    }

    /// Returns the handle to the idle state as it is handed out by the pool.
    pub(crate) fn reset(&self) {
        self.recycle_id.store(IDLE, Ordering::Relaxed);
        self.last_recycled_id.store(IDLE, Ordering::Release);
    }

    #[must_use]
    pub(crate) fn has_been_recycled(&self) -> bool {
        self.has_been_recycled.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_recycled(&self) {
        self.has_been_recycled.store(true, Ordering::Relaxed);
    }

    /// Overwrites both stamps, simulating a recycle that raced with another one.
    #[cfg(test)]
    pub(crate) fn set_stamps(&self, recycle_id: u64, last_recycled_id: u64) {
        self.recycle_id.store(recycle_id, Ordering::Relaxed);
        self.last_recycled_id.store(last_recycled_id, Ordering::Release);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    struct Item {
        handle: Handle<Item>,
    }

    impl Recyclable for Item {
        fn handle(&self) -> &Handle<Self> {
            &self.handle
        }
    }

    assert_impl_all!(Handle<Item>: Send, Sync, Clone, fmt::Debug);

    #[test]
    fn ids_do_not_collide_with_reserved_stamps() {
        let id = next_id();

        assert_ne!(id, IDLE);
        assert_ne!(id, OWN_THREAD_ID);
        assert_ne!(id, DISCARDED_ID);
        assert!(next_id() > id);
    }

    #[test]
    fn clones_are_equal_distinct_handles_are_not() {
        let a = Handle::<Item>::detached(1);
        let b = Handle::<Item>::detached(1);

        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn second_claim_is_refused() {
        let handle = Handle::<Item>::detached(1);
        let state = handle.state();

        assert!(state.claim(42));
        assert!(!state.claim(42));
        assert!(!state.claim_for_owner());

        state.reset();
        assert!(state.claim_for_owner());
        assert!(state.is_settled());
    }

    #[test]
    fn transfer_completes_queue_claim() {
        let handle = Handle::<Item>::detached(1);
        let state = handle.state();

        assert!(state.claim(42));
        assert!(!state.is_settled());

        assert!(state.complete_transfer());
        assert!(state.is_settled());

        // Repeating the completion for the same stamp is harmless.
        assert!(state.complete_transfer());
    }

    #[test]
    fn transfer_detects_conflicting_stamp() {
        let handle = Handle::<Item>::detached(1);
        let state = handle.state();

        assert!(state.claim_for_owner());

        // Simulate the stamp being rewritten by a different queue.
        state.last_recycled_id.store(77, Ordering::Relaxed);
        assert!(!state.complete_transfer());
        assert!(!state.is_settled());
    }

    #[test]
    fn recycle_of_foreign_value_is_rejected() {
        let a = Item {
            handle: Handle::detached(1),
        };
        let b = Item {
            handle: Handle::detached(1),
        };

        let b_handle = b.handle.clone();
        let error = a.handle.recycle(b).unwrap_err();

        assert!(matches!(error, RecycleError::InvalidArgument(_)));

        // The rejected value comes back untouched and its handle is still idle.
        let b = error.into_inner();
        assert!(b.handle.ptr_eq(&b_handle));
        assert!(b.handle.state().claim_for_owner());
    }

    #[test]
    fn disabled_handle_ignores_recycle() {
        let item = Item {
            handle: Handle::disabled(1),
        };

        assert!(!item.handle.is_recyclable());

        let handle = item.handle.clone();
        handle.recycle(item).unwrap();
    }
}
