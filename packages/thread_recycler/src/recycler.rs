use std::any::{Any, type_name};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use foldhash::fast::RandomState;
use tracing::trace;

use crate::{
    Discarded, Handle, Liveness, Recyclable, RecycleError, RecyclerBuilder, RecyclerConfig, Stack,
};

pub(crate) type Factory<T> = Box<dyn Fn(Handle<T>) -> T + Send + Sync>;

/// Number of recyclers dropped so far in the process. Threads compare it against the value they
/// last pruned their registry at, so they only look for dead stacks when there may be some.
static DROPPED_RECYCLERS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The stacks of the current thread, one per recycler that has been used on it.
    static STACKS: RefCell<Registry> = RefCell::new(Registry {
        stacks: HashMap::with_hasher(RandomState::default()),
        pruned_at: 0,
    });
}

struct Registry {
    /// Keyed by recycler ID.
    stacks: HashMap<u64, RegisteredStack, RandomState>,

    /// Value of `DROPPED_RECYCLERS` when this registry was last pruned.
    pruned_at: u64,
}

struct RegisteredStack {
    /// Liveness of the recycler the stack belongs to.
    recycler: Arc<Liveness>,

    /// A `Stack<T>` for the item type of that recycler.
    stack: Arc<dyn Any + Send + Sync>,
}

impl Registry {
    /// Removes the stacks of recyclers that have been dropped since the last call.
    ///
    /// The removed stacks are returned, to be dropped once the registry is no longer borrowed.
    fn prune(&mut self) -> Vec<Arc<dyn Any + Send + Sync>> {
        let dropped = DROPPED_RECYCLERS.load(Ordering::Acquire);

        if dropped == self.pruned_at {
            return Vec::new();
        }

        self.pruned_at = dropped;

        let mut pruned = Vec::new();

        self.stacks.retain(|_, registered| {
            if registered.recycler.is_alive() {
                return true;
            }

            pruned.push(Arc::clone(&registered.stack));
            false
        });

        if !pruned.is_empty() {
            trace!(count = pruned.len(), "pruned stacks of dropped recyclers");
        }

        pruned
    }
}

/// A pool of reusable objects, with a separate free-list for every thread.
///
/// [`get()`][Self::get] takes an object from the calling thread's free-list, creating a new one
/// via the factory if there is none to reuse. Objects are returned to the pool via
/// [`Handle::recycle()`], from any thread. Objects recycled on the thread that obtained them are
/// immediately reusable on that thread. Objects recycled on a different thread travel back to the
/// thread that obtained them and become reusable there during one of its later `get()` calls.
///
/// The pool never blocks. When it decides not to keep an object (because it is at capacity or is
/// damping a burst of new objects), the object is simply dropped.
///
/// The type is cheaply cloneable and all clones refer to the same pool.
///
/// # Examples
///
/// ```
/// use thread_recycler::{Handle, Recyclable, Recycler};
///
/// struct Request {
///     handle: Handle<Request>,
///     path: String,
/// }
///
/// impl Recyclable for Request {
///     fn handle(&self) -> &Handle<Self> {
///         &self.handle
///     }
/// }
///
/// let recycler = Recycler::new(|handle| Request {
///     handle,
///     path: String::new(),
/// });
///
/// let mut request = recycler.get();
/// request.path.push_str("/index.html");
///
/// request.path.clear();
/// request.handle.clone().recycle(request).unwrap();
/// ```
pub struct Recycler<T> {
    inner: Arc<RecyclerInner<T>>,
}

struct RecyclerInner<T> {
    id: u64,
    config: RecyclerConfig,
    factory: Factory<T>,
    liveness: Arc<Liveness>,
}

impl<T> Recycler<T>
where
    T: Recyclable,
{
    /// Creates a recycler with the default configuration.
    ///
    /// The factory is called whenever the pool has nothing to reuse. It receives the handle the
    /// new object must store and return from [`Recyclable::handle()`].
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(Handle<T>) -> T + Send + Sync + 'static,
    {
        Self::builder(factory).build()
    }

    /// Starts building a recycler with a custom configuration.
    pub fn builder<F>(factory: F) -> RecyclerBuilder<T>
    where
        F: Fn(Handle<T>) -> T + Send + Sync + 'static,
    {
        RecyclerBuilder::new(Box::new(factory))
    }

    pub(crate) fn from_parts(config: RecyclerConfig, factory: Factory<T>) -> Self {
        Self {
            inner: Arc::new(RecyclerInner {
                id: crate::next_id(),
                config,
                factory,
                liveness: Liveness::new(),
            }),
        }
    }

    /// Returns an object from the calling thread's free-list or, if there is none, a new one.
    ///
    /// Before creating a new object, this collects objects that other threads have recycled
    /// back to the calling thread.
    #[must_use]
    pub fn get(&self) -> T {
        if self.inner.config.is_disabled() {
            return (self.inner.factory)(Handle::disabled(self.inner.id));
        }

        let Some(stack) = self.thread_local_stack() else {
            // The thread is shutting down or we are being re-entered from the registry.
            return (self.inner.factory)(Handle::detached(self.inner.id));
        };

        let mut discarded = Discarded::default();
        let reused = stack.pop(&mut discarded);

        // Whatever the pool let go of is dropped here, outside of the stack.
        drop(discarded);

        match reused {
            Some(value) => value,
            None => (self.inner.factory)(Handle::new(&stack, self.inner.id)),
        }
    }

    /// Returns `value` to the pool, like [`Handle::recycle()`].
    ///
    /// Returns `Ok(false)` without doing anything if the value was not obtained from this
    /// recycler or was obtained while pooling is disabled, `Ok(true)` otherwise.
    ///
    /// # Errors
    ///
    /// See [`Handle::recycle()`].
    pub fn recycle(&self, value: T) -> Result<bool, RecycleError<T>> {
        let handle = value.handle();

        if !handle.is_recyclable() || handle.recycler_id() != self.inner.id {
            return Ok(false);
        }

        let handle = handle.clone();
        handle.recycle(value)?;

        Ok(true)
    }

    /// Current capacity of the calling thread's free-list.
    ///
    /// This is a diagnostic; the capacity grows on demand up to the configured maximum.
    #[must_use]
    pub fn thread_local_capacity(&self) -> usize {
        if self.inner.config.is_disabled() {
            return 0;
        }

        self.thread_local_stack().map_or(0, |stack| stack.capacity())
    }

    /// Number of objects currently available for reuse in the calling thread's free-list.
    ///
    /// Objects recycled by other threads that have not yet been collected are not counted.
    #[must_use]
    pub fn thread_local_size(&self) -> usize {
        if self.inner.config.is_disabled() {
            return 0;
        }

        self.thread_local_stack().map_or(0, |stack| stack.size())
    }

    /// Returns the calling thread's stack for this recycler, creating it on first use.
    ///
    /// Also lets go of the calling thread's stacks of recyclers that have been dropped.
    fn thread_local_stack(&self) -> Option<Arc<Stack<T>>> {
        let mut pruned = Vec::new();

        let stack = STACKS
            .try_with(|registry| {
                let mut registry = registry.try_borrow_mut().ok()?;

                pruned = registry.prune();

                let registered = registry
                    .stacks
                    .entry(self.inner.id)
                    .or_insert_with(|| RegisteredStack {
                        recycler: Arc::clone(&self.inner.liveness),
                        stack: Stack::<T>::new(self.inner.config),
                    });

                Arc::clone(&registered.stack).downcast::<Stack<T>>().ok()
            })
            .ok()
            .flatten();

        // The pruned stacks drop their pooled objects, which must not happen while we hold the
        // registry.
        drop(pruned);

        stack
    }
}

impl<T> Clone for Recycler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Recycler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for RecyclerInner<T> {
    fn drop(&mut self) {
        self.liveness.mark_gone();
        DROPPED_RECYCLERS.fetch_add(1, Ordering::Release);

        // Only the current thread's stack can be reached from here. Other threads let go of
        // theirs the next time they use any recycler, or when they exit.
        let removed = STACKS
            .try_with(|registry| {
                registry
                    .try_borrow_mut()
                    .ok()
                    .and_then(|mut registry| registry.stacks.remove(&self.id))
            })
            .ok()
            .flatten();

        // The stack drops its pooled objects, which must not happen while we hold the registry.
        drop(removed);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    struct Item {
        handle: Handle<Item>,
        serial: usize,
    }

    impl Recyclable for Item {
        fn handle(&self) -> &Handle<Self> {
            &self.handle
        }
    }

    assert_impl_all!(Recycler<Item>: Send, Sync, Clone, fmt::Debug);

    fn counting_recycler(max_capacity: usize) -> (Recycler<Item>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));

        let recycler = Recycler::builder({
            let created = Arc::clone(&created);
            move |handle| Item {
                handle,
                serial: created.fetch_add(1, Ordering::Relaxed),
            }
        })
        .max_capacity_per_thread(max_capacity)
        .ratio(1)
        .build();

        (recycler, created)
    }

    #[test]
    fn get_creates_then_reuses() {
        let (recycler, created) = counting_recycler(16);

        let item = recycler.get();
        assert_eq!(item.serial, 0);

        assert!(recycler.recycle(item).unwrap());
        assert_eq!(recycler.thread_local_size(), 1);

        let item = recycler.get();
        assert_eq!(item.serial, 0);
        assert_eq!(created.load(Ordering::Relaxed), 1);
        assert_eq!(recycler.thread_local_size(), 0);
    }

    #[test]
    fn recycle_from_other_recycler_is_ignored() {
        let (a, _) = counting_recycler(16);
        let (b, _) = counting_recycler(16);

        let item = a.get();
        assert!(!b.recycle(item).unwrap());
        assert_eq!(a.thread_local_size(), 0);
        assert_eq!(b.thread_local_size(), 0);
    }

    #[test]
    fn disabled_recycler_always_creates() {
        let (recycler, created) = counting_recycler(0);

        let item = recycler.get();
        assert!(!item.handle.is_recyclable());
        assert!(!recycler.recycle(item).unwrap());

        let _item = recycler.get();
        assert_eq!(created.load(Ordering::Relaxed), 2);
        assert_eq!(recycler.thread_local_capacity(), 0);
        assert_eq!(recycler.thread_local_size(), 0);
    }

    #[test]
    fn initial_capacity_is_bounded_by_max() {
        let (small, _) = counting_recycler(10);
        let (large, _) = counting_recycler(100_000);

        assert_eq!(small.thread_local_capacity(), 10);
        assert_eq!(large.thread_local_capacity(), 256);
    }

    #[test]
    fn clones_share_the_pool() {
        let (recycler, created) = counting_recycler(16);
        let clone = recycler.clone();

        let item = recycler.get();
        assert!(clone.recycle(item).unwrap());

        let _item = clone.get();
        assert_eq!(created.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn each_thread_has_its_own_stack() {
        let (recycler, created) = counting_recycler(16);

        let item = recycler.get();
        assert!(recycler.recycle(item).unwrap());

        thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(recycler.thread_local_size(), 0);
                let item = recycler.get();
                assert_eq!(item.serial, 1);
            });
        });

        assert_eq!(recycler.thread_local_size(), 1);
        assert_eq!(created.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn dropping_recycler_releases_thread_local_stack() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted {
            handle: Handle<Counted>,
        }

        impl Recyclable for Counted {
            fn handle(&self) -> &Handle<Self> {
                &self.handle
            }
        }

        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let recycler = Recycler::builder(|handle| Counted { handle })
            .max_capacity_per_thread(16)
            .ratio(1)
            .build();

        let first = recycler.get();
        let second = recycler.get();
        let handle = second.handle.clone();

        recycler.recycle(first).unwrap();
        drop(recycler);

        // The pooled object went down with the stack.
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);

        // Recycling into a stack that no longer exists drops the object.
        handle.recycle(second).unwrap();
        assert_eq!(DROPS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn other_threads_let_go_of_stacks_of_dropped_recycler() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted {
            handle: Handle<Counted>,
        }

        impl Recyclable for Counted {
            fn handle(&self) -> &Handle<Self> {
                &self.handle
            }
        }

        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let dropped = Recycler::builder(|handle| Counted { handle })
            .max_capacity_per_thread(16)
            .ratio(1)
            .build();
        let (kept, _) = counting_recycler(16);

        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        let worker = thread::spawn({
            let dropped = dropped.clone();
            let kept = kept.clone();

            move || {
                let counted = dropped.get();
                dropped.recycle(counted).unwrap();
                assert_eq!(dropped.thread_local_size(), 1);
                drop(dropped);

                let _item = kept.get();

                ready_tx.send(()).unwrap();
                go_rx.recv().unwrap();

                // The worker still holds the pooled object of the dropped recycler.
                assert_eq!(DROPS.load(Ordering::Relaxed), 0);

                // Until it next uses any recycler.
                let _item = kept.get();
                assert_eq!(DROPS.load(Ordering::Relaxed), 1);
            }
        });

        ready_rx.recv().unwrap();
        drop(dropped);
        go_tx.send(()).unwrap();

        worker.join().unwrap();
    }

    #[test]
    fn drop_of_rejected_object_may_use_the_pool() {
        struct Reentrant {
            handle: Handle<Reentrant>,
            pool: Option<Recycler<Reentrant>>,
        }

        impl Recyclable for Reentrant {
            fn handle(&self) -> &Handle<Self> {
                &self.handle
            }
        }

        impl Drop for Reentrant {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let _fresh = pool.get();
                }
            }
        }

        let recycler = Recycler::builder(|handle| Reentrant { handle, pool: None })
            .max_capacity_per_thread(1)
            .ratio(1)
            .build();

        let first = recycler.get();
        let mut second = recycler.get();
        second.pool = Some(recycler.clone());

        recycler.recycle(first).unwrap();

        // The pool is full, so the second object is dropped and its `Drop` calls back in.
        recycler.recycle(second).unwrap();

        assert_eq!(recycler.thread_local_size(), 0);
    }
}
