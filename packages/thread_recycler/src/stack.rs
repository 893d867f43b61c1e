use std::any::type_name;
use std::cell::{RefCell, RefMut};
use std::cmp;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::{
    Liveness, Queue, Recyclable, RecycleError, RecyclerConfig, SharedCapacity, delayed, next_id,
};

/// Upper bound for the initial capacity of a free-list.
const INITIAL_CAPACITY: usize = 256;

/// The per-thread half of a recycler: a free-list owned by one thread, plus the queues through
/// which other threads return objects to it.
///
/// The free-list and the scavenging cursor are only ever touched by the owning thread. Other
/// threads only ever touch the shared capacity counter and the head of the queue list, the latter
/// under `attach_lock`, the only lock in the whole pool.
pub(crate) struct Stack<T> {
    id: u64,
    owner: ThreadId,
    config: RecyclerConfig,
    liveness: Arc<Liveness>,

    /// Budget for all links in all queues attached to this stack.
    shared_capacity: Arc<SharedCapacity>,

    /// Most recently attached queue. Replaced only under `attach_lock`.
    queue_head: ArcSwapOption<Queue<T>>,
    attach_lock: Mutex<()>,

    /// Only accessed from the owning thread (see `local()`) or from `drop()`.
    local: RefCell<LocalState<T>>,
}

// SAFETY: The only field that is not `Sync` is `local`, which is only ever accessed from the
// thread identified by `owner` (enforced by the callers of `local()`) or via `&mut self`.
unsafe impl<T: Send> Sync for Stack<T> {}

struct LocalState<T> {
    free_list: FreeList<T>,

    /// Where the previous scavenging sweep stopped, and the queue before it in the list.
    cursor: Option<Arc<Queue<T>>>,
    prev: Option<Arc<Queue<T>>>,
}

impl<T> Stack<T> {
    pub(crate) fn new(config: RecyclerConfig) -> Arc<Self> {
        let stack = Arc::new(Self {
            id: next_id(),
            owner: thread::current().id(),
            config,
            liveness: Liveness::new(),
            shared_capacity: Arc::new(SharedCapacity::new(config.shared_capacity())),
            queue_head: ArcSwapOption::const_empty(),
            attach_lock: Mutex::new(()),
            local: RefCell::new(LocalState {
                free_list: FreeList::new(&config),
                cursor: None,
                prev: None,
            }),
        });

        trace!(
            stack_id = stack.id,
            max_capacity = config.max_capacity_per_thread,
            shared_capacity = config.shared_capacity(),
            "created stack"
        );

        stack
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn config(&self) -> &RecyclerConfig {
        &self.config
    }

    pub(crate) fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    pub(crate) fn shared_capacity(&self) -> &Arc<SharedCapacity> {
        &self.shared_capacity
    }

    /// Makes a newly created queue visible to the owning thread's scavenging.
    pub(crate) fn attach(&self, queue: Arc<Queue<T>>) {
        let _guard = self.attach_lock.lock();

        queue.set_next(self.queue_head.load_full());
        self.queue_head.store(Some(queue));
    }

    fn local(&self) -> &RefCell<LocalState<T>> {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "stack-local state accessed from a thread that does not own the stack"
        );

        &self.local
    }

    fn try_local(&self) -> Option<RefMut<'_, LocalState<T>>> {
        // If this fails, we have been re-entered by user code running inside the pool (e.g. a
        // `Drop` of a discarded object). The caller treats it as a cache miss.
        self.local().try_borrow_mut().ok()
    }

    /// Capacity of the free-list. Owning thread only.
    pub(crate) fn capacity(&self) -> usize {
        self.try_local().map_or(0, |local| local.free_list.capacity())
    }

    /// Number of objects in the free-list. Owning thread only.
    pub(crate) fn size(&self) -> usize {
        self.try_local().map_or(0, |local| local.free_list.len())
    }

    #[cfg(test)]
    pub(crate) fn has_queues(&self) -> bool {
        self.queue_head.load().is_some()
    }

    #[cfg(test)]
    pub(crate) fn detach_all_queues(&self) {
        let mut queue = self.queue_head.swap(None);

        while let Some(current) = queue {
            queue = current.next();
            current.set_next(None);
        }
    }
}

impl<T> Stack<T>
where
    T: Recyclable,
{
    /// Takes the most recently recycled object from the free-list, scavenging the attached queues
    /// if the free-list is empty. Owning thread only.
    ///
    /// Returns `None` if there is nothing to reuse, in which case the caller creates a new object.
    pub(crate) fn pop(&self, discarded: &mut Discarded<T>) -> Option<T> {
        let mut local = self.try_local()?;

        loop {
            if local.free_list.is_empty() && !self.scavenge(&mut local, discarded) {
                return None;
            }

            let value = local.free_list.pop()?;
            let state = value.handle().state();

            if !state.is_settled() {
                error!(
                    stack_id = self.id,
                    "quarantined object that was recycled multiple times"
                );
                discarded.push_value(value);
                continue;
            }

            state.reset();
            return Some(value);
        }
    }

    /// Returns an object to this stack, from whatever thread the caller is on.
    pub(crate) fn push(&self, value: T) -> Result<(), RecycleError<T>> {
        if thread::current().id() == self.owner {
            self.push_now(value)
        } else {
            delayed::push_later(self, value)
        }
    }

    fn push_now(&self, value: T) -> Result<(), RecycleError<T>> {
        if !value.handle().state().claim_for_owner() {
            return Err(RecycleError::InvariantViolation(value));
        }

        let rejected = match self.try_local() {
            Some(mut local) => local.free_list.push(value),
            None => Some(value),
        };

        // Dropped only now that we no longer hold the local state.
        drop(rejected);

        Ok(())
    }

    fn scavenge(&self, local: &mut LocalState<T>, discarded: &mut Discarded<T>) -> bool {
        if self.scavenge_some(local, discarded) {
            return true;
        }

        // Nothing anywhere. Start from the beginning next time.
        local.prev = None;
        local.cursor = self.queue_head.load_full();
        false
    }

    /// Continues the sweep over the attached queues from where the previous one stopped,
    /// until one queue yields something or the end of the list is reached.
    fn scavenge_some(&self, local: &mut LocalState<T>, discarded: &mut Discarded<T>) -> bool {
        let (mut cursor, mut prev) = match local.cursor.take() {
            Some(cursor) => (Some(cursor), local.prev.take()),
            None => {
                let head = self.queue_head.load_full();

                if head.is_none() {
                    return false;
                }

                (head, None)
            }
        };

        let mut success = false;

        while let Some(current) = cursor.take() {
            if current.transfer(&mut local.free_list, discarded) {
                success = true;
                cursor = Some(current);
                break;
            }

            let next = current.next();

            if current.is_orphaned() {
                // The foreign thread is gone. Take whatever it left behind.
                while current.transfer(&mut local.free_list, discarded) {
                    success = true;
                }

                current.release_if_drained();

                match &prev {
                    Some(prev) => {
                        trace!(stack_id = self.id, "unlinking orphaned queue");

                        prev.set_next(next.clone());

                        // The queue returns its capacity reservations when dropped, which may also
                        // drop values still stuck in it - not while we hold the local state.
                        discarded.push_queue(current);
                    }
                    // The first queue in the list may only be replaced under the attach lock,
                    // so we leave it in place. Its capacity was released above once drained.
                    None => prev = Some(current),
                }
            } else {
                prev = Some(current);
            }

            cursor = next;

            if success {
                break;
            }
        }

        local.prev = prev;
        local.cursor = cursor;

        success
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        self.liveness.mark_gone();

        // Foreign threads may still hold the producer ends of our queues. Whatever they have
        // already handed over is dropped now, which also returns their link reservations.
        let mut queue = self.queue_head.swap(None);

        while let Some(current) = queue {
            current.discard_pending();
            queue = current.next();
            current.set_next(None);
        }

        trace!(stack_id = self.id, "stack torn down");
    }
}

impl<T> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("config", &self.config)
            .field("shared_capacity", &self.shared_capacity)
            .finish_non_exhaustive()
    }
}

/// LIFO free-list of recycled objects, with growth and drop policy.
pub(crate) struct FreeList<T> {
    elements: Vec<T>,

    /// Logical capacity; the `Vec` may have allocated more.
    capacity: usize,
    max_capacity: usize,
    ratio_mask: usize,

    /// Counts recycle attempts on objects that have never been kept before. Starts one below
    /// zero so that the very first such object is kept.
    recycle_attempts: usize,
}

impl<T> FreeList<T> {
    pub(crate) fn new(config: &RecyclerConfig) -> Self {
        let capacity = cmp::min(INITIAL_CAPACITY, config.max_capacity_per_thread);

        Self {
            elements: Vec::with_capacity(capacity),
            capacity,
            max_capacity: config.max_capacity_per_thread,
            ratio_mask: config.ratio_mask,
            recycle_attempts: usize::MAX,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.elements.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.elements.pop()
    }

    /// Doubles the capacity until it reaches `expected_capacity` or the maximum capacity.
    ///
    /// Returns the new capacity.
    pub(crate) fn increase_capacity(&mut self, expected_capacity: usize) -> usize {
        let mut new_capacity = cmp::max(self.capacity, 1);

        loop {
            new_capacity = new_capacity.saturating_mul(2);

            if new_capacity >= expected_capacity || new_capacity >= self.max_capacity {
                break;
            }
        }

        let new_capacity = cmp::min(new_capacity, self.max_capacity);

        if new_capacity > self.capacity {
            self.elements
                .reserve_exact(new_capacity.saturating_sub(self.elements.len()));
            self.capacity = new_capacity;
        }

        self.capacity
    }

    /// Appends a value moved over from a queue. The caller has made room for it.
    pub(crate) fn push_transferred(&mut self, value: T) {
        debug_assert!(self.elements.len() < self.capacity);

        self.elements.push(value);
    }
}

impl<T> FreeList<T>
where
    T: Recyclable,
{
    /// Applies the drop policy to an object that is being recycled.
    ///
    /// Objects that have been kept once are always kept. Of the objects that have never been
    /// kept, only one in every `ratio` is, so that bursts of allocations do not all end up
    /// retained by the pool.
    pub(crate) fn should_drop(&mut self, value: &T) -> bool {
        let state = value.handle().state();

        if state.has_been_recycled() {
            return false;
        }

        self.recycle_attempts = self.recycle_attempts.wrapping_add(1);

        if self.recycle_attempts & self.ratio_mask != 0 {
            return true;
        }

        state.mark_recycled();
        false
    }

    /// Appends a value recycled on the owning thread.
    ///
    /// Returns the value back if the drop policy or the maximum capacity reject it.
    #[must_use]
    pub(crate) fn push(&mut self, value: T) -> Option<T> {
        let size = self.elements.len();

        if size >= self.max_capacity || self.should_drop(&value) {
            return Some(value);
        }

        if size == self.capacity {
            self.increase_capacity(size.saturating_add(1));
        }

        self.elements.push(value);
        None
    }
}

/// Objects and queues let go of while the owning thread holds its stack-local state.
///
/// Dropping either may run user code (the `Drop` of a pooled type) that re-enters the pool,
/// so they are collected here and dropped once the local state is released.
pub(crate) struct Discarded<T> {
    values: Vec<T>,
    queues: Vec<Arc<Queue<T>>>,
}

impl<T> Discarded<T> {
    pub(crate) fn push_value(&mut self, value: T) {
        self.values.push(value);
    }

    pub(crate) fn push_queue(&mut self, queue: Arc<Queue<T>>) {
        self.queues.push(queue);
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.values.is_empty() && self.queues.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn values(&self) -> &[T] {
        &self.values
    }
}

impl<T> Default for Discarded<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            queues: Vec::new(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Handle, OWN_THREAD_ID};

    struct Item {
        handle: Handle<Item>,
        id: usize,
    }

    impl Recyclable for Item {
        fn handle(&self) -> &Handle<Self> {
            &self.handle
        }
    }

    assert_impl_all!(Stack<Item>: Send, Sync);

    fn config(max_capacity: usize, ratio: usize) -> RecyclerConfig {
        RecyclerConfig::new(max_capacity, 2, ratio, 4, 4)
    }

    fn new_item(stack: &Arc<Stack<Item>>, id: usize) -> Item {
        Item {
            handle: Handle::new(stack, 0),
            id,
        }
    }

    fn pop(stack: &Stack<Item>) -> Option<Item> {
        let mut discarded = Discarded::default();
        stack.pop(&mut discarded)
    }

    #[test]
    fn pop_on_empty_stack_returns_none() {
        let stack = Stack::<Item>::new(config(16, 1));
        assert!(pop(&stack).is_none());
    }

    #[test]
    fn push_then_pop_is_lifo() {
        let stack = Stack::new(config(16, 1));

        stack.push(new_item(&stack, 1)).unwrap();
        stack.push(new_item(&stack, 2)).unwrap();

        assert_eq!(pop(&stack).unwrap().id, 2);
        assert_eq!(pop(&stack).unwrap().id, 1);
        assert!(pop(&stack).is_none());
    }

    #[test]
    fn popped_handle_is_idle_again() {
        let stack = Stack::new(config(16, 1));

        stack.push(new_item(&stack, 1)).unwrap();
        let item = pop(&stack).unwrap();

        // Idle handles can be claimed, proving the stamps were reset.
        stack.push(item).unwrap();
        assert_eq!(stack.size(), 1);
    }

    #[test]
    fn double_push_is_violation() {
        let stack = Stack::new(config(16, 1));

        let item = new_item(&stack, 1);
        let alias = Item {
            handle: item.handle.clone(),
            id: 1,
        };

        stack.push(item).unwrap();

        assert!(matches!(
            stack.push(alias),
            Err(RecycleError::InvariantViolation(_))
        ));
        assert_eq!(stack.size(), 1);
    }

    #[test]
    fn push_beyond_max_capacity_drops() {
        let stack = Stack::new(config(2, 1));

        for id in 0..3 {
            stack.push(new_item(&stack, id)).unwrap();
        }

        assert_eq!(stack.size(), 2);
        assert_eq!(pop(&stack).unwrap().id, 1);
    }

    #[test]
    fn capacity_doubles_up_to_max() {
        let stack = Stack::new(config(1000, 1));
        assert_eq!(stack.capacity(), 256);

        for id in 0..257 {
            stack.push(new_item(&stack, id)).unwrap();
        }

        assert_eq!(stack.capacity(), 512);

        for id in 257..1000 {
            stack.push(new_item(&stack, id)).unwrap();
        }

        assert_eq!(stack.capacity(), 1000);
        assert_eq!(stack.size(), 1000);
    }

    #[test]
    fn ratio_keeps_one_in_n_new_objects() {
        let stack = Stack::new(config(64, 4));

        for id in 0..8 {
            stack.push(new_item(&stack, id)).unwrap();
        }

        // Attempts 0 and 4 are kept.
        assert_eq!(stack.size(), 2);
        assert_eq!(pop(&stack).unwrap().id, 4);
        assert_eq!(pop(&stack).unwrap().id, 0);
    }

    #[test]
    fn kept_objects_bypass_ratio() {
        let stack = Stack::new(config(64, 4));

        stack.push(new_item(&stack, 0)).unwrap();

        for _ in 0..10 {
            let item = pop(&stack).unwrap();
            stack.push(item).unwrap();
        }

        assert_eq!(stack.size(), 1);
    }

    #[test]
    fn foreign_push_is_collected_by_scavenging() {
        let stack = Stack::new(config(64, 1));
        let items: Vec<_> = (0..3).map(|id| new_item(&stack, id)).collect();

        thread::scope(|s| {
            s.spawn(|| {
                for item in items {
                    stack.push(item).unwrap();
                }
            });
        });

        assert_eq!(stack.size(), 0);
        assert!(stack.has_queues());

        let mut ids: Vec<_> = (0..3).map(|_| pop(&stack).unwrap().id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(pop(&stack).is_none());
    }

    #[test]
    fn orphaned_queues_are_unlinked_and_release_capacity() {
        let stack = Stack::new(config(256, 1));
        let initial = stack.shared_capacity().available();

        // Three foreign threads, each attaching one queue and exiting.
        for id in 0..3 {
            let item = new_item(&stack, id);
            let stack = Arc::clone(&stack);

            thread::spawn(move || stack.push(item).unwrap())
                .join()
                .unwrap();
        }

        assert_eq!(stack.shared_capacity().available(), initial - 12);

        let mut ids: Vec<_> = (0..3).map(|_| pop(&stack).unwrap().id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);

        // Sweep once more so the remaining orphans get unlinked.
        assert!(pop(&stack).is_none());
        assert!(pop(&stack).is_none());

        // The first queue in the list stays attached but, being drained, holds no capacity.
        assert_eq!(stack.shared_capacity().available(), initial);
    }

    #[test]
    fn exited_foreign_thread_returns_its_capacity() {
        // Shared capacity is max(8 / 2, 4) = 4, enough for exactly one link.
        let stack = Stack::new(config(8, 1));
        let initial = stack.shared_capacity().available();
        assert_eq!(initial, 4);

        let push_on_new_thread = |item: Item| {
            let stack = Arc::clone(&stack);
            thread::spawn(move || stack.push(item).unwrap())
                .join()
                .unwrap();
        };

        push_on_new_thread(new_item(&stack, 1));
        assert_eq!(pop(&stack).unwrap().id, 1);

        // Finds the queue drained and its producer gone.
        assert!(pop(&stack).is_none());
        assert_eq!(stack.shared_capacity().available(), initial);

        // Another thread can now park an object.
        push_on_new_thread(new_item(&stack, 2));

        let reused = (0..3).find_map(|_| pop(&stack));
        assert_eq!(reused.map(|item| item.id), Some(2));
    }

    #[test]
    fn pop_quarantines_unsettled_object() {
        let stack = Stack::new(config(16, 1));

        stack.push(new_item(&stack, 1)).unwrap();

        let bad = new_item(&stack, 2);
        let bad_handle = bad.handle.clone();
        stack.push(bad).unwrap();

        // A conflicting recycle rewrote the stamp while the object sat in the free-list.
        bad_handle.state().set_stamps(OWN_THREAD_ID, 77);

        let mut discarded = Discarded::default();
        assert_eq!(stack.pop(&mut discarded).unwrap().id, 1);

        let quarantined: Vec<_> = discarded.values().iter().map(|item| item.id).collect();
        assert_eq!(quarantined, vec![2]);

        assert!(stack.pop(&mut discarded).is_none());
        assert_eq!(discarded.values().len(), 1);
    }

    #[test]
    fn pop_of_only_unsettled_object_yields_nothing() {
        let stack = Stack::new(config(16, 1));

        let bad = new_item(&stack, 1);
        let bad_handle = bad.handle.clone();
        stack.push(bad).unwrap();

        bad_handle.state().set_stamps(OWN_THREAD_ID, 77);

        let mut discarded = Discarded::default();
        assert!(stack.pop(&mut discarded).is_none());
        assert_eq!(discarded.values().len(), 1);
        assert_eq!(stack.size(), 0);
    }

    #[test]
    fn teardown_drops_pending_foreign_values() {
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

        let (stack_tx, stack_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        // The foreign thread outlives the stack, keeping its queue alive.
        let foreign = thread::spawn(move || {
            let (stack, values): (Arc<Stack<Counted>>, Vec<Counted>) = stack_rx.recv().unwrap();

            for value in values {
                stack.push(value).unwrap();
            }

            drop(stack);
            done_rx.recv().unwrap();
        });

        let stack = Stack::new(config(64, 1));
        let values: Vec<_> = (0..3)
            .map(|_| Counted {
                handle: Handle::new(&stack, 0),
            })
            .collect();

        stack_tx.send((Arc::clone(&stack), values)).unwrap();

        // Wait until the foreign thread has released its reference to the stack.
        while Arc::strong_count(&stack) > 1 {
            thread::yield_now();
        }

        drop(stack);
        assert_eq!(DROPS.load(Ordering::Relaxed), 3);

        done_tx.send(()).unwrap();
        foreign.join().unwrap();
    }

    #[test]
    fn increase_capacity_is_capped() {
        let mut free_list = FreeList::<Item>::new(&config(300, 1));

        assert_eq!(free_list.capacity(), 256);
        assert_eq!(free_list.increase_capacity(257), 300);
        assert_eq!(free_list.increase_capacity(1000), 300);
    }
}
