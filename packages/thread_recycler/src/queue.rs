use std::any::type_name;
use std::cell::UnsafeCell;
use std::cmp;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::{ArcSwap, ArcSwapOption};
use tracing::error;

use crate::{
    Discarded, FreeList, Liveness, Recyclable, RecycleError, SharedCapacity, Stack, next_id,
};

/// A fixed-capacity segment of a [`Queue`].
///
/// Exactly one producer (the foreign thread that owns the queue) appends into a link and exactly
/// one consumer (the thread that owns the target stack) drains it. The write index is the
/// hand-off point between the two: the producer publishes each slot before advancing it and the
/// consumer only reads slots below the index it has observed.
pub(crate) struct Link<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,

    /// Only advanced by the producer.
    write_index: AtomicUsize,

    /// Only touched by the consumer. Atomic only to keep the type `Sync`.
    read_index: AtomicUsize,

    /// Set once by the producer when this link is full and it needs another one.
    next: OnceLock<Arc<Link<T>>>,
}

// SAFETY: The slots are handed over from the producer to the consumer via the release/acquire
// pair on `write_index`, so each value is only ever accessed by one thread at a time. The value
// itself moves between threads, hence the `T: Send` requirement.
unsafe impl<T: Send> Send for Link<T> {}
// SAFETY: See above. The producer only touches slots at or beyond `write_index` and the consumer
// only touches slots below it, so no slot is ever accessed concurrently.
unsafe impl<T: Send> Sync for Link<T> {}

impl<T> Link<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| UnsafeCell::new(None)).collect(),
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
            next: OnceLock::new(),
        }
    }

    fn read_index(&self) -> usize {
        self.read_index.load(Ordering::Relaxed)
    }

    fn set_read_index(&self, value: usize) {
        self.read_index.store(value, Ordering::Relaxed);
    }

    /// Places a value in the slot at `index` and publishes it to the consumer.
    ///
    /// # Safety
    ///
    /// Must only be called by the producer of the queue this link belongs to, with `index` equal
    /// to the current write index and less than the capacity of the link.
    unsafe fn publish(&self, index: usize, value: T) {
        let slot = self
            .slots
            .get(index)
            .expect("caller guarantees index is within link capacity");

        // SAFETY: The slot is at the write index, so the consumer has not observed it yet and
        // will not touch it until we advance the index below. We are the only producer.
        unsafe {
            *slot.get() = Some(value);
        }

        self.write_index.store(index.wrapping_add(1), Ordering::Release);
    }

    /// Takes the value out of the slot at `index`.
    ///
    /// # Safety
    ///
    /// Must only be called by the consumer of the queue this link belongs to, with `index`
    /// below a write index the consumer has loaded with `Acquire` ordering.
    unsafe fn take(&self, index: usize) -> Option<T> {
        let slot = self.slots.get(index)?;

        // SAFETY: The producer has published this slot and will never touch it again,
        // and we are the only consumer.
        unsafe { (*slot.get()).take() }
    }
}

impl<T> Drop for Link<T> {
    fn drop(&mut self) {
        // Unchain iteratively, so dropping a long chain does not recurse once per link.
        let mut next = self.next.take();

        while let Some(link) = next {
            next = match Arc::try_unwrap(link) {
                Ok(mut owned) => owned.next.take(),
                // Someone else still references the rest of the chain and will drop it.
                Err(_) => None,
            };
        }
    }
}

/// The channel through which one foreign thread returns objects to one stack.
///
/// The stack owns the consumer side (reachable via its queue list) and the foreign thread owns
/// the producer side ([`QueueProducer`], kept in its thread-local table of delayed queues).
///
/// Every link in the chain from `head` onwards holds a reservation of `link_capacity` slots
/// against the stack's shared capacity. Reservations are released when the consumer moves past
/// a link and, for the remaining links, when the queue is dropped. Once the producer is gone and
/// everything has been consumed, the last link's reservation is released early (see
/// `release_if_drained()`).
pub(crate) struct Queue<T> {
    id: u64,

    /// Oldest link that may still contain unread values. Only touched by the consumer.
    head: ArcSwap<Link<T>>,

    /// Next queue in the queue list of the target stack.
    next: ArcSwapOption<Queue<T>>,

    /// Liveness of the foreign thread producing into this queue.
    owner: Arc<Liveness>,

    /// Liveness of the stack this queue delivers to.
    target: Arc<Liveness>,

    capacity: Arc<SharedCapacity>,
    link_capacity: usize,

    /// Set once the reservation of the last link has been released ahead of `drop()`.
    released: AtomicBool,
}

impl<T> Queue<T> {
    pub(crate) fn next(&self) -> Option<Arc<Self>> {
        self.next.load_full()
    }

    pub(crate) fn set_next(&self, next: Option<Arc<Self>>) {
        self.next.store(next);
    }

    /// Whether the foreign thread that produced into this queue has terminated.
    pub(crate) fn is_orphaned(&self) -> bool {
        !self.owner.is_alive()
    }

    pub(crate) fn is_target_alive(&self) -> bool {
        self.target.is_alive()
    }

    fn advance_head(&self, next: Arc<Link<T>>) {
        self.head.store(next);
        self.capacity.release(self.link_capacity);
    }

    /// Releases the reservation of the last link if the queue is orphaned and fully consumed.
    ///
    /// Consumer side. Does nothing while the producer may still append, or while values are
    /// waiting to be transferred. Releases at most once per queue.
    pub(crate) fn release_if_drained(&self) {
        if !self.is_orphaned() {
            return;
        }

        let head = self.head.load();

        if head.next.get().is_some()
            || head.read_index() != head.write_index.load(Ordering::Acquire)
        {
            return;
        }

        if !self.released.swap(true, Ordering::Relaxed) {
            self.capacity.release(self.link_capacity);
        }
    }

    /// Drops every value that has been published but not yet transferred.
    ///
    /// Consumer side. Used when the target stack is torn down and nobody is going to take the
    /// values anymore.
    pub(crate) fn discard_pending(&self) {
        loop {
            let head = self.head.load_full();

            let start = head.read_index();
            let end = head.write_index.load(Ordering::Acquire);

            for index in start..end {
                // SAFETY: We are the consumer and `index` is below the write index we loaded
                // with `Acquire` ordering above.
                drop(unsafe { head.take(index) });
            }

            head.set_read_index(end);

            if end != self.link_capacity {
                return;
            }

            let Some(next) = head.next.get() else {
                return;
            };

            self.advance_head(Arc::clone(next));
        }
    }
}

impl<T> Queue<T>
where
    T: Recyclable,
{
    /// Creates a queue from the current thread to `stack` and attaches it to the stack.
    ///
    /// Returns `None` if the stack's shared capacity does not cover the first link.
    pub(crate) fn allocate(stack: &Stack<T>, owner: Arc<Liveness>) -> Option<QueueProducer<T>> {
        let link_capacity = stack.config().link_capacity;
        let capacity = stack.shared_capacity();

        if !capacity.reserve(link_capacity) {
            return None;
        }

        let link = Arc::new(Link::new(link_capacity));

        let queue = Arc::new(Self {
            id: next_id(),
            head: ArcSwap::new(Arc::clone(&link)),
            next: ArcSwapOption::const_empty(),
            owner,
            target: Arc::clone(stack.liveness()),
            capacity: Arc::clone(capacity),
            link_capacity,
            released: AtomicBool::new(false),
        });

        stack.attach(Arc::clone(&queue));

        Some(QueueProducer { queue, tail: link })
    }

    /// Moves a run of values from the head link into `dst`.
    ///
    /// Consumer side. Moves no more than `dst` can hold without exceeding its maximum capacity;
    /// anything beyond that stays in the queue for a later transfer.
    ///
    /// Returns `true` if at least one value was added to `dst`.
    pub(crate) fn transfer(&self, dst: &mut FreeList<T>, discarded: &mut Discarded<T>) -> bool {
        let mut head = self.head.load_full();

        if head.read_index() == self.link_capacity {
            let Some(next) = head.next.get() else {
                return false;
            };

            let next = Arc::clone(next);
            self.advance_head(Arc::clone(&next));
            head = next;
        }

        let src_start = head.read_index();
        let mut src_end = head.write_index.load(Ordering::Acquire);

        if src_start == src_end {
            return false;
        }

        let dst_size = dst.len();
        let expected_capacity = dst_size.saturating_add(src_end.saturating_sub(src_start));

        if expected_capacity > dst.capacity() {
            let actual_capacity = dst.increase_capacity(expected_capacity);
            let room = actual_capacity.saturating_sub(dst_size);
            src_end = cmp::min(src_start.saturating_add(room), src_end);
        }

        if src_start == src_end {
            return false;
        }

        for index in src_start..src_end {
            // SAFETY: We are the consumer and `index` is below the write index we loaded
            // with `Acquire` ordering above.
            let Some(element) = (unsafe { head.take(index) }) else {
                continue;
            };

            if !element.handle().state().complete_transfer() {
                error!(
                    queue_id = self.id,
                    "quarantined object that was recycled more than once while in transit"
                );
                discarded.push_value(element);
                continue;
            }

            if dst.should_drop(&element) {
                discarded.push_value(element);
                continue;
            }

            dst.push_transferred(element);
        }

        if src_end == self.link_capacity {
            if let Some(next) = head.next.get() {
                self.advance_head(Arc::clone(next));
            }
        }

        head.set_read_index(src_end);

        dst.len() != dst_size
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Only ever released early once nothing is left beyond the head link.
        if *self.released.get_mut() {
            return;
        }

        // Return the reservations of all links still in the chain.
        let mut link = Some(self.head.load_full());

        while let Some(current) = link {
            self.capacity.release(self.link_capacity);
            link = current.next.get().map(Arc::clone);
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .field("link_capacity", &self.link_capacity)
            .field("orphaned", &self.is_orphaned())
            .finish_non_exhaustive()
    }
}

/// The producer end of a [`Queue`], owned by the foreign thread that recycles through it.
pub(crate) struct QueueProducer<T> {
    queue: Arc<Queue<T>>,

    /// Newest link. Only the producer ever appends to it.
    tail: Arc<Link<T>>,
}

impl<T> QueueProducer<T>
where
    T: Recyclable,
{
    /// Appends a value to the queue.
    ///
    /// Returns the value back via `Ok(Some(_))` if the queue could not take it because the
    /// target stack's shared capacity is exhausted; the caller is expected to drop it.
    pub(crate) fn add(&mut self, value: T) -> Result<Option<T>, RecycleError<T>> {
        if !value.handle().state().claim(self.queue.id) {
            return Err(RecycleError::InvariantViolation(value));
        }

        let link_capacity = self.queue.link_capacity;
        let mut write_index = self.tail.write_index.load(Ordering::Relaxed);

        if write_index == link_capacity {
            if !self.queue.capacity.reserve(link_capacity) {
                return Ok(Some(value));
            }

            let link = Arc::new(Link::new(link_capacity));

            if self.tail.next.set(Arc::clone(&link)).is_err() {
                unreachable!("only the producer chains links and it only does so once per link");
            }

            self.tail = link;
            write_index = 0;
        }

        // SAFETY: We are the only producer and `write_index` is the current write index of the
        // tail link, which we just ensured is below the link capacity.
        unsafe {
            self.tail.publish(write_index, value);
        }

        Ok(None)
    }

    pub(crate) fn is_target_alive(&self) -> bool {
        self.queue.is_target_alive()
    }
}

impl<T> fmt::Debug for QueueProducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
