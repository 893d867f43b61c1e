//! The thread-local side of cross-thread recycling.
//!
//! Every thread that recycles objects into stacks owned by other threads keeps one queue per
//! target stack here. The table is bounded: once a thread has `max_delayed_queues_per_thread`
//! entries, any further stack it tries to recycle into gets a "full" marker instead of a queue
//! and all objects this thread recycles into that stack are dropped.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use foldhash::fast::RandomState;
use tracing::trace;

use crate::{DISCARDED_ID, Liveness, Queue, QueueProducer, Recyclable, RecycleError, Stack};

thread_local! {
    static DELAYED: RefCell<DelayedTable> = RefCell::new(DelayedTable::new());
}

/// Recycles `value` into a stack owned by a different thread.
///
/// The value is either parked in the queue from the current thread to `stack` or dropped if the
/// current thread is not allowed to commit more memory to that stack.
pub(crate) fn push_later<T>(stack: &Stack<T>, value: T) -> Result<(), RecycleError<T>>
where
    T: Recyclable,
{
    let outcome = DELAYED.try_with(|table| match table.try_borrow_mut() {
        Ok(mut table) => table.push(stack, value),
        // Re-entered from a `Drop` running inside the table. Treat as a capacity drop.
        Err(_) => Ok(Some(value)),
    });

    match outcome {
        Ok(Ok(rejected)) => {
            // Dropped only now that we no longer hold the table.
            drop(rejected);
            Ok(())
        }
        Ok(Err(error)) => Err(error),
        // The thread is shutting down and the table is gone. The value was dropped with the
        // closure that failed to run, same as any other capacity drop.
        Err(_) => Ok(()),
    }
}

/// Type-erased view of a [`QueueProducer`] stored in the table.
trait DelayedQueue: Any {
    fn is_target_alive(&self) -> bool;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> DelayedQueue for QueueProducer<T>
where
    T: Recyclable,
{
    fn is_target_alive(&self) -> bool {
        QueueProducer::is_target_alive(self)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

enum Entry {
    Queue(Box<dyn DelayedQueue>),

    /// This thread may not recycle into the stack. Holds the stack's liveness so the entry can
    /// be pruned once the stack is gone.
    Full(Arc<Liveness>),
}

impl Entry {
    fn is_target_alive(&self) -> bool {
        match self {
            Self::Queue(queue) => queue.is_target_alive(),
            Self::Full(liveness) => liveness.is_alive(),
        }
    }
}

struct DelayedTable {
    /// Keyed by stack ID. Stack IDs are unique across all recyclers and all item types.
    entries: HashMap<u64, Entry, RandomState>,

    /// Liveness of the current thread, shared with every queue it produces into.
    owner: Arc<Liveness>,
}

impl DelayedTable {
    fn new() -> Self {
        Self {
            entries: HashMap::with_hasher(RandomState::default()),
            owner: Liveness::new(),
        }
    }

    /// Returns `Ok(Some(value))` if the value is to be dropped by the caller.
    fn push<T>(&mut self, stack: &Stack<T>, value: T) -> Result<Option<T>, RecycleError<T>>
    where
        T: Recyclable,
    {
        if let Some(entry) = self.entries.get_mut(&stack.id()) {
            return match entry {
                Entry::Queue(queue) => match queue.as_any_mut().downcast_mut::<QueueProducer<T>>()
                {
                    Some(producer) => producer.add(value),
                    None => discard(value),
                },
                Entry::Full(_) => discard(value),
            };
        }

        let max_queues = stack.config().max_delayed_queues_per_thread;

        if self.entries.len() >= max_queues {
            // Entries for stacks that no longer exist do not count against the limit.
            self.entries.retain(|_, entry| entry.is_target_alive());

            if self.entries.len() >= max_queues {
                trace!(
                    stack_id = stack.id(),
                    max_queues, "delayed queue limit reached, denying stack"
                );

                self.entries
                    .insert(stack.id(), Entry::Full(Arc::clone(stack.liveness())));
                return discard(value);
            }
        }

        let Some(mut producer) = Queue::allocate(stack, Arc::clone(&self.owner)) else {
            // Not even one link fits in the shared capacity. We try again next time.
            return discard(value);
        };

        trace!(stack_id = stack.id(), "attached delayed queue");

        let outcome = producer.add(value);
        self.entries
            .insert(stack.id(), Entry::Queue(Box::new(producer)));

        outcome
    }
}

impl Drop for DelayedTable {
    fn drop(&mut self) {
        // Tell every stack we produce into that no more values are coming from this thread.
        self.owner.mark_gone();
    }
}

/// Drops a value recycled into a stack that cannot take it from this thread.
///
/// The handle is still stamped, so a second recycle of the same object is detected even though
/// the object is never going to be seen by the pool again.
fn discard<T>(value: T) -> Result<Option<T>, RecycleError<T>>
where
    T: Recyclable,
{
    if !value.handle().state().claim(DISCARDED_ID) {
        return Err(RecycleError::InvariantViolation(value));
    }

    Ok(Some(value))
}
