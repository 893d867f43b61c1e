use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Explicit liveness signal for a thread-owned structure.
///
/// The owner clears the flag exactly once, when the thread that owns the structure is exiting
/// (or the structure is otherwise being torn down). Other threads hold clones of the `Arc` and
/// poll the flag to decide whether the structure on the other side is still worth talking to.
///
/// This replaces weak references to threads: we never need to keep a thread (or a stack) alive
/// just to be able to ask whether it is still there.
#[derive(Debug)]
pub(crate) struct Liveness {
    alive: AtomicBool,
}

impl Liveness {
    #[must_use]
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub(crate) fn is_alive(&self) -> bool {
        // Acquire pairs with the Release in `mark_gone()`, so whoever observes the owner as gone
        // also observes everything the owner did before leaving.
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_gone(&self) {
        self.alive.store(false, Ordering::Release);
    }
}
