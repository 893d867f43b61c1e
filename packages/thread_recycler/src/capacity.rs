use std::sync::atomic::{AtomicUsize, Ordering};

/// The budget of slots that foreign threads may commit to a single stack via their queues.
///
/// Every link in every queue attached to a stack holds a reservation of `link_capacity` slots
/// against this budget. Reservation never blocks: if the budget does not cover the request,
/// the caller is expected to drop the object it wanted to park.
///
/// This is the only atomic in the pool that is contended by arbitrary threads.
#[derive(Debug)]
pub(crate) struct SharedCapacity {
    available: AtomicUsize,
}

impl SharedCapacity {
    #[must_use]
    pub(crate) fn new(available: usize) -> Self {
        Self {
            available: AtomicUsize::new(available),
        }
    }

    /// Attempts to take `space` slots from the budget.
    ///
    /// Returns `false` without modifying the budget if fewer than `space` slots are available.
    #[must_use]
    pub(crate) fn reserve(&self, space: usize) -> bool {
        let mut available = self.available.load(Ordering::Relaxed);

        loop {
            let Some(remaining) = available.checked_sub(space) else {
                return false;
            };

            match self.available.compare_exchange_weak(
                available,
                remaining,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => available = actual,
            }
        }
    }

    /// Returns `space` slots to the budget.
    pub(crate) fn release(&self, space: usize) {
        self.available.fetch_add(space, Ordering::Relaxed);
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }
}
