use std::any::type_name;
use std::cmp;
use std::env;
use std::fmt;
use std::num::NonZero;
use std::sync::OnceLock;
use std::thread;

use tracing::debug;

use crate::{Factory, Recyclable, Recycler};

const DEFAULT_MAX_CAPACITY_PER_THREAD: usize = 4096;
const DEFAULT_MAX_SHARED_CAPACITY_FACTOR: usize = 2;
const DEFAULT_LINK_CAPACITY: usize = 16;
const DEFAULT_RATIO: usize = 8;

const MAX_CAPACITY_PER_THREAD_VAR: &str = "THREAD_RECYCLER_MAX_CAPACITY_PER_THREAD";
const MAX_SHARED_CAPACITY_FACTOR_VAR: &str = "THREAD_RECYCLER_MAX_SHARED_CAPACITY_FACTOR";
const MAX_DELAYED_QUEUES_PER_THREAD_VAR: &str = "THREAD_RECYCLER_MAX_DELAYED_QUEUES_PER_THREAD";
const LINK_CAPACITY_VAR: &str = "THREAD_RECYCLER_LINK_CAPACITY";
const RATIO_VAR: &str = "THREAD_RECYCLER_RATIO";

/// Normalized, immutable configuration of one recycler, shared by all its stacks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RecyclerConfig {
    /// Zero means pooling is disabled.
    pub(crate) max_capacity_per_thread: usize,
    pub(crate) max_shared_capacity_factor: usize,

    /// `ratio - 1`, with `ratio` a power of two.
    pub(crate) ratio_mask: usize,
    pub(crate) max_delayed_queues_per_thread: usize,

    /// Always a power of two.
    pub(crate) link_capacity: usize,
}

impl RecyclerConfig {
    pub(crate) fn new(
        max_capacity_per_thread: usize,
        max_shared_capacity_factor: usize,
        ratio: usize,
        max_delayed_queues_per_thread: usize,
        link_capacity: usize,
    ) -> Self {
        let ratio_mask = next_power_of_two(ratio).wrapping_sub(1);
        let link_capacity = next_power_of_two(link_capacity);

        if max_capacity_per_thread == 0 {
            return Self {
                max_capacity_per_thread: 0,
                max_shared_capacity_factor: 1,
                ratio_mask,
                max_delayed_queues_per_thread: 0,
                link_capacity,
            };
        }

        Self {
            max_capacity_per_thread,
            max_shared_capacity_factor: cmp::max(max_shared_capacity_factor, 1),
            ratio_mask,
            max_delayed_queues_per_thread,
            link_capacity,
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.max_capacity_per_thread == 0
    }

    /// How many objects other threads may park in queues targeting one stack, together.
    ///
    /// Always enough for at least one link.
    pub(crate) fn shared_capacity(&self) -> usize {
        cmp::max(
            self.max_capacity_per_thread / self.max_shared_capacity_factor,
            self.link_capacity,
        )
    }
}

/// Rounds up to a power of two, treating zero as one and saturating at the largest one.
fn next_power_of_two(value: usize) -> usize {
    cmp::max(value, 1)
        .checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}

/// Process-wide defaults, taken from the environment on first use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Defaults {
    max_capacity_per_thread: usize,
    max_shared_capacity_factor: usize,
    max_delayed_queues_per_thread: usize,
    link_capacity: usize,
    ratio: usize,
}

impl Defaults {
    fn get() -> &'static Self {
        static DEFAULTS: OnceLock<Defaults> = OnceLock::new();

        DEFAULTS.get_or_init(|| {
            let defaults = Self::resolve(|name| env::var(name).ok());
            defaults.log();
            defaults
        })
    }

    fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| -> Option<i64> { lookup(name)?.trim().parse().ok() };

        // Negative values select the default rather than disabling pooling.
        let max_capacity_per_thread = read(MAX_CAPACITY_PER_THREAD_VAR)
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(DEFAULT_MAX_CAPACITY_PER_THREAD);

        let max_shared_capacity_factor = cmp::max(
            read(MAX_SHARED_CAPACITY_FACTOR_VAR)
                .map_or(DEFAULT_MAX_SHARED_CAPACITY_FACTOR, clamp_to_usize),
            DEFAULT_MAX_SHARED_CAPACITY_FACTOR,
        );

        let max_delayed_queues_per_thread = read(MAX_DELAYED_QUEUES_PER_THREAD_VAR)
            .map_or_else(default_max_delayed_queues_per_thread, clamp_to_usize);

        let link_capacity = next_power_of_two(cmp::max(
            read(LINK_CAPACITY_VAR).map_or(DEFAULT_LINK_CAPACITY, clamp_to_usize),
            DEFAULT_LINK_CAPACITY,
        ));

        let ratio = next_power_of_two(read(RATIO_VAR).map_or(DEFAULT_RATIO, clamp_to_usize));

        Self {
            max_capacity_per_thread,
            max_shared_capacity_factor,
            max_delayed_queues_per_thread,
            link_capacity,
            ratio,
        }
    }

    #[cfg_attr(test, mutants::skip)] // Logging only.
    fn log(&self) {
        if self.max_capacity_per_thread == 0 {
            debug!("object recycling disabled by default");
            return;
        }

        debug!(
            max_capacity_per_thread = self.max_capacity_per_thread,
            max_shared_capacity_factor = self.max_shared_capacity_factor,
            max_delayed_queues_per_thread = self.max_delayed_queues_per_thread,
            link_capacity = self.link_capacity,
            ratio = self.ratio,
            "resolved default recycler configuration"
        );
    }
}

/// Negative values become zero, values beyond the range of `usize` saturate.
fn clamp_to_usize(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(usize::MAX)
}

fn default_max_delayed_queues_per_thread() -> usize {
    thread::available_parallelism()
        .map_or(1, NonZero::get)
        .saturating_mul(2)
}

/// Builder for creating an instance of [`Recycler`].
///
/// You only need to use this builder if you want to customize the pool configuration. Any option
/// not set here takes its value from the process-wide defaults, which in turn may be overridden
/// via the following environment variables (read once, on first use):
///
/// * `THREAD_RECYCLER_MAX_CAPACITY_PER_THREAD` (default 4096)
/// * `THREAD_RECYCLER_MAX_SHARED_CAPACITY_FACTOR` (default and minimum 2)
/// * `THREAD_RECYCLER_MAX_DELAYED_QUEUES_PER_THREAD` (default twice the available parallelism)
/// * `THREAD_RECYCLER_LINK_CAPACITY` (default and minimum 16)
/// * `THREAD_RECYCLER_RATIO` (default 8)
///
/// # Examples
///
/// ```
/// use thread_recycler::{Handle, Recyclable, Recycler};
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
///
/// let recycler = Recycler::builder(|handle| Buffer {
///     handle,
///     bytes: Vec::with_capacity(1024),
/// })
/// .max_capacity_per_thread(128)
/// .ratio(1)
/// .build();
///
/// let buffer = recycler.get();
/// assert!(buffer.bytes.capacity() >= 1024);
/// ```
#[must_use]
pub struct RecyclerBuilder<T> {
    factory: Factory<T>,

    max_capacity_per_thread: Option<usize>,
    max_shared_capacity_factor: Option<usize>,
    ratio: Option<usize>,
    max_delayed_queues_per_thread: Option<usize>,
    link_capacity: Option<usize>,
}

impl<T> RecyclerBuilder<T>
where
    T: Recyclable,
{
    pub(crate) fn new(factory: Factory<T>) -> Self {
        Self {
            factory,
            max_capacity_per_thread: None,
            max_shared_capacity_factor: None,
            ratio: None,
            max_delayed_queues_per_thread: None,
            link_capacity: None,
        }
    }

    /// Sets the maximum number of objects each thread retains for reuse.
    ///
    /// Zero disables pooling: [`get()`][Recycler::get] always creates a new object and recycling
    /// never makes an object reusable.
    pub fn max_capacity_per_thread(mut self, value: usize) -> Self {
        self.max_capacity_per_thread = Some(value);
        self
    }

    /// Sets the divisor applied to the per-thread capacity to obtain the number of objects that
    /// other threads may, together, have in flight back to one thread.
    ///
    /// Values below 1 are treated as 1. The resulting budget is never smaller than one link.
    pub fn max_shared_capacity_factor(mut self, value: usize) -> Self {
        self.max_shared_capacity_factor = Some(value);
        self
    }

    /// Sets the damping ratio for objects that have never been retained by the pool: only one in
    /// every `value` of them is kept when recycled.
    ///
    /// Rounded up to a power of two. 0 and 1 both mean every object is kept.
    pub fn ratio(mut self, value: usize) -> Self {
        self.ratio = Some(value);
        self
    }

    /// Sets how many different threads' stacks any one thread may recycle objects into.
    ///
    /// Once a thread has reached this limit, objects it recycles into any further thread's stack
    /// are dropped.
    pub fn max_delayed_queues_per_thread(mut self, value: usize) -> Self {
        self.max_delayed_queues_per_thread = Some(value);
        self
    }

    /// Sets the number of objects in one segment of the queue through which objects are returned
    /// from other threads.
    ///
    /// Rounded up to a power of two.
    pub fn link_capacity(mut self, value: usize) -> Self {
        self.link_capacity = Some(value);
        self
    }

    /// Builds the recycler with the specified configuration.
    #[must_use]
    pub fn build(self) -> Recycler<T> {
        let defaults = Defaults::get();

        let config = RecyclerConfig::new(
            self.max_capacity_per_thread
                .unwrap_or(defaults.max_capacity_per_thread),
            self.max_shared_capacity_factor
                .unwrap_or(defaults.max_shared_capacity_factor),
            self.ratio.unwrap_or(defaults.ratio),
            self.max_delayed_queues_per_thread
                .unwrap_or(defaults.max_delayed_queues_per_thread),
            self.link_capacity.unwrap_or(defaults.link_capacity),
        );

        Recycler::from_parts(config, self.factory)
    }
}

impl<T> fmt::Debug for RecyclerBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("max_capacity_per_thread", &self.max_capacity_per_thread)
            .field("max_shared_capacity_factor", &self.max_shared_capacity_factor)
            .field("ratio", &self.ratio)
            .field(
                "max_delayed_queues_per_thread",
                &self.max_delayed_queues_per_thread,
            )
            .field("link_capacity", &self.link_capacity)
            .finish_non_exhaustive()
    }
}
