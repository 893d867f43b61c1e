use std::any::type_name;
use std::fmt;

use thiserror::Error;

/// Reasons why a value could not be returned to a [`Recycler`][crate::Recycler].
///
/// The rejected value is carried inside the error and can be recovered via
/// [`into_inner()`][Self::into_inner]. A rejected recycle never modifies the pool.
///
/// Values that are silently discarded because the pool is at capacity are not errors - from the
/// point of view of the caller, such a recycle succeeded.
#[derive(Error)]
#[non_exhaustive]
pub enum RecycleError<T> {
    /// The value passed to [`Handle::recycle()`][crate::Handle::recycle] is not the object that
    /// the handle manages.
    #[error("value does not belong to the handle it was recycled through")]
    InvalidArgument(T),

    /// The handle is already recycled (or in transit back to its owning thread) and has not been
    /// handed out again since. This indicates a defect in the calling code, typically an object
    /// that was recycled twice, e.g. via a clone of it.
    #[error("handle was recycled again before being handed out by the pool")]
    InvariantViolation(T),
}

impl<T> RecycleError<T> {
    /// Returns the value that was rejected.
    #[must_use]
    pub fn into_inner(self) -> T {
        match self {
            Self::InvalidArgument(value) | Self::InvariantViolation(value) => value,
        }
    }
}

impl<T> fmt::Debug for RecycleError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::InvariantViolation(_) => "InvariantViolation",
        };

        f.debug_tuple(variant)
            .field(&format_args!("<{}>", type_name::<T>()))
            .finish()
    }
}
