//! A thread-affine object pool that lets a program reuse short-lived heap objects instead of
//! allocating new ones.
//!
//! Each thread has its own free-list, so obtaining and returning an object on the same thread
//! involves no synchronization at all. Objects may also be returned from a different thread than
//! the one that obtained them. Such objects travel back to their original thread through a
//! bounded, lock-free queue and are picked up by that thread the next time it needs an object.
//!
//! The pool never blocks and never fails to provide an object. When it is at capacity, it simply
//! drops what it cannot keep.
//!
//! # Pooled types
//!
//! A pooled type implements [`Recyclable`] by storing the [`Handle`] it was created with. The
//! handle is how the pool recognizes the object when it is returned via [`Handle::recycle()`].
//!
//! ```
//! use std::thread;
//!
//! use thread_recycler::{Handle, Recyclable, Recycler};
//!
//! struct Message {
//!     handle: Handle<Message>,
//!     body: Vec<u8>,
//! }
//!
//! impl Recyclable for Message {
//!     fn handle(&self) -> &Handle<Self> {
//!         &self.handle
//!     }
//! }
//!
//! let recycler = Recycler::new(|handle| Message {
//!     handle,
//!     body: Vec::with_capacity(4096),
//! });
//!
//! let mut message = recycler.get();
//! message.body.extend_from_slice(b"hello");
//!
//! // Objects may be returned from any thread.
//! thread::spawn(move || {
//!     message.body.clear();
//!     message.handle.clone().recycle(message).unwrap();
//! })
//! .join()
//! .unwrap();
//!
//! // Once returned, the object is reused by the thread that obtained it.
//! let message = recycler.get();
//! assert!(message.body.is_empty());
//! ```
//!
//! # Bounds
//!
//! The pool bounds how much memory it retains:
//!
//! * Each thread keeps at most [`max_capacity_per_thread`][RecyclerBuilder::max_capacity_per_thread]
//!   objects.
//! * Objects the pool has never kept before are kept only one in every
//!   [`ratio`][RecyclerBuilder::ratio] times, so allocation bursts do not all end up retained.
//! * Objects in flight back to one thread are capped by a budget derived from the per-thread
//!   capacity via [`max_shared_capacity_factor`][RecyclerBuilder::max_shared_capacity_factor].
//! * Each thread returns objects to at most
//!   [`max_delayed_queues_per_thread`][RecyclerBuilder::max_delayed_queues_per_thread] other
//!   threads. Objects it returns to any further thread are dropped.
//!
//! # Misuse
//!
//! Recycling an object twice without obtaining it from the pool in between is a bug in the calling
//! code. It is detected and reported via [`RecycleError::InvariantViolation`], with the pool left
//! intact.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod builder;
mod capacity;
mod delayed;
mod error;
mod handle;
mod liveness;
mod queue;
mod recycler;
mod stack;

pub use builder::*;
pub(crate) use capacity::*;
pub use error::*;
pub use handle::*;
pub(crate) use liveness::*;
pub(crate) use queue::*;
pub use recycler::*;
pub(crate) use stack::*;
