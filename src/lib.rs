//! A concurrent [`XArray`] implementation.
//!
//! `XArray` is an abstract data type functioning like an expansive array of
//! items where each item is a word-sized object such as `Arc<T>`, `Box<T>`
//! or a tagged integer ([`XaValue`]). It is built as a radix tree of
//! fixed-fanout nodes and facilitates efficient access to adjacent entries.
//!
//! The `XArray` is RCU-based, which means:
//! - Multiple concurrent readers are permitted. Readers traverse the tree
//!   without taking the array lock; they only need to pin an epoch guard
//!   (see [`pin`]) for the duration of the read.
//! - Only one writer is allowed at a time. Writers serialize through the
//!   array's internal lock, obtained with [`XArray::lock`].
//! - Readers may see slightly stale data, but never a torn or reclaimed
//!   node: all frees are deferred until every reader that could have
//!   observed the memory has unpinned.
//!
//! In addition to directly manipulating the `XArray`, users can achieve more
//! flexible operations by creating a [`Cursor`] (read-only) or a
//! [`CursorMut`] (through a [`LockedXArray`]) within the array. Entries may
//! also be marked with up to three independent [`XMark`]s, and iterated
//! through [`Range`] and [`MarkedRange`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use xarray::{pin, XArray};
//!
//! let xa: XArray<Arc<u32>> = XArray::new();
//! let guard = pin();
//!
//! assert!(xa.store(&guard, 10, Arc::new(42)).is_none());
//! assert_eq!(**xa.load(&guard, 10).unwrap(), 42);
//! assert!(xa.load(&guard, 11).is_none());
//!
//! assert!(xa.erase(&guard, 10).is_some());
//! assert!(xa.load(&guard, 10).is_none());
//! ```
//!
//! The XArray concept was originally introduced by Linux, which keeps the
//! data structure of [Linux Radix Trees](https://lwn.net/Articles/175432/).

pub use crossbeam_epoch::{pin, Guard};

pub use cursor::{Cursor, CursorMut};
pub use entry::{ArcRef, ItemEntry, XaValue};
pub use mark::{NoneMark, XMark, XaFilter};
pub use node::XNode;
pub use range::{MarkedRange, Range};
pub use xarray::{LockedXArray, XArray, XaFlags};

mod cursor;
mod entry;
mod mark;
mod node;
mod range;
mod state;
mod xarray;

mod test;

pub(crate) const BITS_PER_LAYER: usize = 6;
pub(crate) const SLOT_SIZE: usize = 1 << BITS_PER_LAYER;
pub(crate) const SLOT_MASK: usize = SLOT_SIZE - 1;

/// The errors that XArray operations can surface.
///
/// Only `NoMemory` is recoverable in place: the operation state parks a
/// preallocated node and the operation is retried. The other variants report
/// conditions in the array itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum XaError {
    /// A node could not be allocated without blocking.
    #[error("failed to allocate a tree node")]
    NoMemory,
    /// An entry was already present at the target index.
    #[error("an entry is already present at this index")]
    AlreadyExists,
    /// No entry is present at the target index.
    #[error("no entry is present at this index")]
    NoEntry,
}
