use std::marker::PhantomData;
use std::ops;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::Guard;
use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::cursor::{wrap_item, Cursor, CursorMut};
use crate::entry::{drop_item_raw, ItemEntry, XEntry};
use crate::mark::{NoneMark, XMark, XaFilter};
use crate::range::{MarkedRange, Range};
use crate::state::XaState;
use crate::{XaError, SLOT_SIZE};

/// Configuration flags of an `XArray`, fixed at initialization.
///
/// The lock-class flags record the contexts the array lock is taken from;
/// they select no different runtime behavior here, but callers that classify
/// their lock contexts can carry the classification with the array. All
/// other bits are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XaFlags(usize);

impl XaFlags {
    pub const NONE: Self = Self(0);
    /// The array lock is also taken from interrupt-like contexts.
    pub const LOCK_IRQ: Self = Self(1);
    /// The array lock is also taken from softirq-like contexts.
    pub const LOCK_BH: Self = Self(2);

    const LOCK_MASK: usize = 3;

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for XaFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A witness that the array lock is held.
///
/// Every mutating operation of the tree takes one, so that the locking
/// discipline is visible in the signatures rather than in comments.
#[derive(Clone, Copy)]
pub(crate) struct XLockGuard<'a>(PhantomData<&'a ()>);

impl<'a> XLockGuard<'a> {
    pub(crate) fn new(_guard: &'a MutexGuard<'_, ()>) -> Self {
        Self(PhantomData)
    }
}

/// The head word and flag word of an `XArray`, shared between the typed
/// array handle and the untyped operation state.
///
/// If the array is empty the head is null; if the only entry is at index 0
/// the head holds that entry directly; otherwise the head points to a node.
/// The flag word combines the configuration bits with one runtime bit per
/// mark meaning "some entry in this array carries this mark".
pub(crate) struct RawXArray {
    head: AtomicUsize,
    flags: AtomicUsize,
}

const MARK_FLAG_SHIFT: usize = 2;

impl RawXArray {
    const fn new(flags: usize) -> Self {
        Self {
            head: AtomicUsize::new(0),
            flags: AtomicUsize::new(flags),
        }
    }

    pub(crate) fn head(&self) -> XEntry {
        XEntry::from_raw(self.head.load(Ordering::Acquire))
    }

    pub(crate) fn set_head(&self, _guard: XLockGuard, entry: XEntry) {
        self.head.store(entry.raw(), Ordering::Release);
    }

    fn head_mut(&mut self) -> XEntry {
        XEntry::from_raw(*self.head.get_mut())
    }

    pub(crate) fn is_marked(&self, mark: XMark) -> bool {
        self.flags.load(Ordering::Relaxed) & (1 << (MARK_FLAG_SHIFT + mark.index())) != 0
    }

    pub(crate) fn set_mark(&self, _guard: XLockGuard, mark: XMark) {
        self.flags
            .fetch_or(1 << (MARK_FLAG_SHIFT + mark.index()), Ordering::Relaxed);
    }

    pub(crate) fn unset_mark(&self, _guard: XLockGuard, mark: XMark) {
        self.flags
            .fetch_and(!(1 << (MARK_FLAG_SHIFT + mark.index())), Ordering::Relaxed);
    }

    fn lock_flags(&self) -> XaFlags {
        XaFlags(self.flags.load(Ordering::Relaxed) & XaFlags::LOCK_MASK)
    }
}

/// `XArray` is an abstract data type functioning like an expansive array of
/// items where each item is a word-sized object implementing [`ItemEntry`],
/// such as `Arc<T>`, `Box<T>` or [`XaValue`](crate::XaValue).
///
/// The array is a radix tree of [`XNode`](crate::XNode)s with a fanout of
/// `SLOT_SIZE` slots per node; it grows in height as larger indices are
/// stored and shrinks back when it could fit in fewer levels. If the array
/// holds exactly one entry at index 0, the entry lives in the head itself
/// and no node is allocated.
///
/// Reads are lock-free: they require only a pinned epoch guard (see
/// [`pin`](crate::pin)), under which every observed node and item stays
/// alive. Writes serialize through the internal lock; use the operations on
/// `XArray` directly (which lock internally), or take [`XArray::lock`] and
/// drive a [`CursorMut`] through multi-step operations.
///
/// A multi-index entry stored with [`XArray::store_order`] occupies a whole
/// aligned power-of-two range of indices and behaves as a single logical
/// entry for load, mark and erase at any covered index.
///
/// Entries can carry up to three independent marks (see
/// [`XMark`]); per-array summary bits record whether any entry carries a
/// given mark.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use xarray::{pin, XArray};
///
/// let xa: XArray<Arc<u32>> = XArray::new();
/// let guard = pin();
///
/// assert!(xa.store(&guard, 117, Arc::new(7)).is_none());
/// assert_eq!(**xa.load(&guard, 117).unwrap(), 7);
/// assert!(xa.erase(&guard, 117).is_some());
/// ```
///
/// The XArray concept was originally introduced by Linux, which keeps the
/// data structure of [Linux Radix Trees](https://lwn.net/Articles/175432/).
pub struct XArray<I, M = NoneMark>
where
    I: ItemEntry + Send + Sync,
    M: Into<XMark>,
{
    raw: RawXArray,
    xlock: Mutex<()>,
    _marker: PhantomData<(I, M)>,
}

impl<I: ItemEntry + Send + Sync, M: Into<XMark>> Default for XArray<I, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ItemEntry + Send + Sync, M: Into<XMark>> XArray<I, M> {
    /// Makes a new, empty `XArray`.
    pub const fn new() -> Self {
        Self::with_flags(XaFlags::NONE)
    }

    /// Makes a new, empty `XArray` with the given configuration flags.
    pub const fn with_flags(flags: XaFlags) -> Self {
        Self {
            raw: RawXArray::new(flags.0 & XaFlags::LOCK_MASK),
            xlock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> &RawXArray {
        &self.raw
    }

    /// The configuration flags this array was initialized with.
    pub fn flags(&self) -> XaFlags {
        self.raw.lock_flags()
    }

    /// Whether the array contains no entries.
    pub fn is_empty(&self) -> bool {
        self.raw.head().is_null()
    }

    /// Whether any entry in the array carries the given mark.
    ///
    /// The summary is maintained eagerly when marks are set and lazily
    /// summarized when they are cleared, so it may report true for a short
    /// while after the last marked entry loses its mark.
    pub fn is_marked(&self, mark: M) -> bool {
        self.raw.is_marked(mark.into())
    }

    /// Acquires the array lock and returns a [`LockedXArray`] for mutable
    /// operations on this array.
    pub fn lock(&self) -> LockedXArray<'_, I, M> {
        LockedXArray {
            xa: self,
            guard: self.xlock.lock(),
            epoch: crossbeam_epoch::pin(),
            _marker: PhantomData,
        }
    }

    /// Creates a [`Cursor`] to perform read-only operations.
    pub fn cursor<'a>(&'a self, guard: &'a Guard, index: u64) -> Cursor<'a, I, M> {
        Cursor::new(self, guard, index)
    }

    /// Creates a [`Range`] which lazily yields the `(index, item)` pairs
    /// present in `range`.
    pub fn range<'a>(&'a self, guard: &'a Guard, range: ops::Range<u64>) -> Range<'a, I, M> {
        Range::new(self.cursor(guard, range.start), range.end)
    }

    /// Creates a [`MarkedRange`] which lazily yields the `(index, item)`
    /// pairs in `range` whose entries carry `mark`.
    pub fn marked_range<'a>(
        &'a self,
        guard: &'a Guard,
        range: ops::Range<u64>,
        mark: M,
    ) -> MarkedRange<'a, I, M> {
        MarkedRange::new(self.cursor(guard, range.start), range.end, mark.into())
    }

    /// Loads the item at the target index.
    pub fn load<'a>(&'a self, guard: &'a Guard, index: u64) -> Option<I::Ref<'a>> {
        self.cursor(guard, index).load()
    }

    /// Stores the provided item at the target index and returns the item
    /// previously stored there.
    ///
    /// The marks of the index are unaffected unless this store erases the
    /// entry.
    pub fn store<'a>(&'a self, guard: &'a Guard, index: u64, item: I) -> Option<I::Ref<'a>> {
        let new = XEntry::from_item_raw(item.into_raw());
        let mut xas = XaState::new(&self.raw, index, drop_item_raw::<I>);
        let old = self.store_with_retry(&mut xas, guard, new);
        if old == new || xas.error().is_some() {
            // The slot already held this exact item, or the store did not
            // happen; release the surplus ownership taken by `into_raw`.
            unsafe { drop(I::from_raw(new.raw())) };
        }
        wrap_item::<I>(old)
    }

    /// Stores the provided item over the `2^order` indices starting at
    /// `index` rounded down to a multiple of `2^order`.
    ///
    /// The stored range behaves as a single logical entry: loading, marking
    /// or erasing at any covered index operates on the whole range.
    pub fn store_order(&self, guard: &Guard, index: u64, order: u8, item: I) {
        let new = XEntry::from_item_raw(item.into_raw());
        let mut xas = XaState::new_order(&self.raw, index, order, drop_item_raw::<I>);
        let old = self.store_with_retry(&mut xas, guard, new);
        if old == new || xas.error().is_some() {
            unsafe { drop(I::from_raw(new.raw())) };
        }
    }

    /// Removes the item at the target index and returns it if one was
    /// present. All marks at the index are released, and nodes left empty
    /// are collapsed.
    pub fn erase<'a>(&'a self, guard: &'a Guard, index: u64) -> Option<I::Ref<'a>> {
        let mut xas = XaState::new(&self.raw, index, drop_item_raw::<I>);
        let lock = self.xlock.lock();
        let old = xas.store(XLockGuard::new(&lock), guard, XEntry::EMPTY);
        drop(lock);
        wrap_item::<I>(old)
    }

    /// Conditionally replaces the item at the target index: if the current
    /// item is `old` (null for `None`), it is replaced with `new`.
    ///
    /// Returns the item that was current at the start of the operation; the
    /// exchange happened if and only if that equals `old`. If the exchange
    /// does not happen, the unused `new` item is dropped.
    pub fn cmpxchg<'a>(
        &'a self,
        guard: &'a Guard,
        index: u64,
        old: Option<&I>,
        new: Option<I>,
    ) -> Option<I::Ref<'a>> {
        let old_raw = old.map_or(0, |item| item.as_raw());
        let new_entry = match new {
            Some(item) => XEntry::from_item_raw(item.into_raw()),
            None => XEntry::EMPTY,
        };
        let mut xas = XaState::new(&self.raw, index, drop_item_raw::<I>);

        let curr = loop {
            let lock = self.xlock.lock();
            let lk = XLockGuard::new(&lock);
            let curr = xas.load();
            if curr.raw() == old_raw {
                xas.store(lk, guard, new_entry);
            }
            drop(lock);
            if !xas.alloc_parked_blocking() {
                break curr;
            }
        };

        if new_entry.is_item()
            && (curr.raw() != old_raw || curr == new_entry || xas.error().is_some())
        {
            // The exchange did not happen, or it replaced the entry with
            // itself; release the unused ownership.
            unsafe { drop(I::from_raw(new_entry.raw())) };
        }
        wrap_item::<I>(curr)
    }

    /// Stores the item at the target index unless an entry is already
    /// present there.
    ///
    /// On failure the tree is unchanged and the item is dropped.
    pub fn insert(&self, guard: &Guard, index: u64, item: I) -> Result<(), XaError> {
        let new = XEntry::from_item_raw(item.into_raw());
        let mut xas = XaState::new(&self.raw, index, drop_item_raw::<I>);

        loop {
            let lock = self.xlock.lock();
            let lk = XLockGuard::new(&lock);
            let curr = xas.load();
            let occupied = !curr.is_null();
            if !occupied {
                xas.store(lk, guard, new);
            }
            drop(lock);
            if xas.alloc_parked_blocking() {
                continue;
            }

            return if occupied {
                unsafe { drop(I::from_raw(new.raw())) };
                Err(XaError::AlreadyExists)
            } else if let Some(err) = xas.error() {
                unsafe { drop(I::from_raw(new.raw())) };
                Err(err)
            } else {
                Ok(())
            };
        }
    }

    /// Whether the entry at the target index carries the given mark.
    ///
    /// This walks the tree lock-free, so the result may be stale by the time
    /// it returns; take the lock if the result must be stable.
    pub fn get_mark(&self, _guard: &Guard, index: u64, mark: M) -> bool {
        let mut xas = XaState::new(&self.raw, index, drop_item_raw::<I>);
        xas.get_mark_walk(mark.into())
    }

    /// Marks the entry at the target index.
    ///
    /// Marking an absent entry does not succeed.
    pub fn set_mark(&self, index: u64, mark: M) -> Result<(), XaError> {
        let mut xas = XaState::new(&self.raw, index, drop_item_raw::<I>);
        let lock = self.xlock.lock();
        let lk = XLockGuard::new(&lock);
        if !xas.load().is_item() {
            return Err(XaError::NoEntry);
        }
        xas.set_mark(lk, mark.into());
        Ok(())
    }

    /// Removes the mark from the entry at the target index.
    pub fn unset_mark(&self, index: u64, mark: M) -> Result<(), XaError> {
        let mut xas = XaState::new(&self.raw, index, drop_item_raw::<I>);
        let lock = self.xlock.lock();
        let lk = XLockGuard::new(&lock);
        if !xas.load().is_item() {
            return Err(XaError::NoEntry);
        }
        xas.unset_mark(lk, mark.into());
        Ok(())
    }

    /// Finds the lowest-indexed present item in `start..=max`.
    pub fn find<'a>(&'a self, guard: &'a Guard, start: u64, max: u64) -> Option<(u64, I::Ref<'a>)> {
        if start > max {
            return None;
        }
        self.cursor(guard, start).find(max)
    }

    /// Finds the lowest-indexed present item strictly after `start`, up to
    /// `max`.
    pub fn find_after<'a>(
        &'a self,
        guard: &'a Guard,
        start: u64,
        max: u64,
    ) -> Option<(u64, I::Ref<'a>)> {
        self.find(guard, start.checked_add(1)?, max)
    }

    /// Finds the lowest-indexed item in `start..=max` whose entry carries
    /// `mark`.
    pub fn find_marked<'a>(
        &'a self,
        guard: &'a Guard,
        start: u64,
        max: u64,
        mark: M,
    ) -> Option<(u64, I::Ref<'a>)> {
        if start > max {
            return None;
        }
        self.cursor(guard, start).find_marked_raw(max, mark.into())
    }

    /// Copies up to `n` matching items with indices in `start..=max` into
    /// `dst`, in ascending index order, and returns how many were copied.
    ///
    /// The copied set is a best-effort snapshot: entries modified while the
    /// extraction runs may or may not be reflected, but unmodified entries
    /// are never skipped.
    pub fn extract<'a>(
        &'a self,
        guard: &'a Guard,
        dst: &mut Vec<(u64, I::Ref<'a>)>,
        start: u64,
        max: u64,
        n: usize,
        filter: XaFilter,
    ) -> usize {
        if n == 0 || start > max {
            return 0;
        }

        let mut cursor = self.cursor(guard, start);
        let mut copied = 0;
        while copied < n {
            let found = match filter {
                XaFilter::Present => cursor.find(max),
                XaFilter::Marked(mark) => cursor.find_marked_raw(max, mark),
            };
            let Some(pair) = found else {
                break;
            };
            dst.push(pair);
            copied += 1;
        }
        copied
    }

    /// Removes every entry and releases all internal storage. Items the
    /// caller still holds references to stay alive until those references
    /// are gone.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Attempts an operation under the lock, recovering from refused node
    /// allocations by allocating with blocking allowed while the lock is
    /// dropped, then retrying. The parked node guarantees forward progress.
    fn store_with_retry(&self, xas: &mut XaState<'_>, epoch: &Guard, entry: XEntry) -> XEntry {
        loop {
            let lock = self.xlock.lock();
            let old = xas.store(XLockGuard::new(&lock), epoch, entry);
            drop(lock);
            if !xas.alloc_parked_blocking() {
                return old;
            }
        }
    }
}

impl<I: ItemEntry + Send + Sync, M: Into<XMark>> Drop for XArray<I, M> {
    fn drop(&mut self) {
        // Exclusive access: no reader can hold references anymore, so the
        // tree can be torn down without deferral.
        let head = self.raw.head_mut();
        release_subtree::<I>(head);
    }
}

fn release_subtree<I: ItemEntry>(entry: XEntry) {
    if let Some(node) = entry.node_ptr() {
        // SAFETY: the tree is exclusively owned during teardown; every node
        // was leaked from a `Box` when it was published.
        let node = unsafe { Box::from_raw(node.as_ptr()) };
        for offset in 0..SLOT_SIZE as u8 {
            release_subtree::<I>(node.entry(offset));
        }
    } else if entry.is_item() {
        // SAFETY: the array owned one instance of every stored item.
        unsafe { drop_item_raw::<I>(entry.raw()) };
    }
}

/// An `XArray` with its lock held, able to perform mutable operations.
///
/// There can be at most one `LockedXArray` of an array at a time. The locked
/// array also pins an epoch guard, which anchors the reclamation of
/// everything the write section unlinks: items returned by
/// [`LockedXArray::remove`] and the cursors' operations stay valid until the
/// `LockedXArray` is dropped.
pub struct LockedXArray<'a, I, M = NoneMark>
where
    I: ItemEntry + Send + Sync,
    M: Into<XMark>,
{
    xa: &'a XArray<I, M>,
    guard: MutexGuard<'a, ()>,
    epoch: Guard,
    _marker: PhantomData<(I, M)>,
}

impl<'a, I: ItemEntry + Send + Sync, M: Into<XMark>> LockedXArray<'a, I, M> {
    /// Creates a [`CursorMut`] to perform read and write operations.
    pub fn cursor_mut(&mut self, index: u64) -> CursorMut<'_, I, M> {
        CursorMut::new(self.xa, &self.guard, &self.epoch, index)
    }

    /// Creates a [`CursorMut`] describing a multi-index entry occupying
    /// `2^order` slots starting at `index` rounded down to the order.
    pub fn cursor_mut_order(&mut self, index: u64, order: u8) -> CursorMut<'_, I, M> {
        CursorMut::new_order(self.xa, &self.guard, &self.epoch, index, order)
    }

    /// Creates a [`Cursor`] to perform read-only operations.
    pub fn cursor(&self, index: u64) -> Cursor<'_, I, M> {
        Cursor::new(self.xa, &self.epoch, index)
    }

    /// Loads the item at the target index.
    pub fn load(&self, index: u64) -> Option<I::Ref<'_>> {
        self.cursor(index).load()
    }

    /// Stores the provided item at the target index and returns the item
    /// previously stored there.
    pub fn store(&mut self, index: u64, item: I) -> Option<I::Ref<'_>> {
        self.cursor_mut(index).store(item)
    }

    /// Stores the provided item over the `2^order` indices starting at
    /// `index` rounded down to a multiple of `2^order`.
    pub fn store_order(&mut self, index: u64, order: u8, item: I) {
        self.cursor_mut_order(index, order).store(item);
    }

    /// Removes the item at the target index, returning it if one was
    /// present.
    pub fn remove(&mut self, index: u64) -> Option<I::Ref<'_>> {
        self.cursor_mut(index).remove()
    }

    /// Removes every entry and releases all internal storage.
    pub fn clear(&mut self) {
        let lk = XLockGuard::new(&self.guard);
        let head = self.xa.raw.head();
        self.xa.raw.set_head(lk, XEntry::EMPTY);
        for mark in XMark::all() {
            if self.xa.raw.is_marked(mark) {
                self.xa.raw.unset_mark(lk, mark);
            }
        }

        let xas = XaState::new(&self.xa.raw, 0, drop_item_raw::<I>);
        if head.is_node() {
            // SAFETY: the detached subtree stays alive under our lock until
            // the walk replaces its slots with retry markers.
            xas.free_nodes(lk, &self.epoch, unsafe { head.as_node_ref() });
        } else if head.is_item() {
            xas.defer_drop_item(&self.epoch, head);
        }
        debug!("cleared xarray");
    }
}
