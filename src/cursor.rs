use std::marker::PhantomData;

use crossbeam_epoch::Guard;
use parking_lot::MutexGuard;

use crate::entry::{drop_item_raw, ItemEntry, XEntry};
use crate::mark::XMark;
use crate::node::XNode;
use crate::state::XaState;
use crate::xarray::{XArray, XLockGuard};
use crate::XaError;

pub(crate) fn wrap_item<'a, I: ItemEntry>(entry: XEntry) -> Option<I::Ref<'a>> {
    if entry.is_item() {
        // SAFETY: a present item observed under the caller's guard or lock
        // stays alive at least until the guard is dropped; its reclamation
        // is deferred through the epoch.
        Some(unsafe { I::raw_as_ref(entry.raw()) })
    } else {
        None
    }
}

/// A `Cursor` can traverse the `XArray` and operate on the entry at its
/// target index, using only read operations.
///
/// A `Cursor` is created from an [`XArray`] and an epoch guard; it never
/// takes the array lock, so any number of cursors may run concurrently with
/// each other and with one writer. A cursor that observes a slot being
/// reclaimed restarts its walk from the head transparently.
///
/// Item references returned by a cursor stay valid for the lifetime of the
/// guard the cursor was created with.
pub struct Cursor<'a, I, M>
where
    I: ItemEntry + Send + Sync,
    M: Into<XMark>,
{
    state: XaState<'a>,
    _marker: PhantomData<(&'a Guard, I, M)>,
}

impl<'a, I: ItemEntry + Send + Sync, M: Into<XMark>> Cursor<'a, I, M> {
    pub(crate) fn new(xa: &'a XArray<I, M>, _guard: &'a Guard, index: u64) -> Self {
        Self {
            state: XaState::new(xa.raw(), index, drop_item_raw::<I>),
            _marker: PhantomData,
        }
    }

    /// The target index of the cursor.
    pub fn index(&self) -> u64 {
        self.state.index()
    }

    /// Moves the cursor to a new target index. The next operation walks from
    /// the head again.
    pub fn reset_to(&mut self, index: u64) {
        self.state.set_index(index);
    }

    /// Loads the item at the target index.
    pub fn load(&mut self) -> Option<I::Ref<'a>> {
        loop {
            let entry = self.state.load();
            if entry.is_retry() {
                self.state.reset();
                continue;
            }
            return wrap_item::<I>(entry);
        }
    }

    /// Whether the entry at the target index carries the given mark.
    pub fn is_marked(&mut self, mark: M) -> bool {
        self.state.get_mark_walk(mark.into())
    }

    /// Finds the next present item at an index between the cursor position
    /// and `max`, inclusive. A found item counts as processed: calling
    /// `find` again continues behind it.
    pub fn find(&mut self, max: u64) -> Option<(u64, I::Ref<'a>)> {
        loop {
            let entry = self.state.find(max);
            if entry.is_retry() {
                self.state.reset();
                continue;
            }
            if !entry.is_item() {
                return None;
            }
            // SAFETY: see `wrap_item`.
            return Some((self.state.index(), unsafe { I::raw_as_ref(entry.raw()) }));
        }
    }

    /// Finds the next item carrying `mark` at an index between the cursor
    /// position and `max`, inclusive.
    pub fn find_marked(&mut self, max: u64, mark: M) -> Option<(u64, I::Ref<'a>)> {
        self.find_marked_raw(max, mark.into())
    }

    pub(crate) fn find_marked_raw(&mut self, max: u64, mark: XMark) -> Option<(u64, I::Ref<'a>)> {
        loop {
            let entry = self.state.find_marked(max, mark);
            if entry.is_retry() {
                self.state.reset();
                continue;
            }
            if !entry.is_item() {
                return None;
            }
            // SAFETY: see `wrap_item`.
            return Some((self.state.index(), unsafe { I::raw_as_ref(entry.raw()) }));
        }
    }

    /// Prepares the cursor so that, after the caller re-pins and resumes,
    /// iteration continues at the first index strictly after the current
    /// position. Only forward iteration supports pausing.
    pub fn pause(&mut self) {
        self.state.pause();
    }
}

/// A `CursorMut` can traverse the `XArray` and both read and modify the
/// entry at its target index.
///
/// A `CursorMut` is created through a [`LockedXArray`], so at most one
/// exists at a time and every operation runs with the array lock held.
/// References returned by its operations stay valid until the
/// `LockedXArray` is dropped.
///
/// When the tree needs a new node, the cursor first tries a no-wait
/// allocation from the shared node cache; if that is refused, it allocates
/// with blocking allowed, parks the node, and retries, so its operations do
/// not surface allocation failures.
///
/// [`LockedXArray`]: crate::LockedXArray
pub struct CursorMut<'a, I, M>
where
    I: ItemEntry + Send + Sync,
    M: Into<XMark>,
{
    lock: XLockGuard<'a>,
    epoch: &'a Guard,
    state: XaState<'a>,
    _marker: PhantomData<(I, M)>,
}

impl<'a, I: ItemEntry + Send + Sync, M: Into<XMark>> CursorMut<'a, I, M> {
    pub(crate) fn new(
        xa: &'a XArray<I, M>,
        guard: &'a MutexGuard<'_, ()>,
        epoch: &'a Guard,
        index: u64,
    ) -> Self {
        Self {
            lock: XLockGuard::new(guard),
            epoch,
            state: XaState::new(xa.raw(), index, drop_item_raw::<I>),
            _marker: PhantomData,
        }
    }

    pub(crate) fn new_order(
        xa: &'a XArray<I, M>,
        guard: &'a MutexGuard<'_, ()>,
        epoch: &'a Guard,
        index: u64,
        order: u8,
    ) -> Self {
        Self {
            lock: XLockGuard::new(guard),
            epoch,
            state: XaState::new_order(xa.raw(), index, order, drop_item_raw::<I>),
            _marker: PhantomData,
        }
    }

    /// The target index of the cursor.
    pub fn index(&self) -> u64 {
        self.state.index()
    }

    /// Moves the cursor to a new target index.
    pub fn reset_to(&mut self, index: u64) {
        self.state.set_index(index);
    }

    /// Loads the item at the target index.
    pub fn load(&mut self) -> Option<I::Ref<'a>> {
        wrap_item::<I>(self.state.load())
    }

    /// Stores the provided item at the cursor position, returning the item
    /// previously stored there.
    ///
    /// For a cursor with a multi-index shape, the whole described range is
    /// covered by the new item, and the returned item is the one that was
    /// stored at the canonical slot of the range.
    pub fn store(&mut self, item: I) -> Option<I::Ref<'a>> {
        let new = XEntry::from_item_raw(item.into_raw());
        let old = self.store_retry(new);
        if old == new || self.state.error().is_some() {
            // The slot already held this exact item, or the store did not
            // happen; release the surplus ownership taken by `into_raw`.
            unsafe { drop(I::from_raw(new.raw())) };
        }
        wrap_item::<I>(old)
    }

    /// Removes the item at the cursor position, returning it if one was
    /// present. All marks at the position are released.
    pub fn remove(&mut self) -> Option<I::Ref<'a>> {
        wrap_item::<I>(self.state.store(self.lock, self.epoch, XEntry::EMPTY))
    }

    /// Conditionally replaces the item at the cursor position: if the
    /// current item is `old` (null for `None`), it is replaced with `new`.
    ///
    /// Returns the item that was current; the exchange happened if and only
    /// if that equals `old`. An unused `new` item is dropped.
    pub fn cmpxchg(&mut self, old: Option<&I>, new: Option<I>) -> Option<I::Ref<'a>> {
        let old_raw = old.map_or(0, ItemEntry::as_raw);
        let new_entry = match new {
            Some(item) => XEntry::from_item_raw(item.into_raw()),
            None => XEntry::EMPTY,
        };

        let curr = loop {
            let curr = self.state.load();
            if curr.raw() == old_raw {
                self.state.store(self.lock, self.epoch, new_entry);
            }
            if !self.state.needs_alloc() || !self.state.alloc_parked_blocking() {
                break curr;
            }
        };

        if new_entry.is_item()
            && (curr.raw() != old_raw || curr == new_entry || self.state.error().is_some())
        {
            // The exchange did not happen, or it replaced the entry with
            // itself; release the unused ownership.
            unsafe { drop(I::from_raw(new_entry.raw())) };
        }
        wrap_item::<I>(curr)
    }

    /// Whether the entry at the target index carries the given mark.
    pub fn is_marked(&mut self, mark: M) -> bool {
        self.state.get_mark_walk(mark.into())
    }

    /// Marks the entry at the cursor position, cascading the mark to the
    /// ancestor nodes and the array-level summary.
    ///
    /// Marking an absent entry does not succeed.
    pub fn set_mark(&mut self, mark: M) -> Result<(), XaError> {
        if !self.state.load().is_item() {
            return Err(XaError::NoEntry);
        }
        self.state.set_mark(self.lock, mark.into());
        Ok(())
    }

    /// Removes the mark from the entry at the cursor position. Ancestors
    /// keep their summary bit while any of their slots still carries the
    /// mark.
    pub fn unset_mark(&mut self, mark: M) -> Result<(), XaError> {
        if !self.state.load().is_item() {
            return Err(XaError::NoEntry);
        }
        self.state.unset_mark(self.lock, mark.into());
        Ok(())
    }

    /// Clears every mark at the cursor position.
    pub fn init_marks(&mut self) {
        self.state.load();
        self.state.init_marks(self.lock);
    }

    /// Finds the next present item at an index between the cursor position
    /// and `max`, inclusive.
    pub fn find(&mut self, max: u64) -> Option<(u64, I::Ref<'a>)> {
        let entry = self.state.find(max);
        if !entry.is_item() {
            return None;
        }
        // SAFETY: see `wrap_item`.
        Some((self.state.index(), unsafe { I::raw_as_ref(entry.raw()) }))
    }

    /// Finds the next item carrying `mark` at an index between the cursor
    /// position and `max`, inclusive.
    pub fn find_marked(&mut self, max: u64, mark: M) -> Option<(u64, I::Ref<'a>)> {
        let entry = self.state.find_marked(max, mark.into());
        if !entry.is_item() {
            return None;
        }
        // SAFETY: see `wrap_item`.
        Some((self.state.index(), unsafe { I::raw_as_ref(entry.raw()) }))
    }

    /// Returns any present item intersecting the cursor's multi-index
    /// range, or `None` once the range is known to be vacant. Repeated
    /// calls scan the whole range, which makes "insert unless present over
    /// a range" a single pass: a store performed after `find_conflict` has
    /// returned `None` lands on the canonical slot of the range.
    pub fn find_conflict(&mut self) -> Option<I::Ref<'a>> {
        wrap_item::<I>(self.state.find_conflict())
    }

    /// Ensures that every slot covered by the cursor's multi-index range
    /// exists, so that subsequent single-index stores into the range will
    /// succeed without allocating.
    pub fn create_range(&mut self) -> Result<(), XaError> {
        loop {
            self.state.create_range(self.lock);
            match self.state.error() {
                None => return Ok(()),
                Some(XaError::NoMemory) => {
                    if !self.state.alloc_parked_blocking() {
                        return Err(XaError::NoMemory);
                    }
                }
                Some(err) => return Err(err),
            }
        }
    }

    /// Prepares the cursor so that iteration resumes at the first index
    /// strictly after the current position. Only forward iteration supports
    /// pausing.
    pub fn pause(&mut self) {
        self.state.pause();
    }

    /// Registers a callback invoked every time a node's counters change,
    /// for layers that cache state per node.
    pub fn set_update(&mut self, update: Option<fn(&XNode)>) {
        self.state.set_update(update);
    }

    fn store_retry(&mut self, entry: XEntry) -> XEntry {
        loop {
            let old = self.state.store(self.lock, self.epoch, entry);
            if !self.state.needs_alloc() {
                return old;
            }
            // The array mutex, unlike a spinlock, tolerates the blocking
            // allocation while held.
            if !self.state.alloc_parked_blocking() {
                return old;
            }
        }
    }
}
