use std::ptr::NonNull;

use crossbeam_epoch::Guard;
use log::{debug, trace};

use crate::entry::XEntry;
use crate::mark::{XMark, NUM_MARKS};
use crate::node::{node_cache, AllocMode, NodeCache, XNode};
use crate::xarray::{RawXArray, XLockGuard};
use crate::{XaError, BITS_PER_LAYER, SLOT_MASK, SLOT_SIZE};

/// Where an [`XaState`] currently is in the tree.
///
/// `Restart` means the state has not been walked (or was reset after a lock
/// drop); `Bounds` means the target index lies outside the tree's current
/// span; `Empty` means the walk ended at the array head itself, with no node
/// in between; `Node` is a position inside a node. A failed operation parks
/// its error in `Error` until the caller recovers or resets.
#[derive(Clone, Copy)]
pub(crate) enum CurrentState {
    Restart,
    Bounds,
    Empty,
    Node(NonNull<XNode>),
    Error(XaError),
}

/// The state of one multi-step operation on an `XArray`.
///
/// An `XaState` carries the target index, an optional multi-index shape
/// (`shift` and `sibs`), the current node and offset of the walk, and a
/// preallocated node used to recover from a refused allocation. It is the
/// engine behind both the cursors and the array's direct operations.
///
/// The state machine itself is untyped: slots are raw words, and the typed
/// layer supplies `drop_item` so that replaced user items can be released
/// through the epoch.
///
/// Callers must hold the array lock for every mutating operation, witnessed
/// by an [`XLockGuard`], and must be pinned (or hold the lock) for the
/// read-only walks.
pub(crate) struct XaState<'a> {
    xa: &'a RawXArray,
    index: u64,
    shift: u8,
    sibs: u8,
    offset: u8,
    node: CurrentState,
    alloc: Option<Box<XNode>>,
    update: Option<fn(&XNode)>,
    drop_item: unsafe fn(usize),
}

fn iter_skip(entry: XEntry) -> bool {
    entry.is_null() || (entry.is_internal() && entry.raw() < XEntry::RETRY.raw())
}

impl<'a> XaState<'a> {
    pub fn new(xa: &'a RawXArray, index: u64, drop_item: unsafe fn(usize)) -> Self {
        Self {
            xa,
            index,
            shift: 0,
            sibs: 0,
            offset: 0,
            node: CurrentState::Restart,
            alloc: None,
            update: None,
            drop_item,
        }
    }

    /// Makes a state describing a multi-index entry that occupies
    /// `2^order` slots starting at `index` rounded down to the order.
    pub fn new_order(xa: &'a RawXArray, index: u64, order: u8, drop_item: unsafe fn(usize)) -> Self {
        debug_assert!((order as u32) < u64::BITS);
        let mut state = Self::new(xa, (index >> order) << order, drop_item);
        state.shift = order - (order % BITS_PER_LAYER as u8);
        state.sibs = (1 << (order % BITS_PER_LAYER as u8)) - 1;
        state
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn set_index(&mut self, index: u64) {
        self.index = index;
        self.node = CurrentState::Restart;
    }

    pub fn reset(&mut self) {
        self.node = CurrentState::Restart;
    }

    pub fn set_update(&mut self, update: Option<fn(&XNode)>) {
        self.update = update;
    }

    pub fn error(&self) -> Option<XaError> {
        match self.node {
            CurrentState::Error(err) => Some(err),
            _ => None,
        }
    }

    fn set_err(&mut self, err: XaError) {
        self.node = CurrentState::Error(err);
    }

    /// Whether the state can not currently be used to operate on a slot.
    fn is_invalid(&self) -> bool {
        matches!(
            self.node,
            CurrentState::Restart | CurrentState::Bounds | CurrentState::Error(_)
        )
    }

    fn current(&self) -> Option<&'a XNode> {
        match self.node {
            // SAFETY: a positioned state only holds nodes that are reachable
            // from the tree, and the caller holds the array lock or an epoch
            // guard pinned before any such node could have been unlinked.
            CurrentState::Node(ptr) => Some(unsafe { &*ptr.as_ptr() }),
            _ => None,
        }
    }

    fn call_update(&self, node: &XNode) {
        if let Some(update) = self.update {
            update(node);
        }
    }

    /// The highest index the current operation may reach, folding the
    /// multi-index shape into the target index.
    fn max(&self) -> u64 {
        let mut max = self.index;
        if self.shift > 0 || self.sibs > 0 {
            let mask = ((self.sibs as u64 + 1).wrapping_shl(self.shift as u32)).wrapping_sub(1);
            max |= mask;
            if mask == max {
                max = max.wrapping_add(1);
            }
        }
        max
    }

    /// The maximum index the array can contain without expanding.
    fn max_index(head: XEntry) -> u64 {
        if !head.is_node() {
            return 0;
        }
        // SAFETY: the head node is alive while the lock is held.
        unsafe { head.as_node_ref() }.max_index()
    }

    /// Moves the index to the start of the range covered by `offset` in the
    /// current node.
    fn move_index(&mut self, offset: u8) {
        let shift = self.current().unwrap().shift() as u32;
        self.index &= (!(SLOT_MASK as u64)).wrapping_shl(shift);
        self.index = self.index.wrapping_add((offset as u64).wrapping_shl(shift));
    }

    fn advance(&mut self) {
        self.offset += 1;
        self.move_index(self.offset);
    }

    fn set_offset(&mut self) {
        self.offset = self.current().unwrap().get_offset(self.index);
    }

    fn reload(&self) -> XEntry {
        match self.node {
            CurrentState::Node(_) => self.current().unwrap().entry(self.offset),
            _ => self.xa.head(),
        }
    }

    /// Starts a walk. If the state is already positioned, returns the entry
    /// it points at; if the index is outside the tree's current span, moves
    /// to `Bounds` and returns null; otherwise moves to the head and returns
    /// the head entry.
    fn start(&mut self) -> XEntry {
        match self.node {
            CurrentState::Node(_) | CurrentState::Empty => return self.reload(),
            CurrentState::Error(_) => return XEntry::EMPTY,
            CurrentState::Restart | CurrentState::Bounds => {}
        }

        let entry = self.xa.head();
        if entry.is_node() {
            // SAFETY: the head node is alive under the caller's guard/lock.
            let node = unsafe { entry.as_node_ref() };
            if (self.index >> node.shift()) > SLOT_MASK as u64 {
                self.node = CurrentState::Bounds;
                return XEntry::EMPTY;
            }
        } else if self.index != 0 {
            self.node = CurrentState::Bounds;
            return XEntry::EMPTY;
        }

        self.node = CurrentState::Empty;
        entry
    }

    /// Moves one level down into `node`, normalizing sibling slots to their
    /// canonical slot (and the index to the canonical base).
    fn descend(&mut self, node: &XNode) -> XEntry {
        let mut offset = node.get_offset(self.index);
        let mut entry = node.entry(offset);

        self.node = CurrentState::Node(NonNull::from(node));
        if let Some(canonical) = entry.as_sibling() {
            offset = canonical;
            entry = node.entry(offset);
            self.move_index(offset);
        }

        self.offset = offset;
        entry
    }

    /// Walks the state to the slot covering the target index and returns the
    /// entry found there. Never expands the tree.
    ///
    /// For a multi-index state this may return a node entry when no entry of
    /// the requested order exists at this position.
    pub fn load(&mut self) -> XEntry {
        let mut entry = self.start();
        while entry.is_node() {
            // SAFETY: node entries read under the guard/lock stay alive.
            let node = unsafe { entry.as_node_ref() };
            if self.shift > node.shift() {
                break;
            }
            entry = self.descend(node);
        }
        entry
    }

    /// Produces a fresh node, preferring the parked preallocation, and links
    /// it below the current position.
    fn alloc_node(&mut self, lk: XLockGuard, shift: u8) -> Option<NonNull<XNode>> {
        if matches!(self.node, CurrentState::Error(_)) {
            return None;
        }

        let mut node = match self.alloc.take() {
            Some(node) => node,
            None => match node_cache().alloc(AllocMode::NoWait) {
                Some(node) => node,
                None => {
                    self.set_err(XaError::NoMemory);
                    return None;
                }
            },
        };
        node.init(shift);

        let parent = match self.node {
            CurrentState::Node(ptr) => Some(ptr),
            _ => None,
        };
        let node_ptr = NonNull::from(Box::leak(node));
        // SAFETY: the node was just leaked and is exclusively ours until it
        // is published into a slot.
        let node_ref = unsafe { node_ptr.as_ref() };
        if let Some(parent) = self.current() {
            node_ref.set_offset(lk, self.offset);
            parent.add_count(lk, 1);
            self.call_update(parent);
        }
        node_ref.set_parent(lk, parent);

        Some(node_ptr)
    }

    /// Adds nodes to the head of the tree until the operation's maximum
    /// index becomes representable. Returns the shift of the slot one level
    /// below the head, or `None` if a node allocation was refused.
    fn expand(&mut self, lk: XLockGuard, mut head: XEntry) -> Option<u8> {
        let max = self.max();
        let mut shift = 0u8;
        let mut top: Option<NonNull<XNode>> = None;

        if head.is_null() {
            if max == 0 {
                return Some(0);
            }
            while (max >> shift as u32) >= SLOT_SIZE as u64 {
                shift += BITS_PER_LAYER as u8;
            }
            return Some(shift + BITS_PER_LAYER as u8);
        } else if head.is_node() {
            // SAFETY: the head node is alive while the lock is held.
            let node = unsafe { head.as_node_ref() };
            shift = node.shift() + BITS_PER_LAYER as u8;
            top = Some(NonNull::from(node));
        }
        self.node = CurrentState::Empty;

        while max > Self::max_index(head) {
            let node_ptr = self.alloc_node(lk, shift)?;
            // SAFETY: freshly allocated, not yet visible to readers.
            let node = unsafe { node_ptr.as_ref() };

            node.add_count(lk, 1);
            if head.is_value() {
                node.add_value_count(lk, 1);
            }
            node.set_entry(lk, 0, head);

            // The new head inherits the array-wide mark summary so that
            // ancestor-walk mark lookups stay correct after growth.
            for mark in XMark::all() {
                if self.xa.is_marked(mark) {
                    node.set_mark(lk, 0, mark.index());
                }
            }

            if head.is_node() {
                // SAFETY: the previous head node is alive under the lock.
                let child = unsafe { head.as_node_ref() };
                child.set_offset(lk, 0);
                child.set_parent(lk, Some(node_ptr));
            }
            head = XEntry::from_node(node_ptr);
            self.xa.set_head(lk, head);
            self.call_update(node);
            top = Some(node_ptr);

            shift += BITS_PER_LAYER as u8;
            trace!("expanded tree head to shift {}", node.shift());
        }

        self.node = match top {
            Some(node) => CurrentState::Node(node),
            None => CurrentState::Empty,
        };
        Some(shift)
    }

    /// Ensures every slot on the walk from the head down to the target
    /// exists, allocating nodes as needed. Returns the contents of the
    /// target slot (null for a newly created slot, or on failure with the
    /// error recorded in the state).
    pub fn create(&mut self, lk: XLockGuard) -> XEntry {
        let order = self.shift;
        let mut shift;
        let mut entry;

        match self.node {
            CurrentState::Node(_) => {
                let node = self.current().unwrap();
                shift = node.shift();
                entry = node.entry(self.offset);
            }
            CurrentState::Error(_) => return XEntry::EMPTY,
            _ => {
                entry = self.xa.head();
                self.node = CurrentState::Empty;
                let Some(expanded) = self.expand(lk, entry) else {
                    return XEntry::EMPTY;
                };
                shift = expanded;
                entry = self.xa.head();
            }
        }

        while shift > order {
            shift -= BITS_PER_LAYER as u8;
            let node: &XNode = if entry.is_null() {
                let Some(node_ptr) = self.alloc_node(lk, shift) else {
                    break;
                };
                let node_entry = XEntry::from_node(node_ptr);
                match self.current() {
                    Some(parent) => {
                        parent.set_entry(lk, self.offset, node_entry);
                    }
                    None => {
                        self.xa.set_head(lk, node_entry);
                    }
                }
                // SAFETY: just published under the lock; stays alive.
                unsafe { node_ptr.as_ref() }
            } else if entry.is_node() {
                // SAFETY: node entries observed under the lock stay alive.
                unsafe { entry.as_node_ref() }
            } else {
                break;
            };
            entry = self.descend(node);
        }

        entry
    }

    /// Creates all of the slots in the range covered by the state's
    /// multi-index shape, as single-index slots. On success the state is
    /// positioned at the beginning of the range with a single-index shape.
    pub fn create_range(&mut self, lk: XLockGuard) {
        let index = self.index;
        let shift = self.shift;
        let sibs = self.sibs;

        self.index |= ((sibs as u64 + 1).wrapping_shl(shift as u32)).wrapping_sub(1);
        self.shift = 0;
        self.sibs = 0;

        loop {
            self.create(lk);
            if self.error().is_some() {
                break;
            }
            if self.index <= (index | SLOT_MASK as u64) {
                self.index = index;
                if matches!(self.node, CurrentState::Node(_)) {
                    self.set_offset();
                }
                return;
            }
            self.index -= SLOT_SIZE as u64;

            loop {
                let node = self.current().unwrap();
                let offset = node.offset();
                self.node = match node.parent() {
                    Some(parent) => CurrentState::Node(parent),
                    None => CurrentState::Empty,
                };
                self.offset = offset.wrapping_sub(1);
                if offset != 0 {
                    break;
                }
            }
        }

        self.shift = shift;
        self.sibs = sibs;
        self.index = index;
    }

    /// Stores `entry` at the state's position, maintaining sibling slots,
    /// marks and node counters, and collapsing nodes that become empty.
    /// Returns the previous entry of the canonical slot.
    pub fn store(&mut self, lk: XLockGuard, epoch: &Guard, entry: XEntry) -> XEntry {
        let value = entry.is_value();
        let mut first = if !entry.is_null() {
            self.create(lk)
        } else {
            self.load()
        };

        if self.is_invalid() {
            return first;
        }
        let node = self.current();
        if let Some(node) = node {
            if self.shift < node.shift() {
                self.sibs = 0;
            }
        }
        if first == entry && self.sibs == 0 {
            return first;
        }
        // The previous content of the canonical slot is what the caller gets
        // back; `first` itself keeps tracking per-slot content for the value
        // accounting below.
        let canonical_old = first;

        let mut count = 0i32;
        let mut values = 0i32;
        let mut cur = entry;
        let mut next = first;
        let mut offset = self.offset;
        let max = self.offset + self.sibs;
        if node.is_some() && self.sibs > 0 {
            self.squash_marks(lk);
        }
        if entry.is_null() {
            self.init_marks(lk);
        }

        loop {
            // The marks of a vanishing entry were cleared above; the release
            // store of the slot orders those clears before the null becomes
            // visible, so marked iteration can not observe a marked null.
            let old = next;
            match node {
                Some(node) => {
                    node.set_entry(lk, offset, cur);
                }
                None => {
                    self.xa.set_head(lk, cur);
                }
            }
            if old.is_node() {
                // SAFETY: the overwritten subtree was reachable and the lock
                // is held.
                self.free_nodes(lk, epoch, unsafe { old.as_node_ref() });
            }
            if old.is_item() && old != cur {
                self.defer_drop_item(epoch, old);
            }
            let Some(node) = node else {
                break;
            };
            count += old.is_null() as i32 - cur.is_null() as i32;
            values += value as i32 - first.is_value() as i32;
            if !cur.is_null() {
                if offset == max {
                    break;
                }
                if !cur.is_sibling() {
                    cur = XEntry::sibling(self.offset);
                }
            } else if offset == SLOT_MASK as u8 {
                break;
            }
            offset += 1;
            next = node.entry(offset);
            if !next.is_sibling() {
                if cur.is_null() && offset > max {
                    break;
                }
                first = next;
            }
        }

        self.update_counts(lk, epoch, node, count, values);
        canonical_old
    }

    fn update_counts(
        &mut self,
        lk: XLockGuard,
        epoch: &Guard,
        node: Option<&XNode>,
        count: i32,
        values: i32,
    ) {
        let Some(node) = node else {
            return;
        };
        if count == 0 && values == 0 {
            return;
        }

        node.add_count(lk, count);
        node.add_value_count(lk, values);
        self.call_update(node);
        if count < 0 {
            self.delete_node(lk, epoch);
        }
    }

    /// Walks up from the current node, unlinking and freeing nodes whose
    /// last entry was just removed, then shrinks the tree head.
    fn delete_node(&mut self, lk: XLockGuard, epoch: &Guard) {
        let Some(mut node) = self.current() else {
            return;
        };

        loop {
            debug_assert!(node.count() as usize <= SLOT_SIZE);
            if node.count() != 0 {
                break;
            }

            let parent = node.parent();
            self.offset = node.offset();
            self.defer_free_node(epoch, node);

            match parent {
                None => {
                    self.xa.set_head(lk, XEntry::EMPTY);
                    self.node = CurrentState::Bounds;
                    return;
                }
                Some(parent) => {
                    // SAFETY: the parent of a reachable node is reachable,
                    // and the lock is held.
                    let parent = unsafe { &*parent.as_ptr() };
                    parent.set_entry(lk, self.offset, XEntry::EMPTY);
                    parent.add_count(lk, -1);
                    self.node = CurrentState::Node(NonNull::from(parent));
                    self.call_update(parent);
                    node = parent;
                }
            }
        }

        if node.parent().is_none() {
            self.shrink(lk, epoch);
        }
    }

    /// Collapses a one-child chain at the head so the tree is no taller
    /// than needed. A one-child head whose child is not a node is only
    /// collapsed at shift 0, which keeps multi-index decoding correct.
    fn shrink(&mut self, lk: XLockGuard, epoch: &Guard) {
        let Some(mut node) = self.current() else {
            return;
        };

        loop {
            debug_assert!(node.count() as usize <= SLOT_SIZE);
            if node.count() != 1 {
                break;
            }
            let entry = node.entry(0);
            if entry.is_null() {
                break;
            }
            if !entry.is_node() && node.shift() != 0 {
                break;
            }

            self.node = CurrentState::Bounds;
            self.xa.set_head(lk, entry);
            trace!("shrunk tree head below shift {}", node.shift());

            node.clear_counts(lk);
            if !entry.is_node() {
                // A reader still inside the detached node must restart.
                node.set_entry(lk, 0, XEntry::RETRY);
            }
            self.call_update(node);
            self.defer_free_node(epoch, node);

            if !entry.is_node() {
                break;
            }
            // SAFETY: the new head node is alive under the lock.
            let child = unsafe { entry.as_node_ref() };
            child.set_parent(lk, None);
            node = child;
        }
    }

    /// Frees `top` and every node below it. All non-null leaf slots are
    /// overwritten with retry markers before the structure is released, so
    /// a concurrent reader that already loaded a slot observes the marker
    /// and restarts at the head.
    pub(crate) fn free_nodes(&self, lk: XLockGuard, epoch: &Guard, top: &XNode) {
        let mut offset = 0u8;
        let mut node = top;

        loop {
            let entry = node.entry(offset);
            if entry.is_node() {
                // SAFETY: entries of a node being freed under the lock are
                // still alive.
                node = unsafe { entry.as_node_ref() };
                offset = 0;
                continue;
            }
            if !entry.is_null() {
                if entry.is_item() {
                    self.defer_drop_item(epoch, entry);
                }
                node.set_entry(lk, offset, XEntry::RETRY);
            }
            offset += 1;
            while offset == SLOT_SIZE as u8 {
                let parent = node.parent();
                offset = node.offset() + 1;
                node.clear_counts(lk);
                self.call_update(node);
                self.defer_free_node(epoch, node);
                if std::ptr::eq(node, top) {
                    return;
                }
                // SAFETY: a node below `top` always has a parent, which is
                // freed only after its children on this walk.
                node = unsafe { &*parent.unwrap().as_ptr() };
            }
        }
    }

    /// Merges the marks of a sibling run into its canonical slot, so mark
    /// reads agree with the logical width of the entry.
    fn squash_marks(&mut self, lk: XLockGuard) {
        let Some(node) = self.current() else {
            return;
        };
        if self.sibs == 0 {
            return;
        }
        let limit = self.offset + self.sibs;

        for mark in 0..NUM_MARKS {
            let bits = node.mark(mark);
            if bits.next_marked(self.offset + 1) >= limit {
                continue;
            }
            let mut merged = bits;
            merged.set(self.offset);
            for offset in self.offset + 1..=limit {
                merged.unset(offset);
            }
            node.store_mark(lk, mark, merged);
        }
    }

    /// Whether the mark is set at the state's position (or, at the head,
    /// whether any entry in the array carries it).
    pub fn get_mark(&self, mark: XMark) -> bool {
        match self.node {
            CurrentState::Node(_) => self.current().unwrap().is_marked(self.offset, mark.index()),
            CurrentState::Empty => self.xa.is_marked(mark),
            _ => false,
        }
    }

    /// Walks the tree from the head, checking the mark bit at every level.
    /// The result is false as soon as any level's bit is clear.
    pub fn get_mark_walk(&mut self, mark: XMark) -> bool {
        let mut entry = self.start();
        while self.get_mark(mark) {
            if !entry.is_node() {
                return true;
            }
            // SAFETY: node entries observed under the guard stay alive.
            entry = self.descend(unsafe { entry.as_node_ref() });
        }
        false
    }

    /// Sets the mark at the state's position and cascades it to the
    /// ancestors and the array-level summary.
    pub fn set_mark(&mut self, lk: XLockGuard, mark: XMark) {
        if self.is_invalid() {
            return;
        }

        let mut node = self.current();
        let mut offset = self.offset;
        while let Some(n) = node {
            if n.set_mark(lk, offset, mark.index()) {
                return;
            }
            offset = n.offset();
            // SAFETY: parents of reachable nodes are alive under the lock.
            node = n.parent().map(|parent| unsafe { &*parent.as_ptr() });
        }

        if !self.xa.is_marked(mark) {
            self.xa.set_mark(lk, mark);
        }
    }

    /// Clears the mark at the state's position; ancestors keep their bit as
    /// long as any of their slots still carries the mark.
    pub fn unset_mark(&mut self, lk: XLockGuard, mark: XMark) {
        if self.is_invalid() {
            return;
        }

        let mut node = self.current();
        let mut offset = self.offset;
        while let Some(n) = node {
            if !n.unset_mark(lk, offset, mark.index()) {
                return;
            }
            if !n.is_mark_clear(mark.index()) {
                return;
            }
            offset = n.offset();
            // SAFETY: parents of reachable nodes are alive under the lock.
            node = n.parent().map(|parent| unsafe { &*parent.as_ptr() });
        }

        if self.xa.is_marked(mark) {
            self.xa.unset_mark(lk, mark);
        }
    }

    /// Clears every mark at the state's position.
    pub fn init_marks(&mut self, lk: XLockGuard) {
        for mark in XMark::all() {
            self.unset_mark(lk, mark);
        }
    }

    /// Finds the next present entry at an index no greater than `max`.
    ///
    /// If the state has not been walked, the entry at the target index
    /// itself is a candidate; otherwise the current entry counts as
    /// processed and the walk moves forward. Runs past the tree leave the
    /// state at `Bounds` with the index set to the smallest index not yet
    /// in the array.
    pub fn find(&mut self, max: u64) -> XEntry {
        match self.node {
            CurrentState::Error(_) => return XEntry::EMPTY,
            CurrentState::Empty => {
                self.index = 1;
                self.node = CurrentState::Bounds;
                return XEntry::EMPTY;
            }
            CurrentState::Restart | CurrentState::Bounds => {
                let entry = self.load();
                if !entry.is_null() || !matches!(self.node, CurrentState::Node(_)) {
                    return entry;
                }
            }
            CurrentState::Node(_) => {}
        }

        self.advance();

        while let CurrentState::Node(ptr) = self.node {
            if self.index > max {
                break;
            }
            // SAFETY: reachable under the caller's guard/lock.
            let node = unsafe { &*ptr.as_ptr() };
            if self.offset == SLOT_SIZE as u8 {
                self.offset = node.offset() + 1;
                self.node = match node.parent() {
                    Some(parent) => CurrentState::Node(parent),
                    None => CurrentState::Empty,
                };
                continue;
            }

            let entry = node.entry(self.offset);
            if let Some(child) = entry.node_ptr() {
                self.node = CurrentState::Node(child);
                self.offset = 0;
                continue;
            }
            if !iter_skip(entry) {
                return entry;
            }

            self.advance();
        }

        if matches!(self.node, CurrentState::Empty) {
            self.node = CurrentState::Bounds;
        }
        XEntry::EMPTY
    }

    /// Finds the next entry carrying `mark` at an index no greater than
    /// `max`, using the per-node mark bitmaps to skip runs of unmarked
    /// slots one word at a time.
    pub fn find_marked(&mut self, max: u64, mark: XMark) -> XEntry {
        let m = mark.index();
        let mut advance = true;

        match self.node {
            CurrentState::Error(_) => return XEntry::EMPTY,
            CurrentState::Empty => {
                self.index = 1;
                self.node = CurrentState::Bounds;
                return XEntry::EMPTY;
            }
            CurrentState::Restart | CurrentState::Bounds => {
                advance = false;
                let entry = self.xa.head();
                if entry.is_node() {
                    // SAFETY: the head node is alive under the guard.
                    let node = unsafe { entry.as_node_ref() };
                    if self.index > node.max_index() {
                        return XEntry::EMPTY;
                    }
                    self.node = CurrentState::Node(NonNull::from(node));
                    self.offset = (self.index >> node.shift()) as u8;
                } else {
                    if self.index > 0 {
                        return XEntry::EMPTY;
                    }
                    if self.xa.is_marked(mark) {
                        self.node = CurrentState::Empty;
                        return entry;
                    }
                    self.index = 1;
                    return XEntry::EMPTY;
                }
            }
            CurrentState::Node(_) => {}
        }

        while self.index <= max {
            let CurrentState::Node(ptr) = self.node else {
                break;
            };
            // SAFETY: reachable under the caller's guard/lock.
            let node = unsafe { &*ptr.as_ptr() };
            if self.offset == SLOT_SIZE as u8 {
                self.offset = node.offset() + 1;
                self.node = match node.parent() {
                    Some(parent) => CurrentState::Node(parent),
                    None => CurrentState::Empty,
                };
                if matches!(self.node, CurrentState::Empty) {
                    break;
                }
                advance = false;
                continue;
            }

            if !advance {
                let entry = node.entry(self.offset);
                if let Some(canonical) = entry.as_sibling() {
                    self.offset = canonical;
                    self.move_index(canonical);
                }
            }

            let offset = node.mark(m).next_marked(self.offset + advance as u8);
            if offset > self.offset {
                advance = false;
                self.move_index(offset);
                self.offset = offset;
                if offset == SLOT_SIZE as u8 {
                    continue;
                }
                if self.index > max {
                    break;
                }
            }

            let entry = node.entry(self.offset);
            if let Some(child) = entry.node_ptr() {
                self.node = CurrentState::Node(child);
                self.set_offset();
                continue;
            }
            return entry;
        }

        if matches!(self.node, CurrentState::Empty) {
            self.node = CurrentState::Bounds;
        }
        XEntry::EMPTY
    }

    /// Returns any present entry intersecting the state's multi-index
    /// range, or null once the range has been fully scanned. Repositions
    /// the state at the canonical offset when the scan completes, so a
    /// store can follow directly.
    pub fn find_conflict(&mut self) -> XEntry {
        match self.node {
            CurrentState::Error(_) | CurrentState::Empty => return XEntry::EMPTY,
            CurrentState::Restart | CurrentState::Bounds => {
                let mut curr = self.start();
                if curr.is_null() {
                    return XEntry::EMPTY;
                }
                while curr.is_node() {
                    // SAFETY: reachable under the lock.
                    curr = self.descend(unsafe { curr.as_node_ref() });
                }
                if !curr.is_null() {
                    return curr;
                }
            }
            CurrentState::Node(_) => {}
        }

        let Some(node) = self.current() else {
            return XEntry::EMPTY;
        };
        if node.shift() > self.shift {
            return XEntry::EMPTY;
        }

        loop {
            let node = self.current().unwrap();
            if node.shift() == self.shift {
                if (self.offset & self.sibs) == self.sibs {
                    break;
                }
            } else if self.offset == SLOT_MASK as u8 {
                self.offset = node.offset();
                match node.parent() {
                    Some(parent) => {
                        self.node = CurrentState::Node(parent);
                        continue;
                    }
                    None => {
                        self.node = CurrentState::Empty;
                        break;
                    }
                }
            }
            self.offset += 1;
            let mut curr = self.current().unwrap().entry(self.offset);
            if curr.is_sibling() {
                continue;
            }
            while let Some(child) = curr.node_ptr() {
                self.node = CurrentState::Node(child);
                self.offset = 0;
                curr = self.current().unwrap().entry(0);
            }
            if !curr.is_null() {
                return curr;
            }
        }

        self.offset = self.offset.wrapping_sub(self.sibs);
        XEntry::EMPTY
    }

    /// Prepares the state so that, after the caller drops and reacquires
    /// its lock or guard, iteration resumes at the first index strictly
    /// after the current position. Only forward iteration supports this.
    pub fn pause(&mut self) {
        match self.node {
            CurrentState::Node(_) => {
                let node = self.current().unwrap();
                let mut offset = self.offset;
                loop {
                    offset += 1;
                    if offset as usize >= SLOT_SIZE || !node.entry(offset).is_sibling() {
                        break;
                    }
                }
                self.index = self
                    .index
                    .wrapping_add(((offset - self.offset) as u64).wrapping_shl(node.shift() as u32));
            }
            CurrentState::Empty => {
                self.index += 1;
            }
            _ => return,
        }
        self.node = CurrentState::Restart;
    }

    /// Whether the last operation was aborted for lack of memory.
    pub fn needs_alloc(&self) -> bool {
        matches!(self.node, CurrentState::Error(XaError::NoMemory))
    }

    /// Recovers from a refused allocation: allocates a node with blocking
    /// allowed, parks it for the retry, and resets the state. Returns true
    /// if the caller should retry the operation.
    ///
    /// If no memory was needed, any unused preallocation is returned to the
    /// cache instead.
    pub fn alloc_parked_blocking(&mut self) -> bool {
        if !self.needs_alloc() {
            if let Some(node) = self.alloc.take() {
                node_cache().release(node);
            }
            return false;
        }

        debug!("node allocation refused; retrying with blocking allowed");
        match node_cache().alloc(AllocMode::CanBlock) {
            Some(node) => {
                self.alloc = Some(node);
                self.node = CurrentState::Restart;
                true
            }
            None => false,
        }
    }

    pub(crate) fn defer_drop_item(&self, epoch: &Guard, entry: XEntry) {
        let raw = entry.raw();
        let drop_item = self.drop_item;
        // SAFETY: the closure owns only plain words and runs once every
        // reader that could still hold a reference to this item has
        // unpinned.
        unsafe { epoch.defer_unchecked(move || drop_item(raw)) };
    }

    fn defer_free_node(&self, epoch: &Guard, node: &XNode) {
        let raw = node as *const XNode as usize;
        // SAFETY: the node has been unlinked from the tree under the lock;
        // the cache takes it back once every reader that could still
        // observe it has unpinned.
        unsafe { epoch.defer_unchecked(move || NodeCache::release_raw(raw as *mut XNode)) };
    }
}

impl Drop for XaState<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.alloc.take() {
            node_cache().release(node);
        }
    }
}
