use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::entry::XEntry;
use crate::mark::{Mark, NUM_MARKS};
use crate::xarray::XLockGuard;
use crate::{SLOT_MASK, SLOT_SIZE};

/// `XNode` is the intermediate node in the tree-like structure of `XArray`.
///
/// It contains `SLOT_SIZE` slots, one mark bitmap per mark kind over those
/// slots, and a back-pointer to its parent. The `shift` of a node is the
/// number of index bits consumed below it: leaves have shift 0 and the root
/// carries the largest shift in the tree.
///
/// Slots are published with release ordering and read with acquire ordering,
/// so a reader that observes an entry can safely follow it. All other fields
/// are only written while the array lock is held.
pub struct XNode {
    /// Bits of the index consumed below this node.
    shift: u8,
    /// This node is its parent's `offset`-th child (0 at the root).
    offset: AtomicU8,
    /// The number of non-null slots: items, values, siblings and children.
    count: AtomicU8,
    /// The number of slots holding a value entry or a sibling of one.
    value_count: AtomicU8,
    /// Raw pointer to the parent node; zero at the root.
    parent: AtomicUsize,
    slots: [AtomicUsize; SLOT_SIZE],
    marks: [AtomicU64; NUM_MARKS],
}

impl XNode {
    pub(crate) fn new() -> Self {
        Self {
            shift: 0,
            offset: AtomicU8::new(0),
            count: AtomicU8::new(0),
            value_count: AtomicU8::new(0),
            parent: AtomicUsize::new(0),
            slots: [const { AtomicUsize::new(0) }; SLOT_SIZE],
            marks: [const { AtomicU64::new(0) }; NUM_MARKS],
        }
    }

    /// The number of index bits consumed below this node.
    pub fn shift(&self) -> u8 {
        self.shift
    }

    /// The position of this node in its parent's slot array.
    pub fn offset(&self) -> u8 {
        self.offset.load(Ordering::Relaxed)
    }

    /// The number of non-null slots in this node.
    pub fn count(&self) -> u8 {
        self.count.load(Ordering::Relaxed)
    }

    /// The number of slots holding value entries or siblings of value
    /// entries.
    pub fn value_count(&self) -> u8 {
        self.value_count.load(Ordering::Relaxed)
    }

    /// The maximum index representable below this node.
    pub(crate) fn max_index(&self) -> u64 {
        ((SLOT_SIZE as u64) << (self.shift as u32)).wrapping_sub(1)
    }

    /// The slot offset within this node that covers the target index.
    pub(crate) fn get_offset(&self, index: u64) -> u8 {
        ((index >> self.shift) & SLOT_MASK as u64) as u8
    }

    pub(crate) fn entry(&self, offset: u8) -> XEntry {
        XEntry::from_raw(self.slots[offset as usize].load(Ordering::Acquire))
    }

    /// Publishes `entry` into the slot and returns the previous entry.
    pub(crate) fn set_entry(&self, _guard: XLockGuard, offset: u8, entry: XEntry) -> XEntry {
        let old = XEntry::from_raw(self.slots[offset as usize].load(Ordering::Relaxed));
        self.slots[offset as usize].store(entry.raw(), Ordering::Release);
        old
    }

    pub(crate) fn parent(&self) -> Option<NonNull<XNode>> {
        NonNull::new(self.parent.load(Ordering::Acquire) as *mut XNode)
    }

    pub(crate) fn set_parent(&self, _guard: XLockGuard, parent: Option<NonNull<XNode>>) {
        let raw = parent.map_or(0, |p| p.as_ptr() as usize);
        self.parent.store(raw, Ordering::Release);
    }

    pub(crate) fn set_offset(&self, _guard: XLockGuard, offset: u8) {
        self.offset.store(offset, Ordering::Relaxed);
    }

    pub(crate) fn add_count(&self, _guard: XLockGuard, delta: i32) {
        let count = self.count.load(Ordering::Relaxed).wrapping_add(delta as u8);
        debug_assert!(count as usize <= SLOT_SIZE);
        self.count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn add_value_count(&self, _guard: XLockGuard, delta: i32) {
        let count = self
            .value_count
            .load(Ordering::Relaxed)
            .wrapping_add(delta as u8);
        debug_assert!(count as usize <= SLOT_SIZE);
        self.value_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn clear_counts(&self, _guard: XLockGuard) {
        self.count.store(0, Ordering::Relaxed);
        self.value_count.store(0, Ordering::Relaxed);
    }

    pub(crate) fn mark(&self, mark: usize) -> Mark {
        Mark::new(self.marks[mark].load(Ordering::Relaxed))
    }

    pub(crate) fn is_marked(&self, offset: u8, mark: usize) -> bool {
        self.mark(mark).is_marked(offset)
    }

    pub(crate) fn is_mark_clear(&self, mark: usize) -> bool {
        self.mark(mark).is_clear()
    }

    /// Sets the mark bit and returns whether it was already set.
    pub(crate) fn set_mark(&self, _guard: XLockGuard, offset: u8, mark: usize) -> bool {
        let bit = 1u64 << offset;
        self.marks[mark].fetch_or(bit, Ordering::Relaxed) & bit != 0
    }

    /// Clears the mark bit and returns whether it was previously set.
    pub(crate) fn unset_mark(&self, _guard: XLockGuard, offset: u8, mark: usize) -> bool {
        let bit = 1u64 << offset;
        self.marks[mark].fetch_and(!bit, Ordering::Relaxed) & bit != 0
    }

    pub(crate) fn store_mark(&self, _guard: XLockGuard, mark: usize, bits: Mark) {
        self.marks[mark].store(bits.raw(), Ordering::Relaxed);
    }

    /// Reinitializes a node taken from or returned to the node cache.
    fn reset(&mut self) {
        self.shift = 0;
        *self.offset.get_mut() = 0;
        *self.count.get_mut() = 0;
        *self.value_count.get_mut() = 0;
        *self.parent.get_mut() = 0;
        for slot in &mut self.slots {
            *slot.get_mut() = 0;
        }
        for mark in &mut self.marks {
            *mark.get_mut() = 0;
        }
    }

    /// Initializes the fields a fresh node needs before it is published.
    /// The node is still exclusively owned here.
    pub(crate) fn init(&mut self, shift: u8) {
        debug_assert!((shift as u32) < u64::BITS);
        self.shift = shift;
    }
}

/// How an allocation from the node cache may behave.
///
/// `NoWait` is used for every allocation attempted while the array lock is
/// held; `CanBlock` is the recovery mode used with the lock dropped (or where
/// blocking is otherwise acceptable).
#[derive(Debug, Clone, Copy)]
pub(crate) enum AllocMode {
    NoWait,
    CanBlock,
}

const NODE_CACHE_CAPACITY: usize = 32;

/// A process-wide cache of tree nodes, shared by all arrays.
///
/// Nodes are type-stable: a node reclaimed from one array may be handed to
/// any other. Reclaimed nodes reach the cache through the epoch deferral, so
/// a node is never reused while a reader could still observe it.
pub(crate) struct NodeCache {
    pool: Mutex<SmallVec<[Box<XNode>; 8]>>,
}

static NODE_CACHE: NodeCache = NodeCache {
    pool: Mutex::new(SmallVec::new_const()),
};

pub(crate) fn node_cache() -> &'static NodeCache {
    &NODE_CACHE
}

impl NodeCache {
    pub(crate) fn alloc(&self, mode: AllocMode) -> Option<Box<XNode>> {
        match mode {
            AllocMode::NoWait => {
                #[cfg(test)]
                if test_hooks::consume_nowait_failure() {
                    return None;
                }
            }
            AllocMode::CanBlock => {}
        }
        if let Some(node) = self.pool.lock().pop() {
            return Some(node);
        }
        Some(Box::new(XNode::new()))
    }

    pub(crate) fn release(&self, mut node: Box<XNode>) {
        node.reset();
        let mut pool = self.pool.lock();
        if pool.len() < NODE_CACHE_CAPACITY {
            pool.push(node);
        }
    }

    /// Returns a node that was unlinked from a tree.
    ///
    /// # Safety
    ///
    /// `ptr` must have been leaked from a `Box<XNode>` and must not be
    /// referenced again; in practice this is called from an epoch-deferred
    /// closure after the last reader has unpinned.
    pub(crate) unsafe fn release_raw(ptr: *mut XNode) {
        NODE_CACHE.release(Box::from_raw(ptr));
    }
}
