//! The allocator root record.
//!
//! One [`BaseMeta`] lives in the metadata region. It holds everything the
//! allocator needs to resume: the list heads, the persistent roots, and the
//! dirty flag that tells the next session whether this one ended cleanly.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{MAX_CACHED_SPAN, MAX_ROOTS, NUM_SIZE_CLASSES};
use crate::descriptor::{AtomicDescNode, DescNode, ProcHeap};
use crate::persist;

/// "nvhMETA" followed by the layout version.
const META_MAGIC: u64 = 0x6e76_684d_4554_4101;

/// Dirty-flag value stored by a clean shutdown.
const CLEAN: u64 = 0x436c_6561_6e21_2121;

/// Dirty-flag value held for the whole of a session.
const DIRTY: u64 = 0x4469_7274_7921_2121;

/// Persistent allocator root.
///
/// The record is never constructed by value; it is laid over zero-filled
/// mapped memory, which is a valid (empty, dirty) state for every field.
#[repr(C, align(64))]
pub struct BaseMeta {
    magic: AtomicU64,
    dirty: AtomicU64,
    num_slots: AtomicU64,
    /// Free superblock runs, indexed by span. Entry 0 is unused.
    pub(crate) free_sb: [AtomicDescNode; MAX_CACHED_SPAN + 1],
    /// Per size class partial lists. Entry 0 (large) is unused.
    pub(crate) heaps: [ProcHeap; NUM_SIZE_CLASSES],
    /// Roots as offsets from the superblock region base; 0 is null.
    roots: [AtomicU64; MAX_ROOTS],
}

impl BaseMeta {
    /// Formats a zero-filled record for a heap of `num_slots` slots. The new
    /// session starts dirty.
    pub(crate) fn format(&self, num_slots: usize) {
        self.num_slots.store(num_slots as u64, Ordering::Relaxed);
        self.dirty.store(DIRTY, Ordering::Relaxed);
        persist::flush_range(std::ptr::from_ref(self).cast(), size_of::<Self>());
        persist::fence();
        self.magic.store(META_MAGIC, Ordering::Release);
        persist::persist(&self.magic);
    }

    /// Checks that the record belongs to a heap of `num_slots` slots.
    pub(crate) fn validate(&self, num_slots: usize) -> Result<(), &'static str> {
        if self.magic.load(Ordering::Acquire) != META_MAGIC {
            return Err("bad allocator root magic");
        }
        if self.num_slots.load(Ordering::Relaxed) != num_slots as u64 {
            return Err("slot count does not match the configured size");
        }
        Ok(())
    }

    /// Whether the last session did not end with a clean shutdown.
    ///
    /// Anything but the clean pattern, including a torn or zeroed word,
    /// counts as dirty.
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire) != CLEAN
    }

    /// Durably marks the session as running.
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(DIRTY, Ordering::Release);
        persist::persist(&self.dirty);
    }

    /// Durably marks the session as cleanly ended.
    pub(crate) fn mark_clean(&self) {
        self.dirty.store(CLEAN, Ordering::Release);
        persist::persist(&self.dirty);
    }

    /// Root `i` as a superblock-region offset.
    pub(crate) fn root(&self, i: usize) -> u64 {
        self.roots[i].load(Ordering::Acquire)
    }

    /// Durably replaces root `i`, returning the previous offset.
    pub(crate) fn swap_root(&self, i: usize, offset: u64) -> u64 {
        let old = self.roots[i].swap(offset, Ordering::AcqRel);
        persist::persist(&self.roots[i]);
        old
    }

    /// Empties every partial and free list. Recovery only.
    pub(crate) fn reset_lists(&self) {
        for head in &self.free_sb {
            head.store(DescNode::NULL, Ordering::Relaxed);
        }
        for heap in &self.heaps {
            heap.partial.store(DescNode::NULL, Ordering::Relaxed);
        }
        persist::flush_range(
            std::ptr::from_ref(&self.free_sb).cast(),
            size_of_val(&self.free_sb) + size_of_val(&self.heaps),
        );
        persist::fence();
    }
}
