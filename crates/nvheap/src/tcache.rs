//! Thread-local block caches.
//!
//! Every thread keeps, per open heap, one bin of free blocks per size
//! class. The common malloc/free path only touches the bin. Bins are refilled
//! a whole superblock's worth at a time and drained back in batches, see
//! `HeapInner::fill_bin` and `HeapInner::drain_bin`.
//!
//! A cached block stores the link to the next one in its first word as a
//! [`Pptr`], so a list spliced back into a superblock stays valid across
//! remapping.
//!
//! Bins are drained when the thread exits, through the destructor of the
//! thread-local registry.

use std::cell::RefCell;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Weak};

use crate::config::NUM_SIZE_CLASSES;
use crate::heap::HeapInner;
use crate::pptr::Pptr;

// ============================================================================
// Block links
// ============================================================================

/// Next block after `block` in a free list.
///
/// # Safety
///
/// `block` must be a free block of at least 8 bytes.
#[inline]
pub unsafe fn read_link(block: *mut u8) -> *mut u8 {
    unsafe { (*block.cast::<Pptr<u8>>()).as_ptr() }
}

/// Links `block` to `next` (null allowed).
///
/// # Safety
///
/// `block` must be a free block of at least 8 bytes.
#[inline]
pub unsafe fn write_link(block: *mut u8, next: *const u8) {
    unsafe { (*block.cast::<Pptr<u8>>()).set(next) };
}

// ============================================================================
// TCacheBin
// ============================================================================

/// A singly linked list of free blocks of one size class.
#[derive(Debug)]
pub struct TCacheBin {
    head: *mut u8,
    count: u32,
}

impl TCacheBin {
    /// An empty bin.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    /// First block, null when empty.
    #[must_use]
    pub const fn head(&self) -> *mut u8 {
        self.head
    }

    /// Number of cached blocks.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Whether the bin is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Caches one freed block.
    ///
    /// # Safety
    ///
    /// `block` must be a block of this bin's class no longer in use.
    pub unsafe fn push_block(&mut self, block: *mut u8) {
        unsafe { write_link(block, self.head) };
        self.head = block;
        self.count += 1;
    }

    /// Takes one block, or `None` if the bin is empty.
    pub fn pop_block(&mut self) -> Option<NonNull<u8>> {
        let block = NonNull::new(self.head)?;
        debug_assert!(self.count > 0);
        // SAFETY: cached blocks are free and linked.
        self.head = unsafe { read_link(block.as_ptr()) };
        self.count -= 1;
        Some(block)
    }

    /// Installs a linked list of `count` blocks into an empty bin.
    pub fn push_list(&mut self, head: *mut u8, count: u32) {
        debug_assert!(self.is_empty());
        self.head = head;
        self.count = count;
    }

    /// Detaches the first `count` blocks; `new_head` is the block after them.
    pub fn pop_list(&mut self, new_head: *mut u8, count: u32) {
        debug_assert!(self.count >= count);
        self.head = new_head;
        self.count -= count;
    }
}

impl Default for TCacheBin {
    fn default() -> Self {
        Self::new()
    }
}

/// One bin per size class.
pub type Bins = [TCacheBin; NUM_SIZE_CLASSES];

fn empty_bins() -> Box<Bins> {
    Box::new(std::array::from_fn(|_| TCacheBin::new()))
}

// ============================================================================
// Thread-local registry
// ============================================================================

struct HeapCache {
    heap_id: u64,
    heap: Weak<HeapInner>,
    /// Checked out while a `with_bins` call is using them.
    bins: Option<Box<Bins>>,
}

struct ThreadCaches {
    entries: Vec<HeapCache>,
}

impl Drop for ThreadCaches {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            if let (Some(heap), Some(mut bins)) = (entry.heap.upgrade(), entry.bins) {
                heap.drain_bins(&mut bins);
            }
        }
    }
}

thread_local! {
    static CACHES: RefCell<ThreadCaches> = const {
        RefCell::new(ThreadCaches { entries: Vec::new() })
    };
}

/// Runs `f` with this thread's bins for `heap`.
///
/// If the registry is unavailable (the thread is being torn down), `f` gets
/// temporary bins that are drained straight back afterwards.
pub fn with_bins<R>(heap: &Arc<HeapInner>, f: impl FnOnce(&mut Bins) -> R) -> R {
    let mut bins = checkout(heap).unwrap_or_else(empty_bins);
    let result = f(&mut bins);
    if let Some(mut bins) = checkin(heap.id(), bins) {
        heap.drain_bins(&mut bins);
    }
    result
}

/// Takes this thread's bins for `heap` out of the registry, registering the
/// heap on first use.
fn checkout(heap: &Arc<HeapInner>) -> Option<Box<Bins>> {
    CACHES
        .try_with(|caches| {
            let mut caches = caches.try_borrow_mut().ok()?;
            let id = heap.id();
            let pos = match caches.entries.iter().position(|e| e.heap_id == id) {
                Some(pos) => pos,
                None => {
                    // Heaps that are gone can never be drained into again.
                    caches.entries.retain(|e| e.heap.strong_count() > 0);
                    caches.entries.push(HeapCache {
                        heap_id: id,
                        heap: Arc::downgrade(heap),
                        bins: Some(empty_bins()),
                    });
                    caches.entries.len() - 1
                }
            };
            caches.entries[pos].bins.take()
        })
        .ok()
        .flatten()
}

/// Puts bins back into the registry. Returns them if there is no empty
/// entry to hold them.
fn checkin(heap_id: u64, bins: Box<Bins>) -> Option<Box<Bins>> {
    let mut bins = Some(bins);
    let _ = CACHES.try_with(|caches| {
        let Ok(mut caches) = caches.try_borrow_mut() else {
            return;
        };
        if let Some(entry) = caches
            .entries
            .iter_mut()
            .find(|e| e.heap_id == heap_id && e.bins.is_none())
        {
            entry.bins = bins.take();
        }
    });
    bins
}

/// Drains and forgets this thread's bins for `heap`.
pub fn drain_current_thread(heap: &HeapInner) {
    if let Some(mut bins) = take_entry(heap.id()).and_then(|entry| entry.bins) {
        heap.drain_bins(&mut bins);
    }
}

/// Forgets this thread's bins for heap `heap_id` without draining them.
pub fn discard_current_thread(heap_id: u64) {
    drop(take_entry(heap_id));
}

fn take_entry(heap_id: u64) -> Option<HeapCache> {
    CACHES
        .try_with(|caches| {
            let mut caches = caches.try_borrow_mut().ok()?;
            let pos = caches.entries.iter().position(|e| e.heap_id == heap_id)?;
            Some(caches.entries.swap_remove(pos))
        })
        .ok()
        .flatten()
}
