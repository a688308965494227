//! A lock-free, crash-recoverable heap allocator for persistent memory.
//!
//! `nvheap` manages a heap that lives in memory-mapped files and survives
//! process restarts. Allocation follows the LRMalloc design: superblocks of
//! fixed-size blocks, per-thread caches, and lock-free descriptor lists
//! updated by CAS. Nothing is logged on the fast path. After a crash the
//! metadata is rebuilt offline by tracing the object graph from a small set
//! of persistent roots.
//!
//! # Features
//!
//! - **Lock-free allocation**: `malloc`/`free` never block
//! - **Position independence**: [`Pptr`] stores self-relative offsets, so a
//!   heap can be mapped at a different address in every session
//! - **Crash recovery**: a dirty restart is detected on open and repaired by
//!   [`Heap::recover`]
//! - **Precise tracing**: `#[derive(Trace)]` for root types, with
//!   conservative scanning as the fallback
//!
//! # Quick Start
//!
//! ```
//! use nvheap::{Heap, HeapConfig, Pptr, Trace};
//!
//! #[derive(Trace)]
//! struct Node {
//!     value: u64,
//!     next: Pptr<Node>,
//! }
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = HeapConfig::new("quickstart").dir(dir.path()).size(8 << 20);
//! let heap = Heap::open(config.clone()).unwrap();
//!
//! let node = heap.malloc(size_of::<Node>()).unwrap().cast::<Node>();
//! unsafe { node.write(Node { value: 7, next: Pptr::null() }) };
//! nvheap::persist::persist(node.as_ptr());
//! heap.set_root(node.as_ptr(), 0).unwrap();
//! heap.close().unwrap();
//!
//! let heap = Heap::open(config).unwrap();
//! heap.recover().unwrap();
//! let node = heap.get_root::<Node>(0).unwrap();
//! assert_eq!(unsafe { (*node).value }, 7);
//! ```
//!
//! # Thread Safety
//!
//! [`Heap`] is `Send + Sync` and cheap to clone. Each thread allocates from
//! its own cache; caches are drained back when the thread exits.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod config;
pub mod descriptor;
mod error;
pub mod gc;
mod heap;
mod meta;
mod metrics;
pub mod persist;
pub mod pptr;
pub mod region;
pub mod size_class;
mod tcache;
mod tracing;

// Re-export public API
pub use config::{HeapConfig, RegionIndex};
pub use error::{Error, Result};
pub use gc::{Trace, Visitor};
pub use heap::Heap;
pub use metrics::RecoveryMetrics;
pub use pptr::{AtomicPptr, Pptr};
pub use crate::tracing::RecoveryId;

// Re-export derive macro when feature is enabled
#[cfg(feature = "derive")]
pub use nvheap_derive::Trace;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use crate::Heap;

    /// Drops `heap` as if its process had been killed.
    pub fn simulate_crash(heap: Heap) {
        heap.simulate_crash();
    }

    /// Anchor and block capacity of every live superblock, in slot order.
    #[must_use]
    pub fn anchors(heap: &Heap) -> Vec<(crate::descriptor::Anchor, u32)> {
        heap.live_anchors()
    }

    /// Checks every live anchor: a superblock that is not FULL has its free
    /// list head inside it, and no superblock counts all of its blocks as
    /// free.
    ///
    /// # Panics
    ///
    /// On the first malformed anchor.
    pub fn assert_anchors_valid(heap: &Heap) {
        use crate::descriptor::SuperblockState;
        for (anchor, capacity) in heap.live_anchors() {
            assert!(anchor.count < capacity, "{anchor:?} of capacity {capacity}");
            if anchor.state != SuperblockState::Full {
                assert!(anchor.avail < capacity, "{anchor:?} of capacity {capacity}");
            }
        }
    }

    /// Slots minted from the superblock arena so far.
    #[must_use]
    pub fn used_slots(heap: &Heap) -> usize {
        heap.used_bytes(crate::RegionIndex::Superblock) / crate::config::SB_SIZE
    }
}
