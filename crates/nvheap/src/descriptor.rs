//! Superblock descriptors and the lock-free lists that link them.
//!
//! Every 64 KiB slot of the superblock arena owns one [`Descriptor`] at the
//! same index of the descriptor table. The descriptor of a superblock's
//! first slot (its head) carries the superblock's metadata; the others only
//! record how far back their head is.
//!
//! Descriptors are linked into two kinds of Treiber stacks, each headed by a
//! [`DescNode`] word that pairs a descriptor index with a generation counter
//! so a stale head cannot win a CAS (the ABA problem):
//!
//! - per size class, the list of `PARTIAL` superblocks ([`ProcHeap`]);
//! - per span length, the list of free superblocks.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam::utils::Backoff;

use crate::config::DESC_SIZE;
use crate::persist;
use crate::size_class::SizeClassData;

// ============================================================================
// Anchor
// ============================================================================

/// Allocation state of a superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SuperblockState {
    /// No unreserved free blocks.
    Full = 0,
    /// Some free blocks; linked on its class's partial list.
    Partial = 1,
    /// Every block is free; eligible for retirement.
    Empty = 2,
}

impl SuperblockState {
    /// Decodes two state bits. The unused pattern `3` reads as `Full`, which
    /// never exposes blocks.
    const fn from_bits(bits: u64) -> Self {
        match bits {
            1 => Self::Partial,
            2 => Self::Empty,
            _ => Self::Full,
        }
    }
}

/// The allocation word of a superblock.
///
/// `avail` is the index of the first block of the superblock's free list and
/// `count` how many blocks that list holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    /// Superblock state.
    pub state: SuperblockState,
    /// Index of the first free block.
    pub avail: u32,
    /// Number of free blocks.
    pub count: u32,
}

const ANCHOR_FIELD_MASK: u64 = (1 << 31) - 1;

impl Anchor {
    /// `state` in bits 0..2, `avail` in 2..33, `count` in 33..64.
    #[must_use]
    pub const fn pack(self) -> u64 {
        (self.state as u64)
            | ((self.avail as u64 & ANCHOR_FIELD_MASK) << 2)
            | ((self.count as u64 & ANCHOR_FIELD_MASK) << 33)
    }

    /// Inverse of [`Anchor::pack`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn unpack(word: u64) -> Self {
        Self {
            state: SuperblockState::from_bits(word & 0b11),
            avail: ((word >> 2) & ANCHOR_FIELD_MASK) as u32,
            count: ((word >> 33) & ANCHOR_FIELD_MASK) as u32,
        }
    }
}

/// An [`Anchor`] updated as one 64-bit word.
#[repr(transparent)]
pub struct AtomicAnchor(AtomicU64);

impl AtomicAnchor {
    /// Loads the anchor.
    pub fn load(&self, order: Ordering) -> Anchor {
        Anchor::unpack(self.0.load(order))
    }

    /// Stores the anchor.
    pub fn store(&self, anchor: Anchor, order: Ordering) {
        self.0.store(anchor.pack(), order);
    }

    /// Weak compare-and-swap of the whole word.
    ///
    /// # Errors
    ///
    /// Returns the current anchor if it was not `current` (or spuriously).
    pub fn compare_exchange_weak(
        &self,
        current: Anchor,
        new: Anchor,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Anchor, Anchor> {
        self.0
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
            .map(Anchor::unpack)
            .map_err(Anchor::unpack)
    }
}

// ============================================================================
// DescNode
// ============================================================================

/// A descriptor index tagged with a generation counter.
///
/// Packed as `counter << 32 | (index + 1)`, so the all-zero word is a null
/// node with counter 0.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DescNode {
    index: Option<u32>,
    counter: u32,
}

impl DescNode {
    /// The null node.
    pub const NULL: Self = Self {
        index: None,
        counter: 0,
    };

    /// A node for `index` with generation `counter`.
    #[must_use]
    pub const fn new(index: Option<u32>, counter: u32) -> Self {
        Self { index, counter }
    }

    /// The descriptor index, `None` for null.
    #[must_use]
    pub const fn index(self) -> Option<u32> {
        self.index
    }

    /// The generation counter.
    #[must_use]
    pub const fn counter(self) -> u32 {
        self.counter
    }

    /// Packs into one word.
    #[must_use]
    pub const fn pack(self) -> u64 {
        let index = match self.index {
            Some(i) => i as u64 + 1,
            None => 0,
        };
        ((self.counter as u64) << 32) | index
    }

    /// Inverse of [`DescNode::pack`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn unpack(word: u64) -> Self {
        let index = (word & 0xffff_ffff) as u32;
        Self {
            index: if index == 0 { None } else { Some(index - 1) },
            counter: (word >> 32) as u32,
        }
    }
}

impl fmt::Debug for DescNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "DescNode({i}@{})", self.counter),
            None => write!(f, "DescNode(null@{})", self.counter),
        }
    }
}

/// A [`DescNode`] updated as one 64-bit word.
#[repr(transparent)]
pub struct AtomicDescNode(AtomicU64);

impl AtomicDescNode {
    /// A null head.
    #[must_use]
    pub const fn null() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Loads the node.
    pub fn load(&self, order: Ordering) -> DescNode {
        DescNode::unpack(self.0.load(order))
    }

    /// Stores the node.
    pub fn store(&self, node: DescNode, order: Ordering) {
        self.0.store(node.pack(), order);
    }

    fn compare_exchange(&self, current: DescNode, new: DescNode) -> bool {
        self.0
            .compare_exchange(current.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Metadata of one superblock slot. Lives in the descriptor region.
///
/// Only the head slot's descriptor describes a superblock. Fields are
/// atomics because the table is shared mapped memory.
#[repr(C, align(64))]
pub struct Descriptor {
    pub(crate) next_free: AtomicDescNode,
    pub(crate) next_partial: AtomicDescNode,
    pub(crate) anchor: AtomicAnchor,
    block_size: AtomicU64,
    class_idx: AtomicU32,
    max_count: AtomicU32,
    span: AtomicU32,
    head_delta: AtomicU32,
}

const _: () = assert!(size_of::<Descriptor>() == DESC_SIZE);

impl Descriptor {
    /// A zeroed descriptor, the state of a never-used slot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_free: AtomicDescNode::null(),
            next_partial: AtomicDescNode::null(),
            anchor: AtomicAnchor(AtomicU64::new(0)),
            block_size: AtomicU64::new(0),
            class_idx: AtomicU32::new(0),
            max_count: AtomicU32::new(0),
            span: AtomicU32::new(0),
            head_delta: AtomicU32::new(0),
        }
    }

    /// The allocation word.
    #[must_use]
    pub const fn anchor(&self) -> &AtomicAnchor {
        &self.anchor
    }

    /// Bytes per block; 0 for a retired or unused superblock.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Acquire) as usize
    }

    /// Size class index; 0 for large.
    #[must_use]
    pub fn class_idx(&self) -> usize {
        self.class_idx.load(Ordering::Acquire) as usize
    }

    /// Blocks in the superblock.
    #[must_use]
    pub fn max_count(&self) -> u32 {
        self.max_count.load(Ordering::Acquire)
    }

    /// Slots covered by the superblock.
    #[must_use]
    pub fn span(&self) -> usize {
        self.span.load(Ordering::Acquire) as usize
    }

    /// Distance back to the head slot; 0 on a head.
    #[must_use]
    pub fn head_delta(&self) -> usize {
        self.head_delta.load(Ordering::Acquire) as usize
    }

    /// Whether the descriptor currently describes a superblock in use.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.block_size() != 0
    }

    /// Marks this slot as `delta` slots behind its head.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn set_head_delta(&self, delta: usize) {
        self.head_delta.store(delta as u32, Ordering::Release);
    }

    /// Sets the span of a free or fresh run.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn set_span(&self, span: usize) {
        self.span.store(span as u32, Ordering::Release);
    }

    /// Describes a superblock of `class`. The anchor is set by the caller.
    pub(crate) fn init_small(&self, class_idx: usize, class: &SizeClassData) {
        #[allow(clippy::cast_possible_truncation)]
        self.class_idx.store(class_idx as u32, Ordering::Relaxed);
        self.max_count.store(class.block_num, Ordering::Relaxed);
        self.block_size
            .store(u64::from(class.block_size), Ordering::Release);
    }

    /// Describes a large allocation covering the whole run.
    pub(crate) fn init_large(&self, bytes: usize) {
        self.class_idx.store(0, Ordering::Relaxed);
        self.max_count.store(1, Ordering::Relaxed);
        self.anchor.store(
            Anchor {
                state: SuperblockState::Full,
                avail: 0,
                count: 0,
            },
            Ordering::Relaxed,
        );
        self.block_size.store(bytes as u64, Ordering::Release);
    }

    /// Marks the superblock unused. The storage is never freed.
    pub(crate) fn retire(&self) {
        self.block_size.store(0, Ordering::Release);
        self.class_idx.store(0, Ordering::Relaxed);
        self.max_count.store(0, Ordering::Relaxed);
        self.anchor.store(
            Anchor {
                state: SuperblockState::Empty,
                avail: 0,
                count: 0,
            },
            Ordering::Relaxed,
        );
    }

    /// Writes the descriptor's cache line back and fences.
    pub(crate) fn persist(&self) {
        persist::persist(self);
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("anchor", &self.anchor.load(Ordering::Relaxed))
            .field("block_size", &self.block_size())
            .field("class_idx", &self.class_idx())
            .field("max_count", &self.max_count())
            .field("span", &self.span())
            .field("head_delta", &self.head_delta())
            .finish_non_exhaustive()
    }
}

/// Per-size-class heap: the head of the class's `PARTIAL` list.
#[repr(C, align(64))]
pub struct ProcHeap {
    pub(crate) partial: AtomicDescNode,
}

impl ProcHeap {
    /// An empty heap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            partial: AtomicDescNode::null(),
        }
    }
}

impl Default for ProcHeap {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Lock-free descriptor stacks
// ============================================================================

/// Resolves descriptor indices.
pub trait DescTable {
    /// The descriptor at `index`.
    fn desc(&self, index: u32) -> &Descriptor;
}

impl DescTable for [Descriptor] {
    #[inline]
    fn desc(&self, index: u32) -> &Descriptor {
        &self[index as usize]
    }
}

/// Which link field a stack threads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescLink {
    /// `next_partial`, for partial lists.
    Partial,
    /// `next_free`, for free-superblock lists.
    Free,
}

impl DescLink {
    const fn of(self, desc: &Descriptor) -> &AtomicDescNode {
        match self {
            Self::Partial => &desc.next_partial,
            Self::Free => &desc.next_free,
        }
    }
}

/// Pushes descriptor `index` onto the stack at `head`.
pub fn push<T: DescTable + ?Sized>(table: &T, head: &AtomicDescNode, link: DescLink, index: u32) {
    let next = link.of(table.desc(index));
    let backoff = Backoff::new();
    loop {
        let old = head.load(Ordering::Acquire);
        next.store(old, Ordering::Relaxed);
        persist::persist(next);
        let new = DescNode::new(Some(index), old.counter().wrapping_add(1));
        if head.compare_exchange(old, new) {
            persist::persist(head);
            return;
        }
        backoff.spin();
    }
}

/// Pops the top descriptor of the stack at `head`.
pub fn pop<T: DescTable + ?Sized>(table: &T, head: &AtomicDescNode, link: DescLink) -> Option<u32> {
    let backoff = Backoff::new();
    loop {
        let old = head.load(Ordering::Acquire);
        let index = old.index()?;
        let next = link.of(table.desc(index)).load(Ordering::Acquire);
        let new = DescNode::new(next.index(), old.counter().wrapping_add(1));
        if head.compare_exchange(old, new) {
            persist::persist(head);
            return Some(index);
        }
        backoff.spin();
    }
}
