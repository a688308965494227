//! Offline mark and rebuild after a dirty restart.
//!
//! Recovery trusts nothing but the roots, the descriptors' shape fields and
//! the bump offsets. It marks every block reachable from the roots, then
//! rebuilds every superblock's free list, every anchor and every list head
//! from the mark bits alone.

use std::ptr::{self, NonNull};
use std::time::Instant;

use crate::config::{RegionIndex, MAX_ROOTS};
use crate::descriptor::{self, Anchor, DescLink, DescTable, SuperblockState};
use crate::error::Result;
use crate::heap::{HeapInner, SuperblockLayout};
use crate::metrics::RecoveryMetrics;
use crate::persist;
use crate::pptr;
use crate::tcache::write_link;
use crate::tracing::internal::{next_recovery_id, trace_phase, trace_recovery, RecoveryPhase};

use super::bitmap::{MarkBitmap, GRANULE};
use super::trace::{Trace, Visitor};

/// Recovery tracer of one block: the address the root or field pointed at,
/// and the marker to report further pointers to.
pub(crate) type TraceFn = unsafe fn(NonNull<u8>, &mut Marker<'_>);

/// Traces the `T` stored at `target`.
///
/// # Safety
///
/// `target` must point into a block recovery has validated.
pub(crate) unsafe fn trace_typed<T: Trace>(target: NonNull<u8>, marker: &mut Marker<'_>) {
    if !marker.fits(target.as_ptr(), size_of::<T>()) {
        return;
    }
    // SAFETY: the value lies inside one live block.
    let value = unsafe { &*target.as_ptr().cast::<T>() };
    value.trace(marker);
}

/// Scans the whole block containing `target` for pointers.
///
/// # Safety
///
/// `target` must point into a block recovery has validated.
pub(crate) unsafe fn trace_conservative(target: NonNull<u8>, marker: &mut Marker<'_>) {
    let Some((block, len)) = marker.block_of(target.as_ptr()) else {
        return;
    };
    // SAFETY: the block is inside the mapped arena.
    unsafe { marker.visit_region(block, len) };
}

// ============================================================================
// Marker
// ============================================================================

/// The mark-phase visitor.
pub(crate) struct Marker<'h> {
    heap: &'h HeapInner,
    base: usize,
    bitmap: MarkBitmap,
    worklist: Vec<(NonNull<u8>, TraceFn)>,
}

impl<'h> Marker<'h> {
    fn new(heap: &'h HeapInner) -> Self {
        let used = heap.used_slots() * crate::config::SB_SIZE;
        Self {
            heap,
            base: heap.slots_start(),
            bitmap: MarkBitmap::for_bytes(used),
            worklist: Vec::new(),
        }
    }

    /// Start and length of the live block containing `addr`.
    fn block_of(&self, addr: *const u8) -> Option<(*const u8, usize)> {
        let layout = self.heap.layout_of(addr)?;
        let sb = self.heap.slot_addr(layout.head) as usize;
        let index = (addr as usize - sb) / layout.block_size;
        Some(((sb + index * layout.block_size) as *const u8, layout.block_size))
    }

    /// Whether `len` bytes at `addr` lie inside one live block.
    fn fits(&self, addr: *const u8, len: usize) -> bool {
        self.block_of(addr)
            .is_some_and(|(block, size)| addr as usize + len <= block as usize + size)
    }

    /// Marks the block containing `addr` and queues `tracer` for it if it
    /// was not marked yet. Addresses outside every live block are ignored.
    fn mark(&mut self, addr: *const u8, tracer: TraceFn) {
        let Some((block, _)) = self.block_of(addr) else {
            return;
        };
        if self.bitmap.mark(block as usize - self.base) {
            // SAFETY: block_of only accepts addresses inside the arena.
            let target = unsafe { NonNull::new_unchecked(addr.cast_mut()) };
            self.worklist.push((target, tracer));
        }
    }

    fn drain(&mut self) {
        while let Some((target, tracer)) = self.worklist.pop() {
            // SAFETY: queued targets passed block_of.
            unsafe { tracer(target, self) };
        }
    }

    fn is_marked(&self, block: *const u8) -> bool {
        self.bitmap.is_marked(block as usize - self.base)
    }
}

impl Visitor for Marker<'_> {
    fn visit<T: Trace>(&mut self, target: *const T) {
        if !target.is_null() {
            self.mark(target.cast(), trace_typed::<T>);
        }
    }

    unsafe fn visit_region(&mut self, ptr: *const u8, len: usize) {
        let start = (ptr as usize).next_multiple_of(GRANULE);
        let end = ptr as usize + len;
        let mut addr = start;
        while addr + GRANULE <= end {
            // SAFETY: aligned and inside the region the caller vouched for.
            let word = unsafe { ptr::read(addr as *const u64) };
            let target = pptr::decode(word, addr);
            if target != 0 {
                self.mark(target as *const u8, trace_conservative);
            }
            addr += GRANULE;
        }
    }
}

// ============================================================================
// Recovery
// ============================================================================

/// Marks from every root, rebuilds all allocator metadata, and writes it
/// back.
pub(crate) fn recover(heap: &HeapInner) -> Result<RecoveryMetrics> {
    let id = next_recovery_id();
    let _span = trace_recovery(id);
    let start = Instant::now();
    let mut metrics = RecoveryMetrics::new();

    let marker = {
        let _phase = trace_phase(RecoveryPhase::Mark);
        let mark_start = Instant::now();
        let mut marker = Marker::new(heap);
        for index in 0..MAX_ROOTS {
            let offset = heap.meta().root(index);
            let root = heap.regions().translate(RegionIndex::Superblock, offset);
            if root.is_null() {
                continue;
            }
            metrics.roots_traced += 1;
            let tracer = heap.root_tracer(index).unwrap_or(trace_conservative);
            marker.mark(root, tracer);
            marker.drain();
        }
        metrics.blocks_marked = marker.bitmap.marked_count();
        metrics.mark_duration = mark_start.elapsed();
        marker
    };

    {
        let _phase = trace_phase(RecoveryPhase::Rebuild);
        let rebuild_start = Instant::now();
        rebuild(heap, &marker, &mut metrics);
        metrics.rebuild_duration = rebuild_start.elapsed();
    }

    heap.regions().flush_all()?;
    persist::fence();
    metrics.duration = start.elapsed();
    crate::tracing::internal::log_recovery_complete(id, &metrics);
    Ok(metrics)
}

/// Walks every minted slot in address order, keeping marked superblocks and
/// returning everything else to the free lists in maximal runs.
#[allow(clippy::cast_possible_truncation)]
fn rebuild(heap: &HeapInner, marker: &Marker<'_>, metrics: &mut RecoveryMetrics) {
    heap.meta().reset_lists();

    let used = heap.used_slots();
    let mut free_run: Option<(u32, usize)> = None;
    let mut slot = 0usize;
    while slot < used {
        let head = slot as u32;
        let (span, live) = match heap.layout(head) {
            Some(layout) => (layout.span, rebuild_superblock(heap, marker, layout, metrics)),
            None => (1, false),
        };

        if live {
            if let Some((start, len)) = free_run.take() {
                heap.release_run(start, len);
                metrics.slots_freed += len;
            }
            heap.format_run(head, span);
        } else {
            free_run = match free_run {
                Some((start, len)) => Some((start, len + span)),
                None => Some((head, span)),
            };
        }
        slot += span;
    }
    if let Some((start, len)) = free_run {
        heap.release_run(start, len);
        metrics.slots_freed += len;
    }
}

/// Rebuilds one superblock from the mark bits. Returns whether any of its
/// blocks survived.
fn rebuild_superblock(
    heap: &HeapInner,
    marker: &Marker<'_>,
    layout: SuperblockLayout,
    metrics: &mut RecoveryMetrics,
) -> bool {
    let desc = heap.desc(layout.head);
    let sb = heap.slot_addr(layout.head);

    if layout.is_large() {
        if !marker.is_marked(sb) {
            return false;
        }
        desc.anchor().store(
            Anchor {
                state: SuperblockState::Full,
                avail: 0,
                count: 0,
            },
            std::sync::atomic::Ordering::Release,
        );
        desc.persist();
        metrics.superblocks_full += 1;
        return true;
    }

    let mut first_free: *const u8 = ptr::null();
    let mut avail = layout.max_count;
    let mut count = 0;
    for i in (0..layout.max_count).rev() {
        let block = sb.wrapping_add(i as usize * layout.block_size);
        if marker.is_marked(block) {
            continue;
        }
        // SAFETY: an unmarked block is unreachable and ours to relink.
        unsafe { write_link(block, first_free) };
        first_free = block;
        avail = i;
        count += 1;
    }
    if count == layout.max_count {
        return false;
    }

    let anchor = if count == 0 {
        Anchor {
            state: SuperblockState::Full,
            avail: layout.max_count,
            count: 0,
        }
    } else {
        Anchor {
            state: SuperblockState::Partial,
            avail,
            count,
        }
    };
    desc.anchor()
        .store(anchor, std::sync::atomic::Ordering::Release);
    desc.persist();

    if anchor.state == SuperblockState::Partial {
        let list = &heap.meta().heaps[layout.class_idx].partial;
        descriptor::push(heap, list, DescLink::Partial, layout.head);
        metrics.superblocks_partial += 1;
    } else {
        metrics.superblocks_full += 1;
    }
    true
}
