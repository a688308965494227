//! The allocator root: superblock lifecycle, malloc/free, roots, and
//! session management.
//!
//! # Layout
//!
//! ```text
//! desc region   [hdr][ D0 | D1 | D2 | D3 | ... ]        64 bytes each
//! sb region     [hdr][ S0 | S1 | S2 | S3 | ... ]        64 KiB each
//! meta region   [hdr][ BaseMeta ]
//! ```
//!
//! Slot `Si` owns descriptor `Di`. A superblock is a run of `span`
//! consecutive slots and is described by the descriptor of its first slot.
//! Slots are minted from the superblock region's bump allocator in whole
//! multiples of 64 KiB, so slot `i` always sits at `S0 + i * 64 KiB`.
//!
//! # Sessions
//!
//! Opening a heap drives the dirty flag to DIRTY and takes an exclusive lock
//! on the metadata file for the lifetime of the session. Only a clean
//! writeback stores CLEAN. A heap that opens dirty refuses allocation until
//! [`Heap::recover`] has rebuilt its metadata.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use sys_alloc::FileLock;

use crate::config::{
    HeapConfig, RegionIndex, DESC_SIZE, MAX_CACHED_SPAN, MAX_HEAP_SIZE, MAX_ROOTS, SB_SIZE,
};
use crate::descriptor::{self, Anchor, DescLink, DescTable, Descriptor, SuperblockState};
use crate::error::{Error, Result};
use crate::gc::{self, Trace, TraceFn};
use crate::meta::BaseMeta;
use crate::metrics::RecoveryMetrics;
use crate::persist;
use crate::region::Regions;
use crate::size_class::{large_span, SIZE_CLASSES};
use crate::tcache::{self, read_link, write_link, Bins, TCacheBin};

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;
const STATE_ABANDONED: u8 = 2;

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// Shape of a live superblock, as read from its head descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SuperblockLayout {
    pub head: u32,
    pub span: usize,
    pub class_idx: usize,
    pub block_size: usize,
    pub max_count: u32,
}

impl SuperblockLayout {
    pub const fn is_large(&self) -> bool {
        self.class_idx == 0
    }
}

// ============================================================================
// HeapInner
// ============================================================================

pub(crate) struct HeapInner {
    id: u64,
    config: HeapConfig,
    regions: Regions,
    _lock: FileLock,
    meta: NonNull<BaseMeta>,
    descs: NonNull<Descriptor>,
    slots: NonNull<u8>,
    num_slots: usize,
    restart: bool,
    recovery_pending: AtomicBool,
    recovery_lock: Mutex<()>,
    state: AtomicU8,
    tracers: Mutex<Box<[Option<TraceFn>]>>,
    last_recovery: Mutex<Option<RecoveryMetrics>>,
}

// SAFETY: all shared state behind the raw pointers is atomics in mapped
// memory that lives as long as `regions`.
unsafe impl Send for HeapInner {}
unsafe impl Sync for HeapInner {}

impl DescTable for HeapInner {
    #[inline]
    fn desc(&self, index: u32) -> &Descriptor {
        debug_assert!((index as usize) < self.num_slots);
        // SAFETY: the descriptor table holds `num_slots` descriptors.
        unsafe { &*self.descs.as_ptr().add(index as usize) }
    }
}

impl HeapInner {
    fn open(config: HeapConfig) -> Result<Self> {
        let num_slots = config.slot_count()?;
        let sizes = [
            num_slots * DESC_SIZE,
            num_slots * SB_SIZE,
            size_of::<BaseMeta>(),
        ];
        let regions = Regions::open(&config, sizes)?;

        let meta_region = regions.get(RegionIndex::Meta);
        let lock = FileLock::try_exclusive(meta_region.file())
            .map_err(|err| Error::io(meta_region.path(), err))?
            .ok_or_else(|| Error::HeapBusy(meta_region.path().to_path_buf()))?;

        let restart = regions.is_restart();
        let (meta, descs, slots) = if restart {
            Self::locate(&regions, num_slots)?
        } else {
            Self::format(&regions, num_slots)?
        };

        // SAFETY: `meta` points at a formatted record inside the mapping.
        let was_dirty = restart && unsafe { meta.as_ref() }.is_dirty();
        unsafe { meta.as_ref() }.mark_dirty();

        crate::tracing::internal::log_heap_opened(&config.id, restart, was_dirty);

        Ok(Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            config,
            regions,
            _lock: lock,
            meta,
            descs,
            slots,
            num_slots,
            restart,
            recovery_pending: AtomicBool::new(was_dirty),
            recovery_lock: Mutex::new(()),
            state: AtomicU8::new(STATE_OPEN),
            tracers: Mutex::new(vec![None; MAX_ROOTS].into_boxed_slice()),
            last_recovery: Mutex::new(None),
        })
    }

    /// Lays out a brand new heap. The metadata root is recorded last, so a
    /// crash before that point leaves a heap that refuses to open rather
    /// than one that opens half formatted.
    fn format(
        regions: &Regions,
        num_slots: usize,
    ) -> Result<(NonNull<BaseMeta>, NonNull<Descriptor>, NonNull<u8>)> {
        let descs = regions.expand(RegionIndex::Desc, num_slots * DESC_SIZE)?;
        regions.get(RegionIndex::Desc).set_heap_start(descs.as_ptr());

        let sb_region = regions.get(RegionIndex::Superblock);
        let (base, _) = sb_region.range();
        let slots = base.wrapping_add(crate::config::PAGE_SIZE);
        sb_region.set_heap_start(slots);

        let meta = regions.expand(RegionIndex::Meta, size_of::<BaseMeta>())?;
        let meta = meta.cast::<BaseMeta>();
        // SAFETY: freshly expanded, zero-filled, page aligned.
        unsafe { meta.as_ref() }.format(num_slots);
        regions.get(RegionIndex::Meta).set_heap_start(meta.as_ptr().cast());

        // SAFETY: slots is inside the mapping, past its header.
        Ok((meta, descs.cast(), unsafe { NonNull::new_unchecked(slots) }))
    }

    fn locate(
        regions: &Regions,
        num_slots: usize,
    ) -> Result<(NonNull<BaseMeta>, NonNull<Descriptor>, NonNull<u8>)> {
        let start = |index: RegionIndex, what: &'static str| {
            let region = regions.get(index);
            NonNull::new(region.heap_start()).ok_or_else(|| Error::Corrupted {
                path: region.path().to_path_buf(),
                reason: what,
            })
        };
        let meta = start(RegionIndex::Meta, "allocator root was never recorded")?.cast::<BaseMeta>();
        let descs = start(RegionIndex::Desc, "descriptor table was never recorded")?;
        let slots = start(RegionIndex::Superblock, "slot area was never recorded")?;

        // SAFETY: heap_start points inside the metadata mapping.
        unsafe { meta.as_ref() }
            .validate(num_slots)
            .map_err(|reason| Error::Corrupted {
                path: regions.get(RegionIndex::Meta).path().to_path_buf(),
                reason,
            })?;
        Ok((meta, descs.cast(), slots))
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn meta(&self) -> &BaseMeta {
        // SAFETY: the record lives as long as the mapping.
        unsafe { self.meta.as_ref() }
    }

    pub(crate) const fn regions(&self) -> &Regions {
        &self.regions
    }

    fn check_open(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => Ok(()),
            _ => Err(Error::Closed),
        }
    }

    fn check_ready(&self) -> Result<()> {
        self.check_open()?;
        if self.recovery_pending.load(Ordering::Acquire) {
            return Err(Error::RecoveryPending);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------------

    /// Address of slot `index`.
    pub(crate) fn slot_addr(&self, index: u32) -> *mut u8 {
        self.slots.as_ptr().wrapping_add(index as usize * SB_SIZE)
    }

    /// Address of the first slot.
    pub(crate) fn slots_start(&self) -> usize {
        self.slots.as_ptr() as usize
    }

    /// Slots minted so far.
    pub(crate) fn used_slots(&self) -> usize {
        self.regions.get(RegionIndex::Superblock).used() / SB_SIZE
    }

    /// Slot containing `ptr`, if it lies in a minted slot.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn slot_of(&self, ptr: *const u8) -> Option<u32> {
        let start = self.slots_start();
        let addr = ptr as usize;
        if addr < start {
            return None;
        }
        let slot = (addr - start) / SB_SIZE;
        (slot < self.used_slots()).then_some(slot as u32)
    }

    /// Head slot of the superblock containing `slot`.
    #[allow(clippy::cast_possible_truncation)]
    fn head_of(&self, slot: u32) -> Option<u32> {
        let delta = self.desc(slot).head_delta();
        (delta <= slot as usize).then(|| slot - delta as u32)
    }

    /// Shape of the superblock headed at `head`, or `None` if the head
    /// descriptor does not describe a live superblock consistent with the
    /// size-class table.
    pub(crate) fn layout(&self, head: u32) -> Option<SuperblockLayout> {
        let desc = self.desc(head);
        let span = desc.span();
        if desc.head_delta() != 0 || span == 0 || head as usize + span > self.used_slots() {
            return None;
        }
        let block_size = desc.block_size();
        let class_idx = desc.class_idx();
        let max_count = desc.max_count();
        if block_size == 0 {
            return None;
        }
        let consistent = if class_idx == 0 {
            block_size == span * SB_SIZE && max_count == 1
        } else if class_idx < crate::config::NUM_SIZE_CLASSES {
            let class = SIZE_CLASSES.get(class_idx);
            block_size == class.block_size as usize
                && span == class.span as usize
                && max_count == class.block_num
        } else {
            false
        };
        consistent.then_some(SuperblockLayout {
            head,
            span,
            class_idx,
            block_size,
            max_count,
        })
    }

    /// Layout of the live superblock containing `ptr`.
    pub(crate) fn layout_of(&self, ptr: *const u8) -> Option<SuperblockLayout> {
        let slot = self.slot_of(ptr)?;
        let layout = self.layout(self.head_of(slot)?)?;
        (slot < layout.head + layout.span as u32).then_some(layout)
    }

    /// Resolves `ptr` to its live superblock and checks that it is a block
    /// start.
    fn live_block(&self, ptr: *const u8) -> Result<SuperblockLayout> {
        let addr = ptr as usize;
        if self.slot_of(ptr).is_none() {
            return Err(Error::ForeignPointer(addr));
        }
        let layout = self.layout_of(ptr).ok_or(Error::InvalidFree(addr))?;
        let offset = addr - self.slot_addr(layout.head) as usize;
        if offset % layout.block_size != 0 {
            return Err(Error::InvalidFree(addr));
        }
        // A large block is live only while FULL; an EMPTY superblock has no
        // live blocks at all.
        let state = self.desc(layout.head).anchor().load(Ordering::Acquire).state;
        let dead = if layout.is_large() {
            state != SuperblockState::Full
        } else {
            state == SuperblockState::Empty
        };
        if dead {
            return Err(Error::InvalidFree(addr));
        }
        Ok(layout)
    }

    // ------------------------------------------------------------------------
    // Superblock lifecycle
    // ------------------------------------------------------------------------

    /// Stamps slots `start..start + span` as one run headed at `start`.
    pub(crate) fn format_run(&self, start: u32, span: usize) {
        for k in 1..span {
            #[allow(clippy::cast_possible_truncation)]
            let desc = self.desc(start + k as u32);
            desc.set_span(0);
            desc.set_head_delta(k);
            desc.persist();
        }
        let head = self.desc(start);
        head.set_head_delta(0);
        head.set_span(span);
        head.persist();
    }

    /// Returns slots `start..start + len` to the free lists, split into
    /// chunks no longer than `MAX_CACHED_SPAN`.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn release_run(&self, start: u32, len: usize) {
        let mut start = start;
        let mut left = len;
        while left > 0 {
            let chunk = left.min(MAX_CACHED_SPAN);
            self.format_run(start, chunk);
            let desc = self.desc(start);
            desc.retire();
            desc.persist();
            descriptor::push(self, &self.meta().free_sb[chunk], DescLink::Free, start);
            start += chunk as u32;
            left -= chunk;
        }
    }

    /// Retires a superblock that no thread can reach any more.
    pub(crate) fn retire_superblock(&self, head: u32) {
        let span = self.desc(head).span().max(1);
        self.release_run(head, span);
    }

    /// Obtains a run of `span` formatted slots.
    fn alloc_superblock(&self, span: usize) -> Result<u32> {
        if span <= MAX_CACHED_SPAN {
            let list = &self.meta().free_sb[span];
            if let Some(head) = descriptor::pop(self, list, DescLink::Free) {
                return Ok(head);
            }
        }
        match self.mint_superblock(span) {
            Err(err @ Error::OutOfSpace { .. }) => self.carve_superblock(span).ok_or(err),
            result => result,
        }
    }

    /// Takes fresh slots from the bump allocator.
    #[allow(clippy::cast_possible_truncation)]
    fn mint_superblock(&self, span: usize) -> Result<u32> {
        let bytes = span.checked_mul(SB_SIZE).ok_or(Error::SizeOverflow)?;
        let ptr = self.regions.allocate(
            RegionIndex::Superblock,
            crate::config::PAGE_SIZE,
            bytes,
        )?;
        let head = ((ptr.as_ptr() as usize - self.slots_start()) / SB_SIZE) as u32;
        self.format_run(head, span);
        crate::tracing::internal::log_superblock_minted(head, span);
        Ok(head)
    }

    /// Splits a longer cached run when the arena is exhausted.
    #[allow(clippy::cast_possible_truncation)]
    fn carve_superblock(&self, span: usize) -> Option<u32> {
        for longer in span + 1..=MAX_CACHED_SPAN {
            let list = &self.meta().free_sb[longer];
            if let Some(head) = descriptor::pop(self, list, DescLink::Free) {
                self.format_run(head, span);
                self.release_run(head + span as u32, longer - span);
                return Some(head);
            }
        }
        None
    }

    // ------------------------------------------------------------------------
    // Bins
    // ------------------------------------------------------------------------

    /// Refills an empty bin: from a partial superblock if one exists, else
    /// from a new superblock.
    fn fill_bin(&self, class_idx: usize, bin: &mut TCacheBin) -> Result<()> {
        if self.fill_from_partial(class_idx, bin) {
            return Ok(());
        }
        self.fill_from_new(class_idx, bin)
    }

    fn fill_from_partial(&self, class_idx: usize, bin: &mut TCacheBin) -> bool {
        let list = &self.meta().heaps[class_idx].partial;
        'retry: loop {
            let Some(head) = descriptor::pop(self, list, DescLink::Partial) else {
                return false;
            };
            let desc = self.desc(head);
            let anchor = desc.anchor();
            let backoff = Backoff::new();
            let mut old = anchor.load(Ordering::Acquire);
            loop {
                if old.state == SuperblockState::Empty {
                    self.retire_superblock(head);
                    continue 'retry;
                }
                debug_assert_eq!(old.state, SuperblockState::Partial);
                let new = Anchor {
                    state: SuperblockState::Full,
                    avail: desc.max_count(),
                    count: 0,
                };
                match anchor.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(current) => {
                        old = current;
                        backoff.spin();
                    }
                }
            }
            persist::persist(anchor);

            let first = self
                .slot_addr(head)
                .wrapping_add(old.avail as usize * desc.block_size());
            bin.push_list(first, old.count);
            return true;
        }
    }

    fn fill_from_new(&self, class_idx: usize, bin: &mut TCacheBin) -> Result<()> {
        let class = SIZE_CLASSES.get(class_idx);
        let head = self.alloc_superblock(class.span as usize)?;
        let desc = self.desc(head);
        let sb = self.slot_addr(head);
        let block_size = class.block_size as usize;

        for i in 0..class.block_num as usize {
            let block = sb.wrapping_add(i * block_size);
            let next = if i + 1 == class.block_num as usize {
                ptr::null()
            } else {
                block.wrapping_add(block_size)
            };
            // SAFETY: the superblock is ours and unused.
            unsafe { write_link(block, next) };
        }

        desc.init_small(class_idx, class);
        desc.anchor().store(
            Anchor {
                state: SuperblockState::Full,
                avail: class.block_num,
                count: 0,
            },
            Ordering::Release,
        );
        desc.persist();

        bin.push_list(sb, class.block_num);
        Ok(())
    }

    /// Returns every block of `bin` to its superblock, one anchor CAS per
    /// run of consecutive blocks from the same superblock.
    fn drain_bin(&self, bin: &mut TCacheBin) {
        while !bin.is_empty() {
            let head = bin.head();
            let Some(layout) = self.layout_of(head) else {
                debug_assert!(false, "cached block {head:p} has no superblock");
                return;
            };
            let sb = self.slot_addr(layout.head);
            let sb_range = sb as usize..sb as usize + layout.span * SB_SIZE;

            let mut tail = head;
            let mut block_count = 1;
            while bin.count() > block_count {
                // SAFETY: cached blocks are free and linked.
                let next = unsafe { read_link(tail) };
                if !sb_range.contains(&(next as usize)) {
                    break;
                }
                tail = next;
                block_count += 1;
            }
            // SAFETY: as above.
            bin.pop_list(unsafe { read_link(tail) }, block_count);

            #[allow(clippy::cast_possible_truncation)]
            let idx = ((head as usize - sb as usize) / layout.block_size) as u32;
            self.release_blocks(layout, tail, idx, block_count);
        }
    }

    /// Splices the run `[idx .. tail]` into its superblock's free list.
    fn release_blocks(&self, layout: SuperblockLayout, tail: *mut u8, idx: u32, block_count: u32) {
        let desc = self.desc(layout.head);
        let anchor = desc.anchor();
        let sb = self.slot_addr(layout.head);
        let backoff = Backoff::new();

        let mut old = anchor.load(Ordering::Acquire);
        let new = loop {
            let next = if old.count == 0 {
                ptr::null()
            } else {
                sb.wrapping_add(old.avail as usize * layout.block_size)
            };
            // SAFETY: tail is a free block of this superblock.
            unsafe { write_link(tail, next) };

            let mut new = Anchor {
                state: SuperblockState::Partial,
                avail: idx,
                count: old.count + block_count,
            };
            if new.count == layout.max_count {
                new.count = layout.max_count - 1;
                new.state = SuperblockState::Empty;
            }
            match anchor.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break new,
                Err(current) => {
                    old = current;
                    backoff.spin();
                }
            }
        };
        persist::persist(anchor);

        // Only a FULL superblock is off every partial list; a PARTIAL one
        // that became EMPTY is retired by whoever pops it next.
        if old.state == SuperblockState::Full {
            if new.state == SuperblockState::Empty {
                self.retire_superblock(layout.head);
            } else {
                let list = &self.meta().heaps[layout.class_idx].partial;
                descriptor::push(self, list, DescLink::Partial, layout.head);
            }
        }
    }

    /// Drains every bin of a thread's cache.
    ///
    /// Only an open heap is drained into. Once `close` has stored CLEAN, the
    /// metadata must not change; blocks still cached by other threads stay
    /// allocated instead.
    pub(crate) fn drain_bins(&self, bins: &mut Bins) {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return;
        }
        for bin in bins.iter_mut() {
            self.drain_bin(bin);
        }
    }

    // ------------------------------------------------------------------------
    // malloc / free
    // ------------------------------------------------------------------------

    fn malloc(self: &Arc<Self>, size: usize) -> Result<NonNull<u8>> {
        self.check_ready()?;
        let Some(class_idx) = SIZE_CLASSES.classify(size) else {
            return self.malloc_large(size);
        };
        tcache::with_bins(self, |bins| {
            let bin = &mut bins[class_idx];
            if bin.is_empty() {
                self.fill_bin(class_idx, bin)?;
            }
            bin.pop_block().ok_or(Error::OutOfSpace {
                region: RegionIndex::Superblock,
                requested: size,
            })
        })
    }

    fn malloc_large(&self, size: usize) -> Result<NonNull<u8>> {
        if size > MAX_HEAP_SIZE {
            return Err(Error::OutOfSpace {
                region: RegionIndex::Superblock,
                requested: size,
            });
        }
        let span = large_span(size);
        let head = self.alloc_superblock(span)?;
        let desc = self.desc(head);
        desc.init_large(span * SB_SIZE);
        desc.persist();
        // SAFETY: slot addresses are inside the mapping.
        Ok(unsafe { NonNull::new_unchecked(self.slot_addr(head)) })
    }

    fn free(self: &Arc<Self>, ptr: *mut u8) -> Result<()> {
        self.check_ready()?;
        if ptr.is_null() {
            return Ok(());
        }
        let layout = self.live_block(ptr)?;
        if layout.is_large() {
            self.retire_superblock(layout.head);
            return Ok(());
        }

        let cache_limit = SIZE_CLASSES.get(layout.class_idx).cache_block_num;
        tcache::with_bins(self, |bins| {
            let bin = &mut bins[layout.class_idx];
            if bin.head() == ptr {
                return Err(Error::InvalidFree(ptr as usize));
            }
            if bin.count() >= cache_limit {
                self.drain_bin(bin);
            }
            // SAFETY: validated as a block of this class.
            unsafe { bin.push_block(ptr) };
            Ok(())
        })
    }

    fn malloc_size(&self, ptr: *const u8) -> Result<usize> {
        self.check_open()?;
        Ok(self.live_block(ptr)?.block_size)
    }

    fn realloc(self: &Arc<Self>, ptr: *mut u8, size: usize) -> Result<NonNull<u8>> {
        if ptr.is_null() {
            return self.malloc(size);
        }
        self.check_ready()?;
        let old_size = self.live_block(ptr)?.block_size;
        if size <= old_size {
            // SAFETY: validated non-null above.
            return Ok(unsafe { NonNull::new_unchecked(ptr) });
        }

        let new = self.malloc(size)?;
        // SAFETY: both blocks are live and at least `old_size` bytes.
        unsafe { ptr::copy_nonoverlapping(ptr, new.as_ptr(), old_size) };
        persist::flush_range(new.as_ptr(), old_size);
        persist::fence();
        self.free(ptr)?;
        Ok(new)
    }

    fn calloc(self: &Arc<Self>, num: usize, size: usize) -> Result<NonNull<u8>> {
        let total = num.checked_mul(size).ok_or(Error::SizeOverflow)?;
        let ptr = self.malloc(total)?;
        let usable = self.live_block(ptr.as_ptr())?.block_size;
        // SAFETY: the block is live and `usable` bytes long.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, usable) };
        persist::flush_range(ptr.as_ptr(), usable);
        persist::fence();
        Ok(ptr)
    }

    // ------------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------------

    fn set_root(&self, ptr: *const u8, index: usize, tracer: TraceFn) -> Result<*mut u8> {
        self.check_open()?;
        if index >= MAX_ROOTS {
            return Err(Error::RootIndexOutOfRange(index));
        }
        if !ptr.is_null() && self.slot_of(ptr).is_none() {
            return Err(Error::ForeignPointer(ptr as usize));
        }
        let offset = self.regions.untranslate(RegionIndex::Superblock, ptr);
        let old = self.meta().swap_root(index, offset);
        self.tracers.lock()[index] = Some(tracer);
        Ok(self.regions.translate(RegionIndex::Superblock, old))
    }

    fn get_root(&self, index: usize, tracer: TraceFn) -> Result<*mut u8> {
        self.check_open()?;
        if index >= MAX_ROOTS {
            return Err(Error::RootIndexOutOfRange(index));
        }
        self.tracers.lock()[index] = Some(tracer);
        let offset = self.meta().root(index);
        Ok(self.regions.translate(RegionIndex::Superblock, offset))
    }

    /// Tracer registered for root `index` this session.
    pub(crate) fn root_tracer(&self, index: usize) -> Option<TraceFn> {
        self.tracers.lock()[index]
    }

    // ------------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------------

    fn recover(&self) -> Result<bool> {
        self.check_open()?;
        let _guard = self.recovery_lock.lock();
        if !self.recovery_pending.load(Ordering::Acquire) {
            return Ok(false);
        }
        let metrics = gc::recover(self)?;
        *self.last_recovery.lock() = Some(metrics);
        self.recovery_pending.store(false, Ordering::Release);
        Ok(true)
    }

    /// Flushes everything and stores CLEAN, unless the metadata is still
    /// awaiting recovery, in which case the heap stays dirty. The heap must
    /// no longer be open.
    fn writeback(&self) -> Result<()> {
        self.regions.flush_region(RegionIndex::Desc)?;
        self.regions.flush_region(RegionIndex::Superblock)?;
        if !self.recovery_pending.load(Ordering::Acquire) {
            self.meta().mark_clean();
        }
        self.regions.flush_region(RegionIndex::Meta)?;
        crate::tracing::internal::log_heap_closed(&self.config.id, self.meta().is_dirty());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.check_open()?;
        tcache::drain_current_thread(self);
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Closed);
        }
        self.writeback()
    }

    /// Anchor and capacity of every live superblock, in slot order.
    #[cfg(any(test, feature = "test-util"))]
    #[allow(clippy::cast_possible_truncation)]
    fn live_anchors(&self) -> Vec<(Anchor, u32)> {
        let used = self.used_slots();
        let mut anchors = Vec::new();
        let mut slot = 0;
        while slot < used {
            match self.layout(slot as u32) {
                Some(layout) => {
                    let anchor = self.desc(layout.head).anchor().load(Ordering::Acquire);
                    anchors.push((anchor, layout.max_count));
                    slot += layout.span;
                }
                None => slot += 1,
            }
        }
        anchors
    }

    #[cfg(any(test, feature = "test-util"))]
    fn simulate_crash(&self) {
        self.state.store(STATE_ABANDONED, Ordering::Release);
        tcache::discard_current_thread(self.id);
    }
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) == STATE_OPEN {
            tcache::drain_current_thread(self);
            self.state.store(STATE_CLOSED, Ordering::Release);
            if let Err(err) = self.writeback() {
                crate::tracing::internal::log_writeback_failed(&err);
            }
        }
    }
}

// ============================================================================
// Heap
// ============================================================================

/// A handle to an open persistent heap.
///
/// Handles are cheap to clone and can be shared between threads. The heap
/// is written back cleanly by [`Heap::close`], or when the last handle is
/// dropped.
///
/// # Example
///
/// ```
/// use nvheap::{Heap, HeapConfig};
///
/// let dir = tempfile::tempdir().unwrap();
/// let heap = Heap::open(HeapConfig::new("doc").dir(dir.path()).size(4 << 20)).unwrap();
/// assert!(!heap.is_restart());
///
/// let block = heap.malloc(100).unwrap();
/// assert!(heap.malloc_size(block.as_ptr()).unwrap() >= 100);
/// heap.set_root_raw(block.as_ptr(), 0).unwrap();
/// heap.close().unwrap();
///
/// let heap = Heap::open(HeapConfig::new("doc").dir(dir.path()).size(4 << 20)).unwrap();
/// assert!(heap.is_restart());
/// assert!(!heap.recover().unwrap());
/// assert!(!heap.get_root_raw(0).unwrap().is_null());
/// ```
#[derive(Clone)]
pub struct Heap {
    inner: Arc<HeapInner>,
}

impl Heap {
    /// Opens the heap described by `config`, creating it if its files do not
    /// exist.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHeapSize`] for an unsupported size.
    /// - [`Error::HeapBusy`] if another live session holds the heap.
    /// - [`Error::Corrupted`] if the files exist but do not match `config`.
    /// - [`Error::Io`] for file system failures.
    pub fn open(config: HeapConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(HeapInner::open(config)?),
        })
    }

    pub(crate) const fn from_inner(inner: Arc<HeapInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<HeapInner> {
        Arc::downgrade(&self.inner)
    }

    /// Whether the heap existed before this session.
    #[must_use]
    pub fn is_restart(&self) -> bool {
        self.inner.restart
    }

    /// Whether the previous session crashed and [`Heap::recover`] is still
    /// due.
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.inner.recovery_pending.load(Ordering::Acquire)
    }

    /// Rebuilds allocator metadata from the persistent roots if the previous
    /// session did not shut down cleanly. Returns whether it did.
    ///
    /// Register root types with [`Heap::get_root`] first to have their
    /// blocks traced precisely; other roots are scanned conservatively.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the rebuilt metadata cannot be written back.
    pub fn recover(&self) -> Result<bool> {
        self.inner.recover()
    }

    /// Allocates at least `size` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfSpace`] when the arena is exhausted,
    /// [`Error::RecoveryPending`] before recovery of a dirty heap.
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.inner.malloc(size)
    }

    /// Frees a block returned by this heap. Null is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::ForeignPointer`] for memory not owned by the heap and
    /// [`Error::InvalidFree`] for anything that is not a live block start.
    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        self.inner.free(ptr)
    }

    /// Resizes a block, moving it if it does not fit.
    ///
    /// A null `ptr` allocates. A block that already holds `size` bytes is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// As [`Heap::malloc`] and [`Heap::free`].
    pub fn realloc(&self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>> {
        self.inner.realloc(ptr, size)
    }

    /// Allocates a zeroed array of `num` elements of `size` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::SizeOverflow`] if `num * size` overflows, else as
    /// [`Heap::malloc`].
    pub fn calloc(&self, num: usize, size: usize) -> Result<NonNull<u8>> {
        self.inner.calloc(num, size)
    }

    /// Usable size of a live block.
    ///
    /// # Errors
    ///
    /// As [`Heap::free`].
    pub fn malloc_size(&self, ptr: *const u8) -> Result<usize> {
        self.inner.malloc_size(ptr)
    }

    /// Stores `ptr` in persistent root `index` and returns the previous root.
    ///
    /// The block is traced as a `T` during recovery.
    ///
    /// # Errors
    ///
    /// [`Error::RootIndexOutOfRange`] or [`Error::ForeignPointer`].
    pub fn set_root<T: Trace>(&self, ptr: *const T, index: usize) -> Result<*mut u8> {
        self.inner.set_root(ptr.cast(), index, gc::trace_typed::<T>)
    }

    /// Like [`Heap::set_root`], tracing the root conservatively.
    ///
    /// # Errors
    ///
    /// [`Error::RootIndexOutOfRange`] or [`Error::ForeignPointer`].
    pub fn set_root_raw(&self, ptr: *const u8, index: usize) -> Result<*mut u8> {
        self.inner.set_root(ptr, index, gc::trace_conservative)
    }

    /// Returns persistent root `index` and registers `T` as its type for
    /// recovery.
    ///
    /// # Errors
    ///
    /// [`Error::RootIndexOutOfRange`].
    pub fn get_root<T: Trace>(&self, index: usize) -> Result<*mut T> {
        self.inner
            .get_root(index, gc::trace_typed::<T>)
            .map(<*mut u8>::cast)
    }

    /// Returns persistent root `index`, traced conservatively on recovery.
    ///
    /// # Errors
    ///
    /// [`Error::RootIndexOutOfRange`].
    pub fn get_root_raw(&self, index: usize) -> Result<*mut u8> {
        self.inner.get_root(index, gc::trace_conservative)
    }

    /// Whether `ptr` points into the allocated part of the superblock arena.
    #[must_use]
    pub fn in_range(&self, ptr: *const u8) -> bool {
        self.inner.slot_of(ptr).is_some()
    }

    /// Mapping bounds of one region.
    #[must_use]
    pub fn region_range(&self, index: RegionIndex) -> (*mut u8, *mut u8) {
        self.inner.regions.range(index)
    }

    /// Bytes handed out by one region's bump allocator.
    #[must_use]
    pub fn used_bytes(&self, index: RegionIndex) -> usize {
        self.inner.regions.get(index).used()
    }

    /// Drains the calling thread's cached blocks back to the heap. Threads
    /// do this automatically when they exit.
    pub fn flush_thread_cache(&self) {
        tcache::drain_current_thread(&self.inner);
    }

    /// Statistics of the recovery run by this session, if any.
    #[must_use]
    pub fn last_recovery_metrics(&self) -> Option<RecoveryMetrics> {
        *self.inner.last_recovery.lock()
    }

    /// The configuration this heap was opened with.
    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.inner.config
    }

    /// Writes the heap back and marks it clean. Other handles see
    /// [`Error::Closed`] afterwards.
    ///
    /// Other threads must have exited (or called
    /// [`Heap::flush_thread_cache`]) first. Blocks still in their caches
    /// are not returned when those threads exit; they stay allocated in the
    /// persistent heap.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if already closed, [`Error::Io`] if write-back fails.
    pub fn close(self) -> Result<()> {
        self.inner.close()
    }

    /// Drops this handle as if the process had died: the heap is never
    /// written back or marked clean, and the calling thread's cached blocks
    /// are forgotten. Other handles see [`Error::Closed`].
    #[cfg(any(test, feature = "test-util"))]
    pub fn simulate_crash(self) {
        self.inner.simulate_crash();
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn live_anchors(&self) -> Vec<(Anchor, u32)> {
        self.inner.live_anchors()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.inner.config.id)
            .field("dir", &self.inner.config.dir)
            .field("slots", &self.inner.num_slots)
            .field("restart", &self.inner.restart)
            .finish_non_exhaustive()
    }
}
