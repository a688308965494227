//! File-backed arenas with a crash-consistent bump allocator.
//!
//! Each [`Region`] is one shared mapping of one file. The first page holds a
//! [`RegionHeader`]; every offset in it is relative to the mapping base, so
//! the region can be remapped anywhere. Space is handed out by advancing the
//! header's bump offset with a CAS; the offset is flushed before the caller
//! sees the memory, so a crash never loses track of space that was given
//! out.
//!
//! A heap owns three regions, see [`Regions`].

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::Backoff;
use sys_alloc::{Mmap, MmapOptions};

use crate::config::{HeapConfig, RegionIndex, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::persist;

/// "nvhREG" followed by the layout version.
const REGION_MAGIC: u64 = 0x6e76_6852_4547_0001;

/// Persistent header at offset 0 of every region.
#[repr(C, align(64))]
pub struct RegionHeader {
    magic: AtomicU64,
    /// Mapping length in bytes, header page included.
    len: AtomicU64,
    /// Offset of the first unallocated byte.
    bump: AtomicU64,
    /// Offset of the region's root object, 0 if none was stored.
    heap_start: AtomicU64,
}

/// Why a single bump attempt did not produce memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpError {
    /// Another thread moved the bump offset first; retry.
    Contended,
    /// The request does not fit in the remaining space.
    OutOfSpace,
    /// Alignment is not a power of two of at least pointer size.
    InvalidAlignment,
}

// ============================================================================
// Region
// ============================================================================

/// One file-backed arena.
pub struct Region {
    map: Mmap,
    file: File,
    path: PathBuf,
    index: RegionIndex,
}

impl Region {
    /// Creates the region file at `path` with `size` usable bytes (rounded up
    /// to whole pages), or remaps it if it already exists.
    ///
    /// Returns the region and whether it was freshly created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created or mapped and
    /// [`Error::Corrupted`] if an existing file does not hold a region of
    /// this size.
    pub fn open(
        path: &Path,
        index: RegionIndex,
        size: usize,
        populate: bool,
    ) -> Result<(Self, bool)> {
        let len = PAGE_SIZE + size.next_multiple_of(PAGE_SIZE);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => Self::create(file, path, index, len, populate).map(|r| (r, true)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Self::remap(path, index, len, populate).map(|r| (r, false))
            }
            Err(err) => Err(Error::io(path, err)),
        }
    }

    fn map(file: &File, path: &Path, len: usize, populate: bool) -> Result<Mmap> {
        unsafe {
            MmapOptions::new()
                .len(len)
                .populate(populate)
                .no_reserve(true)
                .map_file(file)
        }
        .map_err(|err| Error::io(path, err))
    }

    fn create(
        file: File,
        path: &Path,
        index: RegionIndex,
        len: usize,
        populate: bool,
    ) -> Result<Self> {
        file.set_len(len as u64).map_err(|err| Error::io(path, err))?;
        let map = Self::map(&file, path, len, populate)?;
        let region = Self {
            map,
            file,
            path: path.to_path_buf(),
            index,
        };

        let header = region.header();
        header.len.store(len as u64, Ordering::Relaxed);
        header.bump.store(PAGE_SIZE as u64, Ordering::Relaxed);
        header.heap_start.store(0, Ordering::Relaxed);
        persist::persist(header);
        // The magic goes last: a header with a valid magic is complete.
        header.magic.store(REGION_MAGIC, Ordering::Release);
        persist::persist(header);
        region
            .map
            .flush_range(0, PAGE_SIZE)
            .map_err(|err| Error::io(path, err))?;

        crate::tracing::internal::log_region_created(index, len);
        Ok(region)
    }

    fn remap(path: &Path, index: RegionIndex, len: usize, populate: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| Error::io(path, err))?;
        let file_len = file.metadata().map_err(|err| Error::io(path, err))?.len();
        if file_len != len as u64 {
            return Err(Error::Corrupted {
                path: path.to_path_buf(),
                reason: "file length does not match the configured size",
            });
        }

        let map = Self::map(&file, path, len, populate)?;
        let region = Self {
            map,
            file,
            path: path.to_path_buf(),
            index,
        };

        let header = region.header();
        if header.magic.load(Ordering::Acquire) != REGION_MAGIC {
            return Err(region.corrupted("bad region header magic"));
        }
        if header.len.load(Ordering::Relaxed) != len as u64 {
            return Err(region.corrupted("header size does not match the configured size"));
        }
        let bump = header.bump.load(Ordering::Relaxed);
        if bump < PAGE_SIZE as u64 || bump > len as u64 {
            return Err(region.corrupted("bump offset outside the region"));
        }

        crate::tracing::internal::log_region_remapped(index, len, region.used());
        Ok(region)
    }

    fn corrupted(&self, reason: &'static str) -> Error {
        Error::Corrupted {
            path: self.path.clone(),
            reason,
        }
    }

    /// The persistent header.
    #[must_use]
    pub fn header(&self) -> &RegionHeader {
        // SAFETY: the mapping is page aligned and at least one page long.
        unsafe { &*self.map.ptr().cast::<RegionHeader>() }
    }

    /// Which of the heap's regions this is.
    #[must_use]
    pub const fn index(&self) -> RegionIndex {
        self.index
    }

    /// The backing file.
    #[must_use]
    pub const fn file(&self) -> &File {
        &self.file
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start of the mapping (the header).
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.map.ptr()
    }

    /// Mapping bounds `[start, end)`.
    #[must_use]
    pub fn range(&self) -> (*mut u8, *mut u8) {
        let base = self.base();
        (base, base.wrapping_add(self.map.len()))
    }

    /// Bytes handed out so far.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn used(&self) -> usize {
        self.header().bump.load(Ordering::Acquire) as usize - PAGE_SIZE
    }

    /// Usable bytes after the header.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.map.len() - PAGE_SIZE
    }

    /// One attempt to carve `size` bytes aligned to `align` off the end.
    ///
    /// On success the new bump offset is durable before this returns.
    ///
    /// # Errors
    ///
    /// See [`BumpError`]. A failed attempt leaves the region untouched.
    #[allow(clippy::cast_possible_truncation)]
    pub fn try_allocate(&self, align: usize, size: usize) -> Result<NonNull<u8>, BumpError> {
        if !align.is_power_of_two() || align < size_of::<usize>() {
            return Err(BumpError::InvalidAlignment);
        }
        let header = self.header();
        let base = self.base() as usize;
        let old = header.bump.load(Ordering::Acquire) as usize;

        let start = (base + old).next_multiple_of(align);
        let end = start.checked_add(size).ok_or(BumpError::OutOfSpace)?;
        if end > base + self.map.len() {
            return Err(BumpError::OutOfSpace);
        }

        header
            .bump
            .compare_exchange(
                old as u64,
                (end - base) as u64,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .map_err(|_| BumpError::Contended)?;
        persist::persist(&header.bump);

        // SAFETY: start lies inside the live mapping.
        Ok(unsafe { NonNull::new_unchecked(start as *mut u8) })
    }

    /// Carves `size` bytes aligned to `align`, retrying under contention.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] or [`Error::InvalidAlignment`].
    pub fn allocate(&self, align: usize, size: usize) -> Result<NonNull<u8>> {
        let backoff = Backoff::new();
        loop {
            match self.try_allocate(align, size) {
                Ok(ptr) => return Ok(ptr),
                Err(BumpError::Contended) => backoff.spin(),
                Err(BumpError::OutOfSpace) => {
                    crate::tracing::internal::log_out_of_space(self.index, size);
                    return Err(Error::OutOfSpace {
                        region: self.index,
                        requested: size,
                    });
                }
                Err(BumpError::InvalidAlignment) => return Err(Error::InvalidAlignment(align)),
            }
        }
    }

    /// Grows the allocated part by `size` bytes rounded up to whole pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if the pages do not fit.
    pub fn expand(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate(PAGE_SIZE, size.next_multiple_of(PAGE_SIZE))
    }

    /// Absolute address of a region-relative offset; offset 0 is null.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn translate(&self, offset: u64) -> *mut u8 {
        if offset == 0 {
            std::ptr::null_mut()
        } else {
            self.base().wrapping_add(offset as usize)
        }
    }

    /// Region-relative offset of `ptr`; null maps to 0.
    #[must_use]
    pub fn untranslate(&self, ptr: *const u8) -> u64 {
        if ptr.is_null() {
            0
        } else {
            (ptr as usize - self.base() as usize) as u64
        }
    }

    /// Whether `ptr` lies in the allocated part of the region.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn in_range(&self, ptr: *const u8) -> bool {
        let base = self.base() as usize;
        let bump = self.header().bump.load(Ordering::Acquire) as usize;
        (base + PAGE_SIZE..base + bump).contains(&(ptr as usize))
    }

    /// Records the offset of the region's root object durably.
    pub fn set_heap_start(&self, ptr: *const u8) {
        let header = self.header();
        header.heap_start.store(self.untranslate(ptr), Ordering::Release);
        persist::persist(&header.heap_start);
    }

    /// The region's root object, or null if none was recorded.
    #[must_use]
    pub fn heap_start(&self) -> *mut u8 {
        self.translate(self.header().heap_start.load(Ordering::Acquire))
    }

    /// Writes the header and all allocated bytes back to the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if `msync` fails.
    pub fn flush(&self) -> Result<()> {
        self.map
            .flush_range(0, PAGE_SIZE + self.used())
            .map_err(|err| Error::io(&self.path, err))
    }
}

// ============================================================================
// Regions
// ============================================================================

/// The three regions backing one heap, indexed by [`RegionIndex`].
pub struct Regions {
    regions: [Region; 3],
    restart: bool,
}

impl Regions {
    /// Opens the regions of `config` with the given usable sizes.
    ///
    /// The root-metadata file is created last, so its existence means the
    /// other two are complete. A missing metadata file with stale
    /// descriptor or superblock files left behind by an interrupted creation
    /// starts over from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the metadata file exists but another
    /// region file is missing, and any error of [`Region::open`].
    pub fn open(config: &HeapConfig, sizes: [usize; 3]) -> Result<Self> {
        let meta_path = config.region_path(RegionIndex::Meta);
        let restart = meta_path.exists();

        for index in [RegionIndex::Desc, RegionIndex::Superblock] {
            let path = config.region_path(index);
            match (restart, path.exists()) {
                (true, false) => {
                    return Err(Error::Corrupted {
                        path,
                        reason: "region file is missing",
                    })
                }
                (false, true) => {
                    std::fs::remove_file(&path).map_err(|err| Error::io(&path, err))?;
                }
                _ => {}
            }
        }

        let desc = Self::open_one(config, RegionIndex::Desc, sizes, restart)?;
        let sb = Self::open_one(config, RegionIndex::Superblock, sizes, restart)?;
        let meta = Self::open_one(config, RegionIndex::Meta, sizes, restart)?;

        Ok(Self {
            regions: [desc, sb, meta],
            restart,
        })
    }

    fn open_one(
        config: &HeapConfig,
        index: RegionIndex,
        sizes: [usize; 3],
        restart: bool,
    ) -> Result<Region> {
        let path = config.region_path(index);
        let (region, created) = Region::open(&path, index, sizes[index as usize], config.populate)?;
        if created == restart {
            return Err(Error::Corrupted {
                path,
                reason: "region file appeared or vanished while opening",
            });
        }
        Ok(region)
    }

    /// Whether the regions already existed.
    #[must_use]
    pub const fn is_restart(&self) -> bool {
        self.restart
    }

    /// The region at `index`.
    #[must_use]
    pub const fn get(&self, index: RegionIndex) -> &Region {
        &self.regions[index as usize]
    }

    /// See [`Region::allocate`].
    ///
    /// # Errors
    ///
    /// See [`Region::allocate`].
    pub fn allocate(&self, index: RegionIndex, align: usize, size: usize) -> Result<NonNull<u8>> {
        self.get(index).allocate(align, size)
    }

    /// See [`Region::expand`].
    ///
    /// # Errors
    ///
    /// See [`Region::expand`].
    pub fn expand(&self, index: RegionIndex, size: usize) -> Result<NonNull<u8>> {
        self.get(index).expand(size)
    }

    /// See [`Region::translate`].
    #[must_use]
    pub fn translate(&self, index: RegionIndex, offset: u64) -> *mut u8 {
        self.get(index).translate(offset)
    }

    /// See [`Region::untranslate`].
    #[must_use]
    pub fn untranslate(&self, index: RegionIndex, ptr: *const u8) -> u64 {
        self.get(index).untranslate(ptr)
    }

    /// See [`Region::in_range`].
    #[must_use]
    pub fn in_range(&self, index: RegionIndex, ptr: *const u8) -> bool {
        self.get(index).in_range(ptr)
    }

    /// See [`Region::range`].
    #[must_use]
    pub fn range(&self, index: RegionIndex) -> (*mut u8, *mut u8) {
        self.get(index).range()
    }

    /// Writes one region back to its file.
    ///
    /// # Errors
    ///
    /// See [`Region::flush`].
    pub fn flush_region(&self, index: RegionIndex) -> Result<()> {
        self.get(index).flush()
    }

    /// Writes all regions back, metadata last.
    ///
    /// # Errors
    ///
    /// See [`Region::flush`].
    pub fn flush_all(&self) -> Result<()> {
        for index in RegionIndex::ALL {
            self.flush_region(index)?;
        }
        Ok(())
    }
}
