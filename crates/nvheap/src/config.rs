//! Layout constants and runtime heap configuration.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// ============================================================================
// Layout constants
// ============================================================================

/// Size of a hardware cache line; the unit of `persist::flush`.
pub const CACHE_LINE_SIZE: usize = 64;

/// Size of a region header and the alignment of region expansion.
pub const PAGE_SIZE: usize = 4096;

/// Log2 of [`SB_SIZE`].
pub const SB_SHIFT: usize = 16;

/// Size of one superblock slot. Every superblock spans a whole number of
/// slots, and every slot owns exactly one descriptor.
pub const SB_SIZE: usize = 1 << SB_SHIFT;

/// Size (and alignment) of a descriptor.
pub const DESC_SIZE: usize = 64;

/// Number of persistent root slots.
pub const MAX_ROOTS: usize = 1024;

/// Largest request served from a size class. Anything bigger is a large
/// allocation backed by its own run of slots.
pub const MAX_SMALL_SIZE: usize = 14336;

/// Number of size classes, including the reserved large class 0.
pub const NUM_SIZE_CLASSES: usize = 40;

/// Longest run of slots kept on its own free list. Longer runs are split
/// into chunks of this length when retired.
pub const MAX_CACHED_SPAN: usize = 8;

/// Smallest accepted superblock arena.
pub const MIN_HEAP_SIZE: usize = 16 * SB_SIZE;

/// Largest accepted superblock arena (1 TiB). Slot indices must fit the
/// 32-bit index half of a tagged list head.
pub const MAX_HEAP_SIZE: usize = 1 << 40;

/// Default superblock arena size (1 GiB). The backing files are sparse, so
/// untouched slots cost nothing.
pub const DEFAULT_HEAP_SIZE: usize = 1 << 30;

/// Environment variable overriding the default heap directory.
pub const HEAP_DIR_ENV: &str = "NVHEAP_DIR";

/// Identifies one of the three arenas backing a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum RegionIndex {
    /// The descriptor table, one descriptor per superblock slot.
    Desc = 0,
    /// Superblock bytes handed out to the application.
    Superblock = 1,
    /// The allocator root record and persistent roots.
    Meta = 2,
}

impl RegionIndex {
    /// All regions in creation order.
    pub const ALL: [Self; 3] = [Self::Desc, Self::Superblock, Self::Meta];

    /// File name suffix of this region.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Desc => "desc",
            Self::Superblock => "sb",
            Self::Meta => "basemd",
        }
    }
}

impl TryFrom<usize> for RegionIndex {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self> {
        Self::ALL
            .get(value)
            .copied()
            .ok_or(Error::InvalidRegion(value))
    }
}

// ============================================================================
// HeapConfig
// ============================================================================

/// Configuration for opening a persistent heap.
///
/// # Example
///
/// ```
/// use nvheap::HeapConfig;
///
/// let config = HeapConfig::new("journal")
///     .dir("/tmp")
///     .size(64 << 20);
/// assert_eq!(config.region_path(nvheap::RegionIndex::Meta).to_str(), Some("/tmp/journal_basemd"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Heap identifier; the prefix of every backing file.
    pub id: String,
    /// Directory holding the backing files.
    pub dir: PathBuf,
    /// Requested superblock arena size in bytes.
    pub size: usize,
    /// Prefault the mappings when opening.
    pub populate: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            id: String::from("nvheap"),
            dir: default_heap_dir(),
            size: DEFAULT_HEAP_SIZE,
            populate: false,
        }
    }
}

impl HeapConfig {
    /// Configuration for heap `id` with every other setting defaulted.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Sets the directory holding the backing files.
    #[must_use]
    pub fn dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the superblock arena size in bytes.
    #[must_use]
    pub const fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Sets whether the mappings are prefaulted on open.
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Path of the file backing `region`.
    #[must_use]
    pub fn region_path(&self, region: RegionIndex) -> PathBuf {
        self.dir.join(format!("{}_{}", self.id, region.suffix()))
    }

    /// Number of superblock slots this configuration provides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeapSize`] if the size is outside
    /// `[MIN_HEAP_SIZE, MAX_HEAP_SIZE]`.
    pub fn slot_count(&self) -> Result<usize> {
        if self.size < MIN_HEAP_SIZE || self.size > MAX_HEAP_SIZE {
            return Err(Error::InvalidHeapSize(self.size));
        }
        Ok(self.size / SB_SIZE)
    }
}

/// `$NVHEAP_DIR`, else `/dev/shm` when it exists, else the temp dir.
fn default_heap_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HEAP_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        return shm.to_path_buf();
    }
    std::env::temp_dir()
}
