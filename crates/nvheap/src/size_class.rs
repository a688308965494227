//! Size classes.
//!
//! Small requests are rounded up to one of 39 classes spaced four per
//! power-of-two group (the jemalloc series with an 8-byte quantum). Each
//! class carves superblocks of `sb_size` bytes, the least common multiple of
//! its block size and the slot size, so a superblock always holds a whole
//! number of blocks and a whole number of slots. Class 0 is reserved for
//! large allocations.
//!
//! The whole table, including the size-to-class lookup, is built at compile
//! time.

use crate::config::{MAX_SMALL_SIZE, NUM_SIZE_CLASSES, SB_SIZE};

/// Block sizes indexed by class; entry 0 is the large class.
const BLOCK_SIZES: [u32; NUM_SIZE_CLASSES] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512,
    640, 768, 896, 1024, 1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192,
    10240, 12288, 14336,
];

/// Static description of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassData {
    /// Bytes per block.
    pub block_size: u32,
    /// Bytes per superblock.
    pub sb_size: u32,
    /// Blocks per superblock.
    pub block_num: u32,
    /// Blocks a thread cache may hold before draining.
    pub cache_block_num: u32,
    /// Slots per superblock.
    pub span: u32,
}

impl SizeClassData {
    const LARGE: Self = Self {
        block_size: 0,
        sb_size: 0,
        block_num: 1,
        cache_block_num: 0,
        span: 0,
    };
}

/// All size classes plus the size-to-class lookup.
pub struct SizeClassTable {
    classes: [SizeClassData; NUM_SIZE_CLASSES],
    lookup: [u8; MAX_SMALL_SIZE + 1],
}

/// The process-wide size-class table.
pub static SIZE_CLASSES: SizeClassTable = SizeClassTable::new();

const fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl SizeClassTable {
    #[allow(clippy::cast_possible_truncation)]
    const fn new() -> Self {
        let mut classes = [SizeClassData::LARGE; NUM_SIZE_CLASSES];
        let mut lookup = [0u8; MAX_SMALL_SIZE + 1];

        let mut idx = 1;
        let mut next_size = 0;
        while idx < NUM_SIZE_CLASSES {
            let block_size = BLOCK_SIZES[idx] as usize;
            let sb_size = block_size / gcd(block_size, SB_SIZE) * SB_SIZE;
            let block_num = sb_size / block_size;
            classes[idx] = SizeClassData {
                block_size: block_size as u32,
                sb_size: sb_size as u32,
                block_num: block_num as u32,
                cache_block_num: block_num as u32,
                span: (sb_size / SB_SIZE) as u32,
            };
            while next_size <= block_size {
                lookup[next_size] = idx as u8;
                next_size += 1;
            }
            idx += 1;
        }

        Self { classes, lookup }
    }

    /// Class serving `size`, or `None` for a large request.
    ///
    /// A zero-byte request is served by the smallest class.
    #[inline]
    #[must_use]
    pub const fn classify(&self, size: usize) -> Option<usize> {
        if size > MAX_SMALL_SIZE {
            None
        } else {
            Some(self.lookup[size] as usize)
        }
    }

    /// The class at `idx`.
    #[inline]
    #[must_use]
    pub const fn get(&self, idx: usize) -> &SizeClassData {
        &self.classes[idx]
    }

    /// Iterates the small classes with their indices.
    pub fn small_classes(&self) -> impl Iterator<Item = (usize, &SizeClassData)> {
        self.classes.iter().enumerate().skip(1)
    }
}

/// Slots needed by a large allocation of `size` bytes.
#[must_use]
pub const fn large_span(size: usize) -> usize {
    size.div_ceil(SB_SIZE)
}
