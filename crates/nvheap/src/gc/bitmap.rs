//! Mark bitmap over the superblock arena.
//!
//! One bit per 8-byte granule of the minted arena. Every block start is
//! 8-byte aligned, so a block is identified by the bit of its first granule.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Bytes covered by one bit.
pub const GRANULE: usize = 8;

/// A bitmap recording which blocks recovery found reachable.
///
/// # Example
///
/// ```
/// use nvheap::gc::MarkBitmap;
///
/// let bitmap = MarkBitmap::for_bytes(4096);
/// assert_eq!(bitmap.capacity(), 512);
/// assert!(bitmap.mark(16));
/// assert!(!bitmap.mark(16));
/// assert!(bitmap.is_marked(16));
/// assert_eq!(bitmap.marked_count(), 1);
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    bitmap: Vec<AtomicU64>,
    capacity: usize,
    marked_count: AtomicUsize,
}

impl MarkBitmap {
    /// Create a bitmap covering `bytes` bytes of arena.
    #[must_use]
    pub fn for_bytes(bytes: usize) -> Self {
        let capacity = bytes.div_ceil(GRANULE).next_multiple_of(64);
        let bitmap = (0..capacity / 64).map(|_| AtomicU64::new(0)).collect();
        Self {
            bitmap,
            capacity,
            marked_count: AtomicUsize::new(0),
        }
    }

    /// Number of granules covered.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of marked granules.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.marked_count.load(Ordering::Relaxed)
    }

    /// Marks the granule at byte `offset`. Returns `true` if it was not
    /// marked before. Offsets past the end are ignored.
    pub fn mark(&self, offset: usize) -> bool {
        let slot = offset / GRANULE;
        if slot >= self.capacity {
            return false;
        }
        let mask = 1u64 << (slot % 64);
        let prev = self.bitmap[slot / 64].fetch_or(mask, Ordering::Relaxed);
        // Only count a bit that was not already set
        let fresh = prev & mask == 0;
        if fresh {
            self.marked_count.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Whether the granule at byte `offset` is marked.
    #[must_use]
    pub fn is_marked(&self, offset: usize) -> bool {
        let slot = offset / GRANULE;
        if slot >= self.capacity {
            return false;
        }
        (self.bitmap[slot / 64].load(Ordering::Relaxed) >> (slot % 64)) & 1 != 0
    }

    /// Clear all marks for reuse.
    pub fn clear(&self) {
        for word in &self.bitmap {
            word.store(0, Ordering::Relaxed);
        }
        self.marked_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::MarkBitmap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mark_bitmap_concurrent_mark() {
        let bitmap = Arc::new(MarkBitmap::for_bytes(4096));
        let mut handles = Vec::new();

        for i in 0..4 {
            let bitmap = Arc::clone(&bitmap);
            let handle = thread::spawn(move || {
                for j in 0..128 {
                    bitmap.mark((i * 128 + j) * 8);
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(bitmap.marked_count(), 512);
    }

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(MarkBitmap::for_bytes(0).capacity(), 0);
        assert_eq!(MarkBitmap::for_bytes(8).capacity(), 64);
        assert_eq!(MarkBitmap::for_bytes(65 * 8).capacity(), 128);
    }

    #[test]
    fn test_mark_is_per_granule() {
        let bitmap = MarkBitmap::for_bytes(1024);
        assert!(bitmap.mark(64));
        assert!(bitmap.is_marked(64));
        assert!(bitmap.is_marked(71));
        assert!(!bitmap.is_marked(72));
        assert!(!bitmap.mark(1_000_000));
    }

    #[test]
    fn test_mark_bitmap_clear() {
        let bitmap = MarkBitmap::for_bytes(1024);
        bitmap.mark(0);
        bitmap.mark(800);
        assert_eq!(bitmap.marked_count(), 2);

        bitmap.clear();
        assert_eq!(bitmap.marked_count(), 0);
        assert!(!bitmap.is_marked(0));
    }
}
