//! Low-level file mapping primitives.
//!
//! Provides shared, file-backed memory mappings whose contents outlive the
//! process, explicit write-back of mapped ranges, and an advisory whole-file
//! lock used to detect a live owner of a mapped file.

use std::fs::File;
use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(not(unix))]
compile_error!("sys_alloc only supports unix targets: persistent mappings need MAP_SHARED and msync");

pub use os::page_size;

/// A handle to a shared, file-backed memory mapping.
///
/// The region is automatically unmapped when this handle is dropped. Stores
/// made through the mapping reach the file through the page cache; call
/// [`Mmap::flush`] to force them to stable storage.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has zero length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Synchronously writes the whole mapping back to its file.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `msync`.
    pub fn flush(&self) -> io::Result<()> {
        self.inner.flush_range(0, self.inner.len())
    }

    /// Synchronously writes `[offset, offset + len)` back to the file.
    ///
    /// The start is rounded down to a page boundary as `msync` requires.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range is outside the mapping, or the OS
    /// error reported by `msync`.
    pub fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let end = offset.checked_add(len).filter(|end| *end <= self.len());
        if end.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "flush range exceeds the mapping",
            ));
        }
        self.inner.flush_range(offset, len)
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    hint_addr: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            hint_addr: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets a hint address for the mapping.
    ///
    /// The OS is free to ignore the hint; callers must not assume the mapping
    /// lands at `addr`.
    #[must_use]
    pub const fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to reserve swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Maps the first `len` bytes of `file` as a shared, writable mapping.
    ///
    /// The file must already be at least `len` bytes long.
    ///
    /// # Safety
    ///
    /// The returned mapping aliases the file. Any other mapping of the same
    /// file, in this or another process, observes and races with stores made
    /// through it; the caller is responsible for synchronising such access.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length or a file shorter than
    /// `len`, or the OS error reported by `mmap`.
    pub unsafe fn map_file(&self, file: &File) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let file_len = file.metadata()?.len();
        if file_len < self.len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file is shorter than the requested mapping",
            ));
        }

        let inner = unsafe {
            os::MmapInner::map_shared(
                file,
                self.hint_addr,
                self.len,
                self.populate,
                self.no_reserve,
            )?
        };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// An exclusive advisory lock on a whole file.
///
/// The kernel releases the lock when the holding process dies, which makes
/// it a reliable "owner is gone" signal. The lock is released on drop.
pub struct FileLock {
    inner: os::FileLockInner,
}

impl FileLock {
    /// Tries to take an exclusive lock on `file` without blocking.
    ///
    /// Returns `Ok(None)` if another open file description holds the lock.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `flock` for any other failure.
    pub fn try_exclusive(file: &File) -> io::Result<Option<Self>> {
        Ok(os::FileLockInner::try_exclusive(file)?.map(|inner| Self { inner }))
    }

    /// Returns the file the lock is held on.
    #[must_use]
    pub const fn file(&self) -> &File {
        self.inner.file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::ptr;

    fn sized_file(len: usize) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("map"))
            .unwrap();
        file.set_len(len as u64).unwrap();
        (dir, file)
    }

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_basic_map_file() {
        let len = page_size();
        let (_dir, file) = sized_file(len);
        let mmap = unsafe { MmapOptions::new().len(len).map_file(&file).unwrap() };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);
        assert_eq!(mmap.len(), len);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
        mmap.flush().unwrap();
    }

    #[test]
    fn test_contents_survive_remap() {
        let len = 2 * page_size();
        let (dir, file) = sized_file(len);
        {
            let mmap = unsafe { MmapOptions::new().len(len).map_file(&file).unwrap() };
            unsafe { ptr::write_volatile(mmap.ptr().add(page_size() + 7), 0xAB) };
            mmap.flush_range(page_size(), 8).unwrap();
        }

        let reopened = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join("map"))
            .unwrap();
        let mmap = unsafe { MmapOptions::new().len(len).map_file(&reopened).unwrap() };
        assert_eq!(unsafe { ptr::read_volatile(mmap.ptr().add(page_size() + 7)) }, 0xAB);
    }

    #[test]
    fn test_map_file_too_short() {
        let (_dir, mut file) = sized_file(0);
        file.write_all(&[1, 2, 3]).unwrap();
        let result = unsafe { MmapOptions::new().len(page_size()).map_file(&file) };
        assert!(result.is_err());
    }

    #[test]
    fn test_flush_range_out_of_bounds() {
        let len = page_size();
        let (_dir, file) = sized_file(len);
        let mmap = unsafe { MmapOptions::new().len(len).map_file(&file).unwrap() };
        assert!(mmap.flush_range(len - 8, 16).is_err());
    }

    #[test]
    fn test_exclusive_lock_conflicts() {
        let (dir, file) = sized_file(16);
        let first = FileLock::try_exclusive(&file).unwrap();
        assert!(first.is_some());

        let other = std::fs::File::open(dir.path().join("map")).unwrap();
        assert!(FileLock::try_exclusive(&other).unwrap().is_none());

        drop(first);
        assert!(FileLock::try_exclusive(&other).unwrap().is_some());
    }
}
