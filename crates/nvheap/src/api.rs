//! Process-wide heap entry points.
//!
//! A thin layer over one global [`Heap`] for programs that want the classic
//! `init`/`malloc`/`free` interface instead of passing a handle around.
//!
//! Each thread remembers the heap it last used together with the global
//! generation it saw. [`init_with`] and [`close`] bump the generation, so a
//! stale thread-local entry is noticed on the next call and refreshed from
//! the global slot. The global lock is taken only on that refresh.
//!
//! # Example
//!
//! ```
//! let dir = tempfile::tempdir().unwrap();
//! let config = nvheap::HeapConfig::new("global").dir(dir.path()).size(4 << 20);
//! assert!(!nvheap::api::init_with(config).unwrap());
//!
//! let block = nvheap::api::malloc(64).unwrap();
//! nvheap::api::free(block.as_ptr()).unwrap();
//! nvheap::api::close().unwrap();
//! ```

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use parking_lot::RwLock;

use crate::config::{HeapConfig, RegionIndex};
use crate::error::{Error, Result};
use crate::gc::Trace;
use crate::heap::{Heap, HeapInner};

static GLOBAL: RwLock<Option<Heap>> = parking_lot::const_rwlock(None);

static GENERATION: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static LOCAL: RefCell<Option<(u64, Weak<HeapInner>)>> = const { RefCell::new(None) };
}

/// The global heap, via the thread-local entry when it is current.
fn current() -> Result<Heap> {
    let generation = GENERATION.load(Ordering::Acquire);
    let cached = LOCAL
        .try_with(|local| match &*local.borrow() {
            Some((seen, heap)) if *seen == generation => heap.upgrade(),
            _ => None,
        })
        .ok()
        .flatten();
    if let Some(inner) = cached {
        return Ok(Heap::from_inner(inner));
    }

    let global = GLOBAL.read();
    let heap = global.as_ref().ok_or(Error::NotInitialized)?.clone();
    let generation = GENERATION.load(Ordering::Acquire);
    drop(global);
    let _ = LOCAL.try_with(|local| {
        *local.borrow_mut() = Some((generation, heap.downgrade()));
    });
    Ok(heap)
}

/// Opens heap `id` with an arena of `size` bytes in the default directory
/// and installs it as the global heap. Returns whether the heap existed.
///
/// # Errors
///
/// [`Error::AlreadyInitialized`] if a global heap is installed, else as
/// [`Heap::open`].
pub fn init(id: &str, size: usize) -> Result<bool> {
    init_with(HeapConfig::new(id).size(size))
}

/// Like [`init`] with a full configuration.
///
/// # Errors
///
/// As [`init`].
pub fn init_with(config: HeapConfig) -> Result<bool> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(Error::AlreadyInitialized);
    }
    let heap = Heap::open(config)?;
    let restart = heap.is_restart();
    *global = Some(heap);
    GENERATION.fetch_add(1, Ordering::AcqRel);
    Ok(restart)
}

/// Writes the global heap back cleanly and uninstalls it.
///
/// # Errors
///
/// [`Error::NotInitialized`], else as [`Heap::close`].
pub fn close() -> Result<()> {
    let heap = GLOBAL.write().take().ok_or(Error::NotInitialized)?;
    GENERATION.fetch_add(1, Ordering::AcqRel);
    let _ = LOCAL.try_with(|local| local.borrow_mut().take());
    heap.close()
}

/// See [`Heap::recover`].
///
/// # Errors
///
/// [`Error::NotInitialized`], else as [`Heap::recover`].
pub fn recover() -> Result<bool> {
    current()?.recover()
}

/// See [`Heap::malloc`].
///
/// # Errors
///
/// [`Error::NotInitialized`], else as [`Heap::malloc`].
pub fn malloc(size: usize) -> Result<NonNull<u8>> {
    current()?.malloc(size)
}

/// See [`Heap::free`].
///
/// # Errors
///
/// [`Error::NotInitialized`], else as [`Heap::free`].
pub fn free(ptr: *mut u8) -> Result<()> {
    current()?.free(ptr)
}

/// See [`Heap::realloc`].
///
/// # Errors
///
/// [`Error::NotInitialized`], else as [`Heap::realloc`].
pub fn realloc(ptr: *mut u8, size: usize) -> Result<NonNull<u8>> {
    current()?.realloc(ptr, size)
}

/// See [`Heap::calloc`].
///
/// # Errors
///
/// [`Error::NotInitialized`], else as [`Heap::calloc`].
pub fn calloc(num: usize, size: usize) -> Result<NonNull<u8>> {
    current()?.calloc(num, size)
}

/// See [`Heap::malloc_size`].
///
/// # Errors
///
/// [`Error::NotInitialized`], else as [`Heap::malloc_size`].
pub fn malloc_size(ptr: *const u8) -> Result<usize> {
    current()?.malloc_size(ptr)
}

/// See [`Heap::set_root`].
///
/// # Errors
///
/// [`Error::NotInitialized`], else as [`Heap::set_root`].
pub fn set_root<T: Trace>(ptr: *const T, index: usize) -> Result<*mut u8> {
    current()?.set_root(ptr, index)
}

/// See [`Heap::get_root`].
///
/// # Errors
///
/// [`Error::NotInitialized`], else as [`Heap::get_root`].
pub fn get_root<T: Trace>(index: usize) -> Result<*mut T> {
    current()?.get_root(index)
}

/// Whether `ptr` lies in the global heap's allocated arena. `false` when no
/// heap is installed.
#[must_use]
pub fn in_range(ptr: *const u8) -> bool {
    current().is_ok_and(|heap| heap.in_range(ptr))
}

/// Mapping bounds of one region of the global heap.
///
/// # Errors
///
/// [`Error::NotInitialized`].
pub fn region_range(index: RegionIndex) -> Result<(*mut u8, *mut u8)> {
    Ok(current()?.region_range(index))
}

/// Binds the calling thread to the global heap ahead of its first
/// allocation.
///
/// # Errors
///
/// [`Error::NotInitialized`].
pub fn thread_init() -> Result<()> {
    current().map(drop)
}

/// Returns the calling thread's cached blocks to the global heap and forgets
/// the binding. For thread pools whose workers outlive their use of the
/// heap; ordinary threads do this on exit.
pub fn thread_exit() {
    if let Ok(heap) = current() {
        heap.flush_thread_cache();
    }
    let _ = LOCAL.try_with(|local| local.borrow_mut().take());
}
