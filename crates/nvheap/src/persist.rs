//! Cache-line write-back and ordering primitives.
//!
//! A store to persistent memory is durable only once its cache line has been
//! written back. Every metadata mutation in the heap follows the pattern
//! "store, [`flush`], [`fence`]" so that a crash observes either the old or
//! the new value of each word, never a torn mix of lines.
//!
//! The instruction is selected at build time: `clflush` by default on
//! x86-64, `clwb` with the `clwb` feature, nothing with `no-flush`. Other
//! architectures fall back to a full memory fence.

use crate::config::CACHE_LINE_SIZE;

/// Writes back the cache line containing `addr`.
#[inline]
pub fn flush<T>(addr: *const T) {
    write_back_line(addr.cast::<u8>());
}

/// Writes back every cache line overlapping `[ptr, ptr + len)`.
#[inline]
pub fn flush_range(ptr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    let start = ptr as usize & !(CACHE_LINE_SIZE - 1);
    let end = ptr as usize + len;
    let mut line = start;
    while line < end {
        write_back_line(line as *const u8);
        line += CACHE_LINE_SIZE;
    }
}

/// Orders earlier write-backs before any later store.
#[inline]
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Flushes one object and fences.
#[inline]
pub fn persist<T>(addr: *const T) {
    flush(addr);
    fence();
}

#[cfg(all(target_arch = "x86_64", not(feature = "no-flush"), not(feature = "clwb")))]
#[inline]
fn write_back_line(addr: *const u8) {
    // SAFETY: clflush accepts any address; callers pass lines of live mappings.
    unsafe { std::arch::x86_64::_mm_clflush(addr) };
}

#[cfg(all(target_arch = "x86_64", not(feature = "no-flush"), feature = "clwb"))]
#[inline]
fn write_back_line(addr: *const u8) {
    // SAFETY: clwb only writes back the line; it never faults on mapped memory.
    unsafe {
        std::arch::asm!(
            "clwb [{0}]",
            in(reg) addr,
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(any(not(target_arch = "x86_64"), feature = "no-flush"))]
#[inline]
fn write_back_line(_addr: *const u8) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
