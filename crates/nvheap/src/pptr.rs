//! Position-independent pointers.
//!
//! A persistent mapping may land at a different virtual address in every
//! session, so references stored inside it cannot be absolute addresses.
//! [`Pptr`] stores the distance from its own address to the target instead:
//!
//! ```text
//! word = (|target - self| << 2) | tag      tag = 0b01 (target >= self)
//!                                                0b10 (target <  self)
//! ```
//!
//! The all-zero word is null, so freshly zero-filled files decode to null
//! pointers everywhere. A pointer to itself encodes as `0b01`, which stays
//! distinguishable from null.
//!
//! Because the encoding depends on where the word lives, a non-null `Pptr`
//! is only meaningful in place. It is deliberately neither `Copy` nor
//! `Clone`; write the target again with [`Pptr::set`] at the new location.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tag of a target at or above the pointer.
pub const POS_TAG: u64 = 0b01;
/// Tag of a target below the pointer.
pub const NEG_TAG: u64 = 0b10;
/// Mask of the tag bits.
pub const TAG_MASK: u64 = 0b11;

/// Encodes `target` as seen from a word stored at `self_addr`.
///
/// `target == 0` encodes as the null word.
#[inline]
#[must_use]
pub const fn encode(target: usize, self_addr: usize) -> u64 {
    if target == 0 {
        0
    } else if target >= self_addr {
        (((target - self_addr) as u64) << 2) | POS_TAG
    } else {
        (((self_addr - target) as u64) << 2) | NEG_TAG
    }
}

/// Decodes a word stored at `self_addr`. Returns 0 for null or an invalid
/// tag.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn decode(word: u64, self_addr: usize) -> usize {
    let distance = (word >> 2) as usize;
    match word & TAG_MASK {
        POS_TAG => self_addr.wrapping_add(distance),
        NEG_TAG => self_addr.wrapping_sub(distance),
        _ => 0,
    }
}

// ============================================================================
// Pptr
// ============================================================================

/// A nullable, self-relative pointer to a `T` in persistent memory.
#[repr(transparent)]
pub struct Pptr<T> {
    word: u64,
    _marker: PhantomData<*mut T>,
}

impl<T> Pptr<T> {
    /// The null pointer.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            word: 0,
            _marker: PhantomData,
        }
    }

    /// Returns `true` if the pointer resolves to null, which includes a
    /// word with an invalid tag.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.as_ptr().is_null()
    }

    fn addr(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Resolves the pointer relative to where it is stored.
    #[must_use]
    pub fn as_ptr(&self) -> *mut T {
        decode(self.word, self.addr()) as *mut T
    }

    /// Points this pointer at `target` (null allowed).
    pub fn set(&mut self, target: *const T) {
        self.word = encode(target as usize, self.addr());
    }

    /// The raw encoded word.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.word
    }
}

impl<T> Default for Pptr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for Pptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pptr({:p})", self.as_ptr())
    }
}

impl<T> PartialEq for Pptr<T> {
    /// Two pointers are equal when they resolve to the same target.
    fn eq(&self, other: &Self) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}

impl<T> Eq for Pptr<T> {}

// ============================================================================
// AtomicPptr
// ============================================================================

/// A [`Pptr`] that can be shared between threads.
#[repr(transparent)]
pub struct AtomicPptr<T> {
    word: AtomicU64,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for AtomicPptr<T> {}
unsafe impl<T> Sync for AtomicPptr<T> {}

impl<T> AtomicPptr<T> {
    /// The null pointer.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            word: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    fn addr(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Loads and resolves the pointer.
    pub fn load(&self, order: Ordering) -> *mut T {
        decode(self.word.load(order), self.addr()) as *mut T
    }

    /// Stores `target` (null allowed).
    pub fn store(&self, target: *const T, order: Ordering) {
        self.word.store(encode(target as usize, self.addr()), order);
    }

    /// Stores `target` if the current target is `current`.
    ///
    /// # Errors
    ///
    /// Returns the actual target if it was not `current`.
    pub fn compare_exchange(
        &self,
        current: *const T,
        new: *const T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<*mut T, *mut T> {
        let addr = self.addr();
        self.word
            .compare_exchange(
                encode(current as usize, addr),
                encode(new as usize, addr),
                success,
                failure,
            )
            .map(|w| decode(w, addr) as *mut T)
            .map_err(|w| decode(w, addr) as *mut T)
    }
}

impl<T> Default for AtomicPptr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for AtomicPptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicPptr({:p})", self.load(Ordering::Relaxed))
    }
}
