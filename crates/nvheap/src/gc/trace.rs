//! Trace trait and Visitor pattern for crash recovery.
//!
//! Types that implement `Trace` can be registered as the type of a
//! persistent root. Recovery then follows exactly the [`Pptr`] fields they
//! report instead of scanning every word of their blocks.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{
    AtomicBool, AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicIsize, AtomicU16, AtomicU32,
    AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

use crate::pptr::{AtomicPptr, Pptr};

// ============================================================================
// Core Traits
// ============================================================================

/// A type whose persistent pointers can be followed by recovery.
///
/// # Safety
///
/// Implementations **MUST** report every [`Pptr`] and [`AtomicPptr`] field by
/// calling `trace` on it (or `visitor.visit()` on its target). A block that
/// is reachable only through an unreported field is reclaimed by the next
/// recovery while still in use.
///
/// Prefer using `#[derive(Trace)]` instead of manual implementation.
///
/// # Examples
///
/// ```
/// use nvheap::{Pptr, Trace, Visitor};
///
/// struct Node {
///     value: u64,
///     next: Pptr<Node>,
/// }
///
/// unsafe impl Trace for Node {
///     fn trace(&self, visitor: &mut impl Visitor) {
///         self.next.trace(visitor);
///     }
/// }
/// ```
pub unsafe trait Trace {
    /// Visit every persistent pointer contained within this value.
    fn trace(&self, visitor: &mut impl Visitor);
}

/// A visitor that traverses the persistent object graph during recovery.
///
/// Users generally do not need to implement this trait.
pub trait Visitor {
    /// Visit the target of a persistent pointer. Null is ignored.
    fn visit<T: Trace>(&mut self, target: *const T);

    /// Visit a memory region conservatively, reading every aligned word as
    /// a possible [`Pptr`].
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reading `len` bytes.
    unsafe fn visit_region(&mut self, ptr: *const u8, len: usize);
}

// ============================================================================
// Trace implementations for persistent pointers
// ============================================================================

// SAFETY: a Pptr reports its own target.
unsafe impl<T: Trace> Trace for Pptr<T> {
    #[inline]
    fn trace(&self, visitor: &mut impl Visitor) {
        visitor.visit(self.as_ptr().cast_const());
    }
}

// SAFETY: as for Pptr; recovery runs with no concurrent writers.
unsafe impl<T: Trace> Trace for AtomicPptr<T> {
    #[inline]
    fn trace(&self, visitor: &mut impl Visitor) {
        visitor.visit(self.load(Ordering::Acquire).cast_const());
    }
}

// ============================================================================
// Trace implementations for primitive types
// ============================================================================

macro_rules! impl_trace_for_primitives {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: Primitive types contain no persistent pointers
            unsafe impl Trace for $t {
                #[inline]
                fn trace(&self, _visitor: &mut impl Visitor) {}
            }
        )*
    };
}

impl_trace_for_primitives! {
    // Signed integers
    i8, i16, i32, i64, i128, isize,
    // Unsigned integers
    u8, u16, u32, u64, u128, usize,
    // Floating point
    f32, f64,
    // Other primitives
    bool, char, (),
    // Atomics
    AtomicBool, AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
    std::num::NonZeroU32, std::num::NonZeroU64, std::num::NonZeroUsize,
}

// ============================================================================
// Trace implementations for in-place containers
// ============================================================================

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    #[inline]
    fn trace(&self, visitor: &mut impl Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

unsafe impl<T: Trace> Trace for [T] {
    #[inline]
    fn trace(&self, visitor: &mut impl Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

unsafe impl<T: Trace> Trace for Option<T> {
    #[inline]
    fn trace(&self, visitor: &mut impl Visitor) {
        if let Some(value) = self {
            value.trace(visitor);
        }
    }
}

unsafe impl<T: Trace + Copy> Trace for Cell<T> {
    #[inline]
    fn trace(&self, visitor: &mut impl Visitor) {
        self.get().trace(visitor);
    }
}

// ============================================================================
// Trace implementations for tuples
// ============================================================================

macro_rules! impl_trace_for_tuples {
    () => {};
    ($first:ident $(, $rest:ident)*) => {
        #[allow(non_snake_case)]
        unsafe impl<$first: Trace $(, $rest: Trace)*> Trace for ($first, $($rest,)*) {
            #[inline]
            fn trace(&self, visitor: &mut impl Visitor) {
                let ($first, $($rest,)*) = self;
                $first.trace(visitor);
                $($rest.trace(visitor);)*
            }
        }
        impl_trace_for_tuples!($($rest),*);
    };
}

impl_trace_for_tuples!(A, B, C, D, E, F, G, H);

// SAFETY: PhantomData holds no data
unsafe impl<T: ?Sized> Trace for PhantomData<T> {
    #[inline]
    fn trace(&self, _visitor: &mut impl Visitor) {}
}
