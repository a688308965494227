//! Tests for the #[derive(Trace)] macro.

use nvheap::{Pptr, Trace, Visitor};

/// Records the address of every visited target.
#[derive(Default)]
struct Recorder {
    targets: Vec<usize>,
}

impl Visitor for Recorder {
    fn visit<T: Trace>(&mut self, target: *const T) {
        if !target.is_null() {
            self.targets.push(target as usize);
        }
    }

    unsafe fn visit_region(&mut self, _ptr: *const u8, _len: usize) {}
}

fn visited(value: &impl Trace) -> Vec<usize> {
    let mut recorder = Recorder::default();
    value.trace(&mut recorder);
    recorder.targets
}

fn addr<T>(value: &T) -> usize {
    std::ptr::from_ref(value) as usize
}

/// A binary tree node.
#[derive(Trace)]
struct TreeNode {
    key: u64,
    left: Pptr<TreeNode>,
    right: Pptr<TreeNode>,
}

#[test]
fn test_derive_named_struct() {
    let leaf = TreeNode {
        key: 1,
        left: Pptr::null(),
        right: Pptr::null(),
    };
    let mut root = TreeNode {
        key: 2,
        left: Pptr::null(),
        right: Pptr::null(),
    };
    root.right.set(&leaf);

    assert_eq!(visited(&root), vec![addr(&leaf)]);
    assert!(visited(&leaf).is_empty());
    assert_eq!(root.key + leaf.key, 3);
}

/// Tuple struct.
#[derive(Trace)]
struct Pair(Pptr<u64>, u32, Pptr<u64>);

#[test]
fn test_derive_tuple_struct() {
    let a = 1u64;
    let b = 2u64;
    let mut pair = Pair(Pptr::null(), 0, Pptr::null());
    pair.0.set(&a);
    pair.2.set(&b);
    assert_eq!(visited(&pair), vec![addr(&a), addr(&b)]);
    assert_eq!(pair.1, 0);
}

/// Enum with every variant shape.
#[derive(Trace)]
enum Slot {
    Empty,
    Inline(u64),
    Pointer(Pptr<u64>),
    Linked { prev: Pptr<u64>, next: Pptr<u64> },
}

#[test]
fn test_derive_enum() {
    let target = 9u64;
    assert!(visited(&Slot::Empty).is_empty());
    assert!(visited(&Slot::Inline(3)).is_empty());

    let mut pointer = Slot::Pointer(Pptr::null());
    if let Slot::Pointer(p) = &mut pointer {
        p.set(&target);
    }
    assert_eq!(visited(&pointer), vec![addr(&target)]);

    let mut linked = Slot::Linked {
        prev: Pptr::null(),
        next: Pptr::null(),
    };
    if let Slot::Linked { next, .. } = &mut linked {
        next.set(&target);
    }
    assert_eq!(visited(&linked), vec![addr(&target)]);
}

/// Generic struct: the derive adds the `Trace` bound.
#[derive(Trace)]
struct Wrapper<T> {
    inner: T,
    extra: [Pptr<u8>; 2],
}

#[test]
fn test_derive_generic_struct() {
    let byte = 5u8;
    let mut wrapper = Wrapper {
        inner: Pair(Pptr::null(), 1, Pptr::null()),
        extra: [Pptr::null(), Pptr::null()],
    };
    wrapper.extra[1].set(&byte);
    assert_eq!(visited(&wrapper), vec![addr(&byte)]);
    assert!(visited(&wrapper.inner).is_empty());
}

mod reexported {
    pub use nvheap as heap_crate;
}

/// Points the generated code at a re-exported path.
#[derive(Trace)]
#[nvheap(crate = reexported::heap_crate)]
struct Renamed {
    ptr: Pptr<u32>,
}

#[test]
fn test_derive_crate_override() {
    let value = 3u32;
    let mut renamed = Renamed { ptr: Pptr::null() };
    renamed.ptr.set(&value);
    assert_eq!(visited(&renamed), vec![addr(&value)]);
}
