//! Crash recovery: dirty restarts rebuild the heap from its roots.

use std::collections::HashSet;
use std::ptr::NonNull;

use nvheap::config::SB_SIZE;
use nvheap::test_util::{assert_anchors_valid, simulate_crash, used_slots};
use nvheap::{Error, Heap, HeapConfig, Pptr, Trace};

#[derive(Trace)]
struct Node {
    value: u64,
    next: Pptr<Node>,
}

fn config(dir: &tempfile::TempDir) -> HeapConfig {
    HeapConfig::new("recovery").dir(dir.path()).size(32 << 20)
}

/// Allocates a list `values[0] -> values[1] -> ...` and returns its head.
fn build_list(heap: &Heap, values: &[u64]) -> Vec<NonNull<Node>> {
    let nodes: Vec<NonNull<Node>> = values
        .iter()
        .map(|&value| {
            let node = heap.malloc(size_of::<Node>()).unwrap().cast::<Node>();
            unsafe {
                node.write(Node {
                    value,
                    next: Pptr::null(),
                });
            }
            node
        })
        .collect();
    for pair in nodes.windows(2) {
        unsafe { (*pair[0].as_ptr()).next.set(pair[1].as_ptr()) };
    }
    for node in &nodes {
        nvheap::persist::persist(node.as_ptr());
    }
    nodes
}

fn collect_list(head: *mut Node) -> Vec<u64> {
    let mut values = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        let node = unsafe { &*cursor };
        values.push(node.value);
        cursor = node.next.as_ptr();
    }
    values
}

/// Allocates blocks nobody points to.
fn leak_garbage(heap: &Heap) {
    for _ in 0..200 {
        heap.malloc(64).unwrap();
    }
    heap.malloc(300_000).unwrap();
}

#[test]
fn test_dirty_restart_requires_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let heap = Heap::open(config(&dir)).unwrap();
    heap.malloc(8).unwrap();
    simulate_crash(heap);

    let heap = Heap::open(config(&dir)).unwrap();
    assert!(heap.is_restart());
    assert!(heap.needs_recovery());
    assert!(matches!(heap.malloc(8), Err(Error::RecoveryPending)));
    assert!(matches!(
        heap.free(std::ptr::null_mut()),
        Err(Error::RecoveryPending)
    ));

    assert!(heap.recover().unwrap());
    assert!(!heap.needs_recovery());
    assert!(!heap.recover().unwrap());
    heap.malloc(8).unwrap();
}

#[test]
fn test_recovery_preserves_typed_root_graph() {
    let dir = tempfile::tempdir().unwrap();
    let heap = Heap::open(config(&dir)).unwrap();
    let nodes = build_list(&heap, &[10, 20, 30]);
    heap.set_root(nodes[0].as_ptr(), 0).unwrap();
    leak_garbage(&heap);
    let slots_before = used_slots(&heap);
    simulate_crash(heap);

    let heap = Heap::open(config(&dir)).unwrap();
    // Registers `Node` as the root type for precise tracing.
    let head = heap.get_root::<Node>(0).unwrap();
    assert!(heap.recover().unwrap());

    assert_eq!(collect_list(head), vec![10, 20, 30]);
    let metrics = heap.last_recovery_metrics().unwrap();
    assert_eq!(metrics.roots_traced, 1);
    assert_eq!(metrics.blocks_marked, 3);
    assert_eq!(metrics.superblocks_kept(), 1);
    assert!(metrics.slots_freed > 0);
    assert_anchors_valid(&heap);

    // Nothing live is handed out again, and the garbage slots are reused.
    let live: HashSet<usize> = {
        let mut set = HashSet::new();
        let mut cursor = head;
        while !cursor.is_null() {
            set.insert(cursor as usize);
            cursor = unsafe { (*cursor).next.as_ptr() };
        }
        set
    };
    for _ in 0..4000 {
        let block = heap.malloc(size_of::<Node>()).unwrap();
        assert!(!live.contains(&(block.as_ptr() as usize)));
    }
    // The dead 64-byte superblock and the dead large run were coalesced
    // into one free run of six slots.
    heap.malloc(6 * SB_SIZE).unwrap();
    assert_eq!(used_slots(&heap), slots_before);
    assert_eq!(collect_list(head), vec![10, 20, 30]);
    assert_anchors_valid(&heap);
}

#[test]
fn test_recovery_with_conservative_root() {
    let dir = tempfile::tempdir().unwrap();
    let heap = Heap::open(config(&dir)).unwrap();
    let nodes = build_list(&heap, &[1, 2, 3, 4]);
    heap.set_root_raw(nodes[0].as_ptr().cast(), 3).unwrap();
    leak_garbage(&heap);
    simulate_crash(heap);

    let heap = Heap::open(config(&dir)).unwrap();
    assert!(heap.recover().unwrap());
    let head = heap.get_root::<Node>(3).unwrap();
    assert_eq!(collect_list(head), vec![1, 2, 3, 4]);

    let metrics = heap.last_recovery_metrics().unwrap();
    assert!(metrics.blocks_marked >= 4);
}

#[test]
fn test_recovery_keeps_large_root() {
    let dir = tempfile::tempdir().unwrap();
    let heap = Heap::open(config(&dir)).unwrap();
    let big = heap.malloc(200_000).unwrap();
    unsafe { big.as_ptr().write_bytes(0x42, 200_000) };
    heap.set_root_raw(big.as_ptr(), 0).unwrap();
    simulate_crash(heap);

    let heap = Heap::open(config(&dir)).unwrap();
    assert!(heap.recover().unwrap());
    let root = heap.get_root_raw(0).unwrap();
    assert_eq!(heap.malloc_size(root).unwrap(), 4 * SB_SIZE);
    let bytes = unsafe { std::slice::from_raw_parts(root, 200_000) };
    assert!(bytes.iter().all(|&b| b == 0x42));
    heap.free(root).unwrap();
}

#[test]
fn test_recovery_without_roots_frees_everything() {
    let dir = tempfile::tempdir().unwrap();
    let heap = Heap::open(config(&dir)).unwrap();
    leak_garbage(&heap);
    let slots = used_slots(&heap);
    simulate_crash(heap);

    let heap = Heap::open(config(&dir)).unwrap();
    assert!(heap.recover().unwrap());
    let metrics = heap.last_recovery_metrics().unwrap();
    assert_eq!(metrics.roots_traced, 0);
    assert_eq!(metrics.superblocks_kept(), 0);
    assert_eq!(metrics.slots_freed, slots);
}

#[test]
fn test_recovered_heap_closes_clean() {
    let dir = tempfile::tempdir().unwrap();
    let heap = Heap::open(config(&dir)).unwrap();
    let nodes = build_list(&heap, &[5, 6]);
    heap.set_root(nodes[0].as_ptr(), 1).unwrap();
    simulate_crash(heap);

    let heap = Heap::open(config(&dir)).unwrap();
    heap.get_root::<Node>(1).unwrap();
    assert!(heap.recover().unwrap());
    heap.close().unwrap();

    let heap = Heap::open(config(&dir)).unwrap();
    assert!(!heap.needs_recovery());
    assert_eq!(collect_list(heap.get_root::<Node>(1).unwrap()), vec![5, 6]);
}

#[test]
fn test_unrecovered_heap_stays_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let heap = Heap::open(config(&dir)).unwrap();
    heap.malloc(16).unwrap();
    simulate_crash(heap);

    // Closing without recovering must not hide the crash from the next
    // session.
    Heap::open(config(&dir)).unwrap().close().unwrap();
    let heap = Heap::open(config(&dir)).unwrap();
    assert!(heap.needs_recovery());
}
