//! End-to-end heap scenarios: thread churn, size-class boundaries, and
//! concurrent allocation.

use std::collections::HashSet;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;

use nvheap::config::{MAX_SMALL_SIZE, SB_SIZE};
use nvheap::descriptor::SuperblockState;
use nvheap::test_util::{anchors, assert_anchors_valid, used_slots};
use nvheap::{Heap, HeapConfig};

fn open(dir: &tempfile::TempDir, id: &str) -> Heap {
    Heap::open(HeapConfig::new(id).dir(dir.path()).size(256 << 20)).unwrap()
}

/// Blocks freed by exited threads are reused instead of growing the arena.
#[test]
fn test_thread_churn_does_not_grow_arena() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(&dir, "churn");
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let heap = heap.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let blocks: Vec<_> = (0..250).map(|_| heap.malloc(64).unwrap()).collect();
                // Nobody exits (and drains) before everyone has a superblock.
                barrier.wait();
                for block in &blocks {
                    // Fits in place, so realloc keeps the block.
                    assert_eq!(heap.realloc(block.as_ptr(), 48).unwrap(), *block);
                }
                for block in blocks {
                    heap.free(block.as_ptr()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let after_threads = used_slots(&heap);
    assert_eq!(after_threads, 4);
    assert_anchors_valid(&heap);

    let blocks: Vec<_> = (0..1000).map(|_| heap.malloc(64).unwrap()).collect();
    assert_eq!(used_slots(&heap), after_threads);
    assert_anchors_valid(&heap);
    for block in blocks {
        heap.free(block.as_ptr()).unwrap();
    }
    heap.flush_thread_cache();
    assert_anchors_valid(&heap);
}

/// 14336 bytes is the largest size class; one byte more is a large
/// allocation.
#[test]
fn test_size_class_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(&dir, "boundary");

    let small = heap.malloc(MAX_SMALL_SIZE).unwrap();
    assert_eq!(heap.malloc_size(small.as_ptr()).unwrap(), MAX_SMALL_SIZE);
    // 14336 does not divide 64 KiB; its superblocks span 7 slots.
    assert_eq!(used_slots(&heap), 7);

    let large = heap.malloc(MAX_SMALL_SIZE + 1).unwrap();
    assert_eq!(heap.malloc_size(large.as_ptr()).unwrap(), SB_SIZE);
    assert_eq!(used_slots(&heap), 8);
    assert_eq!(large.as_ptr() as usize % SB_SIZE, small.as_ptr() as usize % SB_SIZE);

    heap.free(large.as_ptr()).unwrap();
    heap.free(small.as_ptr()).unwrap();
}

/// Blocks are distinct across threads and never overlap.
#[test]
fn test_concurrent_allocations_are_disjoint() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let dir = tempfile::tempdir().unwrap();
    let heap = open(&dir, "disjoint");
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = heap.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                #[allow(clippy::cast_possible_truncation)]
                let tag = t as u8;
                barrier.wait();
                let mut blocks = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    let size = 8 + (i * 37 + t * 101) % 3000;
                    let ptr = heap.malloc(size).unwrap();
                    unsafe { ptr.as_ptr().write_bytes(tag, size) };
                    blocks.push((ptr.as_ptr() as usize, size));
                }
                for &(addr, size) in &blocks {
                    let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
                    assert!(bytes.iter().all(|&b| b == tag));
                }
                blocks
            })
        })
        .collect();

    let mut all: Vec<(usize, usize)> = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    let unique: HashSet<_> = all.iter().map(|&(addr, _)| addr).collect();
    assert_eq!(unique.len(), THREADS * PER_THREAD);

    all.sort_unstable();
    for pair in all.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0);
    }
    for (addr, _) in all {
        heap.free(addr as *mut u8).unwrap();
    }
}

/// Blocks freed on one thread can be allocated on another.
#[test]
fn test_cross_thread_free() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(&dir, "cross");

    let blocks: Vec<usize> = (0..2000)
        .map(|_| heap.malloc(128).unwrap().as_ptr() as usize)
        .collect();
    heap.flush_thread_cache();

    let worker = {
        let heap = heap.clone();
        thread::spawn(move || {
            for addr in blocks {
                heap.free(addr as *mut u8).unwrap();
            }
        })
    };
    worker.join().unwrap();

    let before = used_slots(&heap);
    let again: Vec<_> = (0..2000).map(|_| heap.malloc(128).unwrap()).collect();
    assert_eq!(used_slots(&heap), before);
    for block in again {
        heap.free(block.as_ptr()).unwrap();
    }
}

/// Class 64 holds 1024 blocks in one slot.
const BLOCKS_64: usize = 1024;

/// A PARTIAL superblock that drains to EMPTY stays listed; the next refill
/// pops it, retires it and takes the slot back from the free list.
#[test]
fn test_emptied_partial_superblock_is_retired_on_pop() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(&dir, "partial_empty");

    for _ in 0..3 {
        let blocks: Vec<_> = (0..BLOCKS_64).map(|_| heap.malloc(64).unwrap()).collect();
        assert_eq!(anchors(&heap)[0].0.state, SuperblockState::Full);

        for block in &blocks[..BLOCKS_64 / 2] {
            heap.free(block.as_ptr()).unwrap();
        }
        heap.flush_thread_cache();
        assert_eq!(anchors(&heap)[0].0.state, SuperblockState::Partial);

        for block in &blocks[BLOCKS_64 / 2..] {
            heap.free(block.as_ptr()).unwrap();
        }
        heap.flush_thread_cache();
        let (anchor, capacity) = anchors(&heap)[0];
        assert_eq!(anchor.state, SuperblockState::Empty);
        assert_eq!(anchor.count, capacity - 1);
        assert_anchors_valid(&heap);
    }
    assert_eq!(used_slots(&heap), 1);
}

/// A FULL superblock whose blocks all come back in one drain is retired by
/// the drainer.
#[test]
fn test_full_superblock_drained_at_once_is_retired() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(&dir, "full_empty");

    for _ in 0..3 {
        let blocks: Vec<_> = (0..BLOCKS_64).map(|_| heap.malloc(64).unwrap()).collect();
        for block in &blocks {
            heap.free(block.as_ptr()).unwrap();
        }
        heap.flush_thread_cache();
        assert!(anchors(&heap).is_empty());
    }
    assert_eq!(used_slots(&heap), 1);
}

/// The last free of a superblock races a refill that pops it from the
/// partial list. Whatever the order, its slot is freed exactly once.
#[test]
fn test_final_free_races_partial_pop() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(&dir, "free_vs_pop");

    for _ in 0..20 {
        let blocks: Vec<usize> = (0..BLOCKS_64)
            .map(|_| heap.malloc(64).unwrap().as_ptr() as usize)
            .collect();
        for &addr in &blocks[..BLOCKS_64 / 2] {
            heap.free(addr as *mut u8).unwrap();
        }
        heap.flush_thread_cache();

        let barrier = Arc::new(Barrier::new(2));
        let freer = {
            let heap = heap.clone();
            let barrier = Arc::clone(&barrier);
            let rest = blocks[BLOCKS_64 / 2..].to_vec();
            thread::spawn(move || {
                for &addr in &rest {
                    heap.free(addr as *mut u8).unwrap();
                }
                barrier.wait();
                // Exiting drains the cache and completes the superblock.
            })
        };
        let popper = {
            let heap = heap.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let block = heap.malloc(64).unwrap();
                heap.free(block.as_ptr()).unwrap();
            })
        };
        freer.join().unwrap();
        popper.join().unwrap();

        assert_eq!(used_slots(&heap), 1);
        assert_anchors_valid(&heap);
    }

    // A slot listed twice would back two superblocks at once.
    let mut seen = HashSet::new();
    for _ in 0..2 * BLOCKS_64 {
        assert!(seen.insert(heap.malloc(64).unwrap().as_ptr() as usize));
    }
    assert_eq!(used_slots(&heap), 2);
}

/// Threads that exit after `close` leave the written-back metadata as it
/// was.
#[test]
fn test_thread_exit_after_close_keeps_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(&dir, "late_exit");
    let observer = heap.clone();
    let (cached_tx, cached_rx) = mpsc::channel();
    let (closed_tx, closed_rx) = mpsc::channel::<()>();

    let worker = {
        let heap = heap.clone();
        thread::spawn(move || {
            let block = heap.malloc(64).unwrap();
            heap.free(block.as_ptr()).unwrap();
            drop(heap);
            cached_tx.send(()).unwrap();
            closed_rx.recv().unwrap();
        })
    };

    cached_rx.recv().unwrap();
    heap.close().unwrap();
    let after_close = anchors(&observer);
    assert_eq!(after_close.len(), 1);
    assert_eq!(after_close[0].0.state, SuperblockState::Full);

    closed_tx.send(()).unwrap();
    worker.join().unwrap();
    assert_eq!(anchors(&observer), after_close);

    drop(observer);
    let heap = open(&dir, "late_exit");
    assert!(!heap.needs_recovery());
    assert_eq!(anchors(&heap), after_close);
    assert_anchors_valid(&heap);
}
