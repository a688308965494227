//! Concurrent bump allocation on a shared region.

use std::sync::{Arc, Barrier};
use std::thread;

use nvheap::config::PAGE_SIZE;
use nvheap::region::Region;
use nvheap::{Error, RegionIndex};

#[test]
fn test_concurrent_bump_until_full() {
    const THREADS: usize = 8;
    const CHUNK: usize = 192;

    let dir = tempfile::tempdir().unwrap();
    let (region, created) =
        Region::open(&dir.path().join("bump_desc"), RegionIndex::Desc, 64 * PAGE_SIZE, false).unwrap();
    assert!(created);
    let region = Arc::new(region);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let region = Arc::clone(&region);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut chunks = Vec::new();
                loop {
                    match region.allocate(64, CHUNK) {
                        Ok(ptr) => chunks.push(ptr.as_ptr() as usize),
                        Err(Error::OutOfSpace { region, requested }) => {
                            assert_eq!(region, RegionIndex::Desc);
                            assert_eq!(requested, CHUNK);
                            return chunks;
                        }
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
            })
        })
        .collect();

    let mut all: Vec<usize> = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    all.sort_unstable();

    let (start, end) = region.range();
    let first = start as usize + PAGE_SIZE;
    for &addr in &all {
        assert_eq!(addr % 64, 0);
        assert!(addr >= first && addr + CHUNK <= end as usize);
    }
    for pair in all.windows(2) {
        assert!(pair[0] + CHUNK <= pair[1]);
    }

    // Each chunk takes 192 bytes at a 64-byte boundary, so nothing is
    // wasted and no room for another chunk is left.
    assert_eq!(all.len(), region.capacity() / CHUNK);
    assert!(region.capacity() - region.used() < CHUNK);
}

#[test]
fn test_reopen_keeps_bump_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reopen_meta");
    let used = {
        let (region, _) = Region::open(&path, RegionIndex::Meta, 8 * PAGE_SIZE, false).unwrap();
        for _ in 0..10 {
            region.allocate(8, 100).unwrap();
        }
        region.flush().unwrap();
        region.used()
    };

    let (region, created) = Region::open(&path, RegionIndex::Meta, 8 * PAGE_SIZE, false).unwrap();
    assert!(!created);
    assert_eq!(region.used(), used);
    let next = region.allocate(8, 8).unwrap();
    assert_eq!(
        next.as_ptr() as usize - region.base() as usize,
        (PAGE_SIZE + used).next_multiple_of(8)
    );
}
