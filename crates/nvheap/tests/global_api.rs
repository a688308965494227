//! The process-wide entry points in `nvheap::api`.
//!
//! The global heap is shared by every test in a binary, so the whole
//! lifecycle runs in one test.

use std::thread;

use nvheap::{api, Error, HeapConfig, RegionIndex};

#[test]
fn test_global_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = HeapConfig::new("global").dir(dir.path()).size(8 << 20);

    assert!(matches!(api::malloc(8), Err(Error::NotInitialized)));
    assert!(!api::in_range(std::ptr::null()));
    assert!(matches!(api::close(), Err(Error::NotInitialized)));

    assert!(!api::init_with(config.clone()).unwrap());
    assert!(matches!(
        api::init_with(config.clone()),
        Err(Error::AlreadyInitialized)
    ));
    assert!(!api::recover().unwrap());

    let block = api::malloc(100).unwrap();
    assert!(api::in_range(block.as_ptr()));
    assert!(api::malloc_size(block.as_ptr()).unwrap() >= 100);
    let (start, end) = api::region_range(RegionIndex::Superblock).unwrap();
    assert!(start < block.as_ptr() && block.as_ptr() < end);

    let block = api::realloc(block.as_ptr(), 5000).unwrap();
    let zeroed = api::calloc(4, 4).unwrap();
    assert_eq!(unsafe { zeroed.cast::<u128>().read() }, 0);
    api::free(zeroed.as_ptr()).unwrap();

    unsafe { block.cast::<u64>().write(0xfeed) };
    assert!(api::set_root(block.cast::<u64>().as_ptr(), 0).unwrap().is_null());

    // Worker threads pick the heap up lazily and drain on exit.
    let workers: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                api::thread_init().unwrap();
                let blocks: Vec<_> = (0..100).map(|_| api::malloc(32).unwrap()).collect();
                for block in blocks {
                    api::free(block.as_ptr()).unwrap();
                }
                api::thread_exit();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    api::close().unwrap();
    assert!(matches!(api::malloc(8), Err(Error::NotInitialized)));

    // A reopened heap is found through the same thread-local slot.
    assert!(api::init_with(config).unwrap());
    assert!(!api::recover().unwrap());
    let root = api::get_root::<u64>(0).unwrap();
    assert_eq!(unsafe { root.read() }, 0xfeed);
    api::free(root.cast()).unwrap();
    api::close().unwrap();
}
