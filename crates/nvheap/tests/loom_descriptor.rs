//! Loom tests for the lock-free descriptor stacks.
//!
//! These tests verify that concurrent push and pop on a tagged stack head
//! never lose or duplicate a descriptor.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use nvheap::descriptor::{self, AtomicDescNode, DescLink, Descriptor};

const TABLE_SIZE: usize = 4;

struct Stack {
    table: Box<[Descriptor]>,
    head: AtomicDescNode,
}

impl Stack {
    fn new() -> Self {
        Self {
            table: (0..TABLE_SIZE).map(|_| Descriptor::new()).collect(),
            head: AtomicDescNode::null(),
        }
    }

    fn push(&self, index: u32) {
        descriptor::push(&*self.table, &self.head, DescLink::Free, index);
    }

    fn pop(&self) -> Option<u32> {
        descriptor::pop(&*self.table, &self.head, DescLink::Free)
    }
}

/// Two concurrent pushes both land on the stack.
#[test]
#[ignore = "loom test - run with cargo test loom_descriptor_push --release"]
fn test_concurrent_push() {
    loom::model(|| {
        let stack = Arc::new(Stack::new());

        let handles: Vec<_> = (0..2u32)
            .map(|index| {
                let stack = Arc::clone(&stack);
                loom::thread::spawn(move || stack.push(index))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut popped = vec![stack.pop().unwrap(), stack.pop().unwrap()];
        popped.sort_unstable();
        assert_eq!(popped, vec![0, 1]);
        assert_eq!(stack.pop(), None);
    });
}

/// Two concurrent pops of a two-element stack take distinct descriptors.
#[test]
#[ignore = "loom test - run with cargo test loom_descriptor_pop --release"]
fn test_concurrent_pop() {
    loom::model(|| {
        let stack = Arc::new(Stack::new());
        stack.push(2);
        stack.push(3);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let stack = Arc::clone(&stack);
                loom::thread::spawn(move || stack.pop())
            })
            .collect();
        let mut popped: Vec<u32> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();
        popped.sort_unstable();

        assert_eq!(popped, vec![2, 3]);
        assert!(stack.head.load(Ordering::Acquire).index().is_none());
    });
}

/// A pop racing a push sees either the old top or the new one.
#[test]
#[ignore = "loom test - run with cargo test loom_descriptor_mixed --release"]
fn test_push_pop_race() {
    loom::model(|| {
        let stack = Arc::new(Stack::new());
        stack.push(0);

        let pusher = loom::thread::spawn({
            let stack = Arc::clone(&stack);
            move || stack.push(1)
        });
        let popper = loom::thread::spawn({
            let stack = Arc::clone(&stack);
            move || stack.pop()
        });

        pusher.join().unwrap();
        let first = popper.join().unwrap().unwrap();
        let second = stack.pop().unwrap();

        assert_ne!(first, second);
        assert!(first <= 1 && second <= 1);
        assert_eq!(stack.pop(), None);
    });
}

/// Every successful CAS bumps the head's generation counter.
#[test]
#[ignore = "loom test - run with cargo test loom_descriptor_counter --release"]
fn test_generation_counter_advances() {
    loom::model(|| {
        let stack = Arc::new(Stack::new());

        let handles: Vec<_> = (0..2u32)
            .map(|index| {
                let stack = Arc::clone(&stack);
                loom::thread::spawn(move || {
                    stack.push(index);
                    stack.pop()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_some());
        }

        let head = stack.head.load(Ordering::Acquire);
        assert!(head.index().is_none());
        assert_eq!(head.counter(), 4);
    });
}
