#![cfg(not(feature = "loom"))]

use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;
use union_table::{UnionTable, BUCKET_LEN};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct Label {
    left: u32,
    right: u32,
    depth: u16,
}

#[derive(Clone, Debug)]
enum Op {
    Acquire(u64, u32),
    Lookup(u64),
    Remove(u64),
    GetOrInsert(u64, u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1_u64..40, any::<u32>()).prop_map(|(key, value)| Op::Acquire(key, value)),
        (1_u64..40).prop_map(Op::Lookup),
        (1_u64..40).prop_map(Op::Remove),
        (1_u64..40, any::<u32>()).prop_map(|(key, value)| Op::GetOrInsert(key, value)),
    ]
}

proptest! {
    #[test]
    fn sequential_model(ops in prop::collection::vec(op(), 1..512)) {
        let table: UnionTable<u32, 5> = UnionTable::new();
        let mut model: HashMap<u64, u32> = HashMap::new();
        for op in ops {
            match op {
                Op::Acquire(key, value) => {
                    let mut handle = table.acquire(key);
                    prop_assert!(handle.exists());
                    if let Some(expected) = model.get(&key) {
                        prop_assert!(!handle.created());
                        prop_assert_eq!(*handle, *expected);
                    } else {
                        prop_assert!(handle.created());
                        prop_assert_eq!(*handle, 0);
                        *handle = value;
                        model.insert(key, value);
                    }
                }
                Op::Lookup(key) => {
                    let handle = table.lookup(key);
                    prop_assert_eq!(handle.exists(), model.contains_key(&key));
                    prop_assert_eq!(handle.get().copied(), model.get(&key).copied());
                }
                Op::Remove(key) => {
                    prop_assert_eq!(unsafe { table.remove(key) }, model.remove(&key));
                }
                Op::GetOrInsert(key, value) => {
                    let expected = *model.entry(key).or_insert(value);
                    prop_assert_eq!(table.get_or_insert_with(key, || value), expected);
                }
            }
        }
        prop_assert_eq!(table.len(), model.len());
        for key in 1..40 {
            prop_assert_eq!(table.contains(key), model.contains_key(&key));
        }
    }
}

#[test]
fn union_labels() {
    let num_threads = 8;
    let num_unions = 2048_u32;
    let table: Arc<UnionTable<Label, 257>> = Arc::new(UnionTable::new());
    let barrier = Arc::new(Barrier::new(num_threads));
    let threads: Vec<_> = (0..num_threads)
        .map(|_| {
            let table = table.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for left in 1..=num_unions {
                    let right = left.wrapping_mul(31) % num_unions + 1;
                    let key = (u64::from(left) << 32) | u64::from(right);
                    let label = table.get_or_insert_with(key, || Label {
                        left,
                        right,
                        depth: 1,
                    });
                    assert_eq!((label.left, label.right, label.depth), (left, right, 1));
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(table.len(), num_unions as usize);
}

#[test]
fn overflow_heavy() {
    let table: UnionTable<u64, 3> = UnionTable::new();
    let num_keys = 64 * BUCKET_LEN as u64;
    for key in 1..=num_keys {
        assert!(table.acquire(key).created());
    }
    for key in (1..=num_keys).step_by(2) {
        assert_eq!(unsafe { table.remove(key) }, Some(0));
    }
    for key in 1..=num_keys {
        assert_eq!(table.contains(key), key % 2 == 0);
    }
    assert_eq!(table.len(), num_keys as usize / 2);
}
