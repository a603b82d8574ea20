use std::sync::{Arc, Mutex};

use loom::model::Builder;
use loom::thread::spawn;

use crate::UnionTable;

static SERIALIZER: Mutex<()> = Mutex::new(());

fn builder() -> Builder {
    let mut model_builder = Builder::new();
    model_builder.max_threads = 2;
    model_builder.max_branches = 1_048_576;
    model_builder.preemption_bound = Some(3);
    model_builder
}

// Exactly one of two threads racing on an absent key creates the entry.
#[test]
fn creation_race() {
    let _guard = SERIALIZER.lock().unwrap();

    builder().check(|| {
        let table: Arc<UnionTable<u64, 1>> = Arc::new(UnionTable::new());
        let table_clone = table.clone();
        let thread_create = spawn(move || {
            let mut handle = table_clone.acquire(7);
            let created = handle.created();
            if created {
                *handle = 1;
            } else {
                assert_eq!(*handle, 2);
            }
            created
        });

        let mut handle = table.acquire(7);
        let created = handle.created();
        if created {
            *handle = 2;
        } else {
            assert_eq!(*handle, 1);
        }
        drop(handle);

        let created_by_other = thread_create.join().unwrap();
        assert!(created ^ created_by_other);
        assert_eq!(table.len(), 1);
    });
}

// A published key is observed together with the value written before publication.
#[test]
fn publication() {
    let _guard = SERIALIZER.lock().unwrap();

    builder().check(|| {
        let table: Arc<UnionTable<u64, 1>> = Arc::new(UnionTable::new());
        let table_clone = table.clone();
        let thread_insert = spawn(move || {
            let mut handle = table_clone.acquire(3);
            assert!(handle.created());
            *handle = 33;
        });

        if let Some(value) = table.get(3) {
            assert_eq!(value, 33);
        }
        thread_insert.join().unwrap();
        assert_eq!(table.get(3), Some(33));
    });
}

// A key moved from the overflow array into an embedded cell is never missed by a reader.
#[test]
fn compaction_visibility() {
    let _guard = SERIALIZER.lock().unwrap();

    builder().check(|| {
        let table: Arc<UnionTable<u64, 1>> = Arc::new(UnionTable::new());
        for key in 1..=4 {
            *table.acquire(key) = key * 10;
        }
        assert_eq!(table.snapshot(0).overflow, vec![4]);

        let table_clone = table.clone();
        let thread_remove = spawn(move || {
            assert_eq!(unsafe { table_clone.remove(1) }, Some(10));
        });

        assert_eq!(table.get(4), Some(40));
        assert!(table.contains(2));
        thread_remove.join().unwrap();

        let snapshot = table.snapshot(0);
        assert_eq!(snapshot.embedded, vec![4, 2, 3]);
        assert_eq!(snapshot.live(), 3);
        assert!(snapshot.overflow_capacity >= 1);
        assert_eq!(table.len(), 3);
    });
}

// An entry created in a freshly allocated overflow array is observed with its value.
#[test]
fn overflow_publication() {
    let _guard = SERIALIZER.lock().unwrap();

    builder().check(|| {
        let table: Arc<UnionTable<u64, 1>> = Arc::new(UnionTable::new());
        for key in 1..=3 {
            *table.acquire(key) = key;
        }
        assert_eq!(table.snapshot(0).overflow_capacity, 0);

        let table_clone = table.clone();
        let thread_insert = spawn(move || {
            let mut handle = table_clone.acquire(4);
            assert!(handle.created());
            *handle = 44;
        });

        if let Some(value) = table.get(4) {
            assert_eq!(value, 44);
        }
        thread_insert.join().unwrap();
        assert_eq!(table.snapshot(0).overflow, vec![4]);
    });
}
