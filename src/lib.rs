//! Fixed-capacity concurrent table for deduplicating records keyed by 64-bit union keys.
//!
//! # union_table::UnionTable
//! A table of `SIZE` buckets with lock-free reads of embedded cells, a per-bucket
//! reader-writer lock for the overflow array, and scoped [`Handle`]s that mediate every lookup,
//! creation, and removal.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use union_table::UnionTable;
//!
//! let table: Arc<UnionTable<u64, 101>> = Arc::new(UnionTable::new());
//! let threads: Vec<_> = (0..4)
//!     .map(|_| {
//!         let table = table.clone();
//!         thread::spawn(move || {
//!             for key in 1..=64 {
//!                 let mut handle = table.acquire(key);
//!                 if handle.created() {
//!                     *handle = key * 2;
//!                 }
//!             }
//!         })
//!     })
//!     .collect();
//! for thread in threads {
//!     thread.join().unwrap();
//! }
//! assert_eq!(table.len(), 64);
//! assert_eq!(table.get(32), Some(64));
//! ```

mod maybe_std;

#[cfg(not(feature = "loom"))]
mod wait_queue;

mod union_table;
pub use union_table::{Handle, UnionTable, BUCKET_LEN};
