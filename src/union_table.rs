//! [`UnionTable`] is a fixed-capacity concurrent table keyed by 64-bit union keys.

mod bucket;
mod lock;
mod overflow;

use std::fmt::{self, Debug};
use std::mem;
use std::num::NonZeroU64;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering::Relaxed;
use std::thread;

use tracing::trace;

pub use bucket::BUCKET_LEN;
use bucket::{Bucket, Cell, Position, Reader, Slot, Writer};

#[cfg(test)]
pub(crate) use bucket::BucketSnapshot;

/// Fixed-capacity concurrent table mapping non-zero `u64` keys to plain-data values.
///
/// [`UnionTable`] consists of `SIZE` buckets, each of which embeds [`BUCKET_LEN`] cells and
/// spills additional entries into a growable overflow array guarded by a per-bucket
/// reader-writer lock. The table itself is never resized.
///
/// All accesses go through a [`Handle`]: acquiring a handle looks the key up and, depending on
/// the intent, creates or prepares the entry for removal; dropping the handle publishes the new
/// entry, completes the removal, or releases the lock it holds.
///
/// ## The key characteristics of [`UnionTable`]
///
/// * Lock-free read: a key stored in an embedded cell is found without touching the lock.
/// * Shared read: keys in the overflow array are found under a shared lock.
/// * Exclusive write: creation and removal lock the bucket exclusively until the handle drops.
/// * Key `0` is reserved for vacant cells and is rejected.
/// * An overflow array, once allocated, is retained until the table is dropped.
///
/// ## Removal
///
/// A lock-free reader may hold a reference to an embedded cell while another thread removes the
/// same key and reuses the cell. Removal is therefore `unsafe`: the caller guarantees that no
/// other handle for the key is alive or being acquired.
///
/// ## Deadlocks
///
/// A [`Handle`] found in the overflow array holds a shared lock, and a [`Handle`] that created
/// or is removing an entry holds an exclusive lock. Acquiring another handle that needs the
/// exclusive lock of the same bucket on the same thread while such a handle is alive
/// deadlocks. [`UnionTable::len`], [`UnionTable::is_empty`], and the [`Debug`] output take the
/// shared lock of every bucket, so calling them while holding a [`Handle`] with an exclusive lock
/// deadlocks as well.
pub struct UnionTable<V, const SIZE: usize> {
    buckets: Box<[Bucket<V>]>,
}

/// [`Handle`] is a scoped accessor to a single entry of a [`UnionTable`].
///
/// The acquire protocol runs when the handle is created and the release protocol runs when it is
/// dropped.
pub struct Handle<'t, V: Copy> {
    key: NonZeroU64,
    access: Access<'t, V>,
}

/// What a [`Handle`] learned and holds after the acquire protocol.
enum Access<'t, V> {
    /// The key is absent and was not created.
    Absent,
    /// Found in an embedded cell without locking.
    LockFree(&'t Cell<V>),
    /// Found in the overflow array under a shared lock.
    Shared {
        cell: &'t Cell<V>,
        reader: Reader<'t, V>,
    },
    /// Found under the exclusive lock; the entry is removed when the handle drops.
    Removal {
        cell: &'t Cell<V>,
        position: Position,
        writer: Writer<'t, V>,
    },
    /// Reserved under the exclusive lock; the entry is published when the handle drops.
    Created {
        cell: &'t Cell<V>,
        position: Position,
        writer: Writer<'t, V>,
    },
}

/// The purpose of a [`Handle`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Intent {
    ReadOrCreate,
    Read,
    Remove,
}

impl<V: Copy + Default, const SIZE: usize> UnionTable<V, SIZE> {
    /// Creates an empty [`UnionTable`], allocating all of its buckets.
    ///
    /// # Panics
    ///
    /// Panics if `SIZE` is `0`.
    ///
    /// # Examples
    ///
    /// ```
    /// use union_table::UnionTable;
    ///
    /// let table: UnionTable<u32, 11> = UnionTable::new();
    /// assert!(table.is_empty());
    /// ```
    pub fn new() -> Self {
        assert_ne!(SIZE, 0, "a table needs at least one bucket");
        Self {
            buckets: (0..SIZE).map(|_| Bucket::new()).collect(),
        }
    }

    /// Acquires a [`Handle`] to the entry for `key`, creating the entry if it is absent.
    ///
    /// If [`Handle::created`] returns `true`, the calling thread has exclusive access to the
    /// entry and is expected to initialize the value; the entry becomes visible to other threads
    /// when the handle is dropped. Otherwise the handle only grants read access.
    ///
    /// # Panics
    ///
    /// Panics if `key` is `0`.
    ///
    /// # Examples
    ///
    /// ```
    /// use union_table::UnionTable;
    ///
    /// let table: UnionTable<u32, 11> = UnionTable::new();
    ///
    /// let mut handle = table.acquire(17);
    /// assert!(handle.created());
    /// *handle = 7;
    /// drop(handle);
    ///
    /// let handle = table.acquire(17);
    /// assert!(handle.exists() && !handle.created());
    /// assert_eq!(*handle, 7);
    /// ```
    #[inline]
    pub fn acquire(&self, key: u64) -> Handle<'_, V> {
        self.handle(key, Intent::ReadOrCreate)
    }

    /// Acquires a read-only [`Handle`] to the entry for `key` without ever creating it.
    ///
    /// # Panics
    ///
    /// Panics if `key` is `0`.
    ///
    /// # Examples
    ///
    /// ```
    /// use union_table::UnionTable;
    ///
    /// let table: UnionTable<u32, 11> = UnionTable::new();
    /// assert!(!table.lookup(3).exists());
    /// assert!(table.is_empty());
    /// ```
    #[inline]
    pub fn lookup(&self, key: u64) -> Handle<'_, V> {
        self.handle(key, Intent::Read)
    }

    /// Acquires a [`Handle`] that removes the entry for `key` when dropped.
    ///
    /// The handle has exclusive access to the entry until it is dropped. If
    /// [`Handle::exists`] returns `false`, the key was absent and nothing happens.
    ///
    /// # Safety
    ///
    /// No other [`Handle`] for `key` may be alive or being acquired while the returned handle
    /// exists: a reader that found the key in an embedded cell holds no lock and would observe
    /// the cell being vacated and reused.
    ///
    /// # Panics
    ///
    /// Panics if `key` is `0`.
    ///
    /// # Examples
    ///
    /// ```
    /// use union_table::UnionTable;
    ///
    /// let table: UnionTable<u32, 11> = UnionTable::new();
    /// *table.acquire(5) = 9;
    ///
    /// let handle = unsafe { table.acquire_for_removal(5) };
    /// assert_eq!(*handle, 9);
    /// drop(handle);
    /// assert!(!table.contains(5));
    /// ```
    #[inline]
    pub unsafe fn acquire_for_removal(&self, key: u64) -> Handle<'_, V> {
        self.handle(key, Intent::Remove)
    }

    /// Returns a copy of the value for `key`.
    ///
    /// # Examples
    ///
    /// ```
    /// use union_table::UnionTable;
    ///
    /// let table: UnionTable<u32, 11> = UnionTable::new();
    /// assert_eq!(table.get(1), None);
    /// *table.acquire(1) = 2;
    /// assert_eq!(table.get(1), Some(2));
    /// ```
    #[inline]
    pub fn get(&self, key: u64) -> Option<V> {
        self.read(key, |value| *value)
    }

    /// Reads the value for `key` with a closure.
    ///
    /// # Examples
    ///
    /// ```
    /// use union_table::UnionTable;
    ///
    /// let table: UnionTable<(u32, u32), 11> = UnionTable::new();
    /// *table.acquire(1) = (3, 4);
    /// assert_eq!(table.read(1, |(a, b)| a + b), Some(7));
    /// ```
    #[inline]
    pub fn read<R, F: FnOnce(&V) -> R>(&self, key: u64, reader: F) -> Option<R> {
        self.lookup(key).get().map(reader)
    }

    /// Returns `true` if the table holds an entry for `key`.
    #[inline]
    pub fn contains(&self, key: u64) -> bool {
        self.lookup(key).exists()
    }

    /// Returns the value for `key`, inserting the one returned by `constructor` if the key is
    /// absent.
    ///
    /// `constructor` runs at most once across all threads racing on the same absent key. If it
    /// panics, the key stays absent.
    ///
    /// # Examples
    ///
    /// ```
    /// use union_table::UnionTable;
    ///
    /// let table: UnionTable<u32, 11> = UnionTable::new();
    /// assert_eq!(table.get_or_insert_with(8, || 1), 1);
    /// assert_eq!(table.get_or_insert_with(8, || 2), 1);
    /// ```
    #[inline]
    pub fn get_or_insert_with<F: FnOnce() -> V>(&self, key: u64, constructor: F) -> V {
        let mut handle = self.acquire(key);
        if handle.created() {
            *handle = constructor();
        }
        *handle
    }

    /// Removes the entry for `key` and returns its value.
    ///
    /// # Safety
    ///
    /// The same contract as [`UnionTable::acquire_for_removal`] applies.
    ///
    /// # Examples
    ///
    /// ```
    /// use union_table::UnionTable;
    ///
    /// let table: UnionTable<u32, 11> = UnionTable::new();
    /// *table.acquire(4) = 1;
    /// assert_eq!(unsafe { table.remove(4) }, Some(1));
    /// assert_eq!(unsafe { table.remove(4) }, None);
    /// ```
    #[inline]
    pub unsafe fn remove(&self, key: u64) -> Option<V> {
        self.acquire_for_removal(key).get().copied()
    }

    /// Returns the number of entries.
    ///
    /// Every bucket is visited under its shared lock, one after another, so the result is only
    /// exact if no other thread modifies the table meanwhile.
    ///
    /// # Examples
    ///
    /// ```
    /// use union_table::UnionTable;
    ///
    /// let table: UnionTable<u32, 11> = UnionTable::new();
    /// for key in 1..=20 {
    ///     *table.acquire(key) = 0;
    /// }
    /// assert_eq!(table.len(), 20);
    /// ```
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.read().len()).sum()
    }

    /// Returns `true` if the table holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, key: u64, intent: Intent) -> Handle<'_, V> {
        let Some(key) = NonZeroU64::new(key) else {
            panic!("key 0 is reserved for vacant cells");
        };
        let bucket = &self.buckets[Self::bucket_index(key.get())];
        Handle {
            key,
            access: Access::acquire(bucket, key, intent),
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self, index: usize) -> BucketSnapshot {
        self.buckets[index].read().snapshot()
    }

    #[cfg(all(test, not(feature = "loom")))]
    pub(crate) fn is_locked(&self, index: usize) -> bool {
        self.buckets[index].is_locked()
    }
}

impl<V, const SIZE: usize> UnionTable<V, SIZE> {
    /// Returns the index of the bucket `key` belongs to.
    ///
    /// The key is mixed with a fixed shift-add-xor avalanche and reduced modulo `SIZE`; there is
    /// no seed, so the mapping is stable across tables and runs.
    ///
    /// # Examples
    ///
    /// ```
    /// use union_table::UnionTable;
    ///
    /// let index = UnionTable::<u32, 11>::bucket_index(42);
    /// assert!(index < 11);
    /// assert_eq!(index, UnionTable::<u64, 11>::bucket_index(42));
    /// ```
    #[inline]
    pub const fn bucket_index(key: u64) -> usize {
        let mut hash = key.wrapping_add(key << 10);
        hash ^= hash >> 6;
        (hash % SIZE as u64) as usize
    }
}

impl<V: Copy + Default, const SIZE: usize> Default for UnionTable<V, SIZE> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Copy + Default, const SIZE: usize> Debug for UnionTable<V, SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnionTable")
            .field("size", &SIZE)
            .field("len", &self.len())
            .finish()
    }
}

impl<'t, V: Copy + Default> Access<'t, V> {
    /// Runs the acquire protocol on `bucket`.
    fn acquire(bucket: &'t Bucket<V>, key: NonZeroU64, intent: Intent) -> Self {
        loop {
            // A remover must not race the lock-free path, so it goes straight to the lock.
            if intent != Intent::Remove {
                if let Some(cell) = bucket.search_lock_free(key) {
                    return Access::LockFree(cell);
                }
                if bucket.has_overflow() {
                    let reader = bucket.read();
                    if let Some((_, cell)) = reader.search_overflow(key) {
                        return Access::Shared { cell, reader };
                    }
                }
            }

            let writer = bucket.write();
            if let Some((position, cell)) = writer.search(key) {
                if intent == Intent::Remove {
                    return Access::Removal {
                        cell,
                        position,
                        writer,
                    };
                }
                // Published by another thread after the optimistic scan.
                drop(writer);
                trace!(key = key.get(), "lost the race to a concurrent insert, retrying");
                continue;
            }

            if intent != Intent::ReadOrCreate {
                return Access::Absent;
            }
            let (position, cell) = writer.reserve();
            return Access::Created {
                cell,
                position,
                writer,
            };
        }
    }
}

impl<'t, V: Copy> Handle<'t, V> {
    /// Returns the key the [`Handle`] is bound to.
    #[inline]
    pub fn key(&self) -> u64 {
        self.key.get()
    }

    /// Returns `true` if the [`Handle`] references an entry, either found or created.
    #[inline]
    pub fn exists(&self) -> bool {
        !matches!(self.access, Access::Absent)
    }

    /// Returns `true` if the entry was created by this [`Handle`].
    ///
    /// The value of a created entry is `V::default()` until the caller writes it. If the thread
    /// panics while the [`Handle`] is alive, the entry is discarded instead of published.
    #[inline]
    pub fn created(&self) -> bool {
        matches!(self.access, Access::Created { .. })
    }

    /// Returns `true` if the [`Handle`] will remove the entry when dropped.
    #[inline]
    pub fn removing(&self) -> bool {
        matches!(self.access, Access::Removal { .. })
    }

    /// Returns a reference to the value, or `None` if the entry does not exist.
    #[inline]
    pub fn get(&self) -> Option<&V> {
        self.cell().map(|cell| unsafe { cell.value() })
    }

    /// Returns a mutable reference to the value if the [`Handle`] has exclusive access, which
    /// is the case for created entries and entries being removed.
    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut V> {
        match &self.access {
            Access::Created { cell, .. } | Access::Removal { cell, .. } => {
                Some(unsafe { cell.value_mut() })
            }
            _ => None,
        }
    }

    fn cell(&self) -> Option<&'t Cell<V>> {
        match &self.access {
            Access::Absent => None,
            Access::LockFree(cell)
            | Access::Shared { cell, .. }
            | Access::Removal { cell, .. }
            | Access::Created { cell, .. } => Some(*cell),
        }
    }
}

impl<V: Copy> Deref for Handle<'_, V> {
    type Target = V;

    /// # Panics
    ///
    /// Panics if the entry does not exist.
    #[inline]
    fn deref(&self) -> &Self::Target {
        match self.get() {
            Some(value) => value,
            None => panic!("no entry for key {}", self.key),
        }
    }
}

impl<V: Copy> DerefMut for Handle<'_, V> {
    /// # Panics
    ///
    /// Panics if the [`Handle`] has no exclusive access to an entry.
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        let key = self.key;
        match self.get_mut() {
            Some(value) => value,
            None => panic!("no exclusive access to the entry for key {key}"),
        }
    }
}

impl<V: Copy> Debug for Handle<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.key)
            .field("exists", &self.exists())
            .field("created", &self.created())
            .field("removing", &self.removing())
            .finish()
    }
}

impl<V: Copy> Drop for Handle<'_, V> {
    /// Runs the release protocol.
    fn drop(&mut self) {
        match mem::replace(&mut self.access, Access::Absent) {
            Access::Absent | Access::LockFree(_) => (),
            Access::Shared { cell, reader } => {
                debug_assert!(cell.holds(self.key, Relaxed));
                drop(reader);
            }
            Access::Created {
                cell,
                position,
                writer,
            } => {
                if thread::panicking() {
                    // The value may never have been written.
                    writer.cancel(position, cell);
                } else {
                    assert_eq!(
                        cell.slot(Relaxed),
                        Slot::Vacant,
                        "a reserved cell was published by someone else"
                    );
                    cell.publish(self.key);
                }
                drop(writer);
            }
            Access::Removal {
                cell,
                position,
                writer,
            } => {
                writer.remove(position, cell, self.key);
                drop(writer);
            }
        }
    }
}
