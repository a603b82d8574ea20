//! [`Bucket`] is a fixed-size array of cells with a lock-protected overflow array.

use std::num::NonZeroU64;
use std::ptr;
use std::sync::atomic::Ordering::{self, Acquire, Relaxed, Release};

use tracing::debug;

use super::lock::Lock;
use super::overflow::OverflowArray;
use crate::maybe_std::{AtomicPtr, AtomicU64, UnsafeCell};

/// The number of cells embedded in every bucket.
///
/// Embedded cells are read without locking; entries beyond them spill into the overflow array
/// of the bucket.
pub const BUCKET_LEN: usize = 3;

/// [`Cell`] is a key-value pair whose key doubles as the publication flag.
///
/// The value of a cell is readable by other threads only after its key has been stored with
/// `Release` and loaded with `Acquire`.
pub(crate) struct Cell<V> {
    key: AtomicU64,
    value: UnsafeCell<V>,
}

/// The decoded state of the key word of a [`Cell`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Slot {
    Vacant,
    Occupied(NonZeroU64),
}

/// Where a [`Cell`] lives inside a [`Bucket`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Position {
    Embedded(usize),
    Overflow(usize),
}

/// [`Bucket`] is the unit of locking of the table.
///
/// The embedded cells are scanned without the lock; the overflow array is only reachable while
/// the lock is held.
pub(crate) struct Bucket<V> {
    lock: Lock,
    overflow: AtomicPtr<OverflowArray<V>>,
    cells: [Cell<V>; BUCKET_LEN],
}

/// [`Reader`] holds a shared lock on a [`Bucket`].
pub(crate) struct Reader<'g, V> {
    bucket: &'g Bucket<V>,
}

/// [`Writer`] holds an exclusive lock on a [`Bucket`].
pub(crate) struct Writer<'g, V> {
    bucket: &'g Bucket<V>,
}

impl<V: Default> Cell<V> {
    pub(crate) fn new() -> Self {
        Self {
            key: AtomicU64::new(0),
            value: UnsafeCell::new(V::default()),
        }
    }

    /// Resets the value of a vacant cell before it is handed out for creation.
    ///
    /// # Safety
    ///
    /// The owning bucket must be exclusively locked and the cell vacant.
    unsafe fn reset(&self) {
        self.value.with_mut(|value| *value = V::default());
    }
}

impl<V: Copy> Cell<V> {
    /// Copies `source` into `self` without publishing anything.
    ///
    /// # Safety
    ///
    /// `self` must not be reachable by other threads, and the bucket owning `source` must be
    /// exclusively locked.
    pub(crate) unsafe fn copy_from(&self, source: &Cell<V>) {
        let value = source.value.with(|value| *value);
        self.value.with_mut(|target| *target = value);
        self.key.store(source.key.load(Relaxed), Relaxed);
    }

    /// Moves `source` into this vacant cell: the value is written first, then the key is
    /// published, then `source` is vacated.
    ///
    /// # Safety
    ///
    /// The owning bucket must be exclusively locked.
    unsafe fn take_from(&self, source: &Cell<V>) {
        let value = source.value.with(|value| *value);
        self.value.with_mut(|target| *target = value);
        self.key.store(source.key.load(Relaxed), Release);
        source.key.store(0, Release);
    }
}

impl<V> Cell<V> {
    /// Loads the key word and decodes it.
    pub(crate) fn slot(&self, order: Ordering) -> Slot {
        NonZeroU64::new(self.key.load(order)).map_or(Slot::Vacant, Slot::Occupied)
    }

    pub(crate) fn holds(&self, key: NonZeroU64, order: Ordering) -> bool {
        self.slot(order) == Slot::Occupied(key)
    }

    /// Makes the cell and its value visible to lock-free readers.
    pub(crate) fn publish(&self, key: NonZeroU64) {
        self.key.store(key.get(), Release);
    }

    fn vacate(&self) {
        self.key.store(0, Release);
    }

    /// Returns a reference to the value.
    ///
    /// # Safety
    ///
    /// No other thread may be writing the value: the key has been observed with `Acquire`, or
    /// the bucket is locked.
    pub(crate) unsafe fn value(&self) -> &V {
        self.value.with(|value| &*value)
    }

    /// Returns a mutable reference to the value.
    ///
    /// # Safety
    ///
    /// The owning bucket must be exclusively locked by the caller, and no other reference to
    /// the value may be alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn value_mut(&self) -> &mut V {
        self.value.with_mut(|value| &mut *value)
    }
}

unsafe impl<V: Send + Sync> Sync for Cell<V> {}

impl<V: Copy + Default> Bucket<V> {
    pub(crate) fn new() -> Self {
        Self {
            lock: Lock::new(),
            overflow: AtomicPtr::new(ptr::null_mut()),
            cells: std::array::from_fn(|_| Cell::new()),
        }
    }
}

impl<V> Bucket<V> {
    /// Searches the embedded cells for `key` without locking.
    #[inline]
    pub(crate) fn search_lock_free(&self, key: NonZeroU64) -> Option<&Cell<V>> {
        self.cells.iter().find(|cell| cell.holds(key, Acquire))
    }

    /// Returns `true` if an overflow array has ever been allocated.
    ///
    /// This is a hint: the array is only examined after the lock is acquired.
    #[inline]
    pub(crate) fn has_overflow(&self) -> bool {
        !self.overflow.load(Relaxed).is_null()
    }

    /// Locks the [`Bucket`] in shared mode.
    pub(crate) fn read(&self) -> Reader<'_, V> {
        self.lock.lock_shared();
        Reader { bucket: self }
    }

    /// Locks the [`Bucket`] exclusively.
    pub(crate) fn write(&self) -> Writer<'_, V> {
        self.lock.lock_exclusive();
        Writer { bucket: self }
    }

    /// The overflow array as seen by a lock owner.
    ///
    /// The reference is valid until the array is replaced, which requires the exclusive lock.
    fn overflow<'g>(&self) -> Option<&'g OverflowArray<V>> {
        unsafe { self.overflow.load(Acquire).as_ref() }
    }

    #[cfg(all(test, not(feature = "loom")))]
    pub(crate) fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

impl<V> Drop for Bucket<V> {
    fn drop(&mut self) {
        let overflow = self.overflow.load(Relaxed);
        if !overflow.is_null() {
            drop(unsafe { Box::from_raw(overflow) });
        }
    }
}

impl<'g, V> Reader<'g, V> {
    /// Searches the overflow array for `key`.
    pub(crate) fn search_overflow(&self, key: NonZeroU64) -> Option<(usize, &'g Cell<V>)> {
        self.bucket.overflow()?.search(key, Relaxed)
    }

    /// The number of live entries in the [`Bucket`].
    pub(crate) fn len(&self) -> usize {
        let embedded = self
            .bucket
            .cells
            .iter()
            .filter(|cell| cell.slot(Acquire) != Slot::Vacant)
            .count();
        embedded + self.bucket.overflow().map_or(0, OverflowArray::len)
    }

    /// Captures the raw layout of the [`Bucket`].
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> BucketSnapshot {
        let raw = |cell: &Cell<V>| match cell.slot(Acquire) {
            Slot::Vacant => 0,
            Slot::Occupied(key) => key.get(),
        };
        let overflow = self.bucket.overflow();
        BucketSnapshot {
            embedded: self.bucket.cells.iter().map(raw).collect(),
            overflow: overflow.map_or_else(Vec::new, |array| array.iter().map(raw).collect()),
            overflow_capacity: overflow.map_or(0, OverflowArray::capacity),
        }
    }
}

impl<V> Drop for Reader<'_, V> {
    #[inline]
    fn drop(&mut self) {
        self.bucket.lock.unlock_shared();
    }
}

impl<'g, V> Writer<'g, V> {
    /// Searches the embedded cells and then the overflow array for `key`.
    pub(crate) fn search(&self, key: NonZeroU64) -> Option<(Position, &'g Cell<V>)> {
        let bucket: &'g Bucket<V> = self.bucket;
        if let Some((index, cell)) = bucket
            .cells
            .iter()
            .enumerate()
            .find(|(_, cell)| cell.holds(key, Relaxed))
        {
            return Some((Position::Embedded(index), cell));
        }
        bucket
            .overflow()?
            .search(key, Relaxed)
            .map(|(index, cell)| (Position::Overflow(index), cell))
    }

    /// Gives back a cell returned by [`Writer::reserve`] that was never published.
    ///
    /// An embedded cell simply stays vacant; an overflow cell is dropped from the live range.
    pub(crate) fn cancel(&self, position: Position, cell: &'g Cell<V>) {
        debug_assert_eq!(cell.slot(Relaxed), Slot::Vacant);
        if let (Position::Overflow(index), Some(array)) = (position, self.bucket.overflow()) {
            let popped = unsafe { array.pop() };
            debug_assert_eq!(popped.map(|(last_index, _)| last_index), Some(index));
        }
    }
}

impl<'g, V: Copy + Default> Writer<'g, V> {
    /// Reserves a vacant cell for a new entry, preferring the embedded cells.
    ///
    /// The value of the returned cell is reset to `V::default()`. The cell stays unpublished
    /// until [`Cell::publish`] is called.
    pub(crate) fn reserve(&self) -> (Position, &'g Cell<V>) {
        let bucket: &'g Bucket<V> = self.bucket;
        if let Some((index, cell)) = bucket
            .cells
            .iter()
            .enumerate()
            .find(|(_, cell)| cell.slot(Relaxed) == Slot::Vacant)
        {
            unsafe { cell.reset() };
            return (Position::Embedded(index), cell);
        }

        let array = self.overflow_with_room();
        let (index, cell) = unsafe { array.push() };
        unsafe { cell.reset() };
        (Position::Overflow(index), cell)
    }

    /// Returns an overflow array with at least one free slot, allocating or growing it.
    ///
    /// A replaced array is freed only after the new one is installed; both happen under the
    /// exclusive lock, so no reader can hold a reference to the old array.
    fn overflow_with_room(&self) -> &'g OverflowArray<V> {
        let current = self.bucket.overflow.load(Relaxed);
        if current.is_null() {
            let array = Box::into_raw(Box::new(OverflowArray::new()));
            self.bucket.overflow.store(array, Release);
            let array = unsafe { &*array };
            debug!(capacity = array.capacity(), "allocated an overflow array");
            return array;
        }

        let array = unsafe { &*current };
        if !array.is_full() {
            return array;
        }
        let grown = Box::into_raw(Box::new(unsafe { array.grow() }));
        self.bucket.overflow.store(grown, Release);
        let grown = unsafe { &*grown };
        debug!(
            old_capacity = array.capacity(),
            new_capacity = grown.capacity(),
            "grew an overflow array"
        );
        drop(unsafe { Box::from_raw(current) });
        grown
    }
}

impl<'g, V: Copy> Writer<'g, V> {
    /// Vacates the cell at `position` and keeps the [`Bucket`] compact.
    ///
    /// A cell freed in the embedded array is refilled with the last overflow entry, and a hole
    /// in the overflow array is filled with its last entry. The overflow array is retained even
    /// if it becomes empty.
    ///
    /// # Panics
    ///
    /// Panics if `cell` does not hold `key`.
    pub(crate) fn remove(&self, position: Position, cell: &'g Cell<V>, key: NonZeroU64) {
        assert!(
            cell.holds(key, Relaxed),
            "the cell being removed no longer holds its key"
        );
        cell.vacate();

        let Some(array) = self.bucket.overflow() else {
            debug_assert!(matches!(position, Position::Embedded(_)));
            return;
        };
        match position {
            Position::Embedded(_) => {
                if let Some((_, last)) = unsafe { array.pop() } {
                    unsafe { cell.take_from(last) };
                }
            }
            Position::Overflow(index) => {
                if let Some((last_index, last)) = unsafe { array.pop() } {
                    if last_index != index {
                        unsafe { cell.take_from(last) };
                    }
                }
            }
        }
    }
}

impl<V> Drop for Writer<'_, V> {
    #[inline]
    fn drop(&mut self) {
        self.bucket.lock.unlock_exclusive();
    }
}

/// Raw layout of a [`Bucket`]: embedded keys with `0` for vacant cells, the keys in the live
/// range of the overflow array, and the overflow capacity.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct BucketSnapshot {
    pub(crate) embedded: Vec<u64>,
    pub(crate) overflow: Vec<u64>,
    pub(crate) overflow_capacity: usize,
}

#[cfg(test)]
impl BucketSnapshot {
    pub(crate) fn live(&self) -> usize {
        self.embedded.iter().filter(|k| **k != 0).count() + self.overflow.len()
    }
}
