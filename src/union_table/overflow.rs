//! [`OverflowArray`] holds the entries that do not fit in the embedded cells of a bucket.

use std::mem::size_of;
use std::num::NonZeroU64;
use std::sync::atomic::Ordering::{self, Relaxed};

use super::bucket::{Cell, Slot};
use crate::maybe_std::AtomicUsize;

/// The number of bytes the first overflow array of a bucket is sized for.
pub(crate) const OVERFLOW_INITIAL_BYTES: usize = 64;

/// [`OverflowArray`] is a densely packed array of cells.
///
/// Live entries always occupy `[0, len)`. The array is only ever mutated or replaced while the
/// owning bucket is exclusively locked, and it is never shrunk.
pub(crate) struct OverflowArray<V> {
    len: AtomicUsize,
    cells: Box<[Cell<V>]>,
}

impl<V: Copy + Default> OverflowArray<V> {
    /// Creates the first [`OverflowArray`] of a bucket.
    pub(crate) fn new() -> Self {
        Self::with_capacity(Self::initial_capacity())
    }

    /// The capacity of a freshly allocated [`OverflowArray`].
    pub(crate) fn initial_capacity() -> usize {
        (OVERFLOW_INITIAL_BYTES / size_of::<Cell<V>>()).max(1)
    }

    /// Returns a copy of `self` with twice the capacity.
    ///
    /// # Safety
    ///
    /// The owning bucket must be exclusively locked.
    pub(crate) unsafe fn grow(&self) -> Self {
        let grown = Self::with_capacity(self.capacity() * 2);
        let len = self.len();
        for (target, source) in grown.cells.iter().zip(self.cells[..len].iter()) {
            target.copy_from(source);
        }
        grown.len.store(len, Relaxed);
        grown
    }

    /// Appends a vacant cell to the live range and returns it together with its index.
    ///
    /// # Safety
    ///
    /// The owning bucket must be exclusively locked.
    ///
    /// # Panics
    ///
    /// Panics if the array is full or the slot past the live range is still occupied.
    pub(crate) unsafe fn push(&self) -> (usize, &Cell<V>) {
        let index = self.len();
        assert!(index < self.capacity(), "overflow array is full");
        let cell = &self.cells[index];
        assert_eq!(
            cell.slot(Relaxed),
            Slot::Vacant,
            "overflow slot past the live range is occupied"
        );
        self.len.store(index + 1, Relaxed);
        (index, cell)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            len: AtomicUsize::new(0),
            cells: (0..capacity).map(|_| Cell::new()).collect(),
        }
    }
}

impl<V> OverflowArray<V> {
    /// The number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Relaxed)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Searches the live range for `key`.
    pub(crate) fn search(&self, key: NonZeroU64, order: Ordering) -> Option<(usize, &Cell<V>)> {
        self.cells[..self.len()]
            .iter()
            .enumerate()
            .find(|(_, cell)| cell.holds(key, order))
    }

    /// Shrinks the live range by one and returns the cell that fell out of it.
    ///
    /// The returned cell keeps its contents; the caller either moves it elsewhere or has
    /// already vacated it.
    ///
    /// # Safety
    ///
    /// The owning bucket must be exclusively locked.
    pub(crate) unsafe fn pop(&self) -> Option<(usize, &Cell<V>)> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        self.len.store(len - 1, Relaxed);
        Some((len - 1, &self.cells[len - 1]))
    }

    /// Iterates over the live cells.
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Cell<V>> {
        self.cells[..self.len()].iter()
    }
}
