//! Atomic and cell types that are replaced with their [`loom`](https://crates.io/crates/loom)
//! counterparts when model checking.

#[cfg(feature = "loom")]
pub(crate) use loom::cell::UnsafeCell;
#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};
#[cfg(feature = "loom")]
pub(crate) use loom::thread::yield_now;

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};

/// [`UnsafeCell`] exposes the closure-based access of `loom::cell::UnsafeCell` on top of
/// [`std::cell::UnsafeCell`].
#[cfg(not(feature = "loom"))]
pub(crate) struct UnsafeCell<T>(std::cell::UnsafeCell<T>);

#[cfg(not(feature = "loom"))]
impl<T> UnsafeCell<T> {
    #[inline]
    pub(crate) const fn new(data: T) -> Self {
        Self(std::cell::UnsafeCell::new(data))
    }

    #[inline]
    pub(crate) fn with<R, F: FnOnce(*const T) -> R>(&self, f: F) -> R {
        f(self.0.get())
    }

    #[inline]
    pub(crate) fn with_mut<R, F: FnOnce(*mut T) -> R>(&self, f: F) -> R {
        f(self.0.get())
    }
}
