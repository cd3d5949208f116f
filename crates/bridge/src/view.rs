//! Zero-copy parameter views over shared buffers.
//!
//! Array parameters are handed to receivers as windows into the backing
//! queue buffer rather than copies; the window stays addressable for as long
//! as the view is held (it keeps the buffer alive), but its *contents* are
//! only guaranteed until the queue cursor is next rotated or reset. Callers
//! needing retained data must copy.

use shm::{Elem, SharedBuffer};
use std::marker::PhantomData;
use std::ops::Index;
use std::sync::Arc;

/// Read-only window of `len` elements into a shared queue buffer.
#[derive(Clone, Debug)]
pub struct ArrayView<T: Elem> {
    buffer: Arc<SharedBuffer>,
    first: usize,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T: Elem> ArrayView<T> {
    pub(crate) fn new(buffer: Arc<SharedBuffer>, first: usize, len: usize) -> Self {
        debug_assert!(buffer.check_kind::<T>().is_ok());
        debug_assert!(first + len <= buffer.len());
        Self {
            buffer,
            first,
            len,
            _elem: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the element at `idx`.
    pub fn get(&self, idx: usize) -> T {
        assert!(idx < self.len, "index {idx} out of range for array view");
        self.buffer.get::<T>(self.first + idx)
    }

    /// Borrows the whole window as a slice.
    pub fn as_slice(&self) -> &[T] {
        self.buffer.slice::<T>(self.first, self.len)
    }

    /// Copies the window into `dst`, which must have the same length.
    pub fn copy_to(&self, dst: &mut [T]) {
        assert_eq!(dst.len(), self.len, "destination length mismatch");
        dst.copy_from_slice(self.as_slice());
    }

    /// Copies the window into a freshly allocated `Vec`.
    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.as_slice().iter().copied()
    }
}

impl<T: Elem + PartialEq> PartialEq for ArrayView<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Elem> Index<usize> for ArrayView<T> {
    type Output = T;

    fn index(&self, idx: usize) -> &T {
        &self.as_slice()[idx]
    }
}

/// Writable window reserved by the producer for in-place array filling.
///
/// Obtained from the message builder *before* being filled: the reservation
/// registers the parameter, the caller then writes elements directly into the
/// queue buffer without staging a temporary array.
#[derive(Debug)]
pub struct ArrayFill<T: Elem> {
    buffer: Arc<SharedBuffer>,
    first: usize,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T: Elem> ArrayFill<T> {
    pub(crate) fn new(buffer: Arc<SharedBuffer>, first: usize, len: usize) -> Self {
        debug_assert!(buffer.check_kind::<T>().is_ok());
        debug_assert!(first + len <= buffer.len());
        Self {
            buffer,
            first,
            len,
            _elem: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes `value` at `idx` of the reserved window.
    pub fn set(&self, idx: usize, value: T) {
        assert!(idx < self.len, "index {idx} out of range for array fill");
        self.buffer.set::<T>(self.first + idx, value);
    }

    /// Fills the window from `src`, which must have the same length.
    pub fn fill_from(&self, src: &[T]) {
        assert_eq!(src.len(), self.len, "source length mismatch");
        self.buffer.copy_from::<T>(self.first, src);
    }
}
