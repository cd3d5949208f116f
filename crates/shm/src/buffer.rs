//! Typed fixed-length shared buffers.
//!
//! A [`SharedBuffer`] is one pinned block of a single primitive element kind,
//! identified by the integer id the provider issued for it. Both halves of
//! the bridge address the same block through `Arc` handles: the producer
//! writes, the engine reads, never concurrently (the delivery pass runs while
//! the producer is quiescent). That cooperative discipline is what makes the
//! `&self` write path below sound.

use crate::{PinnedRegion, ShmError, ShmResult};
use std::ptr::NonNull;

/// Element kinds a shared buffer can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElemKind {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl ElemKind {
    /// Size in bytes of one element of this kind.
    pub fn size(self) -> usize {
        match self {
            ElemKind::U8 => 1,
            ElemKind::I32 | ElemKind::F32 => 4,
            ElemKind::I64 | ElemKind::F64 => 8,
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Primitive element types storable in a shared buffer.
///
/// Sealed: the wire protocol enumerates its element kinds, user types cannot
/// extend the set.
pub trait Elem: sealed::Sealed + Copy + Default + 'static {
    /// The runtime kind tag matching `Self`.
    const KIND: ElemKind;
}

macro_rules! impl_elem {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Elem for $ty {
                const KIND: ElemKind = $kind;
            }
        )*
    };
}

impl_elem! {
    u8 => ElemKind::U8,
    i32 => ElemKind::I32,
    i64 => ElemKind::I64,
    f32 => ElemKind::F32,
    f64 => ElemKind::F64,
}

/// One pinned, fixed-length, typed shared block.
#[derive(Debug)]
pub struct SharedBuffer {
    id: i32,
    kind: ElemKind,
    len: usize,
    base: NonNull<u8>,
    _region: PinnedRegion,
}

impl SharedBuffer {
    /// Allocates a zeroed buffer of `len` elements of `kind` under `id`.
    pub fn new(id: i32, kind: ElemKind, len: usize) -> ShmResult<Self> {
        if len == 0 || len > i32::MAX as usize {
            return Err(ShmError::InvalidLength { requested: len });
        }

        let bytes = len
            .checked_mul(kind.size())
            .ok_or(ShmError::InvalidLength { requested: len })?;
        let region = PinnedRegion::new(bytes, kind.size().max(8))?;
        let base = region.base();

        Ok(Self {
            id,
            kind,
            len,
            base,
            _region: region,
        })
    }

    /// Provider-issued id of this buffer.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Element kind this buffer was allocated with.
    pub fn kind(&self) -> ElemKind {
        self.kind
    }

    /// Number of elements in the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the buffer holds zero elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fails unless the buffer carries `T` elements.
    pub fn check_kind<T: Elem>(&self) -> ShmResult<()> {
        if self.kind == T::KIND {
            Ok(())
        } else {
            Err(ShmError::KindMismatch {
                id: self.id,
                expected: T::KIND,
                actual: self.kind,
            })
        }
    }

    /// Reads the element at `idx`.
    ///
    /// # Panics
    ///
    /// Panics on a kind mismatch or an out-of-range index. Either indicates a
    /// protocol bug between producer and engine, which is fatal by contract.
    pub fn get<T: Elem>(&self, idx: usize) -> T {
        assert_eq!(self.kind, T::KIND, "buffer {} element kind mismatch", self.id);
        assert!(idx < self.len, "index {idx} out of range for buffer {}", self.id);
        unsafe {
            // SAFETY: the base pointer is pinned for the buffer lifetime, the
            // index was checked above, and the element type matches the kind
            // the region was sized for.
            (self.base.as_ptr() as *const T).add(idx).read()
        }
    }

    /// Writes `value` at `idx`.
    ///
    /// Takes `&self`: both bridge halves hold the buffer behind `Arc`, and
    /// exclusive access is a cross-boundary contract (one writer per side,
    /// never during a delivery pass), not something the borrow checker can
    /// see.
    ///
    /// # Panics
    ///
    /// Same conditions as [`SharedBuffer::get`].
    pub fn set<T: Elem>(&self, idx: usize, value: T) {
        assert_eq!(self.kind, T::KIND, "buffer {} element kind mismatch", self.id);
        assert!(idx < self.len, "index {idx} out of range for buffer {}", self.id);
        unsafe {
            // SAFETY: same bounds/kind reasoning as `get`; aliasing writes are
            // excluded by the single-writer discipline documented above.
            (self.base.as_ptr() as *mut T).add(idx).write(value);
        }
    }

    /// Borrows `count` elements starting at `first` as a slice.
    ///
    /// The slice observes whatever the producer has committed there; callers
    /// needing data past the next cursor reset must copy.
    pub fn slice<T: Elem>(&self, first: usize, count: usize) -> &[T] {
        assert_eq!(self.kind, T::KIND, "buffer {} element kind mismatch", self.id);
        assert!(
            first.checked_add(count).is_some_and(|end| end <= self.len),
            "range {first}+{count} out of range for buffer {}",
            self.id
        );
        unsafe {
            // SAFETY: range checked above; no mutable borrow can exist because
            // the buffer never hands out Rust mutable references.
            std::slice::from_raw_parts((self.base.as_ptr() as *const T).add(first), count)
        }
    }

    /// Copies `src` into the buffer starting at `first`.
    pub fn copy_from<T: Elem>(&self, first: usize, src: &[T]) {
        assert_eq!(self.kind, T::KIND, "buffer {} element kind mismatch", self.id);
        assert!(
            first.checked_add(src.len()).is_some_and(|end| end <= self.len),
            "range {first}+{} out of range for buffer {}",
            src.len(),
            self.id
        );
        unsafe {
            // SAFETY: range checked above, source and destination regions are
            // disjoint allocations.
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                (self.base.as_ptr() as *mut T).add(first),
                src.len(),
            );
        }
    }
}

// SAFETY: see the module docs; mutation is externally synchronised by the
// bridge's one-writer-per-side, drained-to-empty-per-tick protocol.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_typed_elements() {
        let buf = SharedBuffer::new(7, ElemKind::I32, 16).expect("allocate buffer");
        assert_eq!(buf.id(), 7);
        assert_eq!(buf.kind(), ElemKind::I32);
        assert_eq!(buf.len(), 16);

        buf.set::<i32>(0, -123);
        buf.set::<i32>(15, 42);
        assert_eq!(buf.get::<i32>(0), -123);
        assert_eq!(buf.get::<i32>(15), 42);
        // untouched elements come back zeroed
        assert_eq!(buf.get::<i32>(8), 0);
    }

    #[test]
    fn slices_and_bulk_copies() {
        let buf = SharedBuffer::new(1, ElemKind::F32, 8).expect("allocate buffer");
        buf.copy_from::<f32>(2, &[1.5, 2.5, 3.5]);
        assert_eq!(buf.slice::<f32>(2, 3), &[1.5, 2.5, 3.5]);
    }

    #[test]
    fn kind_check_reports_mismatch() {
        let buf = SharedBuffer::new(3, ElemKind::U8, 4).expect("allocate buffer");
        assert!(buf.check_kind::<u8>().is_ok());
        assert!(matches!(
            buf.check_kind::<f64>(),
            Err(ShmError::KindMismatch { id: 3, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_access_is_fatal() {
        let buf = SharedBuffer::new(9, ElemKind::I32, 4).expect("allocate buffer");
        buf.get::<i32>(4);
    }
}
