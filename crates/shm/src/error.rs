//! Error handling helpers for the shared-memory crate.
//!
//! The shm layer intentionally keeps its error surface small: allocation
//! failures and id/kind lookup mismatches. The queue engine above translates
//! the lookup cases into dropped messages rather than propagating errors at
//! runtime.

use crate::ElemKind;
use std::fmt;

/// Convenience result alias for fallible shm operations.
pub type ShmResult<T, E = ShmError> = Result<T, E>;

#[derive(Debug)]
/// Errors surfaced by the shared-buffer provider.
pub enum ShmError {
    /// Requested buffer length is zero or would overflow the region size.
    InvalidLength { requested: usize },
    /// Allocation of a pinned region failed for the given size/alignment pair.
    AllocationFailed { size: usize, alignment: usize },
    /// No buffer is registered under the given id.
    UnknownBuffer { id: i32 },
    /// A buffer was requested as a different element kind than it was
    /// allocated with.
    KindMismatch {
        id: i32,
        expected: ElemKind,
        actual: ElemKind,
    },
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidLength { requested } => {
                write!(f, "buffer length {requested} is not representable")
            }
            ShmError::AllocationFailed { size, alignment } => {
                write!(
                    f,
                    "failed to allocate pinned region of {size} bytes aligned to {alignment}"
                )
            }
            ShmError::UnknownBuffer { id } => {
                write!(f, "no shared buffer registered under id {id}")
            }
            ShmError::KindMismatch {
                id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "shared buffer {id} holds {actual:?} elements, requested as {expected:?}"
                )
            }
        }
    }
}

impl std::error::Error for ShmError {}
