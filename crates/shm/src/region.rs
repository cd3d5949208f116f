//! Pinned memory backing for shared buffers.
//!
//! Every buffer handed out by the provider is backed by a fixed-size,
//! contiguous, zero-initialised region that never moves for its lifetime.
//! Native targets prefer anonymous `mmap` regions (page aligned); when the
//! mapping cannot satisfy the requested alignment we fall back to an aligned
//! heap allocation. The unsafe surface stays inside this module.

use crate::{ShmError, ShmResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};

#[cfg(not(target_arch = "wasm32"))]
type NativeMap = memmap2::MmapMut;

#[derive(Debug)]
enum Backing {
    #[cfg(not(target_arch = "wasm32"))]
    Native(NativeMap),
    Owned { ptr: NonNull<u8>, layout: Layout },
}

/// Fixed, zeroed, aligned allocation backing one shared buffer.
#[derive(Debug)]
pub struct PinnedRegion {
    len: usize,
    base: NonNull<u8>,
    backing: Backing,
}

impl PinnedRegion {
    /// Allocates a zeroed region of `len` bytes aligned to `alignment`.
    pub fn new(len: usize, alignment: usize) -> ShmResult<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(ShmError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(region) = Self::mmap_backed(len, alignment)? {
                return Ok(region);
            }
        }

        Self::heap_backed(len, alignment)
    }

    fn heap_backed(len: usize, alignment: usize) -> ShmResult<Self> {
        let layout =
            Layout::from_size_align(len.max(1), alignment).map_err(|_| {
                ShmError::AllocationFailed {
                    size: len,
                    alignment,
                }
            })?;

        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(ShmError::AllocationFailed {
            size: len,
            alignment,
        })?;

        Ok(Self {
            len,
            base: ptr,
            backing: Backing::Owned { ptr, layout },
        })
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn mmap_backed(len: usize, alignment: usize) -> ShmResult<Option<Self>> {
        let mut map = memmap2::MmapOptions::new()
            .len(len.max(1))
            .map_anon()
            .map_err(|_| ShmError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let ptr = map.as_mut_ptr();
        if ptr as usize % alignment != 0 {
            return Ok(None);
        }

        unsafe {
            // SAFETY: the anonymous mapping exposes at least `len` bytes.
            ptr::write_bytes(ptr, 0, len);
        }

        let base = NonNull::new(ptr).ok_or(ShmError::AllocationFailed {
            size: len,
            alignment,
        })?;

        Ok(Some(Self {
            len,
            base,
            backing: Backing::Native(map),
        }))
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base pointer of the pinned allocation. Stable for the region lifetime.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = &self.backing {
            unsafe {
                dealloc(ptr.as_ptr(), *layout);
            }
        }
    }
}

// SAFETY: the region is a plain allocation; all mutation goes through the
// buffer layer, which upholds the one-writer-per-side discipline.
unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}
