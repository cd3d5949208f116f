//! Shared-buffer provider: allocation, id lookup, release.
//!
//! The queue engine never allocates memory itself; it asks a provider for
//! buffers by kind and length and refers to them by id from then on. Release
//! is driven by the producer side, which owns the buffer lifecycle.

use crate::{ElemKind, SharedBuffer, ShmError, ShmResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Issues, resolves, and releases shared buffers by integer id.
pub trait BufferProvider: Send + Sync {
    /// Allocates a zeroed buffer of `len` elements of `kind` and returns its id.
    fn request(&self, kind: ElemKind, len: usize) -> ShmResult<Arc<SharedBuffer>>;

    /// Resolves a previously issued id.
    fn get(&self, id: i32) -> ShmResult<Arc<SharedBuffer>>;

    /// Returns the buffer under `id` to the provider.
    ///
    /// Outstanding `Arc` handles keep the memory alive; release only retires
    /// the id.
    fn release(&self, id: i32) -> ShmResult<()>;
}

/// In-process provider backing both bridge halves in one address space.
pub struct BufferPool {
    inner: Mutex<PoolState>,
}

struct PoolState {
    buffers: HashMap<i32, Arc<SharedBuffer>>,
    next_id: i32,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolState {
                buffers: HashMap::new(),
                // id 0 is never issued so control-stream fields can use 0 as
                // the reserved engine receiver without colliding with a
                // buffer id.
                next_id: 1,
            }),
        }
    }

    /// Number of live (unreleased) buffers.
    pub fn live_buffers(&self) -> usize {
        self.inner.lock().buffers.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferProvider for BufferPool {
    fn request(&self, kind: ElemKind, len: usize) -> ShmResult<Arc<SharedBuffer>> {
        let mut state = self.inner.lock();
        let id = state.next_id;
        let buffer = Arc::new(SharedBuffer::new(id, kind, len)?);
        state.next_id += 1;
        state.buffers.insert(id, buffer.clone());
        tracing::debug!(id, ?kind, len, "issued shared buffer");
        Ok(buffer)
    }

    fn get(&self, id: i32) -> ShmResult<Arc<SharedBuffer>> {
        self.inner
            .lock()
            .buffers
            .get(&id)
            .cloned()
            .ok_or(ShmError::UnknownBuffer { id })
    }

    fn release(&self, id: i32) -> ShmResult<()> {
        let removed = self.inner.lock().buffers.remove(&id);
        match removed {
            Some(_) => {
                tracing::debug!(id, "released shared buffer");
                Ok(())
            }
            None => Err(ShmError::UnknownBuffer { id }),
        }
    }
}
