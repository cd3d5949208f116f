//! Engine-side read cursor over a chain of shared buffers.
//!
//! A channel is materialised as the buffer currently being read plus a
//! cursor, with the first buffer remembered as the reset point for the next
//! delivery pass. Rotation to a new current buffer happens only through an
//! explicit control directive, never implicitly.
//!
//! No operation here validates stream bounds: bounds correctness is a
//! contract with the producer side, and a violation is a protocol bug the
//! underlying buffer turns into a panic.

use shm::{Elem, ElemKind, SharedBuffer};
use std::sync::Arc;

/// Read cursor for one channel's buffer chain.
#[derive(Debug, Default)]
pub struct Chain {
    first: Option<Arc<SharedBuffer>>,
    current: Option<Arc<SharedBuffer>>,
    pos: usize,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the chain's reset point and, through the buffer's declared kind,
    /// fixes the channel's element type for the rest of the process.
    pub fn set_first_buffer(&mut self, buffer: Arc<SharedBuffer>) {
        self.current = Some(buffer.clone());
        self.first = Some(buffer);
    }

    /// Rotates the live buffer and rewinds the cursor to 0.
    pub fn set_current_buffer(&mut self, buffer: Arc<SharedBuffer>) {
        self.current = Some(buffer);
        self.pos = 0;
    }

    /// Skips `n` elements without reading them.
    pub fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    /// Returns the cursor to the first buffer, position 0.
    pub fn reset(&mut self) {
        self.current = self.first.clone();
        self.pos = 0;
    }

    /// Element kind of the chain, fixed by [`Chain::set_first_buffer`].
    pub fn kind(&self) -> Option<ElemKind> {
        self.first.as_ref().map(|buf| buf.kind())
    }

    /// True once a first buffer has been bound.
    pub fn is_bound(&self) -> bool {
        self.first.is_some()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn first(&self) -> Option<&Arc<SharedBuffer>> {
        self.first.as_ref()
    }

    /// Live buffer under the cursor. Unbound chains are a protocol bug.
    pub fn current(&self) -> &Arc<SharedBuffer> {
        self.current.as_ref().expect("chain has no bound buffer")
    }

    /// Reads the element under the cursor and advances by one.
    pub fn read<T: Elem>(&mut self) -> T {
        let value = self.current().get::<T>(self.pos);
        self.pos += 1;
        value
    }

    /// Reads the element `offset` positions past the cursor without moving it.
    pub fn peek<T: Elem>(&self, offset: usize) -> T {
        self.current().get::<T>(self.pos + offset)
    }

    /// Takes `len` elements as a window and advances past them.
    pub fn read_window(&mut self, len: usize) -> (Arc<SharedBuffer>, usize) {
        let start = self.pos;
        self.pos += len;
        (self.current().clone(), start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_buffer(id: i32, values: &[i32]) -> Arc<SharedBuffer> {
        let buf = Arc::new(SharedBuffer::new(id, ElemKind::I32, values.len()).expect("allocate"));
        buf.copy_from::<i32>(0, values);
        buf
    }

    #[test]
    fn reads_advance_the_cursor() {
        let mut chain = Chain::new();
        chain.set_first_buffer(int_buffer(1, &[10, 20, 30]));
        assert_eq!(chain.kind(), Some(ElemKind::I32));
        assert_eq!(chain.read::<i32>(), 10);
        assert_eq!(chain.peek::<i32>(0), 20);
        assert_eq!(chain.peek::<i32>(1), 30);
        chain.advance(1);
        assert_eq!(chain.read::<i32>(), 30);
    }

    #[test]
    fn rotation_keeps_the_reset_point() {
        let mut chain = Chain::new();
        let first = int_buffer(1, &[1, 2]);
        let second = int_buffer(2, &[3, 4]);

        chain.set_first_buffer(first.clone());
        assert_eq!(chain.read::<i32>(), 1);

        chain.set_current_buffer(second);
        assert_eq!(chain.pos(), 0);
        assert_eq!(chain.read::<i32>(), 3);

        chain.reset();
        assert_eq!(chain.pos(), 0);
        assert_eq!(chain.current().id(), first.id());
        assert_eq!(chain.read::<i32>(), 1);
    }
}
