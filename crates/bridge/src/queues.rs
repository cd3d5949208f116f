//! Typed parameter queues, arena-indexed by channel id.
//!
//! One queue exists per element kind for the engine's lifetime; the binding
//! between a channel id and its kind is established once, when the first
//! buffer directive for that channel arrives, and never changes afterwards.
//! Channel 0 is the control queue and lives outside this arena.

use crate::chain::Chain;
use crate::view::ArrayView;
use crate::wire::MAX_QUEUES;
use shm::{Elem, ElemKind, SharedBuffer};
use std::sync::Arc;

/// Engine-side arena of parameter channels.
pub(crate) struct ParamQueues {
    chains: Vec<Chain>,
}

impl ParamQueues {
    pub fn new() -> Self {
        Self {
            chains: (0..MAX_QUEUES).map(|_| Chain::new()).collect(),
        }
    }

    fn chain(&self, queue_id: i32) -> Option<&Chain> {
        usize::try_from(queue_id).ok().and_then(|id| self.chains.get(id))
    }

    fn chain_mut(&mut self, queue_id: i32) -> Option<&mut Chain> {
        usize::try_from(queue_id)
            .ok()
            .and_then(|id| self.chains.get_mut(id))
    }

    /// Binds the reset point of `queue_id`, fixing its element kind.
    /// Returns false (after reporting) for an out-of-range channel.
    pub fn set_first(&mut self, queue_id: i32, buffer: Arc<SharedBuffer>) -> bool {
        match self.chain_mut(queue_id) {
            Some(chain) => {
                chain.set_first_buffer(buffer);
                true
            }
            None => {
                tracing::error!(queue_id, "first-buffer directive for invalid channel");
                false
            }
        }
    }

    /// Rotates the live buffer of `queue_id`.
    pub fn set_current(&mut self, queue_id: i32, buffer: Arc<SharedBuffer>) -> bool {
        match self.chain_mut(queue_id) {
            Some(chain) => {
                chain.set_current_buffer(buffer);
                true
            }
            None => {
                tracing::error!(queue_id, "rotate directive for invalid channel");
                false
            }
        }
    }

    /// Element kind bound to `queue_id`, if any.
    pub fn kind_of(&self, queue_id: i32) -> Option<ElemKind> {
        self.chain(queue_id).and_then(|chain| chain.kind())
    }

    /// Channel id currently bound to byte elements, used for in-band name
    /// payloads in routed addressing.
    pub fn byte_queue_id(&self) -> Option<i32> {
        self.chains
            .iter()
            .position(|chain| chain.kind() == Some(ElemKind::U8))
            .map(|id| id as i32)
    }

    /// Skips `n` elements of `queue_id` without reading them.
    pub fn skip(&mut self, queue_id: i32, n: usize) {
        match self.chain_mut(queue_id) {
            Some(chain) if chain.is_bound() => chain.advance(n),
            _ => tracing::error!(queue_id, "skip on unbound channel"),
        }
    }

    /// Reads the next scalar of `queue_id`. Kind agreement is the caller's
    /// responsibility (checked at the message-cursor layer).
    pub fn read_next<T: Elem>(&mut self, queue_id: i32) -> T {
        let chain = self
            .chain_mut(queue_id)
            .expect("scalar read on invalid channel");
        chain.read::<T>()
    }

    /// Takes `len` elements of `queue_id` as a zero-copy view.
    pub fn read_next_array<T: Elem>(&mut self, queue_id: i32, len: usize) -> ArrayView<T> {
        let chain = self
            .chain_mut(queue_id)
            .expect("array read on invalid channel");
        let (buffer, first) = chain.read_window(len);
        ArrayView::new(buffer, first, len)
    }

    /// Reads `len` bytes of `queue_id` as ASCII text.
    pub fn read_next_str(&mut self, queue_id: i32, len: usize) -> String {
        let view = self.read_next_array::<u8>(queue_id, len);
        String::from_utf8_lossy(view.as_slice()).into_owned()
    }

    /// Rewinds every bound channel to its first buffer for the next pass.
    pub fn reset_all(&mut self) {
        for chain in self.chains.iter_mut().filter(|chain| chain.is_bound()) {
            chain.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(id: i32, kind: ElemKind, len: usize) -> Arc<SharedBuffer> {
        Arc::new(SharedBuffer::new(id, kind, len).expect("allocate buffer"))
    }

    #[test]
    fn binds_kind_at_first_buffer() {
        let mut queues = ParamQueues::new();
        assert_eq!(queues.kind_of(2), None);
        assert!(queues.set_first(2, buffer(10, ElemKind::F32, 8)));
        assert_eq!(queues.kind_of(2), Some(ElemKind::F32));
        assert!(!queues.set_first(-1, buffer(11, ElemKind::F32, 8)));
        assert!(!queues.set_first(MAX_QUEUES as i32, buffer(12, ElemKind::F32, 8)));
    }

    #[test]
    fn finds_the_byte_channel() {
        let mut queues = ParamQueues::new();
        assert_eq!(queues.byte_queue_id(), None);
        queues.set_first(1, buffer(10, ElemKind::I32, 8));
        queues.set_first(3, buffer(11, ElemKind::U8, 8));
        assert_eq!(queues.byte_queue_id(), Some(3));
    }

    #[test]
    fn reads_skip_and_reset_stay_in_step() {
        let mut queues = ParamQueues::new();
        let buf = buffer(10, ElemKind::I32, 8);
        buf.copy_from::<i32>(0, &[5, 6, 7, 8]);
        queues.set_first(1, buf);

        assert_eq!(queues.read_next::<i32>(1), 5);
        queues.skip(1, 2);
        assert_eq!(queues.read_next::<i32>(1), 8);

        queues.reset_all();
        assert_eq!(queues.read_next::<i32>(1), 5);
    }

    #[test]
    fn string_reads_decode_ascii() {
        let mut queues = ParamQueues::new();
        let buf = buffer(10, ElemKind::U8, 16);
        buf.copy_from::<u8>(0, b"scale");
        queues.set_first(1, buf);
        assert_eq!(queues.read_next_str(1, 5), "scale");
    }
}
