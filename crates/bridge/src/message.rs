//! Message cursor handed to receivers during delivery.
//!
//! A cursor is valid for parameter reads only while its sequence stamp
//! matches the engine's global stamp; the moment the engine advances to the
//! next header, every copy of the previous cursor is permanently read-stale
//! and reports "nothing to read" instead of stale data. Reads are
//! forward-only and single-pass: a consumed parameter cannot be read again.

use crate::engine::EngineState;
use crate::view::ArrayView;
use crate::wire::NO_ROUTING;
use parking_lot::Mutex;
use shm::{Elem, ElemKind};

/// Single-pass view of one delivered message.
#[derive(Clone)]
pub struct Message<'a> {
    state: &'a Mutex<EngineState>,
    stamp: u64,
    receiver_id: i32,
    message_id: i32,
    param_count: i32,
    routing_id: i32,
    method_name: Option<String>,
}

impl<'a> Message<'a> {
    pub(crate) fn new(
        state: &'a Mutex<EngineState>,
        stamp: u64,
        receiver_id: i32,
        message_id: i32,
        param_count: i32,
        routing_id: i32,
        method_name: Option<String>,
    ) -> Self {
        Self {
            state,
            stamp,
            receiver_id,
            message_id,
            param_count,
            routing_id,
            method_name,
        }
    }

    /// Id of the receiver this message was addressed to.
    pub fn receiver_id(&self) -> i32 {
        self.receiver_id
    }

    /// Application-defined message id. Negative ids never reach receivers:
    /// they encode in-band method names and are resolved before dispatch.
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// Total number of parameters sent with the message, consumed or not.
    pub fn param_count(&self) -> i32 {
        self.param_count
    }

    /// Routing id for routed addressing, [`NO_ROUTING`] otherwise.
    pub fn routing_id(&self) -> i32 {
        self.routing_id
    }

    /// True when this message used routed addressing.
    pub fn is_routed(&self) -> bool {
        self.routing_id != NO_ROUTING
    }

    /// In-band method name, present on routed messages with a negative
    /// encoded message id.
    pub fn method_name(&self) -> Option<&str> {
        self.method_name.as_deref()
    }

    /// Parameters not yet consumed. A stale cursor always reports zero.
    pub fn params_to_read(&self) -> i32 {
        let state = self.state.lock();
        if self.stamp != state.seq {
            return 0;
        }
        state.control.params_before_next()
    }

    /// Element kind of the next parameter, `None` when nothing remains.
    pub fn next_param_kind(&self) -> Option<ElemKind> {
        let state = self.state.lock();
        if self.stamp != state.seq {
            return None;
        }
        let descriptor = state.control.current_param();
        if descriptor.is_none() {
            return None;
        }
        state.queues.kind_of(descriptor.queue_id)
    }

    /// True when the next parameter is an array of [`Message::next_param_kind`].
    pub fn next_param_is_array(&self) -> bool {
        let state = self.state.lock();
        if self.stamp != state.seq {
            return false;
        }
        let descriptor = state.control.current_param();
        !descriptor.is_none() && descriptor.is_array()
    }

    /// True when the next parameter can be read as a string (byte array).
    pub fn can_read_next_as_str(&self) -> bool {
        let state = self.state.lock();
        if self.stamp != state.seq {
            return false;
        }
        let descriptor = state.control.current_param();
        !descriptor.is_none()
            && descriptor.is_array()
            && state.queues.kind_of(descriptor.queue_id) == Some(ElemKind::U8)
    }

    /// Reads the next parameter as a scalar and advances to the one after.
    ///
    /// Protocol violations (stale cursor, no parameter left, kind or arity
    /// mismatch) are reported to the diagnostics sink and yield `None`; the
    /// delivery pass is never aborted by a bad read.
    pub fn read_next<T: Elem>(&mut self) -> Option<T> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let descriptor = self.checked_descriptor(state, T::KIND, false)?;

        let value = state.queues.read_next::<T>(descriptor.queue_id);
        let (control, mut ctx) = state.split();
        control.advance_to_next_param(&mut ctx);
        Some(value)
    }

    /// Reads the next parameter as a zero-copy array view and advances.
    ///
    /// The view's contents are valid until the backing queue is next rotated
    /// or reset, not merely until this call returns. Copy to retain.
    pub fn read_next_array<T: Elem>(&mut self) -> Option<ArrayView<T>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let descriptor = self.checked_descriptor(state, T::KIND, true)?;

        let view = state
            .queues
            .read_next_array::<T>(descriptor.queue_id, descriptor.array_len as usize);
        let (control, mut ctx) = state.split();
        control.advance_to_next_param(&mut ctx);
        Some(view)
    }

    /// Reads the next parameter as an ASCII string and advances. Valid only
    /// for byte-array parameters.
    pub fn read_next_str(&mut self) -> Option<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let descriptor = self.checked_descriptor(state, ElemKind::U8, true)?;

        let text = state
            .queues
            .read_next_str(descriptor.queue_id, descriptor.array_len as usize);
        let (control, mut ctx) = state.split();
        control.advance_to_next_param(&mut ctx);
        Some(text)
    }

    /// Skips the next parameter, keeping every channel cursor in step, and
    /// advances to the one after.
    pub fn skip_next(&mut self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if self.stamp != state.seq {
            tracing::error!("skip on an already consumed message cursor");
            return;
        }
        let descriptor = state.control.current_param();
        if descriptor.is_none() {
            return;
        }
        let elems = if descriptor.is_array() {
            descriptor.array_len as usize
        } else {
            1
        };
        state.queues.skip(descriptor.queue_id, elems);
        let (control, mut ctx) = state.split();
        control.advance_to_next_param(&mut ctx);
    }

    fn checked_descriptor(
        &self,
        state: &EngineState,
        kind: ElemKind,
        as_array: bool,
    ) -> Option<crate::wire::ParamDescriptor> {
        if self.stamp != state.seq {
            tracing::error!(
                message_id = self.message_id,
                "parameter read on an already consumed message cursor"
            );
            return None;
        }

        let descriptor = state.control.current_param();
        if descriptor.is_none() {
            tracing::error!(
                message_id = self.message_id,
                "parameter requested beyond the ones available for the message"
            );
            return None;
        }

        let bound = state.queues.kind_of(descriptor.queue_id);
        if bound != Some(kind) {
            tracing::error!(
                queue_id = descriptor.queue_id,
                requested = ?kind,
                bound = ?bound,
                "parameter of wrong element kind requested"
            );
            return None;
        }

        if descriptor.is_array() != as_array {
            if as_array {
                tracing::error!("single parameter value requested as array");
            } else {
                tracing::error!("array parameter requested as single value");
            }
            return None;
        }

        Some(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlQueue;
    use crate::queues::ParamQueues;
    use crate::registry::Registry;
    use crate::routed::ComponentTable;
    use shm::{BufferPool, BufferProvider};
    use std::sync::Arc;

    /// Builds an engine state holding one message with the given control
    /// stream and an i32 queue (id 1) / u8 queue (id 2) pre-filled.
    fn state_with(
        control_stream: &[i32],
        ints: &[i32],
        bytes: &[u8],
    ) -> Mutex<EngineState> {
        let provider = Arc::new(BufferPool::new());

        let control_buf = provider.request(ElemKind::I32, 64).expect("control");
        control_buf.copy_from::<i32>(0, control_stream);

        let int_buf = provider.request(ElemKind::I32, 32).expect("ints");
        int_buf.copy_from::<i32>(0, ints);
        let byte_buf = provider.request(ElemKind::U8, 32).expect("bytes");
        byte_buf.copy_from::<u8>(0, bytes);

        let mut queues = ParamQueues::new();
        queues.set_first(1, int_buf);
        queues.set_first(2, byte_buf);

        Mutex::new(EngineState {
            control: ControlQueue::new(control_buf),
            queues,
            registry: Registry::new(),
            components: ComponentTable::default(),
            provider,
            seq: 1,
        })
    }

    fn read_header(state: &Mutex<EngineState>) -> crate::wire::MessageHeader {
        let mut guard = state.lock();
        let (control, mut ctx) = guard.split();
        control.read_next_header(&mut ctx)
    }

    #[test]
    fn typed_reads_consume_in_order() {
        // header (5, 2, 3): scalar int, byte array "hi", scalar int
        let state = state_with(&[5, 2, 3, 1, -2, 2, 1], &[42, 7], b"hi");
        let header = read_header(&state);

        let mut msg = Message::new(&state, 1, header.receiver_id, header.message_id, 3, NO_ROUTING, None);
        assert_eq!(msg.params_to_read(), 3);
        assert_eq!(msg.next_param_kind(), Some(ElemKind::I32));
        assert!(!msg.next_param_is_array());

        assert_eq!(msg.read_next::<i32>(), Some(42));
        assert!(msg.can_read_next_as_str());
        assert_eq!(msg.read_next_str(), Some("hi".to_owned()));
        assert_eq!(msg.read_next::<i32>(), Some(7));

        assert_eq!(msg.params_to_read(), 0);
        assert_eq!(msg.read_next::<i32>(), None);
    }

    #[test]
    fn kind_and_arity_mismatches_yield_nothing() {
        let state = state_with(&[5, 2, 2, 1, -2, 3], &[42], b"abc");
        let header = read_header(&state);
        let mut msg = Message::new(&state, 1, header.receiver_id, header.message_id, 2, NO_ROUTING, None);

        // scalar int requested as f32, as array, as string: all rejected,
        // nothing consumed
        assert_eq!(msg.read_next::<f32>(), None);
        assert_eq!(msg.read_next_array::<i32>(), None);
        assert_eq!(msg.read_next_str(), None);
        assert_eq!(msg.params_to_read(), 2);

        assert_eq!(msg.read_next::<i32>(), Some(42));

        // array parameter requested as scalar: rejected
        assert_eq!(msg.read_next::<u8>(), None);
        let view = msg.read_next_array::<u8>().expect("byte array");
        assert_eq!(view.as_slice(), b"abc");
    }

    #[test]
    fn stale_cursor_reports_empty_forever() {
        let state = state_with(&[5, 2, 1, 1], &[42], b"");
        let header = read_header(&state);
        let mut msg = Message::new(&state, 1, header.receiver_id, header.message_id, 1, NO_ROUTING, None);
        let mut copy = msg.clone();

        // the engine moves on to the next header
        state.lock().seq += 1;

        for _ in 0..4 {
            assert_eq!(msg.params_to_read(), 0);
            assert_eq!(msg.read_next::<i32>(), None);
            assert_eq!(copy.read_next::<i32>(), None);
            assert_eq!(copy.next_param_kind(), None);
            assert!(!copy.next_param_is_array());
        }
    }

    #[test]
    fn skip_advances_data_and_control_in_step() {
        // two int scalars then a byte array
        let state = state_with(&[5, 2, 3, 1, 1, -2, 3], &[10, 20], b"xyz");
        let header = read_header(&state);
        let mut msg = Message::new(&state, 1, header.receiver_id, header.message_id, 3, NO_ROUTING, None);

        msg.skip_next();
        assert_eq!(msg.params_to_read(), 2);
        assert_eq!(msg.read_next::<i32>(), Some(20));
        msg.skip_next();
        assert_eq!(msg.params_to_read(), 0);
    }
}
