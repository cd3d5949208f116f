//! Control queue: the protocol core on the reading side.
//!
//! The control channel (id 0) interleaves user-message headers, parameter
//! descriptors, and in-band control directives in one integer stream. Every
//! header or descriptor read first runs [`ControlQueue::normalize`], which
//! consumes any directives sitting under the cursor and executes them in
//! place. Consolidating the interception in one spot matters because a
//! buffer rotation can land *between two parameters of one message* and must
//! stay invisible to the receiver.

use crate::chain::Chain;
use crate::queues::ParamQueues;
use crate::registry::Registry;
use crate::wire::{
    decode_routed_count, MessageHeader, ParamDescriptor, DIR_SET_QUEUE_BUFFER,
    DIR_SET_QUEUE_FIRST_BUFFER, DIR_SET_RECEIVER_IDS_BUFFER, EMPTY_QUEUE_CODE, NO_ROUTING,
};
use shm::{BufferProvider, SharedBuffer};
use smallvec::SmallVec;
use std::sync::Arc;

/// Mutable surroundings a directive may touch while being executed.
pub(crate) struct DirectiveCtx<'a> {
    pub queues: &'a mut ParamQueues,
    pub registry: &'a mut Registry,
    pub provider: &'a dyn BufferProvider,
}

/// Reader half of the control channel.
pub(crate) struct ControlQueue {
    chain: Chain,
    params_before_next: i32,
    current_param: ParamDescriptor,
}

impl ControlQueue {
    /// Binds the reader to the producer's first control buffer.
    pub fn new(first_buffer: Arc<SharedBuffer>) -> Self {
        let mut chain = Chain::new();
        chain.set_first_buffer(first_buffer);
        Self {
            chain,
            params_before_next: 0,
            current_param: ParamDescriptor::NONE,
        }
    }

    /// The non-empty signal for the whole engine: position 0 of the *first*
    /// buffer (regardless of rotation) holds the sentinel once a pass is
    /// complete.
    pub fn has_messages(&self) -> bool {
        let first = self.chain.first().expect("control chain is always bound");
        first.get::<i32>(0) != EMPTY_QUEUE_CODE
    }

    /// Writes the sentinel, transitioning the channel back to idle.
    pub fn finish(&mut self) {
        let first = self.chain.first().expect("control chain is always bound");
        first.set::<i32>(0, EMPTY_QUEUE_CODE);
    }

    /// Parameters of the current message not yet consumed (the one described
    /// by [`ControlQueue::current_param`] included).
    pub fn params_before_next(&self) -> i32 {
        self.params_before_next
    }

    pub fn current_param(&self) -> ParamDescriptor {
        self.current_param
    }

    /// Decodes the header under the cursor and pre-reads the first parameter
    /// descriptor. Must only be called once the previous message's
    /// parameters are fully consumed or skipped.
    pub fn read_next_header(&mut self, ctx: &mut DirectiveCtx<'_>) -> MessageHeader {
        debug_assert_eq!(self.params_before_next, 0);
        self.normalize(ctx);

        let receiver_id = self.chain.read::<i32>();
        let message_id = self.chain.read::<i32>();
        let count_field = self.chain.read::<i32>();

        // The count sign selects the framing: non-negative is the plain
        // 3-int header, negative is the routed 4-int header with the true
        // count shifted by one so zero parameters stay distinguishable.
        let (param_count, routing_id) = if count_field >= 0 {
            (count_field, NO_ROUTING)
        } else {
            (decode_routed_count(count_field), self.chain.read::<i32>())
        };

        self.params_before_next = param_count;
        self.read_current_param(ctx);

        MessageHeader {
            receiver_id,
            message_id,
            param_count,
            routing_id,
        }
    }

    /// Steps past the current parameter descriptor and decodes the next one.
    pub fn advance_to_next_param(&mut self, ctx: &mut DirectiveCtx<'_>) {
        self.params_before_next -= 1;
        self.read_current_param(ctx);
    }

    /// Returns the reader to the head of the chain for the next pass.
    pub fn reset(&mut self) {
        self.chain.reset();
        self.params_before_next = 0;
        self.current_param = ParamDescriptor::NONE;
    }

    fn read_current_param(&mut self, ctx: &mut DirectiveCtx<'_>) {
        if self.params_before_next <= 0 {
            self.current_param = ParamDescriptor::NONE;
            return;
        }

        self.normalize(ctx);

        let first = self.chain.read::<i32>();
        debug_assert_ne!(first, 0, "descriptor cannot target the control channel");
        self.current_param = if first > 0 {
            ParamDescriptor::scalar(first)
        } else {
            // negated queue id marks an array parameter; its length follows
            let len = self.chain.read::<i32>();
            ParamDescriptor::array(-first, len)
        };
    }

    /// Executes every directive sitting under the cursor. Directives are
    /// recognised by `receiverId == 0` plus a negative count field, and may
    /// arrive back-to-back before the next real header or descriptor.
    fn normalize(&mut self, ctx: &mut DirectiveCtx<'_>) {
        while self.chain.peek::<i32>(0) == 0 && self.chain.peek::<i32>(2) < 0 {
            let directive_id = self.chain.peek::<i32>(1);
            let arg_count = -self.chain.peek::<i32>(2);

            // Copy the inline arguments out before advancing: executing the
            // directive may rotate this very chain.
            let mut args: SmallVec<[i32; 4]> = SmallVec::new();
            for i in 0..arg_count {
                args.push(self.chain.peek::<i32>(3 + i as usize));
            }
            self.chain.advance(3 + arg_count as usize);

            self.execute_directive(directive_id, &args, ctx);
        }
    }

    fn execute_directive(&mut self, directive_id: i32, args: &[i32], ctx: &mut DirectiveCtx<'_>) {
        match directive_id {
            DIR_SET_QUEUE_BUFFER => {
                let Some((queue_id, buffer)) = self.resolve_queue_directive(args, ctx) else {
                    return;
                };
                if queue_id == 0 {
                    self.chain.set_current_buffer(buffer);
                } else {
                    ctx.queues.set_current(queue_id, buffer);
                }
            }
            DIR_SET_QUEUE_FIRST_BUFFER => {
                let Some((queue_id, buffer)) = self.resolve_queue_directive(args, ctx) else {
                    return;
                };
                if queue_id == 0 {
                    self.chain.set_first_buffer(buffer);
                } else {
                    ctx.queues.set_first(queue_id, buffer);
                }
            }
            DIR_SET_RECEIVER_IDS_BUFFER => {
                let &[buffer_id] = args else {
                    tracing::error!(?args, "receiver-id table directive with malformed arguments");
                    return;
                };
                match ctx.provider.get(buffer_id) {
                    Ok(buffer) => ctx.registry.bind_id_buffer(buffer),
                    Err(err) => {
                        tracing::error!(buffer_id, %err, "receiver-id table buffer not resolvable")
                    }
                }
            }
            other => tracing::error!(directive_id = other, "unknown control directive dropped"),
        }
    }

    fn resolve_queue_directive(
        &mut self,
        args: &[i32],
        ctx: &mut DirectiveCtx<'_>,
    ) -> Option<(i32, Arc<SharedBuffer>)> {
        let &[queue_id, buffer_id] = args else {
            tracing::error!(?args, "queue buffer directive with malformed arguments");
            return None;
        };
        match ctx.provider.get(buffer_id) {
            Ok(buffer) => Some((queue_id, buffer)),
            Err(err) => {
                tracing::error!(queue_id, buffer_id, %err, "queue buffer not resolvable");
                None
            }
        }
    }
}
