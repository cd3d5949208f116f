//! The delivery engine: one explicit instance per bridge, no process globals.
//!
//! A delivery pass drains the control queue to the sentinel without yielding:
//! headers are decoded one at a time, dispatched to their receiver, and any
//! parameters the receiver left unread are skipped so every channel cursor
//! stays in lock-step. The pass either completes or the force-termination
//! guard writes the sentinel on the way out, so a panicking receiver cannot
//! wedge the next tick into permanent non-termination.

use crate::control::{ControlQueue, DirectiveCtx};
use crate::message::Message;
use crate::queues::ParamQueues;
use crate::registry::{Receiver, ReceiverHandle, Registry};
use crate::routed::{ComponentTable, RoutedTarget, TargetResolver};
use crate::wire::{
    MessageHeader, ENGINE_RECEIVER_ID, MSG_FINISH_DELIVERING, MSG_REGISTER_COMPONENT,
};
use crate::BridgeResult;
use parking_lot::Mutex;
use shm::BufferProvider;
use std::sync::Arc;

/// Hook the engine pulls to tell the producer a delivery pass is starting.
///
/// The producer's obligations behind this call: enqueue the finish message
/// and rewind its write cursors, since everything enqueued so far is about
/// to be consumed.
pub trait ProducerControl: Send + Sync {
    fn on_start_delivering(&self);
}

/// Mutable engine internals, shared between the drain loop and the message
/// cursors it hands out.
pub(crate) struct EngineState {
    pub(crate) control: ControlQueue,
    pub(crate) queues: ParamQueues,
    pub(crate) registry: Registry,
    pub(crate) components: ComponentTable,
    pub(crate) provider: Arc<dyn BufferProvider>,
    /// Global sequence stamp; a cursor whose stamp falls behind is read-stale.
    pub(crate) seq: u64,
}

impl EngineState {
    /// Splits the state into the control cursor and the context directives
    /// mutate, so both can be borrowed at once.
    pub(crate) fn split(&mut self) -> (&mut ControlQueue, DirectiveCtx<'_>) {
        (
            &mut self.control,
            DirectiveCtx {
                queues: &mut self.queues,
                registry: &mut self.registry,
                provider: self.provider.as_ref(),
            },
        )
    }
}

enum Dispatch {
    /// Handled by the engine's internal receiver (reserved id 0).
    Internal,
    /// Handed to a resolved receiver endpoint.
    Receiver(ReceiverHandle),
    /// Unresolvable; parameters are skipped and the message is lost.
    Drop,
}

/// The engine half of the bridge: drains messages the producer enqueued.
pub struct Engine {
    state: Mutex<EngineState>,
    producer_ctl: Arc<dyn ProducerControl>,
    resolver: Mutex<Option<Arc<dyn TargetResolver>>>,
}

impl Engine {
    /// Binds an engine to the producer's first control buffer and consumes
    /// the bootstrap stream (receiver-id table directive and the initial
    /// finish), leaving the channel idle.
    pub fn new(
        provider: Arc<dyn BufferProvider>,
        control_buffer_id: i32,
        producer_ctl: Arc<dyn ProducerControl>,
    ) -> BridgeResult<Self> {
        let control_buffer = provider.get(control_buffer_id)?;
        control_buffer.check_kind::<i32>()?;

        let engine = Self {
            state: Mutex::new(EngineState {
                control: ControlQueue::new(control_buffer),
                queues: ParamQueues::new(),
                registry: Registry::new(),
                components: ComponentTable::default(),
                provider,
                seq: 0,
            }),
            producer_ctl,
            resolver: Mutex::new(None),
        };

        engine.deliver_messages();
        Ok(engine)
    }

    /// Registers the resolver consulted for by-name routed targets.
    pub fn set_resolver(&self, resolver: Arc<dyn TargetResolver>) {
        *self.resolver.lock() = Some(resolver);
    }

    /// True when the producer has enqueued messages since the last pass.
    pub fn has_messages_to_deliver(&self) -> bool {
        self.state.lock().control.has_messages()
    }

    /// Pops a receiver id from the shared free list. `None` means the pool
    /// is exhausted: a configuration-sizing error, already reported.
    pub fn new_receiver_id(&self) -> Option<i32> {
        self.state.lock().registry.allocate_id()
    }

    /// Binds `receiver` to a previously allocated id.
    pub fn bind_receiver(&self, id: i32, receiver: ReceiverHandle) -> bool {
        self.state.lock().registry.bind(id, receiver)
    }

    /// Convenience for binding a plain receiver value.
    pub fn bind(&self, id: i32, receiver: impl Receiver + 'static) -> bool {
        self.bind_receiver(id, Arc::new(Mutex::new(receiver)))
    }

    /// Binds the routed-addressing target handle for `id`.
    pub fn bind_target(&self, id: i32, target: Arc<dyn RoutedTarget>) -> bool {
        self.state.lock().registry.bind_target(id, target)
    }

    /// Releases a receiver id back to the shared free list.
    pub fn release_receiver_id(&self, id: i32) {
        self.state.lock().registry.release(id);
    }

    /// Component type name registered under `routing_id`, if any.
    pub fn component_name(&self, routing_id: i32) -> Option<String> {
        self.state
            .lock()
            .components
            .name_of(routing_id)
            .map(str::to_owned)
    }

    /// Delivers every pending message to its receiver, then resets all queue
    /// cursors for the next pass. Runs to completion without yielding.
    pub fn deliver_messages(&self) {
        if !self.has_messages_to_deliver() {
            return;
        }

        self.producer_ctl.on_start_delivering();

        let mut guard = DrainGuard {
            state: &self.state,
            completed: false,
        };

        while self.has_messages_to_deliver() {
            self.deliver_one();
        }

        guard.completed = true;
    }

    /// Reads one header, dispatches it, and skips whatever the receiver left
    /// unread.
    fn deliver_one(&self) {
        let (stamp, header, method_name, dispatch) = {
            let mut locked = self.state.lock();
            let state = &mut *locked;

            state.seq += 1;
            let stamp = state.seq;

            let (control, mut ctx) = state.split();
            let header = control.read_next_header(&mut ctx);

            if header.is_routed() {
                let (method_name, dispatch) = self.resolve_routed(state, &header);
                (stamp, header, method_name, dispatch)
            } else {
                let dispatch = if header.receiver_id == ENGINE_RECEIVER_ID {
                    Dispatch::Internal
                } else {
                    match state.registry.get(header.receiver_id) {
                        Some(handle) => Dispatch::Receiver(handle),
                        None => {
                            tracing::error!(
                                receiver_id = header.receiver_id,
                                "message sent to an invalid receiver"
                            );
                            Dispatch::Drop
                        }
                    }
                };
                (stamp, header, None, dispatch)
            }
        };

        match dispatch {
            Dispatch::Internal => self.handle_internal(stamp, &header),
            Dispatch::Receiver(handle) => {
                let mut msg = Message::new(
                    &self.state,
                    stamp,
                    header.receiver_id,
                    header.message_id,
                    header.param_count,
                    header.routing_id,
                    method_name,
                );
                handle.lock().receive(&mut msg);
            }
            Dispatch::Drop => {}
        }

        self.skip_unread_params();
    }

    /// Resolves a routed header to a capability. The in-band names *must* be
    /// consumed unconditionally: they sit in the byte queue whether or not
    /// resolution succeeds, and leaving them behind would desync the cursor.
    fn resolve_routed(
        &self,
        state: &mut EngineState,
        header: &MessageHeader,
    ) -> (Option<String>, Dispatch) {
        let target_name = (header.receiver_id < 0)
            .then(|| Self::read_name(state, -header.receiver_id))
            .flatten();
        let method_name = (header.message_id < 0)
            .then(|| Self::read_name(state, -header.message_id))
            .flatten();

        let Some(type_name) = state
            .components
            .name_of(header.routing_id)
            .map(str::to_owned)
        else {
            tracing::error!(
                routing_id = header.routing_id,
                "routed message with unregistered routing id"
            );
            return (method_name, Dispatch::Drop);
        };

        let capability = if header.receiver_id >= 0 {
            state
                .registry
                .capability(header.receiver_id, header.routing_id, &type_name)
        } else {
            let resolver = self.resolver.lock().clone();
            match (resolver, target_name) {
                (Some(resolver), Some(name)) => resolver
                    .resolve(&name)
                    .and_then(|target| target.capability(&type_name)),
                (None, Some(name)) => {
                    tracing::error!(target = %name, "no target resolver registered");
                    None
                }
                (_, None) => None,
            }
        };

        match capability {
            Some(handle) => (method_name, Dispatch::Receiver(handle)),
            None => {
                tracing::error!(
                    receiver_id = header.receiver_id,
                    routing_id = header.routing_id,
                    type_name = %type_name,
                    "routed target not found; message dropped"
                );
                (method_name, Dispatch::Drop)
            }
        }
    }

    fn read_name(state: &mut EngineState, len: i32) -> Option<String> {
        match state.queues.byte_queue_id() {
            Some(queue_id) => Some(state.queues.read_next_str(queue_id, len as usize)),
            None => {
                tracing::error!("in-band name expected but no byte channel is bound");
                None
            }
        }
    }

    /// The reserved receiver id 0: finish-delivering and component
    /// registration arrive here as ordinary messages.
    fn handle_internal(&self, stamp: u64, header: &MessageHeader) {
        match header.message_id {
            MSG_FINISH_DELIVERING => {
                self.state.lock().control.finish();
            }
            MSG_REGISTER_COMPONENT => {
                let mut msg = Message::new(
                    &self.state,
                    stamp,
                    header.receiver_id,
                    header.message_id,
                    header.param_count,
                    header.routing_id,
                    None,
                );
                let routing_id = msg.read_next::<i32>();
                let type_name = msg.read_next_str();
                match (routing_id, type_name) {
                    (Some(routing_id), Some(type_name)) => {
                        self.state.lock().components.register(routing_id, type_name);
                    }
                    _ => tracing::error!("malformed component registration message dropped"),
                }
            }
            other => {
                tracing::error!(message_id = other, "unknown message for the engine receiver");
            }
        }
    }

    /// Fast-forwards every channel past parameters the receiver ignored, so
    /// leaving K parameters unread lands every cursor exactly where reading
    /// them would have.
    fn skip_unread_params(&self) {
        let mut locked = self.state.lock();
        let state = &mut *locked;
        while state.control.params_before_next() > 0 {
            let descriptor = state.control.current_param();
            if !descriptor.is_none() {
                let elems = if descriptor.is_array() {
                    descriptor.array_len as usize
                } else {
                    1
                };
                state.queues.skip(descriptor.queue_id, elems);
            }
            let (control, mut ctx) = state.split();
            control.advance_to_next_param(&mut ctx);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("has_messages", &self.has_messages_to_deliver())
            .finish()
    }
}

/// Forced-termination guard: whatever unwinds out of a delivery pass, the
/// sentinel gets written and the cursors reset, so the channel is idle and
/// consistent when the next pass starts.
struct DrainGuard<'a> {
    state: &'a Mutex<EngineState>,
    completed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !self.completed {
            tracing::error!("delivery pass aborted; force-terminating the channel");
            state.control.finish();
        }
        state.control.reset();
        state.queues.reset_all();
    }
}
