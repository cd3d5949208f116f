//! Producer: the compliant writer half of the bridge.
//!
//! Each channel is written through a chain of shared buffers. When the
//! current buffer runs out, the writer allocates (or reuses) the next one
//! and announces the rotation on the control queue *before* switching, so
//! the reader rotates before it reaches the data. The control queue rotates
//! itself the same way, which is why its allocator keeps
//! [`ROTATE_DIRECTIVE_LEN`] ints of slack at every buffer tail and guards
//! against re-entering its own rotation.
//!
//! New messages must never be enqueued while a delivery pass is running on
//! the engine side. That is a cross-boundary caller discipline, not something
//! enforced here.

use crate::config::BridgeConfig;
use crate::engine::ProducerControl;
use crate::registry::free_list;
use crate::view::ArrayFill;
use crate::wire::{
    encode_routed_count, CONTROL_QUEUE_ID, DIR_SET_QUEUE_BUFFER, DIR_SET_QUEUE_FIRST_BUFFER,
    DIR_SET_RECEIVER_IDS_BUFFER, EMPTY_QUEUE_CODE, ENGINE_RECEIVER_ID, MAX_QUEUES,
    MSG_FINISH_DELIVERING, MSG_REGISTER_COMPONENT, ROTATE_DIRECTIVE_LEN,
};
use crate::{BridgeError, BridgeResult};
use parking_lot::{Mutex, MutexGuard};
use shm::{BufferProvider, Elem, ElemKind, SharedBuffer};
use std::sync::Arc;

/// Writer cursor over one parameter channel's buffer chain.
///
/// Nodes are kept across passes and reused after every reset; fresh buffers
/// are requested from the provider only when the chain grows past its
/// high-water mark.
struct WriteChain {
    queue_id: i32,
    kind: ElemKind,
    nodes: Vec<Arc<SharedBuffer>>,
    current: usize,
    pos: usize,
}

impl WriteChain {
    fn new(queue_id: i32, kind: ElemKind, elems: usize, provider: &dyn BufferProvider) -> BridgeResult<Self> {
        let first = provider.request(kind, elems)?;
        Ok(Self {
            queue_id,
            kind,
            nodes: vec![first],
            current: 0,
            pos: 0,
        })
    }

    fn first_buffer_id(&self) -> i32 {
        self.nodes[0].id()
    }

    fn buffer_len(&self) -> usize {
        self.nodes[0].len()
    }

    fn is_reset(&self) -> bool {
        self.current == 0 && self.pos == 0
    }

    fn reset(&mut self) {
        self.current = 0;
        self.pos = 0;
    }

    /// Reserves `len` elements, rotating to the next buffer when the current
    /// one cannot hold them.
    fn alloc(
        &mut self,
        len: usize,
        control: &mut ControlWriter,
        provider: &dyn BufferProvider,
    ) -> BridgeResult<(Arc<SharedBuffer>, usize)> {
        if self.pos + len >= self.buffer_len() {
            // a single parameter can never exceed one buffer; pass a buffer
            // id instead of the data for payloads that large
            assert!(
                len < self.buffer_len(),
                "parameter of {len} elements exceeds the configured buffer size"
            );
            self.advance_node(control, provider)?;
        }
        let start = self.pos;
        self.pos += len;
        Ok((self.nodes[self.current].clone(), start))
    }

    fn advance_node(
        &mut self,
        control: &mut ControlWriter,
        provider: &dyn BufferProvider,
    ) -> BridgeResult<()> {
        if self.current + 1 >= self.nodes.len() {
            self.nodes.push(provider.request(self.kind, self.buffer_len())?);
        }
        let next_id = self.nodes[self.current + 1].id();
        // the rotation goes in front of the data written after it
        control.directive(DIR_SET_QUEUE_BUFFER, &[self.queue_id, next_id], provider)?;
        self.current += 1;
        self.pos = 0;
        Ok(())
    }

    fn release_spares(&mut self, provider: &dyn BufferProvider) {
        debug_assert!(self.is_reset());
        for node in self.nodes.drain(1..) {
            if let Err(err) = provider.release(node.id()) {
                tracing::warn!(id = node.id(), %err, "spare buffer release failed");
            }
        }
    }
}

/// Location of the parameter-count field of the message being built.
///
/// The count is written incrementally as parameters are pushed, so it may
/// live in an earlier buffer than the descriptors it counts.
struct CountCell {
    buffer: Arc<SharedBuffer>,
    index: usize,
    routed: bool,
}

/// Writer cursor over the control channel.
struct ControlWriter {
    nodes: Vec<Arc<SharedBuffer>>,
    current: usize,
    pos: usize,
    count_cell: Option<CountCell>,
    advancing: bool,
}

impl ControlWriter {
    fn new(elems: usize, provider: &dyn BufferProvider) -> BridgeResult<Self> {
        let first = provider.request(ElemKind::I32, elems)?;
        // idle until the first record overwrites the sentinel
        first.set::<i32>(0, EMPTY_QUEUE_CODE);
        Ok(Self {
            nodes: vec![first],
            current: 0,
            pos: 0,
            count_cell: None,
            advancing: false,
        })
    }

    fn first_buffer_id(&self) -> i32 {
        self.nodes[0].id()
    }

    fn buffer_len(&self) -> usize {
        self.nodes[0].len()
    }

    fn has_messages_pending(&self) -> bool {
        self.nodes[0].get::<i32>(0) != EMPTY_QUEUE_CODE
    }

    fn is_reset(&self) -> bool {
        self.current == 0 && self.pos == 0
    }

    fn reset(&mut self) {
        self.current = 0;
        self.pos = 0;
        self.count_cell = None;
    }

    /// Reserves `len` ints. Unlike the data chains, the control chain keeps
    /// enough slack at every buffer tail for its own rotate directive, so
    /// the rotation can always be written into the buffer it rotates away
    /// from.
    fn alloc(
        &mut self,
        len: usize,
        provider: &dyn BufferProvider,
    ) -> BridgeResult<(Arc<SharedBuffer>, usize)> {
        if self.pos + len >= self.buffer_len() - ROTATE_DIRECTIVE_LEN {
            self.advance_node(provider)?;
        }
        let start = self.pos;
        self.pos += len;
        Ok((self.nodes[self.current].clone(), start))
    }

    fn advance_node(&mut self, provider: &dyn BufferProvider) -> BridgeResult<()> {
        // re-entered from our own rotate directive: the reserved tail takes it
        if self.advancing {
            return Ok(());
        }
        self.advancing = true;
        let result = self.advance_node_inner(provider);
        self.advancing = false;
        result
    }

    fn advance_node_inner(&mut self, provider: &dyn BufferProvider) -> BridgeResult<()> {
        if self.current + 1 >= self.nodes.len() {
            self.nodes.push(provider.request(ElemKind::I32, self.buffer_len())?);
        }
        let next_id = self.nodes[self.current + 1].id();
        self.directive(DIR_SET_QUEUE_BUFFER, &[CONTROL_QUEUE_ID, next_id], provider)?;
        self.current += 1;
        self.pos = 0;
        Ok(())
    }

    /// Writes a control directive: `[0][id][-argCount][args...]`. Directives
    /// never touch the count cell; they may legally interleave with the
    /// parameters of the message being built.
    fn directive(&mut self, id: i32, args: &[i32], provider: &dyn BufferProvider) -> BridgeResult<()> {
        let (buf, start) = self.alloc(3 + args.len(), provider)?;
        buf.set::<i32>(start, ENGINE_RECEIVER_ID);
        buf.set::<i32>(start + 1, id);
        buf.set::<i32>(start + 2, -(args.len() as i32));
        for (i, arg) in args.iter().enumerate() {
            buf.set::<i32>(start + 3 + i, *arg);
        }
        Ok(())
    }

    fn begin_message(&mut self, receiver_id: i32, message_id: i32, provider: &dyn BufferProvider) -> BridgeResult<()> {
        let (buf, start) = self.alloc(3, provider)?;
        buf.set::<i32>(start, receiver_id);
        buf.set::<i32>(start + 1, message_id);
        buf.set::<i32>(start + 2, 0);
        self.count_cell = Some(CountCell {
            buffer: buf,
            index: start + 2,
            routed: false,
        });
        Ok(())
    }

    fn begin_routed_message(
        &mut self,
        receiver_field: i32,
        message_field: i32,
        routing_id: i32,
        provider: &dyn BufferProvider,
    ) -> BridgeResult<()> {
        let (buf, start) = self.alloc(4, provider)?;
        buf.set::<i32>(start, receiver_field);
        buf.set::<i32>(start + 1, message_field);
        buf.set::<i32>(start + 2, encode_routed_count(0));
        buf.set::<i32>(start + 3, routing_id);
        self.count_cell = Some(CountCell {
            buffer: buf,
            index: start + 2,
            routed: true,
        });
        Ok(())
    }

    fn register_scalar(&mut self, queue_id: i32, provider: &dyn BufferProvider) -> BridgeResult<()> {
        let (buf, start) = self.alloc(1, provider)?;
        buf.set::<i32>(start, queue_id);
        self.bump_count();
        Ok(())
    }

    fn register_array(&mut self, queue_id: i32, len: i32, provider: &dyn BufferProvider) -> BridgeResult<()> {
        let (buf, start) = self.alloc(2, provider)?;
        // negated queue id marks an array parameter; the length follows
        buf.set::<i32>(start, -queue_id);
        buf.set::<i32>(start + 1, len);
        self.bump_count();
        Ok(())
    }

    fn bump_count(&mut self) {
        let cell = self
            .count_cell
            .as_ref()
            .expect("parameter pushed with no message in progress");
        let current = cell.buffer.get::<i32>(cell.index);
        let next = if cell.routed {
            // encoded as -(n + 1): stays negative for any count
            current - 1
        } else {
            current + 1
        };
        cell.buffer.set::<i32>(cell.index, next);
    }

    fn release_spares(&mut self, provider: &dyn BufferProvider) {
        debug_assert!(self.is_reset());
        for node in self.nodes.drain(1..) {
            if let Err(err) = provider.release(node.id()) {
                tracing::warn!(id = node.id(), %err, "spare control buffer release failed");
            }
        }
    }
}

fn kind_index(kind: ElemKind) -> usize {
    match kind {
        ElemKind::U8 => 0,
        ElemKind::I32 => 1,
        ElemKind::I64 => 2,
        ElemKind::F32 => 3,
        ElemKind::F64 => 4,
    }
}

struct ProducerState {
    provider: Arc<dyn BufferProvider>,
    control: ControlWriter,
    queues: Vec<Option<WriteChain>>,
    kind_queues: [Option<i32>; 5],
    next_queue_id: i32,
    next_routing_id: i32,
    ids_buffer: Arc<SharedBuffer>,
    buffer_bytes: usize,
}

impl ProducerState {
    /// Channel id for `kind`, creating and announcing the channel on first
    /// use. Ids are assigned by usage order and keep their meaning for the
    /// producer's lifetime.
    fn ensure_queue(&mut self, kind: ElemKind) -> BridgeResult<i32> {
        if let Some(id) = self.kind_queues[kind_index(kind)] {
            return Ok(id);
        }

        let id = self.next_queue_id;
        debug_assert!((id as usize) < MAX_QUEUES);
        let elems = (self.buffer_bytes / kind.size()).max(1);
        let chain = WriteChain::new(id, kind, elems, self.provider.as_ref())?;
        self.control.directive(
            DIR_SET_QUEUE_FIRST_BUFFER,
            &[id, chain.first_buffer_id()],
            self.provider.as_ref(),
        )?;

        self.queues[id as usize] = Some(chain);
        self.kind_queues[kind_index(kind)] = Some(id);
        self.next_queue_id += 1;
        Ok(id)
    }

    fn data_alloc(&mut self, queue_id: i32, len: usize) -> BridgeResult<(Arc<SharedBuffer>, usize)> {
        let ProducerState {
            provider,
            control,
            queues,
            ..
        } = self;
        let chain = queues[queue_id as usize]
            .as_mut()
            .expect("channel created by ensure_queue");
        chain.alloc(len, control, provider.as_ref())
    }

    fn push_scalar<T: Elem>(&mut self, value: T) -> BridgeResult<()> {
        let queue_id = self.ensure_queue(T::KIND)?;
        let (buf, start) = self.data_alloc(queue_id, 1)?;
        buf.set::<T>(start, value);
        self.control.register_scalar(queue_id, self.provider.as_ref())
    }

    fn push_array<T: Elem>(&mut self, items: &[T]) -> BridgeResult<()> {
        let queue_id = self.ensure_queue(T::KIND)?;
        let (buf, start) = self.data_alloc(queue_id, items.len())?;
        buf.copy_from::<T>(start, items);
        self.control
            .register_array(queue_id, items.len() as i32, self.provider.as_ref())
    }

    fn push_fill<T: Elem>(&mut self, len: usize) -> BridgeResult<ArrayFill<T>> {
        let queue_id = self.ensure_queue(T::KIND)?;
        let (buf, start) = self.data_alloc(queue_id, len)?;
        self.control
            .register_array(queue_id, len as i32, self.provider.as_ref())?;
        Ok(ArrayFill::new(buf, start, len))
    }

    /// Pushes bytes onto the byte channel with no descriptor: in-band name
    /// payloads for routed addressing.
    fn push_bytes_raw(&mut self, bytes: &[u8]) -> BridgeResult<()> {
        let queue_id = self.ensure_queue(ElemKind::U8)?;
        let (buf, start) = self.data_alloc(queue_id, bytes.len())?;
        buf.copy_from::<u8>(start, bytes);
        Ok(())
    }

    fn start_delivering(&mut self) -> BridgeResult<()> {
        self.control
            .begin_message(ENGINE_RECEIVER_ID, MSG_FINISH_DELIVERING, self.provider.as_ref())?;

        // everything enqueued is about to be consumed: rewind for next tick
        self.control.reset();
        for chain in self.queues.iter_mut().flatten() {
            chain.reset();
        }
        Ok(())
    }
}

/// Routed-message target: a registry slot id or an in-band lookup name.
#[derive(Clone, Copy, Debug)]
pub enum RoutedRef<'a> {
    Id(i32),
    Name(&'a str),
}

/// Routed-message handler selector: a message id or an in-band method name.
#[derive(Clone, Copy, Debug)]
pub enum MethodRef<'a> {
    Id(i32),
    Name(&'a str),
}

/// Writer endpoint of the bridge. Cheap to clone; all clones share one
/// writer cursor per channel.
#[derive(Clone)]
pub struct Producer {
    state: Arc<Mutex<ProducerState>>,
}

impl Producer {
    pub(crate) fn new(provider: Arc<dyn BufferProvider>, config: BridgeConfig) -> BridgeResult<Self> {
        let config = config.clamped();

        let control_elems = config.queue_buffer_bytes / ElemKind::I32.size();
        let mut control = ControlWriter::new(control_elems, provider.as_ref())?;

        let ids_buffer = provider.request(ElemKind::I32, config.max_receiver_ids)?;
        free_list::init(&ids_buffer);
        control.directive(
            DIR_SET_RECEIVER_IDS_BUFFER,
            &[ids_buffer.id()],
            provider.as_ref(),
        )?;

        Ok(Self {
            state: Arc::new(Mutex::new(ProducerState {
                provider,
                control,
                queues: (0..MAX_QUEUES).map(|_| None).collect(),
                kind_queues: [None; 5],
                // channel 0 is the control queue
                next_queue_id: 1,
                next_routing_id: 0,
                ids_buffer,
                buffer_bytes: config.queue_buffer_bytes,
            })),
        })
    }

    /// Id of the first control buffer: the engine's bootstrap handle.
    pub fn control_buffer_id(&self) -> i32 {
        self.state.lock().control.first_buffer_id()
    }

    /// Pops a receiver id from the shared free list, for handing to the
    /// engine side inside a creation message. Messages may target the id
    /// immediately, before the engine has bound a receiver to it.
    pub fn new_receiver_id(&self) -> Option<i32> {
        let state = self.state.lock();
        let id = free_list::pop(&state.ids_buffer);
        if id.is_none() {
            tracing::error!("receiver id pool exhausted; raise the configured maximum");
        }
        id
    }

    /// Enqueues a message with no parameters.
    pub fn send(&self, receiver_id: i32, message_id: i32) -> BridgeResult<()> {
        self.message(receiver_id, message_id).map(drop)
    }

    /// Starts a plain message; parameters are pushed through the returned
    /// builder and the header count tracks them as they land.
    pub fn message(&self, receiver_id: i32, message_id: i32) -> BridgeResult<MessageBuilder<'_>> {
        if receiver_id < 0 {
            return Err(BridgeError::InvalidMessage(
                "plain messages require a non-negative receiver id",
            ));
        }
        if message_id < 0 {
            return Err(BridgeError::InvalidMessage(
                "negative message ids are reserved for in-band method names",
            ));
        }
        let mut state = self.state.lock();
        let provider = state.provider.clone();
        state
            .control
            .begin_message(receiver_id, message_id, provider.as_ref())?;
        Ok(MessageBuilder { state })
    }

    /// Starts a routed message: 4-int header, count encoded as `-(n + 1)`,
    /// target and method optionally named in-band through the byte channel.
    pub fn routed_message(
        &self,
        target: RoutedRef<'_>,
        routing_id: i32,
        method: MethodRef<'_>,
    ) -> BridgeResult<MessageBuilder<'_>> {
        if routing_id < 0 {
            return Err(BridgeError::InvalidMessage(
                "routed messages require a non-negative routing id",
            ));
        }

        let mut state = self.state.lock();
        let provider = state.provider.clone();

        // in-band names ride the byte queue ahead of the header: target
        // first, then method, the order the engine consumes them in
        let receiver_field = match target {
            RoutedRef::Id(id) if id > 0 => id,
            RoutedRef::Id(_) => {
                return Err(BridgeError::InvalidMessage(
                    "routed messages cannot target the reserved engine receiver",
                ))
            }
            RoutedRef::Name(name) => {
                if name.is_empty() {
                    return Err(BridgeError::InvalidMessage("routed target name is empty"));
                }
                state.push_bytes_raw(name.as_bytes())?;
                -(name.len() as i32)
            }
        };
        let message_field = match method {
            MethodRef::Id(id) if id >= 0 => id,
            MethodRef::Id(_) => {
                return Err(BridgeError::InvalidMessage(
                    "routed method ids must be non-negative",
                ))
            }
            MethodRef::Name(name) => {
                if name.is_empty() {
                    return Err(BridgeError::InvalidMessage("routed method name is empty"));
                }
                state.push_bytes_raw(name.as_bytes())?;
                -(name.len() as i32)
            }
        };

        state
            .control
            .begin_routed_message(receiver_field, message_field, routing_id, provider.as_ref())?;
        Ok(MessageBuilder { state })
    }

    /// Registers a component type for routed addressing and returns the
    /// routing id the engine will associate with `type_name`.
    pub fn register_component_type(&self, type_name: &str) -> BridgeResult<i32> {
        if type_name.is_empty() {
            return Err(BridgeError::InvalidMessage("component type name is empty"));
        }
        let routing_id = {
            let mut state = self.state.lock();
            let id = state.next_routing_id;
            state.next_routing_id += 1;
            id
        };
        self.message(ENGINE_RECEIVER_ID, MSG_REGISTER_COMPONENT)?
            .push(routing_id)?
            .push_str(type_name)?;
        Ok(routing_id)
    }

    /// Returns every buffer except each chain's first to the provider.
    /// Only legal while no messages are pending; useful when the host
    /// application loses focus and wants its memory back.
    pub fn release_spare_buffers(&self) {
        let mut state = self.state.lock();
        if state.control.has_messages_pending() {
            tracing::error!("cannot release queue buffers while messages are pending");
            return;
        }
        let ProducerState {
            provider,
            control,
            queues,
            ..
        } = &mut *state;
        control.release_spares(provider.as_ref());
        for chain in queues.iter_mut().flatten() {
            chain.release_spares(provider.as_ref());
        }
    }
}

impl ProducerControl for Producer {
    fn on_start_delivering(&self) {
        if let Err(err) = self.state.lock().start_delivering() {
            tracing::error!(%err, "finish message could not be enqueued");
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Producer")
            .field("control_buffer", &state.control.first_buffer_id())
            .field("channels", &(state.next_queue_id - 1))
            .finish()
    }
}

/// In-progress message. Holds the producer lock: one message is built at a
/// time, mirroring the single-writer discipline of the wire.
pub struct MessageBuilder<'a> {
    state: MutexGuard<'a, ProducerState>,
}

impl MessageBuilder<'_> {
    /// Pushes a scalar parameter.
    pub fn push<T: Elem>(mut self, value: T) -> BridgeResult<Self> {
        self.state.push_scalar(value)?;
        Ok(self)
    }

    /// Pushes an array parameter, copying `items` into the queue.
    pub fn push_array<T: Elem>(mut self, items: &[T]) -> BridgeResult<Self> {
        self.state.push_array(items)?;
        Ok(self)
    }

    /// Pushes a string parameter as a byte array.
    pub fn push_str(self, text: &str) -> BridgeResult<Self> {
        self.push_array(text.as_bytes())
    }

    /// Reserves an array parameter and returns the writable window, for
    /// filling in place without staging a temporary array. Fill it before
    /// the engine's next delivery pass.
    pub fn push_array_to_fill<T: Elem>(&mut self, len: usize) -> BridgeResult<ArrayFill<T>> {
        self.state.push_fill(len)
    }

    /// Completes the message. Dropping the builder does the same; this just
    /// reads better at call sites.
    pub fn finish(self) {}
}
