//! Receiver registry: id allocation and receiver endpoint slots.
//!
//! Free receiver ids form a singly linked list threaded through a shared
//! integer buffer so both bridge halves can allocate from the same pool:
//! position 0 holds the head, a free slot holds the index of the next free
//! slot, and `-1` marks a slot that is allocated but not yet bound. Id 0 is
//! the engine's own internal receiver and never enters the free list.

use crate::message::Message;
use crate::routed::RoutedTarget;
use parking_lot::Mutex;
use shm::{ElemKind, SharedBuffer};
use std::collections::HashMap;
use std::sync::Arc;

/// Endpoint capable of handling delivered messages.
///
/// The cursor is valid only for the duration of the call; parameters left
/// unread are skipped by the engine afterwards.
pub trait Receiver: Send {
    fn receive(&mut self, msg: &mut Message<'_>);
}

pub type ReceiverHandle = Arc<Mutex<dyn Receiver>>;

/// In-buffer free list shared by producer and engine.
pub(crate) mod free_list {
    use shm::SharedBuffer;

    /// Marker stored at an allocated slot's position while it is in use.
    pub const IN_USE: i32 = -1;

    /// Threads the whole table into one free chain. Id 0 stays off the list:
    /// the head lives there.
    pub fn init(buf: &SharedBuffer) {
        let len = buf.len();
        for i in 0..len {
            buf.set::<i32>(i, (i + 1) as i32);
        }
        // 0 terminates the chain: "no free id beyond this one"
        buf.set::<i32>(len - 1, 0);
    }

    /// Pops the head of the free list, or `None` when the pool is exhausted.
    pub fn pop(buf: &SharedBuffer) -> Option<i32> {
        let head = buf.get::<i32>(0);
        if head == 0 {
            return None;
        }
        buf.set::<i32>(0, buf.get::<i32>(head as usize));
        buf.set::<i32>(head as usize, IN_USE);
        Some(head)
    }

    /// Pushes `id` back onto the head of the free list.
    pub fn push(buf: &SharedBuffer, id: i32) {
        buf.set::<i32>(id as usize, buf.get::<i32>(0));
        buf.set::<i32>(0, id);
    }
}

#[derive(Default)]
struct Slot {
    receiver: Option<ReceiverHandle>,
    target: Option<Arc<dyn RoutedTarget>>,
    /// Capability cache consulted only for routed messages.
    caps: HashMap<i32, ReceiverHandle>,
}

/// Id-indexed receiver slot table.
pub(crate) struct Registry {
    ids: Option<Arc<SharedBuffer>>,
    slots: Vec<Slot>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            ids: None,
            slots: Vec::new(),
        }
    }

    /// Binds the free-list storage announced by the producer's directive.
    pub fn bind_id_buffer(&mut self, buffer: Arc<SharedBuffer>) {
        if buffer.kind() != ElemKind::I32 {
            tracing::error!(
                id = buffer.id(),
                kind = ?buffer.kind(),
                "receiver-id table must be an integer buffer"
            );
            return;
        }
        self.slots = (0..buffer.len()).map(|_| Slot::default()).collect();
        tracing::debug!(id = buffer.id(), capacity = buffer.len(), "receiver-id table bound");
        self.ids = Some(buffer);
    }

    fn ids(&self) -> Option<Arc<SharedBuffer>> {
        if self.ids.is_none() {
            tracing::error!("receiver-id table not bound yet");
        }
        self.ids.clone()
    }

    /// Pops a fresh receiver id. Exhaustion is a configuration-sizing error:
    /// it is reported and `None` is returned, never thrown.
    pub fn allocate_id(&mut self) -> Option<i32> {
        let buf = self.ids()?;
        let id = free_list::pop(&buf);
        if id.is_none() {
            tracing::error!("receiver id pool exhausted; raise the configured maximum");
        }
        id
    }

    /// Attaches `receiver` to a previously allocated, still-unbound id.
    /// Rejects (reports, does not mutate) ids that were never allocated.
    pub fn bind(&mut self, id: i32, receiver: ReceiverHandle) -> bool {
        let Some(buf) = self.ids() else { return false };
        let Ok(index) = usize::try_from(id) else {
            tracing::error!(id, "receiver id out of range");
            return false;
        };
        if index == 0 || index >= self.slots.len() {
            tracing::error!(id, "receiver id out of range");
            return false;
        }
        if buf.get::<i32>(index) != free_list::IN_USE {
            tracing::error!(id, "attempt to bind a receiver to an unallocated id");
            return false;
        }
        self.slots[index].receiver = Some(receiver);
        true
    }

    /// Attaches the external-object handle consulted for routed messages.
    pub fn bind_target(&mut self, id: i32, target: Arc<dyn RoutedTarget>) -> bool {
        let Some(buf) = self.ids() else { return false };
        let Ok(index) = usize::try_from(id) else {
            tracing::error!(id, "receiver id out of range");
            return false;
        };
        if index == 0 || index >= self.slots.len() {
            tracing::error!(id, "receiver id out of range");
            return false;
        }
        if buf.get::<i32>(index) != free_list::IN_USE {
            tracing::error!(id, "attempt to bind a target to an unallocated id");
            return false;
        }
        self.slots[index].target = Some(target);
        true
    }

    /// Validates the id is currently allocated, clears its endpoints, and
    /// pushes it back onto the free list.
    pub fn release(&mut self, id: i32) {
        let Some(buf) = self.ids() else { return };
        let Ok(index) = usize::try_from(id) else {
            tracing::error!(id, "receiver id out of range");
            return;
        };
        if index == 0 || index >= self.slots.len() {
            tracing::error!(id, "receiver id out of range");
            return;
        }
        if buf.get::<i32>(index) != free_list::IN_USE {
            tracing::warn!(id, "attempt to release a receiver id not in use");
            return;
        }
        let slot = &mut self.slots[index];
        slot.receiver = None;
        slot.target = None;
        slot.caps.clear();
        free_list::push(&buf, id);
    }

    pub fn get(&self, id: i32) -> Option<ReceiverHandle> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.slots.get(index))
            .and_then(|slot| slot.receiver.clone())
    }

    /// Resolves the sub-receiver for `(id, routing_id)`, caching the lookup
    /// so repeated routed messages skip the target's resolution path.
    pub fn capability(&mut self, id: i32, routing_id: i32, type_name: &str) -> Option<ReceiverHandle> {
        let index = usize::try_from(id).ok()?;
        let slot = self.slots.get_mut(index)?;
        if let Some(cap) = slot.caps.get(&routing_id) {
            return Some(cap.clone());
        }
        let cap = slot.target.as_ref()?.capability(type_name)?;
        slot.caps.insert(routing_id, cap.clone());
        Some(cap)
    }
}
