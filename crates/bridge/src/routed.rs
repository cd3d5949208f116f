//! Extended (routed) addressing support.
//!
//! Routed messages select a sub-target beyond the base receiver id: the
//! routing id names a component *type* (registered over the wire by the
//! producer), the target object resolves that type to a capability, and an
//! optionally in-band method name picks the handler within it. The queue
//! core never inspects types at runtime; everything funnels through the
//! capability interfaces below, and a dispatch table stands in for
//! reflection.

use crate::message::Message;
use crate::registry::{Receiver, ReceiverHandle};
use std::collections::HashMap;
use std::sync::Arc;

/// External-object handle a routed message lands on.
///
/// Implementations map a component type name to the receiver endpoint
/// handling messages for that component on this particular object.
pub trait RoutedTarget: Send + Sync {
    fn capability(&self, type_name: &str) -> Option<ReceiverHandle>;
}

/// Resolves by-name routed targets (negative receiver id framing: the name
/// rides the byte queue instead of a slot id).
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn RoutedTarget>>;
}

/// Wire-registered association between routing ids and component type names.
#[derive(Default)]
pub(crate) struct ComponentTable {
    names: HashMap<i32, String>,
}

impl ComponentTable {
    pub fn register(&mut self, routing_id: i32, type_name: String) {
        if routing_id < 0 {
            tracing::error!(routing_id, "component registration with negative routing id");
            return;
        }
        if let Some(previous) = self.names.insert(routing_id, type_name) {
            tracing::warn!(routing_id, previous, "component routing id re-registered");
        }
    }

    pub fn name_of(&self, routing_id: i32) -> Option<&str> {
        self.names.get(&routing_id).map(String::as_str)
    }
}

type MethodFn = Box<dyn FnMut(&mut Message<'_>) + Send>;

/// Method-name dispatch table: the reflection replacement.
///
/// A capability built from a `MethodTable` handles routed messages whose
/// message id encodes an in-band method name; unknown names are reported and
/// the engine skips the message's parameters as usual.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`. Builder-style for table literals.
    pub fn on(
        mut self,
        name: impl Into<String>,
        handler: impl FnMut(&mut Message<'_>) + Send + 'static,
    ) -> Self {
        self.methods.insert(name.into(), Box::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl Receiver for MethodTable {
    fn receive(&mut self, msg: &mut Message<'_>) {
        let Some(name) = msg.method_name().map(str::to_owned) else {
            tracing::error!(
                message_id = msg.message_id(),
                "method table received a message without a method name"
            );
            return;
        };
        match self.methods.get_mut(&name) {
            Some(handler) => handler(msg),
            None => tracing::error!(method = %name, "no handler registered for routed method"),
        }
    }
}
