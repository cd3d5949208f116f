//! Bidirectional message bridge over pre-allocated shared buffers.
//!
//! Two cooperating halves exchange typed, variable-arity messages without
//! per-call marshalling: the [`Producer`] writes headers, parameter
//! descriptors, and in-band control directives into chained shared buffers,
//! and the [`Engine`] drains them once per tick, dispatching each message to
//! its [`Receiver`] through a single-pass [`Message`] cursor.
//!
//! The wire is hand-rolled, self-describing integer records, with no framing
//! library or serializer. Buffer rotation, channel binding, and the
//! end-of-pass sentinel all travel in-band on the control channel and are
//! intercepted transparently by the reader.

mod builder;
mod chain;
mod config;
mod control;
mod engine;
mod error;
mod message;
mod producer;
mod queues;
mod registry;
mod routed;
mod view;
pub mod wire;

pub use builder::{build_bridge, build_bridge_with};
pub use config::{BridgeConfig, MIN_QUEUE_BUFFER_BYTES, MIN_RECEIVER_IDS};
pub use engine::{Engine, ProducerControl};
pub use error::{BridgeError, BridgeResult};
pub use message::Message;
pub use producer::{MessageBuilder, MethodRef, Producer, RoutedRef};
pub use registry::{Receiver, ReceiverHandle};
pub use routed::{MethodTable, RoutedTarget, TargetResolver};
pub use view::{ArrayFill, ArrayView};
