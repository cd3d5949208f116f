//! Wires both bridge halves over one buffer provider.

use crate::config::BridgeConfig;
use crate::engine::Engine;
use crate::producer::Producer;
use anyhow::{Context, Result};
use shm::{BufferPool, BufferProvider};
use std::sync::Arc;

/// Builds a connected producer/engine pair over an in-process buffer pool.
///
/// The returned engine has already consumed the bootstrap stream (receiver-id
/// table binding and the initial finish) and sits idle.
pub fn build_bridge(config: BridgeConfig) -> Result<(Producer, Engine)> {
    build_bridge_with(Arc::new(BufferPool::new()), config)
}

/// Variant of [`build_bridge`] over a caller-supplied provider.
pub fn build_bridge_with(
    provider: Arc<dyn BufferProvider>,
    config: BridgeConfig,
) -> Result<(Producer, Engine)> {
    let producer = Producer::new(provider.clone(), config).context("producer setup failed")?;
    let control_buffer_id = producer.control_buffer_id();
    let engine = Engine::new(provider, control_buffer_id, Arc::new(producer.clone()))
        .context("engine setup failed")?;
    Ok((producer, engine))
}
