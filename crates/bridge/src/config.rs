//! Bridge sizing configuration.

/// Fewer receiver slots than this is never useful: slot 0 is reserved and
/// real scenes hold more than a handful of receivers.
pub const MIN_RECEIVER_IDS: usize = 16;

/// Below this, buffer rotation overhead dominates the traffic.
pub const MIN_QUEUE_BUFFER_BYTES: usize = 512;

/// Sizing knobs for one bridge instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Maximum number of simultaneously allocated receiver ids.
    pub max_receiver_ids: usize,
    /// Size in bytes of each queue buffer, for every element kind; a kind's
    /// element count is derived from its element size.
    pub queue_buffer_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_receiver_ids: 64,
            queue_buffer_bytes: 2048,
        }
    }
}

impl BridgeConfig {
    /// Forces the configured minimums, warning when a value had to be raised.
    pub fn clamped(self) -> Self {
        let mut clamped = self;
        if clamped.max_receiver_ids < MIN_RECEIVER_IDS {
            tracing::warn!(
                requested = clamped.max_receiver_ids,
                minimum = MIN_RECEIVER_IDS,
                "max_receiver_ids below minimum; forcing it"
            );
            clamped.max_receiver_ids = MIN_RECEIVER_IDS;
        }
        if clamped.queue_buffer_bytes < MIN_QUEUE_BUFFER_BYTES {
            tracing::warn!(
                requested = clamped.queue_buffer_bytes,
                minimum = MIN_QUEUE_BUFFER_BYTES,
                "queue_buffer_bytes below minimum; forcing it"
            );
            clamped.queue_buffer_bytes = MIN_QUEUE_BUFFER_BYTES;
        }
        clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamping_forces_minimums() {
        let config = BridgeConfig {
            max_receiver_ids: 2,
            queue_buffer_bytes: 64,
        }
        .clamped();
        assert_eq!(config.max_receiver_ids, MIN_RECEIVER_IDS);
        assert_eq!(config.queue_buffer_bytes, MIN_QUEUE_BUFFER_BYTES);
    }

    #[test]
    fn valid_values_pass_through() {
        let config = BridgeConfig::default().clamped();
        assert_eq!(config, BridgeConfig::default());
    }
}
