//! Wire protocol constants and framing.
//!
//! The control channel carries nothing but `i32` records, mixing three kinds
//! of content in one stream:
//!
//! ```text
//! plain header:   [receiverId][messageId][paramCount >= 0]
//! routed header:  [receiverId][messageId][-(count + 1)][routingId]
//! scalar param:   [queueId > 0]
//! array param:    [-queueId][length >= 0]
//! directive:      [0][directiveId][-argCount][arg0..argN-1]
//! ```
//!
//! A directive is recognised by `receiverId == 0` together with a *negative*
//! count field; a message legitimately addressed to the reserved engine
//! receiver carries a non-negative count and is dispatched like any other.
//! Position 0 of the first control buffer holds either live stream data or
//! [`EMPTY_QUEUE_CODE`], the sole end-of-pass signal.

/// Channel id of the control queue. Must be 0 on both sides.
pub const CONTROL_QUEUE_ID: i32 = 0;

/// Receiver id reserved for the engine's own internal receiver.
pub const ENGINE_RECEIVER_ID: i32 = 0;

/// Written to position 0 of the first control buffer once a delivery pass
/// has consumed every message. Reserved: no valid stream starts with it.
pub const EMPTY_QUEUE_CODE: i32 = -123_456;

/// Upper bound on simultaneously live channels (control + one per element
/// kind actually used). Matches the writer side's channel-id space.
pub const MAX_QUEUES: usize = 32;

/// Ints occupied by one rotate directive (3-int frame + 2 inline args). The
/// control writer keeps this much slack at the tail of every buffer so the
/// rotation announcing the *next* buffer always fits in the current one.
pub const ROTATE_DIRECTIVE_LEN: usize = 5;

/// Directive ids, intercepted in place by the reader.
pub const DIR_SET_QUEUE_BUFFER: i32 = 0;
pub const DIR_SET_QUEUE_FIRST_BUFFER: i32 = 1;
pub const DIR_SET_RECEIVER_IDS_BUFFER: i32 = 2;

/// Message ids handled by the engine's internal receiver (id 0). These travel
/// as ordinary messages: the negative-count directive framing cannot express
/// zero inline arguments, and component registration needs a string
/// parameter, which directives do not carry.
pub const MSG_FINISH_DELIVERING: i32 = 3;
pub const MSG_REGISTER_COMPONENT: i32 = 4;

/// Marks "no routing" in a decoded header.
pub const NO_ROUTING: i32 = -1;

/// Encodes a routed parameter count. Zero parameters encode as `-1`, not `0`:
/// the sign carries the addressing mode, so the magnitude is shifted by one.
pub const fn encode_routed_count(count: i32) -> i32 {
    -(count + 1)
}

/// Inverse of [`encode_routed_count`].
pub const fn decode_routed_count(encoded: i32) -> i32 {
    -encoded - 1
}

/// Decoded message header. Constructed transiently while draining the
/// control queue; one header is live at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub receiver_id: i32,
    pub message_id: i32,
    /// True parameter count, sign already stripped.
    pub param_count: i32,
    /// Routing id for routed addressing, [`NO_ROUTING`] for plain messages.
    pub routing_id: i32,
}

impl MessageHeader {
    /// True when this header used the 4-int routed framing.
    pub fn is_routed(&self) -> bool {
        self.routing_id != NO_ROUTING
    }
}

/// Descriptor of the next parameter, always derived fresh from the control
/// cursor and never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamDescriptor {
    /// Target parameter queue, negative when no parameter remains.
    pub queue_id: i32,
    /// Array length, `-1` for a scalar.
    pub array_len: i32,
}

impl ParamDescriptor {
    pub const NONE: ParamDescriptor = ParamDescriptor {
        queue_id: -1,
        array_len: 0,
    };

    pub fn scalar(queue_id: i32) -> Self {
        Self {
            queue_id,
            array_len: -1,
        }
    }

    pub fn array(queue_id: i32, len: i32) -> Self {
        Self {
            queue_id,
            array_len: len,
        }
    }

    /// True when no parameter remains for the current message.
    pub fn is_none(&self) -> bool {
        self.queue_id < 0
    }

    /// True when the described parameter is an array.
    pub fn is_array(&self) -> bool {
        self.array_len >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routed_count_shifts_by_one() {
        // zero routed parameters encode as -1, never 0; the sign is the mode
        assert_eq!(encode_routed_count(0), -1);
        assert_eq!(encode_routed_count(3), -4);
        for count in 0..16 {
            assert_eq!(decode_routed_count(encode_routed_count(count)), count);
            assert!(encode_routed_count(count) < 0);
        }
    }

    #[test]
    fn descriptor_classification() {
        assert!(ParamDescriptor::NONE.is_none());
        assert!(!ParamDescriptor::scalar(2).is_none());
        assert!(!ParamDescriptor::scalar(2).is_array());
        assert!(ParamDescriptor::array(2, 0).is_array());
        assert!(ParamDescriptor::array(2, 7).is_array());
    }

    #[test]
    fn empty_code_is_out_of_band() {
        // a header never starts with the sentinel: receiver ids are slot
        // indices and stay small and non-negative
        assert!(EMPTY_QUEUE_CODE < 0);
        assert_ne!(EMPTY_QUEUE_CODE, encode_routed_count(0));
    }
}
