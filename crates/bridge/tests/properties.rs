//! Property coverage: FIFO order under rotation, skip-equivalence, and
//! randomized multi-tick stress.

use bridge::{build_bridge, BridgeConfig, Message, Receiver};
use parking_lot::Mutex;
use proptest::prelude::*;
use rand::prelude::*;
// Both proptest and rand glob-export a `Rng` trait; name rand's explicitly so
// its `gen`/`gen_range`/`gen_bool` methods resolve.
use rand::Rng as _;
use std::sync::Arc;

struct FnReceiver<F: FnMut(&mut Message<'_>) + Send>(F);

impl<F: FnMut(&mut Message<'_>) + Send> Receiver for FnReceiver<F> {
    fn receive(&mut self, msg: &mut Message<'_>) {
        (self.0)(msg)
    }
}

/// One generated parameter: scalar or array, all i32 to keep the model flat.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Param {
    Scalar(i32),
    Array(Vec<i32>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Msg {
    message_id: i32,
    params: Vec<Param>,
}

fn param_strategy() -> impl Strategy<Value = Param> {
    prop_oneof![
        any::<i32>().prop_map(Param::Scalar),
        prop::collection::vec(any::<i32>(), 0..12).prop_map(Param::Array),
    ]
}

fn stream_strategy() -> impl Strategy<Value = Vec<Msg>> {
    prop::collection::vec(
        (0..64i32, prop::collection::vec(param_strategy(), 0..5))
            .prop_map(|(message_id, params)| Msg { message_id, params }),
        1..40,
    )
}

fn send_stream(producer: &bridge::Producer, receiver: i32, stream: &[Msg]) {
    for msg in stream {
        let mut builder = producer
            .message(receiver, msg.message_id)
            .expect("begin message");
        for param in &msg.params {
            builder = match param {
                Param::Scalar(value) => builder.push(*value).expect("push scalar"),
                Param::Array(items) => builder.push_array(items).expect("push array"),
            };
        }
        builder.finish();
    }
}

fn read_all(msg: &mut Message<'_>) -> Vec<Param> {
    let mut params = Vec::new();
    while msg.params_to_read() > 0 {
        if msg.next_param_is_array() {
            let view = msg.read_next_array::<i32>().expect("array param");
            params.push(Param::Array(view.to_vec()));
        } else {
            params.push(Param::Scalar(msg.read_next::<i32>().expect("scalar param")));
        }
    }
    params
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Draining yields headers and parameters in exact enqueue order, no
    /// matter how many buffer rotations the tiny buffers force mid-stream.
    #[test]
    fn fifo_order_is_preserved(stream in stream_strategy()) {
        let (producer, engine) = build_bridge(BridgeConfig {
            max_receiver_ids: 16,
            queue_buffer_bytes: 512,
        })
        .expect("build bridge");

        let id = producer.new_receiver_id().expect("receiver id");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.bind(
            id,
            FnReceiver(move |msg: &mut Message<'_>| {
                let params = read_all(msg);
                sink.lock().push(Msg {
                    message_id: msg.message_id(),
                    params,
                });
            }),
        );

        send_stream(&producer, id, &stream);
        engine.deliver_messages();

        prop_assert_eq!(seen.lock().clone(), stream);
        prop_assert!(!engine.has_messages_to_deliver());
    }

    /// Reading N parameters then leaving K unread lands every channel cursor
    /// exactly where reading all N would have: a fully-read witness stream
    /// decodes identically behind lazy readers and greedy ones.
    #[test]
    fn partial_reads_are_skip_equivalent(stream in stream_strategy(), prefix_seed in any::<u64>()) {
        let greedy = run_with_reader(&stream, usize::MAX, prefix_seed);
        let lazy = run_with_reader(&stream, 0, prefix_seed);
        let mixed = run_with_reader(&stream, 2, prefix_seed);
        prop_assert_eq!(&greedy, &lazy);
        prop_assert_eq!(&greedy, &mixed);
    }
}

/// Delivers `stream` with a receiver that reads at most `limit` parameters
/// per message (varied by a per-message offset derived from `seed`), then a
/// witness message whose fully-read params are returned alongside the
/// observed message ids.
fn run_with_reader(stream: &[Msg], limit: usize, seed: u64) -> (Vec<i32>, Vec<Param>) {
    let (producer, engine) = build_bridge(BridgeConfig {
        max_receiver_ids: 16,
        queue_buffer_bytes: 512,
    })
    .expect("build bridge");

    let id = producer.new_receiver_id().expect("receiver id");
    let witness_id = producer.new_receiver_id().expect("receiver id");

    let order = Arc::new(Mutex::new(Vec::new()));
    let order_sink = order.clone();
    let counter = Arc::new(Mutex::new(seed));
    engine.bind(
        id,
        FnReceiver(move |msg: &mut Message<'_>| {
            order_sink.lock().push(msg.message_id());
            let budget = if limit == usize::MAX {
                usize::MAX
            } else {
                // deterministic per-message prefix length in 0..=limit
                let mut counter = counter.lock();
                *counter = counter.wrapping_mul(6364136223846793005).wrapping_add(1);
                (*counter % (limit as u64 + 1)) as usize
            };
            let mut read = 0usize;
            while msg.params_to_read() > 0 && read < budget {
                if msg.next_param_is_array() {
                    msg.read_next_array::<i32>().expect("array param");
                } else {
                    msg.read_next::<i32>().expect("scalar param");
                }
                read += 1;
            }
        }),
    );

    let witness = Arc::new(Mutex::new(Vec::new()));
    let witness_sink = witness.clone();
    engine.bind(
        witness_id,
        FnReceiver(move |msg: &mut Message<'_>| {
            *witness_sink.lock() = read_all(msg);
        }),
    );

    send_stream(&producer, id, stream);
    producer
        .message(witness_id, 0)
        .expect("begin witness")
        .push(123_456_789i32)
        .expect("push")
        .push_array(&[9, 8, 7, 6, 5])
        .expect("push")
        .finish();

    engine.deliver_messages();

    let order = order.lock().clone();
    let witness = witness.lock().clone();
    (order, witness)
}

/// Randomized multi-tick stress: every tick sends a fresh random stream and
/// drains it; cursors must return to a pristine state every time.
#[test]
fn multi_tick_randomized_stress() {
    let (producer, engine) = build_bridge(BridgeConfig {
        max_receiver_ids: 16,
        queue_buffer_bytes: 512,
    })
    .expect("build bridge");

    let id = producer.new_receiver_id().expect("receiver id");
    let expected: Arc<Mutex<Vec<Msg>>> = Arc::new(Mutex::new(Vec::new()));
    let received: Arc<Mutex<Vec<Msg>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    engine.bind(
        id,
        FnReceiver(move |msg: &mut Message<'_>| {
            let params = read_all(msg);
            sink.lock().push(Msg {
                message_id: msg.message_id(),
                params,
            });
        }),
    );

    let mut rng = StdRng::seed_from_u64(0xBEEF);
    for _tick in 0..50 {
        expected.lock().clear();
        received.lock().clear();

        let count = rng.gen_range(1..60);
        for _ in 0..count {
            let message_id = rng.gen_range(0..32);
            let mut params = Vec::new();
            for _ in 0..rng.gen_range(0..4) {
                if rng.gen_bool(0.5) {
                    params.push(Param::Scalar(rng.gen()));
                } else {
                    let len = rng.gen_range(0..20);
                    params.push(Param::Array((0..len).map(|_| rng.gen()).collect()));
                }
            }
            expected.lock().push(Msg { message_id, params });
        }

        let stream = expected.lock().clone();
        send_stream(&producer, id, &stream);
        engine.deliver_messages();

        assert_eq!(*received.lock(), stream, "tick stream must round-trip");
        assert!(!engine.has_messages_to_deliver());
    }
}
