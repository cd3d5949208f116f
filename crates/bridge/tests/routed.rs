//! Routed-addressing coverage: component registration, capability dispatch,
//! by-name targets, and in-band method names.

use bridge::{
    build_bridge, BridgeConfig, Message, MethodRef, MethodTable, Receiver, ReceiverHandle,
    RoutedRef, RoutedTarget, TargetResolver,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct FnReceiver<F: FnMut(&mut Message<'_>) + Send>(F);

impl<F: FnMut(&mut Message<'_>) + Send> Receiver for FnReceiver<F> {
    fn receive(&mut self, msg: &mut Message<'_>) {
        (self.0)(msg)
    }
}

fn handle(receiver: impl Receiver + 'static) -> ReceiverHandle {
    Arc::new(Mutex::new(receiver))
}

/// Target object resolving component type names to capabilities.
struct TestTarget {
    caps: HashMap<String, ReceiverHandle>,
}

impl TestTarget {
    fn with(type_name: &str, receiver: ReceiverHandle) -> Arc<Self> {
        let mut caps = HashMap::new();
        caps.insert(type_name.to_owned(), receiver);
        Arc::new(Self { caps })
    }
}

impl RoutedTarget for TestTarget {
    fn capability(&self, type_name: &str) -> Option<ReceiverHandle> {
        self.caps.get(type_name).cloned()
    }
}

/// Name-indexed resolver for by-name routed targets.
struct MapResolver {
    targets: Mutex<HashMap<String, Arc<dyn RoutedTarget>>>,
}

impl TargetResolver for MapResolver {
    fn resolve(&self, name: &str) -> Option<Arc<dyn RoutedTarget>> {
        self.targets.lock().get(name).cloned()
    }
}

#[test]
fn component_registration_round_trips() {
    let (producer, engine) = build_bridge(BridgeConfig::default()).expect("build bridge");

    let transform = producer
        .register_component_type("Transform")
        .expect("register");
    let sprite = producer.register_component_type("Sprite").expect("register");
    assert_ne!(transform, sprite);

    assert_eq!(engine.component_name(transform), None, "not delivered yet");
    engine.deliver_messages();
    assert_eq!(engine.component_name(transform).as_deref(), Some("Transform"));
    assert_eq!(engine.component_name(sprite).as_deref(), Some("Sprite"));
}

#[test]
fn routed_by_id_dispatches_to_the_capability() {
    let (producer, engine) = build_bridge(BridgeConfig::default()).expect("build bridge");
    let routing = producer
        .register_component_type("Transform")
        .expect("register");

    let id = producer.new_receiver_id().expect("receiver id");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let capability = handle(FnReceiver(move |msg: &mut Message<'_>| {
        assert!(msg.is_routed());
        assert_eq!(msg.message_id(), 3);
        sink.lock()
            .push((msg.routing_id(), msg.read_next::<f64>().expect("scale")));
    }));
    engine.bind_target(id, TestTarget::with("Transform", capability));

    producer
        .routed_message(RoutedRef::Id(id), routing, MethodRef::Id(3))
        .expect("begin routed")
        .push(1.5f64)
        .expect("push")
        .finish();

    engine.deliver_messages();
    assert_eq!(seen.lock().as_slice(), &[(routing, 1.5)]);
}

#[test]
fn method_names_dispatch_through_the_table() {
    let (producer, engine) = build_bridge(BridgeConfig::default()).expect("build bridge");
    let routing = producer
        .register_component_type("Transform")
        .expect("register");
    let id = producer.new_receiver_id().expect("receiver id");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let scale_sink = seen.clone();
    let color_sink = seen.clone();
    let table = MethodTable::new()
        .on("set_scale", move |msg| {
            let value = msg.read_next::<f32>().expect("scale");
            assert_eq!(msg.method_name(), Some("set_scale"));
            scale_sink.lock().push(("set_scale", value));
        })
        .on("set_alpha", move |msg| {
            let value = msg.read_next::<f32>().expect("alpha");
            color_sink.lock().push(("set_alpha", value));
        });
    engine.bind_target(id, TestTarget::with("Transform", handle(table)));

    producer
        .routed_message(RoutedRef::Id(id), routing, MethodRef::Name("set_scale"))
        .expect("begin routed")
        .push(2.0f32)
        .expect("push")
        .finish();
    producer
        .routed_message(RoutedRef::Id(id), routing, MethodRef::Name("set_alpha"))
        .expect("begin routed")
        .push(0.5f32)
        .expect("push")
        .finish();
    // unknown method: reported, parameters skipped, pass continues
    producer
        .routed_message(RoutedRef::Id(id), routing, MethodRef::Name("no_such"))
        .expect("begin routed")
        .push(9.0f32)
        .expect("push")
        .finish();
    producer
        .routed_message(RoutedRef::Id(id), routing, MethodRef::Name("set_scale"))
        .expect("begin routed")
        .push(3.0f32)
        .expect("push")
        .finish();

    engine.deliver_messages();
    assert_eq!(
        seen.lock().as_slice(),
        &[("set_scale", 2.0), ("set_alpha", 0.5), ("set_scale", 3.0)]
    );
}

#[test]
fn by_name_targets_resolve_through_the_resolver() {
    let (producer, engine) = build_bridge(BridgeConfig::default()).expect("build bridge");
    let routing = producer.register_component_type("Hud").expect("register");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let capability = handle(FnReceiver(move |msg: &mut Message<'_>| {
        assert_eq!(msg.method_name(), Some("refresh"));
        sink.lock().push(msg.read_next::<i32>().expect("frame"));
    }));

    let mut targets: HashMap<String, Arc<dyn RoutedTarget>> = HashMap::new();
    targets.insert(
        "hud/root".to_owned(),
        TestTarget::with("Hud", capability) as Arc<dyn RoutedTarget>,
    );
    engine.set_resolver(Arc::new(MapResolver {
        targets: Mutex::new(targets),
    }));

    producer
        .routed_message(
            RoutedRef::Name("hud/root"),
            routing,
            MethodRef::Name("refresh"),
        )
        .expect("begin routed")
        .push(60i32)
        .expect("push")
        .finish();

    engine.deliver_messages();
    assert_eq!(seen.lock().as_slice(), &[60]);
}

#[test]
fn zero_parameter_routed_message_is_delivered() {
    // encoded count -1: the sign-overloaded framing's degenerate case
    let (producer, engine) = build_bridge(BridgeConfig::default()).expect("build bridge");
    let routing = producer.register_component_type("Ping").expect("register");
    let id = producer.new_receiver_id().expect("receiver id");

    let hits = Arc::new(Mutex::new(0usize));
    let sink = hits.clone();
    let capability = handle(FnReceiver(move |msg: &mut Message<'_>| {
        assert_eq!(msg.param_count(), 0);
        assert_eq!(msg.params_to_read(), 0);
        *sink.lock() += 1;
    }));
    engine.bind_target(id, TestTarget::with("Ping", capability));

    producer
        .routed_message(RoutedRef::Id(id), routing, MethodRef::Id(0))
        .expect("begin routed")
        .finish();

    engine.deliver_messages();
    assert_eq!(*hits.lock(), 1);
}

#[test]
fn unresolvable_routed_messages_are_dropped_pass_continues() {
    let (producer, engine) = build_bridge(BridgeConfig::default()).expect("build bridge");
    let routing = producer.register_component_type("Transform").expect("register");

    let no_target = producer.new_receiver_id().expect("receiver id");
    let plain = producer.new_receiver_id().expect("receiver id");

    let hits = Arc::new(Mutex::new(0usize));
    let sink = hits.clone();
    engine.bind(
        plain,
        FnReceiver(move |msg: &mut Message<'_>| {
            assert_eq!(msg.read_next::<i32>(), Some(1));
            *sink.lock() += 1;
        }),
    );

    // routing id never registered
    producer
        .routed_message(RoutedRef::Id(no_target), 99, MethodRef::Id(0))
        .expect("begin routed")
        .push(7i32)
        .expect("push")
        .finish();
    // registered routing id, but no target bound to the slot
    producer
        .routed_message(RoutedRef::Id(no_target), routing, MethodRef::Id(0))
        .expect("begin routed")
        .push(8i32)
        .expect("push")
        .finish();
    // a healthy plain message behind both
    producer
        .message(plain, 0)
        .expect("begin")
        .push(1i32)
        .expect("push")
        .finish();

    engine.deliver_messages();
    assert_eq!(*hits.lock(), 1);
    assert!(!engine.has_messages_to_deliver());
}

#[test]
fn malformed_routed_sends_are_rejected_up_front() {
    let (producer, _engine) = build_bridge(BridgeConfig::default()).expect("build bridge");
    assert!(producer
        .routed_message(RoutedRef::Id(0), 0, MethodRef::Id(0))
        .is_err());
    assert!(producer
        .routed_message(RoutedRef::Name(""), 0, MethodRef::Id(0))
        .is_err());
    assert!(producer
        .routed_message(RoutedRef::Id(1), -1, MethodRef::Id(0))
        .is_err());
    assert!(producer.message(-1, 0).is_err());
    assert!(producer.message(1, -2).is_err());
}
