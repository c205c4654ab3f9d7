// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic negotiation integration tests
//!
//! Publisher and subscriber nodes talk to an in-process Master and exchange
//! messages over real data-plane links.

use parking_lot::Mutex;
use rendez::{
    ChannelDescriptor, ChannelKind, ChannelKinds, Context, InProcessMaster, NodeConfig,
    NodeIdentity, NodeLifecycle, Publisher, Status, StatusCode, Subscriber, TopicState,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Capture(Arc<Mutex<Option<NodeIdentity>>>);

impl NodeLifecycle for Capture {
    fn on_did_create(&mut self, identity: NodeIdentity) {
        *self.0.lock() = Some(identity);
    }
}

fn context(master: &InProcessMaster) -> Context {
    let config = NodeConfig::default().with_heartbeat_interval(Duration::from_millis(10));
    Context::with_transport(config, Arc::new(master.transport()))
}

fn node(ctx: &mut Context, name: &str) -> NodeIdentity {
    let slot = Arc::new(Mutex::new(None));
    ctx.create_node(name, Capture(slot.clone()));
    ctx.run_until_idle().expect("node registration");
    let identity = slot.lock().clone();
    identity.expect("node identity")
}

#[derive(Default, Clone)]
struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn push(&self, event: String) {
        self.0.lock().push(event);
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn result(&self) -> impl FnOnce(Status) + Send + 'static {
        let events = self.clone();
        move |status| events.push(format!("result {}", status.code()))
    }

    fn subscribe(&self, sub: &Subscriber<String>, identity: &NodeIdentity, topic: &str, descriptor: ChannelDescriptor) {
        let (m, e) = (self.clone(), self.clone());
        sub.request_subscribe(
            identity,
            topic,
            move |msg: String| m.push(format!("msg {}", msg)),
            move |status: Status| e.push(format!("error {}", status.code())),
            descriptor,
            self.result(),
        );
    }
}

#[test]
fn test_intersection_picks_highest_priority_kind() {
    let master = InProcessMaster::new();
    let mut ctx = context(&master);
    let talker = node(&mut ctx, "talker");
    let listener = node(&mut ctx, "listener");

    // The subscriber waits first so the choice comes from both sets.
    let subscriber: Subscriber<String> = ctx.subscriber();
    let sub_events = Events::default();
    sub_events.subscribe(
        &subscriber,
        &listener,
        "chatter",
        ChannelDescriptor::with_kinds(ChannelKinds::SHM | ChannelKinds::UDP),
    );
    ctx.run_until_idle().unwrap();
    assert!(sub_events.snapshot().is_empty());
    assert_eq!(subscriber.state(), TopicState::Pending);

    let publisher: Publisher<String> = ctx.publisher();
    let pub_events = Events::default();
    publisher.request_publish(
        &talker,
        "chatter",
        ChannelDescriptor::with_kinds(ChannelKinds::TCP | ChannelKinds::SHM),
        pub_events.result(),
    );
    ctx.run_until_idle().unwrap();
    assert_eq!(pub_events.snapshot(), vec!["result OK"]);
    assert_eq!(sub_events.snapshot(), vec!["result OK"]);
    assert_eq!(subscriber.channel().map(|c| c.kind), Some(ChannelKind::Shm));
    assert_eq!(publisher.channel().map(|c| c.kind), Some(ChannelKind::Shm));

    // The ring reader starts at the current head, so keep publishing until
    // the first message lands.
    let mut n = 0u32;
    publisher.publish_repeating(Duration::from_millis(20), move || {
        n += 1;
        format!("tick {}", n)
    });
    let seen = sub_events.clone();
    assert!(ctx.run_until(WAIT, move || seen.count("msg tick") > 0).unwrap());
}

#[test]
fn test_fixed_buffer_smaller_than_request_fails() {
    let master = InProcessMaster::new();
    let mut ctx = context(&master);
    let talker = node(&mut ctx, "talker");
    let listener = node(&mut ctx, "listener");

    let publisher: Publisher<String> = ctx.publisher();
    let descriptor = ChannelDescriptor::builder()
        .kinds(ChannelKinds::TCP)
        .buffer_size(512)
        .dynamic_buffer(false)
        .build()
        .unwrap();
    let pub_events = Events::default();
    publisher.request_publish(&talker, "frames", descriptor, pub_events.result());
    ctx.run_until_idle().unwrap();
    assert_eq!(pub_events.snapshot(), vec!["result OK"]);

    let subscriber: Subscriber<String> = ctx.subscriber();
    let sub_events = Events::default();
    let request = ChannelDescriptor::builder()
        .kinds(ChannelKinds::TCP)
        .buffer_size(1024)
        .build()
        .unwrap();
    sub_events.subscribe(&subscriber, &listener, "frames", request);
    ctx.run_until_idle().unwrap();

    assert_eq!(sub_events.snapshot(), vec!["result BUFFER_TOO_SMALL"]);
    assert_eq!(subscriber.state(), TopicState::Failed);
    // The publisher is not affected.
    assert_eq!(publisher.state(), TopicState::Negotiated);
}

#[test]
fn test_repeating_publish_stops_after_unpublish() {
    let master = InProcessMaster::new();
    let mut ctx = context(&master);
    let talker = node(&mut ctx, "talker");
    let listener = node(&mut ctx, "listener");

    let publisher: Publisher<String> = ctx.publisher();
    publisher.request_publish(&talker, "counter", ChannelDescriptor::default(), |_| {});
    let subscriber: Subscriber<String> = ctx.subscriber();
    let sub_events = Events::default();
    sub_events.subscribe(&subscriber, &listener, "counter", ChannelDescriptor::default());
    ctx.run_until_idle().unwrap();

    let produced = Arc::new(Mutex::new(0u32));
    let counter = produced.clone();
    publisher.publish_repeating(Duration::from_millis(20), move || {
        let mut n = counter.lock();
        *n += 1;
        n.to_string()
    });
    let seen = sub_events.clone();
    assert!(ctx.run_until(WAIT, move || seen.count("msg") >= 3).unwrap());

    let done = Events::default();
    publisher.request_unpublish(&talker, "counter", done.result());
    let finished = done.clone();
    assert!(ctx.run_until(WAIT, move || !finished.snapshot().is_empty()).unwrap());
    assert_eq!(done.snapshot(), vec!["result OK"]);

    let after_unpublish = *produced.lock();
    ctx.run_for(Duration::from_millis(120)).unwrap();
    assert!(*produced.lock() <= after_unpublish + 1);
}

#[test]
fn test_second_publish_fails_fast() {
    let master = InProcessMaster::new();
    let mut ctx = context(&master);
    let talker = node(&mut ctx, "talker");

    let publisher: Publisher<String> = ctx.publisher();
    let events = Events::default();
    publisher.request_publish(&talker, "dup", ChannelDescriptor::default(), events.result());
    publisher.request_publish(&talker, "dup", ChannelDescriptor::default(), events.result());
    ctx.run_until_idle().unwrap();

    let mut results = events.snapshot();
    results.sort();
    assert_eq!(results, vec!["result ALREADY_EXISTS", "result OK"]);
    assert_eq!(publisher.state(), TopicState::Negotiated);
}

#[test]
fn test_tcp_fan_out_to_every_subscriber() {
    let master = InProcessMaster::new();
    let mut ctx = context(&master);
    let talker = node(&mut ctx, "talker");
    let first = node(&mut ctx, "first");
    let second = node(&mut ctx, "second");

    let sub_a: Subscriber<String> = ctx.subscriber();
    let sub_b: Subscriber<String> = ctx.subscriber();
    let events_a = Events::default();
    let events_b = Events::default();
    events_a.subscribe(&sub_a, &first, "news", ChannelDescriptor::default());
    events_b.subscribe(&sub_b, &second, "news", ChannelDescriptor::default());
    ctx.run_until_idle().unwrap();
    assert!(events_a.snapshot().is_empty());
    assert_eq!(sub_a.state(), TopicState::Pending);

    let publisher: Publisher<String> = ctx.publisher();
    publisher.request_publish(&talker, "news", ChannelDescriptor::default(), |s| assert!(s.ok()));
    let link = publisher.clone();
    assert!(ctx.run_until(WAIT, move || link.peer_count() == 2).unwrap());

    publisher.publish(&"extra".to_string()).unwrap();
    let (a, b) = (events_a.clone(), events_b.clone());
    assert!(ctx
        .run_until(WAIT, move || a.count("msg") == 1 && b.count("msg") == 1)
        .unwrap());
    assert_eq!(events_a.snapshot(), vec!["result OK", "msg extra"]);
    assert_eq!(events_b.snapshot(), vec!["result OK", "msg extra"]);
}

#[test]
fn test_unsubscribe_and_unpublish_are_idempotent() {
    let master = InProcessMaster::new();
    let mut ctx = context(&master);
    let talker = node(&mut ctx, "talker");
    let listener = node(&mut ctx, "listener");

    let publisher: Publisher<String> = ctx.publisher();
    publisher.request_publish(&talker, "once", ChannelDescriptor::default(), |_| {});
    let subscriber: Subscriber<String> = ctx.subscriber();
    subscriber.request_subscribe(&listener, "once", |_| {}, |_| {}, ChannelDescriptor::default(), |_| {});
    ctx.run_until_idle().unwrap();

    let events = Events::default();
    subscriber.request_unsubscribe(&listener, "once", events.result());
    subscriber.request_unsubscribe(&listener, "once", events.result());
    publisher.request_unpublish(&talker, "once", events.result());
    publisher.request_unpublish(&talker, "once", events.result());
    ctx.run_until_idle().unwrap();

    assert_eq!(events.snapshot(), vec!["result OK"; 4]);
    assert_eq!(subscriber.state(), TopicState::Unregistered);
    assert!(publisher.is_unregistered());
    assert!(master.with_registry_ref(|r| r.list_topics().is_empty()));
}

#[test]
fn test_publish_without_registration_is_refused() {
    let master = InProcessMaster::new();
    let ctx = context(&master);
    let publisher: Publisher<String> = ctx.publisher();
    let err = publisher.publish(&"nobody".to_string()).unwrap_err();
    assert_eq!(err.code(), StatusCode::Unregistered);
}

#[test]
fn test_incompatible_restarted_publisher_keeps_subscriber_pending() {
    let master = InProcessMaster::new();
    let mut ctx = context(&master);
    let talker = node(&mut ctx, "talker");
    let listener = node(&mut ctx, "listener");

    let first: Publisher<String> = ctx.publisher();
    first.request_publish(&talker, "status", ChannelDescriptor::default(), |s| assert!(s.ok()));
    let subscriber: Subscriber<String> = ctx.subscriber();
    let events = Events::default();
    events.subscribe(&subscriber, &listener, "status", ChannelDescriptor::default());
    ctx.run_until_idle().unwrap();
    assert_eq!(subscriber.state(), TopicState::Negotiated);

    first.request_unpublish(&talker, "status", |s| assert!(s.ok()));
    let waiting = subscriber.clone();
    assert!(ctx.run_until(WAIT, move || waiting.state() == TopicState::Pending).unwrap());

    let udp_only: Publisher<String> = ctx.publisher();
    let pub_events = Events::default();
    udp_only.request_publish(
        &talker,
        "status",
        ChannelDescriptor::with_kinds(ChannelKinds::UDP),
        pub_events.result(),
    );
    ctx.run_until_idle().unwrap();
    assert_eq!(pub_events.snapshot(), vec!["result CHANNEL_MISMATCH"]);
    assert_eq!(subscriber.state(), TopicState::Pending);
    assert_eq!(events.count("error CHANNEL_MISMATCH"), 0);
    assert_eq!(events.snapshot()[0], "result OK");

    let tcp: Publisher<String> = ctx.publisher();
    tcp.request_publish(&talker, "status", ChannelDescriptor::default(), |s| assert!(s.ok()));
    let link = tcp.clone();
    assert!(ctx.run_until(WAIT, move || link.peer_count() == 1).unwrap());
    tcp.publish(&"back".to_string()).unwrap();
    let seen = events.clone();
    assert!(ctx.run_until(WAIT, move || seen.count("msg back") == 1).unwrap());
    assert_eq!(events.count("result"), 1);
}
