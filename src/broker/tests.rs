use std::time::Duration;

use super::channel::{Channel, ChannelRegistry};
use super::long_poll::hold;
use super::message::{
    ConnectionType, LIFECYCLE_CHANNEL, META_CONNECT, META_DISCONNECT, META_HANDSHAKE,
    META_SUBSCRIBE, META_UNSUBSCRIBE, Message, MessageId, Reconnect,
};
use super::{Broker, Delivery, Exchange, Extension, Intercept, lock, shared};
use crate::utils::ProtocolError;
use serde_json::json;

fn handshake(broker: &mut Broker) -> String {
    let request = Message::new(META_HANDSHAKE).with_id(0_u64);
    let delivery = broker.deliver_all(vec![request], Exchange::default()).unwrap();
    delivery.responses[0].client_id.clone().unwrap()
}

fn subscribe_request(client_id: &str, channel: &str) -> Message {
    Message::new(META_SUBSCRIBE)
        .with_client_id(client_id)
        .with_subscription(channel)
        .with_id(1_u64)
}

fn subscribe(broker: &mut Broker, client_id: &str, channel: &str) -> Message {
    let delivery = broker
        .deliver_all(vec![subscribe_request(client_id, channel)], Exchange::default())
        .unwrap();
    delivery.responses[0].clone()
}

fn connect_request(client_id: &str, id: u64) -> Message {
    Message::new(META_CONNECT)
        .with_client_id(client_id)
        .with_connection_type(ConnectionType::LongPolling)
        .with_id(id)
}

fn connect(broker: &mut Broker, client_id: &str) -> Delivery {
    broker
        .deliver_all(vec![connect_request(client_id, 2)], Exchange::default())
        .unwrap()
}

fn publish_request(client_id: &str, channel: &str, data: serde_json::Value) -> Message {
    Message::new(channel)
        .with_client_id(client_id)
        .with_data(data)
        .with_id(3_u64)
}

#[test]
fn test_channel_new() {
    let channel = Channel::new("/chat/demo");
    assert_eq!(channel.name, "/chat/demo");
    assert!(channel.subscribers.is_empty());
}

#[test]
fn test_registry_subscribe_is_idempotent() {
    let mut registry = ChannelRegistry::new();
    registry.subscribe("/chat/demo", "1").unwrap();
    registry.subscribe("/chat/demo", "1").unwrap();
    assert_eq!(registry.subscribers("/chat/demo"), vec!["1".to_string()]);

    registry.unsubscribe("/chat/demo", "1");
    assert!(registry.subscribers("/chat/demo").is_empty());
    registry.unsubscribe("/chat/demo", "1");
}

#[test]
fn test_registry_refuses_meta_channels() {
    let mut registry = ChannelRegistry::new();
    assert!(registry.subscribe("/meta/connect", "1").is_err());
    assert!(registry.subscribers("/meta/connect").is_empty());
    assert!(registry.is_empty());
}

#[test]
fn test_registry_unsubscribe_all() {
    let mut registry = ChannelRegistry::new();
    registry.subscribe("/a", "1").unwrap();
    registry.subscribe("/b", "1").unwrap();
    registry.subscribe("/b", "2").unwrap();

    registry.unsubscribe_all("1");

    assert!(!registry.is_subscribed("/a", "1"));
    assert!(!registry.is_subscribed("/b", "1"));
    assert!(registry.is_subscribed("/b", "2"));
}

#[test]
fn test_handshake_response() {
    let mut broker = Broker::default();
    let mut request = Message::new(META_HANDSHAKE).with_id("hs");
    request.version = Some("1.0".to_string());
    request.minimum_version = Some("0.9".to_string());
    request.client_id = Some("spoofed".to_string());

    let delivery = broker.deliver_all(vec![request], Exchange::default()).unwrap();
    let response = &delivery.responses[0];

    assert_eq!(response.channel, META_HANDSHAKE);
    assert_eq!(response.client_id.as_deref(), Some("1"));
    assert_eq!(response.id, Some(MessageId::Text("hs".to_string())));
    assert!(response.is_successful());
    assert_eq!(response.version.as_deref(), Some("1.0"));
    assert_eq!(response.minimum_version.as_deref(), Some("0.9"));
    assert_eq!(
        response.supported_connection_types,
        Some(vec![ConnectionType::LongPolling, ConnectionType::CallbackPolling])
    );
    let advice = response.advice.clone().unwrap();
    assert_eq!(advice.reconnect, Some(Reconnect::Retry));
    assert_eq!(advice.interval, Some(5000));
    assert!(broker.clients().contains("1"));
    assert!(!broker.clients().contains("spoofed"));
}

#[test]
fn test_handshake_advice_depends_on_transport() {
    let mut broker = Broker::default();
    let exchange = Exchange {
        connection_type: ConnectionType::CallbackPolling,
    };
    let delivery = broker
        .deliver_all(vec![Message::new(META_HANDSHAKE)], exchange)
        .unwrap();
    let advice = delivery.responses[0].advice.clone().unwrap();
    assert_eq!(advice.interval, Some(1000));
}

#[test]
fn test_handshake_ids_increase() {
    let mut broker = Broker::default();
    assert_eq!(handshake(&mut broker), "1");
    assert_eq!(handshake(&mut broker), "2");
}

#[test]
fn test_subscribe_is_idempotent() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);

    assert!(subscribe(&mut broker, &client, "/chat/demo").is_successful());
    let response = subscribe(&mut broker, &client, "/chat/demo");
    assert!(response.is_successful());
    assert_eq!(response.subscription.as_deref(), Some("/chat/demo"));
    assert_eq!(broker.channels().subscribers("/chat/demo").len(), 1);
}

#[test]
fn test_meta_channel_protection() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);

    let response = subscribe(&mut broker, &client, "/meta/connect");

    assert!(!response.is_successful());
    assert!(broker.channels().subscribers("/meta/connect").is_empty());
}

#[test]
fn test_subscribe_unknown_client_asks_for_handshake() {
    let mut broker = Broker::default();
    let response = subscribe(&mut broker, "nobody", "/chat/demo");
    assert!(!response.is_successful());
    assert_eq!(
        response.advice.and_then(|a| a.reconnect),
        Some(Reconnect::Handshake)
    );
    assert!(broker.channels().subscribers("/chat/demo").is_empty());
}

#[test]
fn test_unsubscribe_is_unconditional() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);
    subscribe(&mut broker, &client, "/chat/demo");

    let request = Message::new(META_UNSUBSCRIBE)
        .with_client_id(&client)
        .with_subscription("/chat/demo");
    let delivery = broker.deliver_all(vec![request.clone()], Exchange::default()).unwrap();
    assert!(delivery.responses[0].is_successful());

    let delivery = broker.deliver_all(vec![request], Exchange::default()).unwrap();
    assert!(delivery.responses[0].is_successful());
    assert_eq!(delivery.responses[0].subscription.as_deref(), Some("/chat/demo"));

    let publisher = handshake(&mut broker);
    broker
        .deliver_all(
            vec![publish_request(&publisher, "/chat/demo", json!("after"))],
            Exchange::default(),
        )
        .unwrap();
    assert_eq!(broker.clients().get(&client).unwrap().queue_len(), 0);
}

#[test]
fn test_connect_unknown_client_fails() {
    let mut broker = Broker::default();
    let delivery = connect(&mut broker, "ghost");
    assert!(delivery.pending.is_none());
    let response = &delivery.responses[0];
    assert_eq!(response.channel, META_CONNECT);
    assert!(!response.is_successful());
    assert_eq!(
        response.advice.as_ref().and_then(|a| a.reconnect),
        Some(Reconnect::Handshake)
    );
}

#[test]
fn test_connect_with_queued_messages_returns_immediately() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);
    subscribe(&mut broker, &client, "/chat/demo");
    broker.publish("/chat/demo", json!({"n": 1}));
    broker.publish("/chat/demo", json!({"n": 2}));

    let delivery = connect(&mut broker, &client);

    assert!(delivery.pending.is_none());
    assert_eq!(delivery.responses.len(), 3);
    assert_eq!(delivery.responses[0].data, Some(json!({"n": 1})));
    assert_eq!(delivery.responses[1].data, Some(json!({"n": 2})));
    let ack = &delivery.responses[2];
    assert_eq!(ack.channel, META_CONNECT);
    assert_eq!(ack.client_id.as_deref(), Some(client.as_str()));
    assert!(ack.is_successful());
    assert!(broker.clients().get(&client).unwrap().connected);
}

#[test]
fn test_connect_with_empty_queue_suspends_and_publish_wakes_it() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);
    subscribe(&mut broker, &client, "/chat/demo");

    let delivery = connect(&mut broker, &client);
    assert!(delivery.responses.is_empty());
    let mut pending = delivery.pending.unwrap();

    assert_eq!(broker.publish("/chat/demo", json!("wake")), 1);

    let batch = pending.rx.try_recv().unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].data, Some(json!("wake")));
    assert_eq!(batch[1].channel, META_CONNECT);
    assert!(!broker.clients().get(&client).unwrap().has_waiter());
}

#[test]
fn test_overlapping_connect_resolves_older_waiter() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);
    subscribe(&mut broker, &client, "/chat/demo");

    let mut first = connect(&mut broker, &client).pending.unwrap();
    let second = broker
        .deliver_all(vec![connect_request(&client, 9)], Exchange::default())
        .unwrap();

    // the newer connect answers at once, the older one gets a bare ack
    assert!(second.pending.is_none());
    assert_eq!(second.responses.len(), 1);
    assert_eq!(second.responses[0].id, Some(MessageId::from(9_u64)));
    let older = first.rx.try_recv().unwrap();
    assert_eq!(older.len(), 1);
    assert_eq!(older[0].channel, META_CONNECT);

    // nothing parked any more: a publish is queued exactly once
    broker.publish("/chat/demo", json!("once"));
    let client_state = broker.clients().get(&client).unwrap();
    assert!(!client_state.has_waiter());
    assert_eq!(client_state.queue_len(), 1);
}

#[test]
fn test_disconnect_cleanup() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);
    subscribe(&mut broker, &client, "/chat/demo");
    let mut parked = connect(&mut broker, &client).pending.unwrap();

    let request = Message::new(META_DISCONNECT).with_client_id(&client).with_id(4_u64);
    let delivery = broker.deliver_all(vec![request.clone()], Exchange::default()).unwrap();
    assert!(delivery.responses[0].is_successful());

    // the parked poll was answered rather than left dangling
    assert_eq!(parked.rx.try_recv().unwrap()[0].channel, META_CONNECT);
    assert!(!broker.channels().is_subscribed("/chat/demo", &client));
    assert_eq!(broker.publish("/chat/demo", json!("late")), 0);
    assert!(!connect(&mut broker, &client).responses[0].is_successful());

    let delivery = broker.deliver_all(vec![request], Exchange::default()).unwrap();
    assert!(!delivery.responses[0].is_successful());
}

#[test]
fn test_end_to_end_publish_scenario() {
    let mut broker = Broker::default();
    let alice = handshake(&mut broker);
    let bob = handshake(&mut broker);
    assert_eq!(alice, "1");

    subscribe(&mut broker, &bob, "/chat/demo");
    let mut bob_poll = connect(&mut broker, &bob).pending.unwrap();

    let delivery = broker
        .deliver_all(
            vec![
                subscribe_request(&alice, "/chat/demo"),
                publish_request(&alice, "/chat/demo", json!({"user": "alice", "chat": "hi"})),
            ],
            Exchange::default(),
        )
        .unwrap();

    assert_eq!(delivery.responses.len(), 2);
    assert!(delivery.responses[0].is_successful());
    let ack = &delivery.responses[1];
    assert_eq!(ack.channel, "/chat/demo");
    assert_eq!(ack.client_id.as_deref(), Some("1"));
    assert_eq!(ack.id, Some(MessageId::from(3_u64)));
    assert!(ack.is_successful());

    let batch = bob_poll.rx.try_recv().unwrap();
    assert_eq!(batch[0].channel, "/chat/demo");
    assert_eq!(batch[0].data, Some(json!({"user": "alice", "chat": "hi"})));

    // the publisher is subscribed too and sees its own line on its next connect
    let alice_connect = connect(&mut broker, &alice);
    assert_eq!(alice_connect.responses.len(), 2);
}

#[test]
fn test_publish_from_unknown_client_is_refused() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);
    subscribe(&mut broker, &client, "/chat/demo");

    let delivery = broker
        .deliver_all(
            vec![publish_request("ghost", "/chat/demo", json!("x"))],
            Exchange::default(),
        )
        .unwrap();

    assert!(!delivery.responses[0].is_successful());
    assert_eq!(broker.clients().get(&client).unwrap().queue_len(), 0);
}

#[test]
fn test_service_channel_never_broadcasts() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);
    subscribe(&mut broker, &client, "/service/echo");

    let delivery = broker
        .deliver_all(
            vec![publish_request(&client, "/service/echo", json!("private"))],
            Exchange::default(),
        )
        .unwrap();

    assert!(delivery.responses[0].is_successful());
    assert_eq!(broker.clients().get(&client).unwrap().queue_len(), 0);
}

#[test]
fn test_unroutable_meta_action_fails() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);
    let request = Message::new("/meta/reload").with_client_id(&client);

    let delivery = broker.deliver_all(vec![request], Exchange::default()).unwrap();
    assert!(!delivery.responses[0].is_successful());
}

#[test]
fn test_unknown_channel_is_a_protocol_error() {
    let mut broker = Broker::default();
    let result = broker.deliver_all(vec![Message::new("chat")], Exchange::default());
    assert!(matches!(result, Err(ProtocolError::UnknownChannel(_))));
}

#[test]
fn test_unknown_channel_inside_batch_keeps_other_responses() {
    let mut broker = Broker::default();
    let delivery = broker
        .deliver_all(
            vec![Message::new(META_HANDSHAKE), Message::new("//bad")],
            Exchange::default(),
        )
        .unwrap();

    assert_eq!(delivery.responses.len(), 2);
    assert!(delivery.responses[0].is_successful());
    assert!(!delivery.responses[1].is_successful());
}

#[test]
fn test_connect_in_mixed_batch_is_not_held() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);

    let delivery = broker
        .deliver_all(
            vec![
                subscribe_request(&client, "/chat/demo"),
                connect_request(&client, 5),
            ],
            Exchange::default(),
        )
        .unwrap();

    assert!(delivery.pending.is_none());
    assert_eq!(delivery.responses.len(), 2);
    assert_eq!(delivery.responses[1].channel, META_CONNECT);
    assert!(!broker.clients().get(&client).unwrap().has_waiter());
}

struct Roster;

impl Extension for Roster {
    fn incoming(&self, broker: &mut Broker, message: &Message) -> Intercept {
        if message.channel != "/chat/roster" {
            return Intercept::Continue;
        }
        let names: Vec<String> = broker.clients().ids().cloned().collect();
        broker.publish("/chat/members", json!(names));
        Intercept::Respond(vec![Message::reply_to(message).with_successful(true)])
    }
}

#[test]
fn test_extension_intercepts_its_channel() {
    let mut broker = Broker::default().with_extension(Roster);
    let client = handshake(&mut broker);
    subscribe(&mut broker, &client, "/chat/members");

    let delivery = broker
        .deliver_all(
            vec![publish_request(&client, "/chat/roster", json!({"join": true}))],
            Exchange::default(),
        )
        .unwrap();

    assert!(delivery.responses[0].is_successful());
    let queued: Vec<_> = broker.clients().get(&client).unwrap().queued().cloned().collect();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].channel, "/chat/members");
    assert_eq!(queued[0].data, Some(json!(["1"])));
}

struct Exploding;

impl Extension for Exploding {
    fn incoming(&self, _broker: &mut Broker, message: &Message) -> Intercept {
        if message.channel == "/chat/boom" {
            panic!("extension bug");
        }
        Intercept::Continue
    }
}

#[test]
fn test_panicking_handler_fails_only_its_message() {
    let mut broker = Broker::default().with_extension(Exploding);
    let client = handshake(&mut broker);

    let delivery = broker
        .deliver_all(
            vec![
                publish_request(&client, "/chat/boom", json!(1)),
                subscribe_request(&client, "/chat/demo"),
            ],
            Exchange::default(),
        )
        .unwrap();

    assert_eq!(delivery.responses.len(), 2);
    assert_eq!(delivery.responses[0].error.as_deref(), Some("500::Internal error"));
    assert!(delivery.responses[1].is_successful());
    assert!(broker.channels().is_subscribed("/chat/demo", &client));
}

#[test]
fn test_handshake_announces_session_on_lifecycle_channel() {
    let mut broker = Broker::default();
    let monitor = handshake(&mut broker);
    assert!(subscribe(&mut broker, &monitor, LIFECYCLE_CHANNEL).is_successful());

    let newcomer = handshake(&mut broker);

    let events: Vec<Message> = broker
        .clients()
        .get(&monitor)
        .unwrap()
        .queued()
        .cloned()
        .collect();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.channel == LIFECYCLE_CHANNEL && e.is_successful()));
    assert!(events.iter().all(|e| e.data == Some(json!({}))));
    assert_eq!(events[0].action.as_deref(), Some("handshake"));
    assert_eq!(events[0].reestablish, Some(false));
    assert_eq!(events[1].action.as_deref(), Some("connect"));
    assert_eq!(broker.clients().get(&newcomer).unwrap().queue_len(), 0);
}

#[test]
fn test_expire_idle_removes_client_and_subscriptions() {
    let mut broker = Broker::default();
    let client = handshake(&mut broker);
    subscribe(&mut broker, &client, "/chat/demo");
    broker.clients_mut().get_mut(&client).unwrap().last_seen = 0;

    let expired = broker.expire_idle(10 * 60 * 1000);

    assert_eq!(expired, vec![client.clone()]);
    assert!(!broker.clients().contains(&client));
    assert!(!broker.channels().is_subscribed("/chat/demo", &client));
}

#[tokio::test]
async fn test_hold_returns_published_message() {
    let broker = shared(Broker::default());
    let (client, pending) = {
        let mut b = lock(&broker);
        let client = handshake(&mut b);
        subscribe(&mut b, &client, "/chat/demo");
        let pending = connect(&mut b, &client).pending.unwrap();
        (client, pending)
    };

    let held = tokio::spawn(hold(broker.clone(), pending, Duration::from_secs(5)));
    lock(&broker).publish("/chat/demo", json!("hello"));

    let batch = held.await.unwrap();
    assert_eq!(batch[0].data, Some(json!("hello")));
    assert_eq!(batch[1].client_id.as_deref(), Some(client.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_hold_times_out_with_bare_ack() {
    let broker = shared(Broker::default());
    let (client, pending) = {
        let mut b = lock(&broker);
        let client = handshake(&mut b);
        let pending = connect(&mut b, &client).pending.unwrap();
        (client, pending)
    };

    let batch = hold(broker.clone(), pending, Duration::from_secs(30)).await;

    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].channel, META_CONNECT);
    assert!(batch[0].is_successful());
    assert!(!lock(&broker).clients().get(&client).unwrap().has_waiter());
}

#[tokio::test]
async fn test_aborted_hold_releases_waiter() {
    let broker = shared(Broker::default());
    let (client, pending) = {
        let mut b = lock(&broker);
        let client = handshake(&mut b);
        subscribe(&mut b, &client, "/chat/demo");
        let pending = connect(&mut b, &client).pending.unwrap();
        (client, pending)
    };

    let mut held = Box::pin(hold(broker.clone(), pending, Duration::from_secs(30)));
    assert!(futures::poll!(&mut held).is_pending());
    drop(held);

    assert!(!lock(&broker).clients().get(&client).unwrap().has_waiter());
    lock(&broker).publish("/chat/demo", json!("queued"));
    assert_eq!(lock(&broker).clients().get(&client).unwrap().queue_len(), 1);
}

#[tokio::test]
async fn test_wakeup_into_aborted_hold_is_requeued() {
    let broker = shared(Broker::default());
    let (client, pending) = {
        let mut b = lock(&broker);
        let client = handshake(&mut b);
        subscribe(&mut b, &client, "/chat/demo");
        let pending = connect(&mut b, &client).pending.unwrap();
        (client, pending)
    };

    let mut held = Box::pin(hold(broker.clone(), pending, Duration::from_secs(30)));
    assert!(futures::poll!(&mut held).is_pending());
    lock(&broker).publish("/chat/demo", json!("in flight"));
    drop(held);

    let mut b = lock(&broker);
    let delivery = connect(&mut b, &client);
    assert_eq!(delivery.responses.len(), 2);
    assert_eq!(delivery.responses[0].data, Some(json!("in flight")));
}
