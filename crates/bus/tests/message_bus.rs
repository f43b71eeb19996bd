use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use repeater_bus::{
    BusError, BusOptions, ConnectionSupervisor, Delivery, EventHandler, HandlerFuture,
    MemoryBroker, MessageBus, MessageProperties, ReplyHandler, RetryOptions,
};
use repeater_protocol::{Command, CommandPayload, Event, Payload};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Foo {
    text: String,
}

impl Payload for Foo {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ask {
    question: String,
}

impl Payload for Ask {}

impl CommandPayload for Ask {
    type Reply = Answer;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Answer {
    text: String,
}

struct Recorder(mpsc::UnboundedSender<Foo>);

impl EventHandler<Foo> for Recorder {
    fn handle(&self, event: Foo) -> HandlerFuture<'_, ()> {
        Box::pin(async move {
            self.0.send(event)?;
            Ok(())
        })
    }
}

struct Tally(Arc<AtomicU32>);

impl EventHandler<Foo> for Tally {
    fn handle(&self, _event: Foo) -> HandlerFuture<'_, ()> {
        Box::pin(async move {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

struct Oracle;

impl ReplyHandler<Ask> for Oracle {
    type Reply = Answer;

    fn handle(&self, event: Ask) -> HandlerFuture<'_, Answer> {
        Box::pin(async move {
            Ok(Answer {
                text: format!("re: {}", event.question),
            })
        })
    }
}

struct Sleeper;

impl ReplyHandler<Ask> for Sleeper {
    type Reply = Answer;

    fn handle(&self, _event: Ask) -> HandlerFuture<'_, Answer> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Answer { text: "late".into() })
        })
    }
}

fn options(client_queue: &str) -> BusOptions {
    BusOptions {
        url: "memory://local".into(),
        client_queue: client_queue.into(),
        reconnect: RetryOptions {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn start_bus(broker: &MemoryBroker, client_queue: &str) -> Arc<MessageBus> {
    let options = options(client_queue);
    let supervisor = ConnectionSupervisor::new(Arc::new(broker.clone()), &options);
    let bus = MessageBus::new(supervisor, options);
    bus.init().await.unwrap();
    bus
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn foo_binding() -> (String, String) {
    ("EventBus".to_string(), "Foo".to_string())
}

#[tokio::test]
async fn published_event_reaches_handler_exactly_once() {
    let broker = MemoryBroker::new();
    let bus = start_bus(&broker, "agent:one").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.register::<Foo, _>(Recorder(tx)).await.unwrap();

    bus.publish(&Event::new(Foo { text: "hi".into() }))
        .await
        .unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, Foo { text: "hi".into() });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    let published = broker.published();
    let event = published.last().unwrap();
    assert_eq!(event.exchange, "EventBus");
    assert_eq!(event.routing_key, "Foo");
    let props = &event.message.properties;
    assert_eq!(props.message_type.as_deref(), Some("Foo"));
    assert_eq!(props.content_type.as_deref(), Some("application/json"));
    assert!(props.persistent);
    assert!(props.correlation_id.is_some());
    assert!(props.timestamp.is_some());

    bus.dispose().await;
}

#[tokio::test]
async fn command_reply_is_correlated() {
    let broker = MemoryBroker::new();
    let server = start_bus(&broker, "app").await;
    server.register_with_reply::<Ask, _>(Oracle).await.unwrap();
    let client = start_bus(&broker, "agent:one").await;

    let reply = client
        .execute(&Command::new(Ask {
            question: "status".into(),
        }))
        .await
        .unwrap();
    assert_eq!(
        reply,
        Some(Answer {
            text: "re: status".into()
        })
    );

    let sent = broker
        .published()
        .into_iter()
        .find(|m| m.routing_key == "app")
        .unwrap();
    assert_eq!(sent.exchange, "");
    assert!(
        sent.message
            .properties
            .reply_to
            .as_deref()
            .is_some_and(|r| !r.is_empty())
    );

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn execute_before_init_is_rejected() {
    let broker = MemoryBroker::new();
    let options = options("agent:one");
    let supervisor = ConnectionSupervisor::new(Arc::new(broker.clone()), &options);
    let bus = MessageBus::new(supervisor, options);

    let err = bus
        .execute(&Command::new(Ask {
            question: "early".into(),
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NotInitialized), "{err}");
    assert!(broker.published().is_empty());

    bus.init().await.unwrap();
    let reply = bus
        .execute(
            &Command::new(Ask {
                question: "late".into(),
            })
            .with_expect_reply(false),
        )
        .await
        .unwrap();
    assert!(reply.is_none());

    bus.dispose().await;
}

#[tokio::test]
async fn command_times_out_near_its_ttl() {
    let broker = MemoryBroker::new();
    let server = start_bus(&broker, "app").await;
    server.register_with_reply::<Ask, _>(Sleeper).await.unwrap();
    let client = start_bus(&broker, "agent:one").await;

    let started = Instant::now();
    let err = client
        .execute(
            &Command::new(Ask {
                question: "slow".into(),
            })
            .with_ttl(Duration::from_millis(1)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(started.elapsed() < Duration::from_millis(500));
    match err {
        BusError::Timeout { message_type, ttl } => {
            assert_eq!(message_type, "Ask");
            assert_eq!(ttl, Duration::from_millis(1));
        }
        other => panic!("unexpected error: {other}"),
    }

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn command_without_reply_returns_immediately() {
    let broker = MemoryBroker::new();
    let server = start_bus(&broker, "app").await;
    server.register_with_reply::<Ask, _>(Sleeper).await.unwrap();
    let client = start_bus(&broker, "agent:one").await;

    let started = Instant::now();
    let reply = client
        .execute(
            &Command::new(Ask {
                question: "fire".into(),
            })
            .with_expect_reply(false),
        )
        .await
        .unwrap();
    assert!(reply.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn command_to_explicit_destination() {
    let broker = MemoryBroker::new();
    let peer = start_bus(&broker, "agent:peer").await;
    peer.register_with_reply::<Ask, _>(Oracle).await.unwrap();
    let client = start_bus(&broker, "agent:one").await;

    let reply = client
        .execute(
            &Command::new(Ask {
                question: "direct".into(),
            })
            .with_destination("agent:peer"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.text, "re: direct");

    client.dispose().await;
    peer.dispose().await;
}

#[tokio::test]
async fn redelivered_messages_are_dropped() {
    let broker = MemoryBroker::new();
    let bus = start_bus(&broker, "agent:one").await;
    let count = Arc::new(AtomicU32::new(0));
    bus.register::<Foo, _>(Tally(count.clone())).await.unwrap();

    let delivery = |redelivered| Delivery {
        exchange: "EventBus".into(),
        routing_key: "Foo".into(),
        redelivered,
        properties: MessageProperties {
            message_type: Some("Foo".into()),
            ..Default::default()
        },
        body: br#"{"text":"again"}"#.to_vec(),
    };

    broker.inject("agent:one", delivery(true)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    broker.inject("agent:one", delivery(false)).unwrap();
    eventually(|| count.load(Ordering::SeqCst) == 1).await;

    bus.dispose().await;
}

#[tokio::test]
async fn all_handlers_for_a_type_are_invoked() {
    let broker = MemoryBroker::new();
    let bus = start_bus(&broker, "agent:one").await;
    let count = Arc::new(AtomicU32::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.register::<Foo, _>(Tally(count.clone())).await.unwrap();
    bus.register::<Foo, _>(Recorder(tx)).await.unwrap();

    bus.publish(&Event::new(Foo { text: "x".into() }))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    eventually(|| count.load(Ordering::SeqCst) == 1).await;

    bus.dispose().await;
}

#[tokio::test]
async fn register_unregister_binds_once_and_unbinds_once() {
    let broker = MemoryBroker::new();
    let bus = start_bus(&broker, "agent:one").await;
    let count = Arc::new(AtomicU32::new(0));
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(broker.bindings("agent:one").is_empty());

    bus.register::<Foo, _>(Tally(count.clone())).await.unwrap();
    assert_eq!(broker.bindings("agent:one"), vec![foo_binding()]);
    bus.register::<Foo, _>(Recorder(tx)).await.unwrap();
    // Registering the same handler type again changes nothing.
    bus.register::<Foo, _>(Tally(count.clone())).await.unwrap();
    assert_eq!(broker.bindings("agent:one"), vec![foo_binding()]);

    bus.unregister::<Foo, Tally>().await.unwrap();
    assert_eq!(broker.bindings("agent:one"), vec![foo_binding()]);
    assert!(matches!(
        bus.unregister::<Foo, Tally>().await,
        Err(BusError::HandlerNotFound(_))
    ));

    bus.unregister::<Foo, Recorder>().await.unwrap();
    assert!(broker.bindings("agent:one").is_empty());
    assert!(bus.registered_types().is_empty());
    assert!(matches!(
        bus.unregister::<Foo, Recorder>().await,
        Err(BusError::NoSubscriptionFound(_))
    ));

    bus.dispose().await;
}

#[tokio::test]
async fn bindings_are_rebuilt_after_reconnect() {
    let broker = MemoryBroker::new();
    let bus = start_bus(&broker, "agent:one").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.register::<Foo, _>(Recorder(tx)).await.unwrap();

    broker.sever_connections();
    assert!(!broker.queue_exists("agent:one"));

    eventually(|| broker.bindings("agent:one") == vec![foo_binding()]).await;
    assert_eq!(bus.supervisor().generation(), 2);

    bus.publish(&Event::new(Foo {
        text: "after".into(),
    }))
    .await
    .unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.text, "after");

    bus.dispose().await;
}

#[tokio::test]
async fn registration_while_disconnected_is_bound_on_reconnect() {
    let broker = MemoryBroker::new();
    let bus = start_bus(&broker, "agent:one").await;
    // Keep the broker refusing long enough for the registration to land
    // while no consumer exists.
    broker.fail_next_connects(3);
    broker.sever_connections();

    let count = Arc::new(AtomicU32::new(0));
    bus.register::<Foo, _>(Tally(count.clone())).await.unwrap();

    eventually(|| broker.bindings("agent:one") == vec![foo_binding()]).await;
    bus.publish(&Event::new(Foo { text: "late".into() }))
        .await
        .unwrap();
    eventually(|| count.load(Ordering::SeqCst) == 1).await;

    bus.dispose().await;
}
