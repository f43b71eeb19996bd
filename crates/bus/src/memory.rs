//! In-process broker.
//!
//! [`MemoryBroker`] implements the broker contract the bus relies on
//! (direct exchanges, named and generated queues, bindings, per-channel
//! reply addresses, round-robin delivery) entirely in memory. It backs the
//! test suites and local development, and exposes hooks to sever
//! connections, inject raw deliveries, and observe published traffic.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::BusError;
use crate::transport::{
    BrokerFuture, Channel, ConnectParams, Connection, ConnectionFault, Delivery, FaultNotifier,
    OutboundMessage, QueueSpec, Transport,
};

/// Number of published messages kept for [`MemoryBroker::published`].
const PUBLISHED_HISTORY: usize = 1024;

const REPLY_ADDRESS_PREFIX: &str = "amq.rabbitmq.reply-to.";

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

struct Subscriber {
    connection: u64,
    channel: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    owner: Option<u64>,
    auto_delete: bool,
    had_consumers: bool,
    bindings: BTreeSet<(String, String)>,
    subscribers: Vec<Subscriber>,
    next: usize,
    backlog: VecDeque<Delivery>,
}

impl QueueState {
    fn enqueue(&mut self, delivery: Delivery) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        if self.subscribers.is_empty() {
            self.backlog.push_back(delivery);
            return;
        }
        let idx = self.next % self.subscribers.len();
        self.next = self.next.wrapping_add(1);
        if let Err(err) = self.subscribers[idx].tx.send(delivery) {
            self.backlog.push_back(err.0);
        }
    }

    fn is_abandoned(&self) -> bool {
        self.auto_delete && self.had_consumers && self.subscribers.is_empty()
    }
}

struct ReplyRoute {
    connection: u64,
    channel: u64,
    tx: Option<mpsc::UnboundedSender<Delivery>>,
}

struct ConnectionEntry {
    open: Arc<AtomicBool>,
    faults: FaultNotifier,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    replies: HashMap<String, ReplyRoute>,
    connections: HashMap<u64, ConnectionEntry>,
    published: VecDeque<PublishedMessage>,
    failing_connects: u32,
    credentials: Option<(String, String)>,
}

impl BrokerState {
    fn close_connection(&mut self, id: u64) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&id)?;
        entry.open.store(false, Ordering::SeqCst);
        self.replies.retain(|_, r| r.connection != id);
        for queue in self.queues.values_mut() {
            queue.subscribers.retain(|s| s.connection != id);
        }
        self.queues
            .retain(|_, q| q.owner != Some(id) && !q.is_abandoned());
        Some(entry)
    }

    fn close_channel(&mut self, id: u64) {
        self.replies.retain(|_, r| r.channel != id);
        for queue in self.queues.values_mut() {
            queue.subscribers.retain(|s| s.channel != id);
        }
        self.queues.retain(|_, q| !q.is_abandoned());
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BusError> {
        if !exchange.is_empty() && !self.exchanges.contains(exchange) {
            return Err(BusError::Transport(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }

        if self.published.len() == PUBLISHED_HISTORY {
            self.published.pop_front();
        }
        self.published.push_back(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });

        let delivery = Delivery {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
            properties: message.properties,
            body: message.body,
        };

        if exchange.is_empty() {
            if let Some(route) = self.replies.get(routing_key) {
                if let Some(tx) = &route.tx {
                    let _ = tx.send(delivery);
                }
                return Ok(());
            }
            match self.queues.get_mut(routing_key) {
                Some(queue) => queue.enqueue(delivery),
                None => trace!(routing_key, "unroutable message dropped"),
            }
            return Ok(());
        }

        let key = (exchange.to_string(), routing_key.to_string());
        for queue in self.queues.values_mut() {
            if queue.bindings.contains(&key) {
                queue.enqueue(delivery.clone());
            }
        }
        Ok(())
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    ids: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// An in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                ids: AtomicU64::new(0),
            }),
        }
    }

    /// Requires connections to present these credentials.
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.shared.lock().credentials = Some((username.into(), password.into()));
        self
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.lock().failing_connects = count;
    }

    /// Closes every open connection and reports a shutdown fault for each.
    pub fn sever_connections(&self) {
        let fault = ConnectionFault::Shutdown {
            reason: "connection severed".into(),
        };
        self.raise(|| fault.clone(), true);
    }

    /// Reports `fault` on every open connection without closing it.
    pub fn raise_fault(&self, fault: ConnectionFault) {
        self.raise(|| fault.clone(), false);
    }

    fn raise(&self, fault: impl Fn() -> ConnectionFault, close: bool) {
        let notifiers: Vec<FaultNotifier> = {
            let mut state = self.shared.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            let mut notifiers = Vec::with_capacity(ids.len());
            for id in ids {
                let notifier = if close {
                    state.close_connection(id).map(|e| e.faults)
                } else {
                    state.connections.get(&id).map(|e| e.faults.clone())
                };
                notifiers.extend(notifier);
            }
            notifiers
        };
        for notifier in notifiers {
            let fault = fault();
            debug!(generation = notifier.generation(), %fault, "raising connection fault");
            notifier.notify(fault);
        }
    }

    /// Delivers a raw message straight to `queue`.
    pub fn inject(&self, queue: &str, delivery: Delivery) -> Result<(), BusError> {
        let mut state = self.shared.lock();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Transport(format!("NOT_FOUND - no queue '{queue}'")))?;
        queue_state.enqueue(delivery);
        Ok(())
    }

    /// Messages published so far, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.lock().published.iter().cloned().collect()
    }

    /// `(exchange, routing key)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }
}

impl Transport for MemoryBroker {
    fn connect<'a>(
        &'a self,
        params: &'a ConnectParams,
        faults: FaultNotifier,
    ) -> BrokerFuture<'a, Arc<dyn Connection>> {
        Box::pin(async move {
            let id = self.shared.next_id();
            let open = Arc::new(AtomicBool::new(true));
            {
                let mut state = self.shared.lock();
                if state.failing_connects > 0 {
                    state.failing_connects -= 1;
                    return Err(BusError::Transport(format!(
                        "connection refused: {}",
                        params.url
                    )));
                }
                if let Some((user, pass)) = &state.credentials {
                    let accepted = params.username.as_deref() == Some(user.as_str())
                        && params.password.as_deref() == Some(pass.as_str());
                    if !accepted {
                        return Err(BusError::Transport(
                            "ACCESS_REFUSED - login refused".into(),
                        ));
                    }
                }
                state.connections.insert(
                    id,
                    ConnectionEntry {
                        open: open.clone(),
                        faults,
                    },
                );
            }
            trace!(connection = id, url = %params.url, "memory connection opened");
            let connection: Arc<dyn Connection> = Arc::new(MemoryConnection {
                id,
                shared: self.shared.clone(),
                open,
            });
            Ok(connection)
        })
    }
}

struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    open: Arc<AtomicBool>,
}

impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn Channel>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(BusError::Closed);
            }
            let id = self.shared.next_id();
            let reply_address = format!("{REPLY_ADDRESS_PREFIX}{}", uuid::Uuid::new_v4().simple());
            self.shared.lock().replies.insert(
                reply_address.clone(),
                ReplyRoute {
                    connection: self.id,
                    channel: id,
                    tx: None,
                },
            );
            let channel: Arc<dyn Channel> = Arc::new(MemoryChannel {
                id,
                connection: self.id,
                shared: self.shared.clone(),
                connection_open: self.open.clone(),
                open: AtomicBool::new(true),
                reply_address,
            });
            Ok(channel)
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.shared.lock().close_connection(self.id);
            Ok(())
        })
    }
}

struct MemoryChannel {
    id: u64,
    connection: u64,
    shared: Arc<Shared>,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
    reply_address: String,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }

    fn subscribe(
        &self,
        state: &mut BrokerState,
        queue: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BusError> {
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Transport(format!("NOT_FOUND - no queue '{queue}'")))?;
        if queue_state.owner.is_some_and(|owner| owner != self.connection) {
            return Err(BusError::Transport(format!(
                "RESOURCE_LOCKED - queue '{queue}' is exclusive to another connection"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        queue_state.had_consumers = true;
        queue_state.subscribers.push(Subscriber {
            connection: self.connection,
            channel: self.id,
            tx,
        });
        let backlog: Vec<Delivery> = queue_state.backlog.drain(..).collect();
        for delivery in backlog {
            queue_state.enqueue(delivery);
        }
        Ok(rx)
    }
}

impl Channel for MemoryChannel {
    fn declare_exchange<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            self.shared.lock().exchanges.insert(name.to_string());
            Ok(())
        })
    }

    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BrokerFuture<'a, String> {
        Box::pin(async move {
            self.ensure_open()?;
            let name = if spec.name.is_empty() {
                format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
            } else {
                spec.name.clone()
            };
            let mut state = self.shared.lock();
            let queue = state.queues.entry(name.clone()).or_insert_with(|| QueueState {
                owner: spec.exclusive.then_some(self.connection),
                auto_delete: spec.auto_delete,
                ..Default::default()
            });
            if queue.owner.is_some_and(|owner| owner != self.connection) {
                return Err(BusError::Transport(format!(
                    "RESOURCE_LOCKED - queue '{name}' is exclusive to another connection"
                )));
            }
            Ok(name)
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.shared.lock();
            if !state.exchanges.contains(exchange) {
                return Err(BusError::Transport(format!(
                    "NOT_FOUND - no exchange '{exchange}'"
                )));
            }
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Transport(format!("NOT_FOUND - no queue '{queue}'")))?;
            queue_state
                .bindings
                .insert((exchange.to_string(), routing_key.to_string()));
            Ok(())
        })
    }

    fn unbind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if let Some(queue_state) = self.shared.lock().queues.get_mut(queue) {
                queue_state
                    .bindings
                    .remove(&(exchange.to_string(), routing_key.to_string()));
            }
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: OutboundMessage,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            self.shared.lock().route(exchange, routing_key, message)
        })
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, mpsc::UnboundedReceiver<Delivery>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.shared.lock();
            self.subscribe(&mut state, queue)
        })
    }

    fn reply_address(&self) -> &str {
        &self.reply_address
    }

    fn consume_replies(&self) -> BrokerFuture<'_, mpsc::UnboundedReceiver<Delivery>> {
        Box::pin(async move {
            self.ensure_open()?;
            let (tx, rx) = mpsc::unbounded_channel();
            match self.shared.lock().replies.get_mut(&self.reply_address) {
                Some(route) => route.tx = Some(tx),
                None => return Err(BusError::Closed),
            }
            Ok(rx)
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.open.swap(false, Ordering::SeqCst) {
                self.shared.lock().close_channel(self.id);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageProperties;

    async fn open(broker: &MemoryBroker) -> (Arc<dyn Connection>, mpsc::UnboundedReceiver<(u64, ConnectionFault)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let params = ConnectParams {
            url: "memory://test".into(),
            ..Default::default()
        };
        let conn = broker.connect(&params, FaultNotifier::new(1, tx)).await.unwrap();
        (conn, rx)
    }

    fn message(body: &str) -> OutboundMessage {
        OutboundMessage {
            properties: MessageProperties::default(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn direct_exchange_routes_by_binding() {
        let broker = MemoryBroker::new();
        let (conn, _faults) = open(&broker).await;
        let ch = conn.create_channel().await.unwrap();
        ch.declare_exchange("EventBus").await.unwrap();
        let q = ch.declare_queue(&QueueSpec::new("q1")).await.unwrap();
        ch.bind_queue(&q, "EventBus", "Foo").await.unwrap();
        let mut rx = ch.consume(&q).await.unwrap();

        ch.publish("EventBus", "Bar", message("ignored")).await.unwrap();
        ch.publish("EventBus", "Foo", message("hello")).await.unwrap();

        let d = rx.recv().await.unwrap();
        assert_eq!(d.body, b"hello");
        assert_eq!(d.routing_key, "Foo");
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let (conn, _faults) = open(&broker).await;
        let ch = conn.create_channel().await.unwrap();
        let err = ch.publish("nope", "Foo", message("x")).await.unwrap_err();
        assert!(matches!(err, BusError::Transport(_)));
    }

    #[tokio::test]
    async fn default_exchange_reaches_reply_address() {
        let broker = MemoryBroker::new();
        let (conn, _faults) = open(&broker).await;
        let requester = conn.create_channel().await.unwrap();
        let responder = conn.create_channel().await.unwrap();
        let mut replies = requester.consume_replies().await.unwrap();

        responder
            .publish("", requester.reply_address(), message("pong"))
            .await
            .unwrap();
        assert_eq!(replies.recv().await.unwrap().body, b"pong");
    }

    #[tokio::test]
    async fn backlog_is_flushed_to_first_consumer() {
        let broker = MemoryBroker::new();
        let (conn, _faults) = open(&broker).await;
        let ch = conn.create_channel().await.unwrap();
        ch.declare_queue(&QueueSpec::new("app")).await.unwrap();
        ch.publish("", "app", message("early")).await.unwrap();

        let mut rx = ch.consume("app").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().body, b"early");
    }

    #[tokio::test]
    async fn consumers_receive_round_robin() {
        let broker = MemoryBroker::new();
        let (conn, _faults) = open(&broker).await;
        let ch = conn.create_channel().await.unwrap();
        ch.declare_queue(&QueueSpec::new("work")).await.unwrap();
        let mut a = ch.consume("work").await.unwrap();
        let mut b = ch.consume("work").await.unwrap();

        for body in ["1", "2"] {
            ch.publish("", "work", message(body)).await.unwrap();
        }
        assert_eq!(a.recv().await.unwrap().body, b"1");
        assert_eq!(b.recv().await.unwrap().body, b"2");
    }

    #[tokio::test]
    async fn exclusive_queue_is_locked_to_its_connection() {
        let broker = MemoryBroker::new();
        let (owner, _f1) = open(&broker).await;
        let (other, _f2) = open(&broker).await;
        let spec = QueueSpec::new("agent:1").durable().exclusive().auto_delete();
        owner.create_channel().await.unwrap().declare_queue(&spec).await.unwrap();

        let ch = other.create_channel().await.unwrap();
        assert!(ch.declare_queue(&spec).await.is_err());
        assert!(ch.consume("agent:1").await.is_err());
        // Publishing by name is still allowed.
        ch.publish("", "agent:1", message("x")).await.unwrap();
    }

    #[tokio::test]
    async fn sever_closes_connections_and_drops_exclusive_queues() {
        let broker = MemoryBroker::new();
        let (conn, mut faults) = open(&broker).await;
        let ch = conn.create_channel().await.unwrap();
        let spec = QueueSpec::new("agent:1").exclusive();
        ch.declare_queue(&spec).await.unwrap();
        let mut rx = ch.consume("agent:1").await.unwrap();

        broker.sever_connections();

        assert!(!conn.is_open());
        assert!(!broker.queue_exists("agent:1"));
        assert!(rx.recv().await.is_none());
        let (generation, fault) = faults.recv().await.unwrap();
        assert_eq!(generation, 1);
        assert!(matches!(fault, ConnectionFault::Shutdown { .. }));
        assert!(matches!(ch.declare_exchange("x").await, Err(BusError::Closed)));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn raise_fault_keeps_connection_open() {
        let broker = MemoryBroker::new();
        let (conn, mut faults) = open(&broker).await;
        broker.raise_fault(ConnectionFault::Blocked {
            reason: "memory alarm".into(),
        });
        assert!(conn.is_open());
        let (_, fault) = faults.recv().await.unwrap();
        assert_eq!(
            fault,
            ConnectionFault::Blocked {
                reason: "memory alarm".into()
            }
        );
    }

    #[tokio::test]
    async fn failing_connects_and_credentials() {
        let broker = MemoryBroker::new().with_credentials("guest", "secret");
        broker.fail_next_connects(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut params = ConnectParams {
            url: "memory://test".into(),
            username: Some("guest".into()),
            password: Some("secret".into()),
        };
        assert!(broker.connect(&params, FaultNotifier::new(1, tx.clone())).await.is_err());
        assert!(broker.connect(&params, FaultNotifier::new(1, tx.clone())).await.is_ok());
        params.password = Some("wrong".into());
        assert!(broker.connect(&params, FaultNotifier::new(2, tx)).await.is_err());
    }

    #[tokio::test]
    async fn inject_marks_redelivery() {
        let broker = MemoryBroker::new();
        let (conn, _faults) = open(&broker).await;
        let ch = conn.create_channel().await.unwrap();
        ch.declare_queue(&QueueSpec::new("q")).await.unwrap();
        let mut rx = ch.consume("q").await.unwrap();
        broker
            .inject(
                "q",
                Delivery {
                    exchange: String::new(),
                    routing_key: "q".into(),
                    redelivered: true,
                    properties: MessageProperties::default(),
                    body: b"again".to_vec(),
                },
            )
            .unwrap();
        assert!(rx.recv().await.unwrap().redelivered);
        assert!(broker.inject("missing", empty_delivery()).is_err());
    }

    fn empty_delivery() -> Delivery {
        Delivery {
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: MessageProperties::default(),
            body: Vec::new(),
        }
    }
}
