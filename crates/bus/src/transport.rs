//! Broker transport abstraction.
//!
//! The bus talks to the broker only through these traits. A transport
//! provides connections; a connection provides channels; a channel declares
//! topology, publishes, and consumes. Each channel also owns an ephemeral
//! reply address: anything published to it on the default exchange is
//! delivered to that channel's reply consumer.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::BusError;

/// A boxed future returned by transport operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'a>>;

/// Where and how to reach the broker.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A degradation reported by the transport for an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFault {
    /// The connection was closed by the broker or the network.
    Shutdown { reason: String },
    /// A client-side callback failed and the connection is unusable.
    CallbackError { reason: String },
    /// The broker applied flow control.
    Blocked { reason: String },
}

impl fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown { reason } => write!(f, "shutdown: {reason}"),
            Self::CallbackError { reason } => write!(f, "callback error: {reason}"),
            Self::Blocked { reason } => write!(f, "blocked: {reason}"),
        }
    }
}

/// Reports faults of one connection back to its supervisor.
///
/// Every notifier is tagged with the generation of the connection it was
/// handed to, so faults from a replaced connection can be told apart.
#[derive(Debug, Clone)]
pub struct FaultNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, ConnectionFault)>,
}

impl FaultNotifier {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, ConnectionFault)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn notify(&self, fault: ConnectionFault) {
        let _ = self.tx.send((self.generation, fault));
    }
}

/// Properties carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// A message received from a queue or a reply address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Queue declaration. An empty name asks the broker to generate one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }
}

/// Opens broker connections.
pub trait Transport: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        params: &'a ConnectParams,
        faults: FaultNotifier,
    ) -> BrokerFuture<'a, Arc<dyn Connection>>;
}

pub trait Connection: Send + Sync {
    fn is_open(&self) -> bool;

    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn Channel>>;

    /// Closes the connection without raising a fault.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

pub trait Channel: Send + Sync {
    /// Declares a direct exchange. Redeclaring is a no-op.
    fn declare_exchange<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()>;

    /// Declares a queue and returns its (possibly generated) name.
    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BrokerFuture<'a, String>;

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()>;

    fn unbind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()>;

    /// Publishes a message. The empty exchange routes by queue name or
    /// reply address.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: OutboundMessage,
    ) -> BrokerFuture<'a, ()>;

    /// Starts consuming a queue. The stream ends when the channel or its
    /// connection closes.
    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, mpsc::UnboundedReceiver<Delivery>>;

    /// The ephemeral address replies to this channel are published to.
    fn reply_address(&self) -> &str;

    /// Starts consuming messages addressed to [`Channel::reply_address`].
    fn consume_replies(&self) -> BrokerFuture<'_, mpsc::UnboundedReceiver<Delivery>>;

    fn close(&self) -> BrokerFuture<'_, ()>;
}
