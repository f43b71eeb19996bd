//! Broker-backed message bus.
//!
//! [`ConnectionSupervisor`] keeps one broker connection alive through a
//! pluggable [`Transport`]; [`MessageBus`] publishes events, executes
//! commands with correlated replies, and dispatches inbound messages to
//! registered handlers, rebuilding its queue bindings after every reconnect.
//! [`MemoryBroker`] is an in-process transport for tests and local runs;
//! with the `amqp` feature, `AmqpTransport` talks to RabbitMQ.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod bus;
pub mod error;
pub mod handler;
pub mod memory;
pub mod options;
mod registry;
pub mod retry;
pub mod supervisor;
pub mod transport;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use bus::MessageBus;
pub use error::BusError;
pub use handler::{EventHandler, HandlerFuture, ReplyHandler};
pub use memory::MemoryBroker;
pub use options::BusOptions;
pub use retry::{ExponentialBackoff, RetryOptions, RetryStrategy};
pub use supervisor::{ConnectionState, ConnectionSupervisor, Consumer};
pub use transport::{
    BrokerFuture, Channel, ConnectParams, Connection, ConnectionFault, Delivery, FaultNotifier,
    MessageProperties, OutboundMessage, QueueSpec, Transport,
};
