//! Handler traits for inbound messages.
//!
//! Handlers are registered per payload type. An [`EventHandler`] only
//! consumes; a [`ReplyHandler`] produces a reply that the bus publishes to
//! the sender's reply address.

use std::future::Future;
use std::pin::Pin;

use repeater_protocol::Payload;
use serde::Serialize;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

pub trait EventHandler<E: Payload>: Send + Sync + 'static {
    fn handle(&self, event: E) -> HandlerFuture<'_, ()>;
}

pub trait ReplyHandler<E: Payload>: Send + Sync + 'static {
    type Reply: Serialize + Send + 'static;

    fn handle(&self, event: E) -> HandlerFuture<'_, Self::Reply>;
}
