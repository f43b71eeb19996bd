//! Handler registry keyed by wire message type.
//!
//! Each entry captures the concrete payload type at registration, so
//! dispatch decodes and invokes without any runtime type lookup.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use repeater_protocol::{Payload, codec};

use crate::error::BusError;
use crate::handler::{EventHandler, ReplyHandler};

pub(crate) type InvokeFuture =
    Pin<Box<dyn Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send + 'static>>;

type Invoke = Arc<dyn Fn(Vec<u8>) -> InvokeFuture + Send + Sync>;

/// One registered handler: its identity and a type-erased invoker that
/// decodes the body, runs the handler, and encodes the reply if any.
#[derive(Clone)]
pub(crate) struct HandlerEntry {
    id: TypeId,
    pub(crate) name: &'static str,
    invoke: Invoke,
}

impl HandlerEntry {
    pub(crate) fn event<E, H>(handler: H) -> Self
    where
        E: Payload,
        H: EventHandler<E>,
    {
        let handler = Arc::new(handler);
        let invoke: Invoke = Arc::new(move |body: Vec<u8>| -> InvokeFuture {
            let handler = handler.clone();
            Box::pin(async move {
                let event: E = codec::decode(&body)?;
                handler.handle(event).await?;
                Ok(None)
            })
        });
        Self {
            id: TypeId::of::<H>(),
            name: std::any::type_name::<H>(),
            invoke,
        }
    }

    pub(crate) fn reply<E, H>(handler: H) -> Self
    where
        E: Payload,
        H: ReplyHandler<E>,
    {
        let handler = Arc::new(handler);
        let invoke: Invoke = Arc::new(move |body: Vec<u8>| -> InvokeFuture {
            let handler = handler.clone();
            Box::pin(async move {
                let event: E = codec::decode(&body)?;
                let reply = handler.handle(event).await?;
                Ok(Some(codec::encode(&reply)?))
            })
        });
        Self {
            id: TypeId::of::<H>(),
            name: std::any::type_name::<H>(),
            invoke,
        }
    }

    pub(crate) fn invoke(&self, body: Vec<u8>) -> InvokeFuture {
        (self.invoke)(body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Added {
    /// First handler for the type; the queue must be bound.
    First,
    Appended,
    /// The same handler type was already registered for this message type.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removed {
    /// The entry is gone; the queue must be unbound.
    LastForType,
    Remaining,
}

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    entries: HashMap<String, Vec<HandlerEntry>>,
}

impl HandlerRegistry {
    pub(crate) fn add(&mut self, message_type: &str, entry: HandlerEntry) -> Added {
        match self.entries.get_mut(message_type) {
            Some(handlers) if handlers.iter().any(|h| h.id == entry.id) => Added::Duplicate,
            Some(handlers) => {
                handlers.push(entry);
                Added::Appended
            }
            None => {
                self.entries.insert(message_type.to_string(), vec![entry]);
                Added::First
            }
        }
    }

    pub(crate) fn remove(&mut self, message_type: &str, id: TypeId) -> Result<Removed, BusError> {
        let handlers = self
            .entries
            .get_mut(message_type)
            .ok_or_else(|| BusError::NoSubscriptionFound(message_type.to_string()))?;
        let idx = handlers
            .iter()
            .position(|h| h.id == id)
            .ok_or_else(|| BusError::HandlerNotFound(message_type.to_string()))?;
        handlers.remove(idx);
        if handlers.is_empty() {
            self.entries.remove(message_type);
            Ok(Removed::LastForType)
        } else {
            Ok(Removed::Remaining)
        }
    }

    /// Handlers for `message_type` in registration order.
    pub(crate) fn resolve(&self, message_type: &str) -> Result<Vec<HandlerEntry>, BusError> {
        let handlers = self
            .entries
            .get(message_type)
            .ok_or_else(|| BusError::NoSubscriptionFound(message_type.to_string()))?;
        if handlers.is_empty() {
            return Err(BusError::HandlerNotFound(message_type.to_string()));
        }
        Ok(handlers.clone())
    }

    pub(crate) fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.keys().cloned().collect();
        types.sort();
        types
    }
}
