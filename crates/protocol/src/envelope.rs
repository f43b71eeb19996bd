//! Message envelopes.
//!
//! A payload travels as the JSON body of a broker message; the envelope
//! metadata (type, correlation id, creation time) travels in the message
//! properties. [`Event`] is fire-and-forget, [`Command`] expects a typed
//! reply bounded by a time-to-live.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::constants::DEFAULT_COMMAND_TTL;

/// A type that can travel as a message body.
///
/// The wire name defaults to the Rust type's short name (`RepeaterStatusEvent`
/// for `repeater_protocol::messages::RepeaterStatusEvent`).
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn message_type() -> &'static str {
        short_type_name::<Self>()
    }
}

/// A payload that is answered with a typed reply.
pub trait CommandPayload: Payload {
    type Reply: Serialize + DeserializeOwned + Send + 'static;
}

/// Returns the last path segment of a type name, without generic arguments.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Metadata shared by every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    pub message_type: String,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

impl MessageMeta {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A published message nobody replies to.
#[derive(Debug, Clone)]
pub struct Event<T> {
    meta: MessageMeta,
    payload: T,
}

impl<T: Payload> Event<T> {
    pub fn new(payload: T) -> Self {
        Self {
            meta: MessageMeta::new(T::message_type()),
            payload,
        }
    }
}

impl<T> Event<T> {
    /// Overrides the wire type (and so the routing key).
    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.meta.message_type = message_type.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.meta.correlation_id = correlation_id.into();
        self
    }

    pub fn meta(&self) -> &MessageMeta {
        &self.meta
    }

    pub fn message_type(&self) -> &str {
        &self.meta.message_type
    }

    pub fn correlation_id(&self) -> &str {
        &self.meta.correlation_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.meta.created_at
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// A message answered with `T::Reply`.
#[derive(Debug, Clone)]
pub struct Command<T> {
    meta: MessageMeta,
    payload: T,
    ttl: Duration,
    expect_reply: bool,
    destination: Option<String>,
}

impl<T: CommandPayload> Command<T> {
    pub fn new(payload: T) -> Self {
        Self {
            meta: MessageMeta::new(T::message_type()),
            payload,
            ttl: DEFAULT_COMMAND_TTL,
            expect_reply: true,
            destination: None,
        }
    }
}

impl<T> Command<T> {
    /// Sets how long the caller waits for the reply. Zero falls back to the
    /// default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = if ttl.is_zero() { DEFAULT_COMMAND_TTL } else { ttl };
        self
    }

    pub fn with_expect_reply(mut self, expect_reply: bool) -> Self {
        self.expect_reply = expect_reply;
        self
    }

    /// Sends the command to `queue` instead of the application queue.
    pub fn with_destination(mut self, queue: impl Into<String>) -> Self {
        self.destination = Some(queue.into());
        self
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.meta.message_type = message_type.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.meta.correlation_id = correlation_id.into();
        self
    }

    pub fn meta(&self) -> &MessageMeta {
        &self.meta
    }

    pub fn message_type(&self) -> &str {
        &self.meta.message_type
    }

    pub fn correlation_id(&self) -> &str {
        &self.meta.correlation_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.meta.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expect_reply(&self) -> bool {
        self.expect_reply
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }
}
