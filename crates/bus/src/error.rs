use std::time::Duration;

use repeater_protocol::CodecError;

/// Errors from the message bus and its broker connection.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("bus not initialized, call `init` first")]
    NotInitialized,

    #[error("no subscription found for `{0}`")]
    NoSubscriptionFound(String),

    #[error("handler not found for `{0}`")]
    HandlerNotFound(String),

    #[error("no reply to `{message_type}` within {ttl:?}")]
    Timeout { message_type: String, ttl: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bus is closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("failed to connect after {attempts} attempt(s): {reason}")]
    ConnectFailed { attempts: u32, reason: String },
}

impl BusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
