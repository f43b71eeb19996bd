use std::time::Duration;

use repeater_protocol::codec::duration_ms;
use repeater_protocol::constants::{DEFAULT_APP_QUEUE, DEFAULT_EXCHANGE};
use serde::{Deserialize, Serialize};

use crate::retry::RetryOptions;
use crate::transport::ConnectParams;

/// Broker connection and topology settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusOptions {
    /// Broker URL, e.g. `amqp://localhost:5672`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Direct exchange events are published on.
    pub exchange: String,
    /// Queue commands are sent to unless they name a destination.
    pub app_queue: String,
    /// Inbound queue of this client. Empty lets the broker name it.
    pub client_queue: String,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    pub reconnect: RetryOptions,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".into(),
            username: None,
            password: None,
            exchange: DEFAULT_EXCHANGE.into(),
            app_queue: DEFAULT_APP_QUEUE.into(),
            client_queue: String::new(),
            connect_timeout: Duration::from_secs(30),
            reconnect: RetryOptions::default(),
        }
    }
}

impl BusOptions {
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}
