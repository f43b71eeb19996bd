use std::time::Duration;

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Name of the direct exchange carrying events.
pub const DEFAULT_EXCHANGE: &str = "EventBus";

/// Well-known queue the backend consumes commands from.
pub const DEFAULT_APP_QUEUE: &str = "app";

/// Prefix of the per-agent inbound queue (`agent:<repeater id>`).
pub const CLIENT_QUEUE_PREFIX: &str = "agent:";

/// The broker's nameless default exchange, which routes by queue name.
pub const DIRECT_EXCHANGE: &str = "";

/// Time a command waits for its reply when no TTL is given.
pub const DEFAULT_COMMAND_TTL: Duration = Duration::from_secs(10);

/// Interval between `connected` status heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default timeout for a single target request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on the number of response body bytes returned.
pub const DEFAULT_MAX_CONTENT_LENGTH: i64 = 1024;

/// `max_content_length` value that disables truncation.
pub const UNLIMITED_CONTENT_LENGTH: i64 = -1;

/// Close code reported when a WebSocket peer closes without one.
pub const WS_NORMAL_CLOSURE: u16 = 1000;

/// Message reported when a target request exceeds its timeout.
pub const CANCELED_MESSAGE: &str = "The operation was canceled.";

/// Response media types that are never truncated.
pub const DEFAULT_ALLOWED_MIME_TYPES: &[&str] = &[
    "text/html",
    "text/plain",
    "text/css",
    "text/javascript",
    "text/markdown",
    "text/xml",
    "application/javascript",
    "application/x-javascript",
    "application/json",
    "application/xml",
    "application/x-www-form-urlencoded",
    "application/msgpack",
    "application/ld+json",
    "application/graphql",
];

/// Returns the per-agent queue name for a repeater.
pub fn client_queue_name(repeater_id: &str) -> String {
    format!("{CLIENT_QUEUE_PREFIX}{repeater_id}")
}
