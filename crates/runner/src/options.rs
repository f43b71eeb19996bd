use std::collections::BTreeSet;
use std::time::Duration;

use repeater_protocol::Headers;
use repeater_protocol::codec::duration_ms;
use repeater_protocol::constants::{
    DEFAULT_ALLOWED_MIME_TYPES, DEFAULT_MAX_CONTENT_LENGTH, DEFAULT_REQUEST_TIMEOUT,
    UNLIMITED_CONTENT_LENGTH,
};
use serde::{Deserialize, Serialize};

/// Settings shared by the request runners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestRunnerOptions {
    /// Upper bound for one request, connect included.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// HTTP proxy every target request goes through.
    pub proxy_url: Option<String>,
    /// Response MIME types that are never truncated.
    pub allowed_mime_types: BTreeSet<String>,
    /// Response body limit in bytes; `-1` disables truncation.
    pub max_content_length: i64,
    /// Keep idle connections to targets for reuse.
    pub reuse_connection: bool,
    /// Added to every request that does not set them itself.
    pub headers: Headers,
}

impl Default for RequestRunnerOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            proxy_url: None,
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            reuse_connection: false,
            headers: Headers::new(),
        }
    }
}

impl RequestRunnerOptions {
    /// The configured timeout, or the default when it is zero.
    pub fn request_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            self.timeout
        }
    }

    /// Whether a response of `mime` (essence only, lowercase) is returned
    /// whole.
    pub fn is_allowed_mime(&self, mime: &str) -> bool {
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime))
    }

    /// The byte limit for a body of type `mime`, or `None` when the body is
    /// kept whole.
    pub fn body_limit(&self, mime: Option<&str>) -> Option<usize> {
        if self.max_content_length == UNLIMITED_CONTENT_LENGTH
            || mime.is_some_and(|m| self.is_allowed_mime(m))
        {
            return None;
        }
        Some(usize::try_from(self.max_content_length).unwrap_or(0))
    }
}
