use serde::{Deserialize, Serialize};

use crate::codec::{HttpMethod, wire_enum};
use crate::envelope::{CommandPayload, Payload};
use crate::headers::Headers;

// ---------------------------------------------------------------------------
// Wire enums
// ---------------------------------------------------------------------------

wire_enum! {
    /// Transport a target request is executed over.
    pub enum Protocol ("protocol") {
        Http => "http",
        Ws => "ws",
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Http
    }
}

wire_enum! {
    /// Classification of a failed target request.
    pub enum ErrorCode ("error code") {
        ConnectionRefused => "ECONNREFUSED",
        ConnectionReset => "ECONNRESET",
        ConnectionAborted => "ECONNABORTED",
        TimedOut => "ETIMEDOUT",
        NotFound => "ENOTFOUND",
        HostUnreachable => "EHOSTUNREACH",
        NetworkUnreachable => "ENETUNREACH",
        BrokenPipe => "EPIPE",
        AddressInUse => "EADDRINUSE",
        Protocol => "EPROTO",
        Canceled => "ECANCELED",
        Unknown => "UNKNOWN",
    }
}

wire_enum! {
    /// Reason the backend refused a repeater registration.
    pub enum RepeaterRegisteringError ("registration error") {
        Busy => "busy",
        NotActive => "not_active",
        NotFound => "not_found",
        RequiresToBeUpdated => "requires_to_be_updated",
    }
}

wire_enum! {
    pub enum RepeaterStatus ("repeater status") {
        Connected => "connected",
        Disconnected => "disconnected",
    }
}

// ---------------------------------------------------------------------------
// Request execution
// ---------------------------------------------------------------------------

/// A request the backend asks the repeater to run against a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestExecutingEvent {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    /// Selects which WebSocket message is the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id_regex: Option<String>,
}

impl RequestExecutingEvent {
    pub fn new(protocol: Protocol, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Headers::new(),
            body: None,
            protocol,
            correlation_id_regex: None,
        }
    }
}

impl Payload for RequestExecutingEvent {
    fn message_type() -> &'static str {
        "RequestExecuting"
    }
}

impl CommandPayload for RequestExecutingEvent {
    type Reply = RequestExecutingResult;
}

/// Outcome of a target request.
///
/// A success carries `status_code` and `body`; a failure carries `message`
/// and `error_code` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestExecutingResult {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl RequestExecutingResult {
    pub fn success(protocol: Protocol, status_code: u16, headers: Headers, body: String) -> Self {
        Self {
            protocol,
            status_code: Some(status_code),
            body: Some(body),
            headers,
            message: None,
            error_code: None,
        }
    }

    pub fn failure(protocol: Protocol, message: impl Into<String>, error_code: ErrorCode) -> Self {
        Self {
            protocol,
            status_code: None,
            body: None,
            headers: Headers::new(),
            message: Some(message.into()),
            error_code: Some(error_code),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error_code.is_some()
    }
}

// ---------------------------------------------------------------------------
// Registration and status
// ---------------------------------------------------------------------------

/// Announces a repeater to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRepeaterCommand {
    pub version: String,
    pub repeater_id: String,
}

impl Payload for RegisterRepeaterCommand {
    fn message_type() -> &'static str {
        "RepeaterRegistering"
    }
}

impl CommandPayload for RegisterRepeaterCommand {
    type Reply = RegisterRepeaterResult;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRepeaterResult {
    pub payload: RegisterRepeaterPayload,
}

/// Either the latest repeater version known to the backend or the reason
/// registration was refused.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterRepeaterPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RepeaterRegisteringError>,
}

/// Liveness report published on start, on every heartbeat, and on stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeaterStatusEvent {
    pub repeater_id: String,
    pub status: RepeaterStatus,
}

impl Payload for RepeaterStatusEvent {
    fn message_type() -> &'static str {
        "RepeaterStatusUpdated"
    }
}
