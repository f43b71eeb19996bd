//! Failure classification for target requests.
//!
//! A failed target request is an expected outcome, so runners never return
//! these errors; they turn them into a failure result carrying the message
//! and an [`ErrorCode`].

use std::error::Error as _;
use std::io;

use repeater_protocol::ErrorCode;
use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid request method `{0}`")]
    InvalidMethod(String),

    #[error("invalid correlation id regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("invalid proxy url `{0}`")]
    InvalidProxy(String),

    #[error("proxy refused the tunnel: {0}")]
    ProxyRefused(String),

    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Ws(#[from] tungstenite::Error),

    #[error("{0}")]
    Io(#[from] io::Error),
}

impl RunnerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidMethod(_) | Self::InvalidRegex(_) | Self::InvalidProxy(_) => {
                ErrorCode::Unknown
            }
            Self::ProxyRefused(_) => ErrorCode::Protocol,
            Self::Http(e) => from_reqwest(e),
            Self::Ws(e) => from_ws(e),
            Self::Io(e) => from_io(e.kind()),
        }
    }
}

pub fn from_io(kind: io::ErrorKind) -> ErrorCode {
    use io::ErrorKind::*;
    match kind {
        ConnectionRefused => ErrorCode::ConnectionRefused,
        ConnectionReset | UnexpectedEof => ErrorCode::ConnectionReset,
        ConnectionAborted => ErrorCode::ConnectionAborted,
        TimedOut => ErrorCode::TimedOut,
        HostUnreachable => ErrorCode::HostUnreachable,
        NetworkUnreachable => ErrorCode::NetworkUnreachable,
        BrokenPipe => ErrorCode::BrokenPipe,
        AddrInUse => ErrorCode::AddressInUse,
        Interrupted => ErrorCode::Canceled,
        InvalidData => ErrorCode::Protocol,
        _ => ErrorCode::Unknown,
    }
}

pub fn from_reqwest(err: &reqwest::Error) -> ErrorCode {
    if err.is_timeout() {
        return ErrorCode::TimedOut;
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            return from_io(io.kind());
        }
        if is_dns_failure(&cause.to_string()) {
            return ErrorCode::NotFound;
        }
        source = cause.source();
    }
    if err.is_connect() {
        ErrorCode::ConnectionRefused
    } else if err.is_redirect() || err.is_decode() {
        ErrorCode::Protocol
    } else {
        ErrorCode::Unknown
    }
}

pub fn from_ws(err: &tungstenite::Error) -> ErrorCode {
    use tungstenite::Error;
    use tungstenite::error::UrlError;
    match err {
        Error::Io(e) => from_io(e.kind()),
        Error::ConnectionClosed | Error::AlreadyClosed => ErrorCode::ConnectionReset,
        Error::Url(UrlError::UnableToConnect(reason)) if is_dns_failure(reason) => {
            ErrorCode::NotFound
        }
        Error::Url(UrlError::UnableToConnect(_)) => ErrorCode::ConnectionRefused,
        Error::Protocol(_) | Error::Capacity(_) | Error::Http(_) | Error::HttpFormat(_) => {
            ErrorCode::Protocol
        }
        _ => ErrorCode::Unknown,
    }
}

fn is_dns_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("dns error")
        || message.contains("failed to lookup")
        || message.contains("name or service not known")
}
