//! WebSocket request runner.
//!
//! One round trip: connect, send the request body as a text message, then
//! read messages until one matches the correlation regex (or, without a
//! regex, until the first message). The connection is always closed
//! afterwards.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use repeater_protocol::constants::{CANCELED_MESSAGE, WS_NORMAL_CLOSURE};
use repeater_protocol::{ErrorCode, Headers, Protocol, RequestExecutingEvent, RequestExecutingResult};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::RunnerError;
use crate::options::RequestRunnerOptions;
use crate::proxy;
use crate::registry::{RequestRunner, RunnerFuture};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake headers owned by the WebSocket client.
const RESERVED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
];

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// What the read loop ended with.
struct Exchange {
    close_code: Option<u16>,
    reply: Option<String>,
}

pub struct WsRequestRunner {
    options: RequestRunnerOptions,
}

impl WsRequestRunner {
    pub fn new(options: RequestRunnerOptions) -> Self {
        Self { options }
    }

    /// Performs the handshake, directly or through the configured proxy,
    /// and returns the stream with the handshake response headers.
    async fn connect(
        &self,
        request: &RequestExecutingEvent,
    ) -> Result<(WsStream, Headers), RunnerError> {
        let mut handshake = request.url.as_str().into_client_request()?;
        let mut headers = request.headers.clone();
        headers.merge_defaults(&self.options.headers);
        for (name, values) in headers.iter() {
            if RESERVED_HEADERS.iter().any(|r| r.eq_ignore_ascii_case(name)) {
                continue;
            }
            let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
                debug!(name, "skipping invalid header name");
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                    handshake.headers_mut().append(header.clone(), value);
                }
            }
        }

        let proxy_url = self.options.proxy_url.as_deref().filter(|p| !p.is_empty());
        let (stream, response) = match proxy_url {
            None => tokio_tungstenite::connect_async_with_config(handshake, None, false).await?,
            Some(proxy_url) => {
                let uri = handshake.uri();
                let host = uri
                    .host()
                    .ok_or_else(|| RunnerError::InvalidProxy(proxy_url.to_string()))?
                    .to_string();
                let port = uri
                    .port_u16()
                    .unwrap_or(if uri.scheme_str() == Some("wss") { 443 } else { 80 });
                let tunnel = proxy::connect_tunnel(proxy_url, &host, port).await?;
                tokio_tungstenite::client_async_tls_with_config(handshake, tunnel, None, None)
                    .await?
            }
        };

        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Ok((stream, headers))
    }
}

impl RequestRunner for WsRequestRunner {
    fn protocol(&self) -> Protocol {
        Protocol::Ws
    }

    fn run<'a>(&'a self, request: &'a RequestExecutingEvent) -> RunnerFuture<'a> {
        Box::pin(async move {
            debug!(url = %request.url, "running websocket request");
            let matcher = match request
                .correlation_id_regex
                .as_deref()
                .filter(|r| !r.is_empty())
                .map(Regex::new)
                .transpose()
            {
                Ok(matcher) => matcher,
                Err(e) => return failed(request, e.into()),
            };

            let timeout = self.options.request_timeout();
            let deadline = Instant::now() + timeout;
            let (mut stream, headers) =
                match tokio::time::timeout_at(deadline, self.connect(request)).await {
                    Ok(Ok(connected)) => connected,
                    Ok(Err(e)) => return failed(request, e),
                    Err(_) => return timed_out(request, timeout),
                };

            let outcome = tokio::time::timeout_at(
                deadline,
                exchange(&mut stream, request.body.as_deref(), matcher.as_ref()),
            )
            .await;
            close(&mut stream).await;

            match outcome {
                Ok(Ok(exchange)) => RequestExecutingResult::success(
                    Protocol::Ws,
                    exchange.close_code.unwrap_or(WS_NORMAL_CLOSURE),
                    headers,
                    exchange.reply.unwrap_or_default(),
                ),
                Ok(Err(e)) => failed(request, e),
                Err(_) => timed_out(request, timeout),
            }
        })
    }
}

async fn exchange(
    stream: &mut WsStream,
    body: Option<&str>,
    matcher: Option<&Regex>,
) -> Result<Exchange, RunnerError> {
    if let Some(body) = body {
        stream.send(Message::Text(body.to_owned().into())).await?;
    }

    let mut close_code = None;
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            Message::Close(frame) => {
                close_code = frame.map(|f| u16::from(f.code));
                trace!(?close_code, "websocket closed by target");
                break;
            }
            _ => continue,
        };
        trace!(len = text.len(), "websocket message received");
        if matcher.is_none_or(|re| re.is_match(&text)) {
            return Ok(Exchange {
                close_code,
                reply: Some(text),
            });
        }
    }
    Ok(Exchange {
        close_code,
        reply: None,
    })
}

/// Best-effort close; errors are ignored.
async fn close(stream: &mut WsStream) {
    match tokio::time::timeout(CLOSE_TIMEOUT, stream.close(None)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(error = %e, "websocket close failed"),
        Err(_) => trace!("websocket close timed out"),
    }
}

fn failed(request: &RequestExecutingEvent, err: RunnerError) -> RequestExecutingResult {
    let code = err.code();
    warn!(url = %request.url, error = %err, %code, "websocket request failed");
    RequestExecutingResult::failure(Protocol::Ws, err.to_string(), code)
}

fn timed_out(request: &RequestExecutingEvent, timeout: Duration) -> RequestExecutingResult {
    warn!(url = %request.url, ?timeout, "websocket request timed out");
    RequestExecutingResult::failure(Protocol::Ws, CANCELED_MESSAGE, ErrorCode::TimedOut)
}
