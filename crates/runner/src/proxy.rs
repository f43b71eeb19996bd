//! HTTP CONNECT tunnelling for WebSocket targets.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::RunnerError;

/// Largest proxy response head accepted.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Opens a tunnel to `host:port` through the HTTP proxy at `proxy_url`.
///
/// Credentials in the proxy URL are sent as basic proxy authorization.
pub(crate) async fn connect_tunnel(
    proxy_url: &str,
    host: &str,
    port: u16,
) -> Result<TcpStream, RunnerError> {
    let invalid = || RunnerError::InvalidProxy(proxy_url.to_string());
    let proxy = reqwest::Url::parse(proxy_url).map_err(|_| invalid())?;
    let proxy_host = proxy.host_str().ok_or_else(invalid)?;
    let proxy_port = proxy.port_or_known_default().ok_or_else(invalid)?;

    let mut stream = TcpStream::connect(format!("{proxy_host}:{proxy_port}")).await?;

    let authority = format!("{host}:{port}");
    let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or_default());
        head.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode(credentials)
        ));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;

    let response = read_response_head(&mut stream).await?;
    let status_line = response.lines().next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(RunnerError::ProxyRefused(status_line.to_string()));
    }
    debug!(proxy = %proxy_host, target = %authority, "proxy tunnel established");
    Ok(stream)
}

/// Reads up to and including the blank line ending the response head, one
/// byte at a time so nothing past it is consumed.
async fn read_response_head(stream: &mut TcpStream) -> Result<String, RunnerError> {
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(RunnerError::ProxyRefused("response head too large".into()));
        }
        let byte = stream.read_u8().await?;
        head.push(byte);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}
