//! HTTP request runner.
//!
//! Sends the request as described, without following redirects or
//! validating target certificates, and returns the response with its body
//! decoded by the declared charset and truncated to the configured limit.

use repeater_protocol::constants::CANCELED_MESSAGE;
use repeater_protocol::{ErrorCode, Headers, Protocol, RequestExecutingEvent, RequestExecutingResult};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, trace, warn};

use crate::error::RunnerError;
use crate::options::RequestRunnerOptions;
use crate::registry::{RequestRunner, RunnerFuture};

pub struct HttpRequestRunner {
    client: reqwest::Client,
    options: RequestRunnerOptions,
}

impl HttpRequestRunner {
    /// Builds the runner and its client. Fails only on an unusable proxy URL
    /// or client configuration.
    pub fn new(options: RequestRunnerOptions) -> Result<Self, RunnerError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true);
        if !options.reuse_connection {
            builder = builder.pool_max_idle_per_host(0);
        }
        if let Some(proxy_url) = options.proxy_url.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|_| RunnerError::InvalidProxy(proxy_url.to_string()))?;
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            client: builder.build()?,
            options,
        })
    }

    pub fn options(&self) -> &RequestRunnerOptions {
        &self.options
    }

    async fn execute(
        &self,
        request: &RequestExecutingEvent,
    ) -> Result<RequestExecutingResult, RunnerError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|_| RunnerError::InvalidMethod(request.method.to_string()))?;
        let mut outbound = request.headers.clone();
        outbound.merge_defaults(&self.options.headers);

        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(header_map(&outbound));
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            headers.append(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
        }

        if request.method.is_head() || status == StatusCode::NO_CONTENT {
            headers.insert(CONTENT_LENGTH.as_str(), "0");
            return Ok(RequestExecutingResult::success(
                Protocol::Http,
                status.as_u16(),
                headers,
                String::new(),
            ));
        }

        let (mime, charset) = headers
            .first("content-type")
            .map(parse_content_type)
            .unwrap_or_default();
        let bytes = response.bytes().await?;
        let mut body = decode_body(&bytes, charset.as_deref());
        if let Some(limit) = self.options.body_limit(mime.as_deref()) {
            truncate_utf8(&mut body, limit);
        }
        headers.insert(CONTENT_LENGTH.as_str(), body.len().to_string());

        trace!(
            status = status.as_u16(),
            received = bytes.len(),
            returned = body.len(),
            "http response collected"
        );
        Ok(RequestExecutingResult::success(
            Protocol::Http,
            status.as_u16(),
            headers,
            body,
        ))
    }
}

impl RequestRunner for HttpRequestRunner {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn run<'a>(&'a self, request: &'a RequestExecutingEvent) -> RunnerFuture<'a> {
        Box::pin(async move {
            debug!(method = %request.method, url = %request.url, "running http request");
            let timeout = self.options.request_timeout();
            match tokio::time::timeout(timeout, self.execute(request)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    let code = e.code();
                    warn!(url = %request.url, error = %e, %code, "http request failed");
                    RequestExecutingResult::failure(Protocol::Http, e.to_string(), code)
                }
                Err(_) => {
                    warn!(url = %request.url, ?timeout, "http request timed out");
                    RequestExecutingResult::failure(
                        Protocol::Http,
                        CANCELED_MESSAGE,
                        ErrorCode::TimedOut,
                    )
                }
            }
        })
    }
}

/// Converts request headers, skipping names or values the client cannot
/// send and any `Content-Length`, which the client computes itself.
fn header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers.iter() {
        if name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str()) {
            continue;
        }
        let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(name, "skipping invalid header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_bytes(value.as_bytes()) {
                Ok(value) => {
                    map.append(header.clone(), value);
                }
                Err(_) => debug!(name, "skipping invalid header value"),
            }
        }
    }
    map
}

/// Splits a `Content-Type` value into its lowercase essence and charset.
pub(crate) fn parse_content_type(raw: &str) -> (Option<String>, Option<String>) {
    let mut parts = raw.split(';');
    let essence = parts
        .next()
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty());
    let charset = parts.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
    });
    (essence, charset)
}

/// Decodes with the declared charset, falling back to UTF-8 for a missing
/// or unknown label. A byte order mark overrides the label.
pub(crate) fn decode_body(bytes: &[u8], charset: Option<&str>) -> String {
    let encoding = charset
        .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

/// Truncates to at most `limit` bytes without splitting a character.
pub(crate) fn truncate_utf8(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_parsing() {
        assert_eq!(
            parse_content_type("Text/HTML; Charset=\"ISO-8859-1\""),
            (Some("text/html".into()), Some("ISO-8859-1".into()))
        );
        assert_eq!(
            parse_content_type("application/json"),
            (Some("application/json".into()), None)
        );
        assert_eq!(parse_content_type(""), (None, None));
    }

    #[test]
    fn decodes_by_charset() {
        assert_eq!(decode_body(b"caf\xe9", Some("iso-8859-1")), "café");
        assert_eq!(decode_body("café".as_bytes(), None), "café");
        assert_eq!(decode_body(b"plain", Some("no-such-charset")), "plain");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut text = String::from("hello");
        truncate_utf8(&mut text, 1);
        assert_eq!(text, "h");

        let mut text = String::from("é!");
        truncate_utf8(&mut text, 1);
        assert_eq!(text, "");

        let mut text = String::from("short");
        truncate_utf8(&mut text, 100);
        assert_eq!(text, "short");
    }

    #[test]
    fn header_map_skips_content_length_and_invalid_names() {
        let headers: Headers = [
            ("X-One", "1"),
            ("Content-Length", "99"),
            ("bad header", "x"),
            ("X-One", "2"),
        ]
        .into_iter()
        .collect();
        let map = header_map(&headers);
        assert!(!map.contains_key(CONTENT_LENGTH));
        let values: Vec<_> = map.get_all("x-one").iter().collect();
        assert_eq!(values, ["1", "2"]);
        assert_eq!(map.len(), 2);
    }
}
