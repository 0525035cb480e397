//! Upstream Dispatcher (component J): header sanitization plus a streaming
//! upstream request with bounded retries and exponential backoff.

use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tracing::{debug, warn};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that must never be forwarded to the upstream, or that the
/// dispatcher recomputes itself.
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Debug)]
pub enum DispatchError {
    UpstreamTransport(String),
    InvalidUrl(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::UpstreamTransport(e) => write!(f, "upstream transport error: {e}"),
            DispatchError::InvalidUrl(e) => write!(f, "invalid upstream URL: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

pub struct DispatchRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub secret: String,
}

/// Strips hop-by-hop and proxy-auth headers and replaces `Authorization`
/// with `Bearer <secret>`.
pub fn sanitize_headers(mut headers: HeaderMap, secret: &str) -> HeaderMap {
    for name in STRIPPED_HEADERS {
        headers.remove(*name);
    }
    headers.remove(AUTHORIZATION);
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {secret}")) {
        headers.insert(AUTHORIZATION, value);
    }
    headers
}

/// Filters hop-by-hop response headers before relaying to the client.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub struct RetryPolicy {
    pub retry_max: u32,
    pub retry_base_ms: u64,
}

/// Dispatches one request to the upstream, retrying connection-level
/// failures and `429`/`5xx` statuses up to `retry_policy.retry_max` times
/// with exponential backoff (`retry_base_ms * 2^attempt`).
pub async fn dispatch(
    client: &reqwest::Client,
    request: DispatchRequest,
    retry_policy: &RetryPolicy,
) -> Result<reqwest::Response, DispatchError> {
    let mut attempt: u32 = 0;
    loop {
        let built = client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| DispatchError::InvalidUrl(e.to_string()))?;

        match client.execute(built).await {
            Ok(response) => {
                let status = response.status();
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if retryable && attempt < retry_policy.retry_max {
                    drop(response);
                    backoff(&retry_policy, attempt).await;
                    attempt += 1;
                    continue;
                }
                return Ok(response);
            }
            Err(e) => {
                if attempt < retry_policy.retry_max {
                    warn!(attempt, error = %e, "upstream connection error, retrying");
                    backoff(&retry_policy, attempt).await;
                    attempt += 1;
                    continue;
                }
                return Err(DispatchError::UpstreamTransport(e.to_string()));
            }
        }
    }
}

async fn backoff(policy: &RetryPolicy, attempt: u32) {
    let delay_ms = policy.retry_base_ms.saturating_mul(1u64 << attempt.min(20));
    debug!(delay_ms, attempt, "backing off before retry");
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_authorization_and_strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer old"));
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        let sanitized = sanitize_headers(headers, "sk-new-secret");
        assert_eq!(sanitized.get(AUTHORIZATION).unwrap(), "Bearer sk-new-secret");
        assert!(sanitized.get("host").is_none());
        assert!(sanitized.get("connection").is_none());
    }

    #[test]
    fn filter_response_headers_drops_transfer_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let filtered = filter_response_headers(&headers);
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("content-type").is_some());
    }
}
