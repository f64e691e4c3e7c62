//! HTTP probe implementation.

use std::error::Error as StdError;
use std::time::{Duration, Instant};

use reqwest::{Client, Method, Response};

use super::ProbeError;
use crate::db::Monitor;

/// Raw outcome of one request against a monitor's target.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Absent when no response was received.
    pub status_code: Option<u16>,
    /// Time from just before the request was sent until a response or error.
    pub response_time_ms: i64,
    /// Leading bytes of the response body, decoded lossily.
    pub body: Option<String>,
    pub error: Option<ProbeError>,
}

impl ProbeOutcome {
    pub fn is_up(&self) -> bool {
        self.error.is_none()
    }

    fn failed(response_time_ms: i64, error: ProbeError) -> Self {
        Self {
            status_code: None,
            response_time_ms,
            body: None,
            error: Some(error),
        }
    }
}

/// Run an HTTP probe for the given monitor.
///
/// Never fails: every problem is classified into the outcome's `error`.
pub async fn run_http_probe(
    client: &Client,
    monitor: &Monitor,
    timeout_ms: u64,
    max_body_bytes: usize,
) -> ProbeOutcome {
    let method = match Method::from_bytes(monitor.method.trim().to_uppercase().as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            return ProbeOutcome::failed(
                0,
                ProbeError::Request(format!("Invalid HTTP method: {}", monitor.method)),
            )
        }
    };

    let mut request = client
        .request(method.clone(), &monitor.url)
        .timeout(Duration::from_millis(timeout_ms));

    if let Some(headers) = &monitor.headers {
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
    }

    if method != Method::GET && method != Method::HEAD {
        if let Some(body) = &monitor.body {
            request = request.body(body.clone());
        }
    }

    let start = Instant::now();
    let result = request.send().await;
    let response_time_ms = start.elapsed().as_millis() as i64;

    match result {
        Ok(response) => {
            let status = response.status().as_u16();
            let body = read_body_prefix(response, max_body_bytes).await;
            let error = (status != monitor.expected_status).then_some(ProbeError::UnexpectedStatus {
                expected: monitor.expected_status,
                actual: status,
            });

            ProbeOutcome {
                status_code: Some(status),
                response_time_ms,
                body,
                error,
            }
        }
        Err(e) => ProbeOutcome::failed(response_time_ms, classify_error(&e, timeout_ms)),
    }
}

fn classify_error(err: &reqwest::Error, timeout_ms: u64) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout(timeout_ms)
    } else if err.is_connect() || err.is_request() || err.is_body() || err.is_redirect() {
        ProbeError::Network(error_chain(err))
    } else {
        ProbeError::Request(error_chain(err))
    }
}

/// Flatten an error and its sources, e.g. "error sending request: connection refused".
fn error_chain(err: &dyn StdError) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let inner_text = inner.to_string();
        if !text.contains(&inner_text) {
            text.push_str(": ");
            text.push_str(&inner_text);
        }
        source = inner.source();
    }
    text
}

/// Read at most `limit` bytes of the body. A read failure keeps what arrived.
async fn read_body_prefix(mut response: Response, limit: usize) -> Option<String> {
    if limit == 0 {
        return None;
    }

    let mut buf: Vec<u8> = Vec::with_capacity(limit.min(8 * 1024));
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Check: Body read stopped early: {}", e);
                break;
            }
        }
    }

    buf.truncate(limit);
    Some(decode_prefix(buf))
}

/// Decode a byte prefix, dropping a multi-byte character cut off at the end.
fn decode_prefix(mut bytes: Vec<u8>) -> String {
    if let Err(e) = std::str::from_utf8(&bytes) {
        if e.error_len().is_none() {
            bytes.truncate(e.valid_up_to());
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{spawn_server, test_monitor, unused_local_url};
    use axum::{http::StatusCode, routing::any, Router};

    fn client() -> Client {
        Client::new()
    }

    #[tokio::test]
    async fn test_expected_status_is_up() {
        let addr = spawn_server(Router::new().route("/", any(|| async { "healthy" }))).await;
        let monitor = test_monitor(&format!("http://{}/", addr), 60);

        let outcome = run_http_probe(&client(), &monitor, 2_000, 1024).await;
        assert!(outcome.is_up());
        assert_eq!(outcome.status_code, Some(200));
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.body.as_deref(), Some("healthy"));
    }

    #[tokio::test]
    async fn test_status_mismatch_is_down() {
        let router = Router::new().route("/", any(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let addr = spawn_server(router).await;
        let monitor = test_monitor(&format!("http://{}/", addr), 60);

        let outcome = run_http_probe(&client(), &monitor, 2_000, 1024).await;
        assert!(!outcome.is_up());
        assert_eq!(outcome.status_code, Some(500));
        assert_eq!(
            outcome.error.unwrap().to_string(),
            "Expected status 200, got 500"
        );
    }

    #[tokio::test]
    async fn test_timeout_is_down() {
        let router = Router::new().route(
            "/",
            any(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let addr = spawn_server(router).await;
        let monitor = test_monitor(&format!("http://{}/", addr), 60);

        let outcome = run_http_probe(&client(), &monitor, 100, 1024).await;
        assert_eq!(outcome.status_code, None);
        assert_eq!(outcome.error.unwrap().to_string(), "Timeout after 100ms");
        assert!(outcome.response_time_ms < 5_000);
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let monitor = test_monitor(&unused_local_url().await, 60);

        let outcome = run_http_probe(&client(), &monitor, 2_000, 1024).await;
        assert_eq!(outcome.status_code, None);
        let message = outcome.error.unwrap().to_string();
        assert!(message.starts_with("Network error: "), "{}", message);
    }

    #[tokio::test]
    async fn test_body_truncated_to_budget() {
        let router = Router::new().route("/", any(|| async { "x".repeat(5000) }));
        let addr = spawn_server(router).await;
        let monitor = test_monitor(&format!("http://{}/", addr), 60);

        let outcome = run_http_probe(&client(), &monitor, 2_000, 1024).await;
        assert_eq!(outcome.body.unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn test_body_omitted_for_get() {
        let router = Router::new().route("/", any(|body: String| async move { body }));
        let addr = spawn_server(router).await;

        let mut monitor = test_monitor(&format!("http://{}/", addr), 60);
        monitor.body = Some("payload".to_string());
        let outcome = run_http_probe(&client(), &monitor, 2_000, 1024).await;
        assert_eq!(outcome.body.as_deref(), Some(""));

        monitor.method = "post".to_string();
        let outcome = run_http_probe(&client(), &monitor, 2_000, 1024).await;
        assert_eq!(outcome.body.as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn test_invalid_method_is_down() {
        let mut monitor = test_monitor("http://127.0.0.1:1/", 60);
        monitor.method = "NOT A METHOD".to_string();

        let outcome = run_http_probe(&client(), &monitor, 100, 1024).await;
        assert!(!outcome.is_up());
        assert!(matches!(outcome.error, Some(ProbeError::Request(_))));
    }

    #[test]
    fn test_decode_prefix_drops_partial_char() {
        let mut bytes = "héllo".as_bytes().to_vec();
        bytes.truncate(2); // 'h' plus the first byte of 'é'
        assert_eq!(decode_prefix(bytes), "h");
    }
}
