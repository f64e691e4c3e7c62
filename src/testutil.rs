//! Shared fixtures for unit tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::Router;
use chrono::Utc;
use tempfile::NamedTempFile;

use crate::alerts::AlertDispatcher;
use crate::config::{AlertSettings, ProbeSettings};
use crate::db::{Monitor, NewCheck, Store};
use crate::incident::IncidentTracker;
use crate::probe::CheckRunner;

pub fn temp_store() -> (NamedTempFile, Arc<Store>) {
    let tmp = NamedTempFile::new().unwrap();
    let store = Store::new(tmp.path()).unwrap();
    (tmp, Arc::new(store))
}

pub fn test_monitor(url: &str, interval: i64) -> Monitor {
    Monitor {
        user_id: 1,
        name: "Test API".to_string(),
        url: url.to_string(),
        check_interval_seconds: interval,
        timeout_ms: 2_000,
        ..Default::default()
    }
}

pub fn down_check(monitor_id: i64) -> NewCheck {
    NewCheck {
        monitor_id,
        status_code: None,
        response_time_ms: 12,
        is_up: false,
        error_message: Some("Network error: connection refused".to_string()),
        response_body: None,
        region: "us-east-1".to_string(),
        checked_at: Utc::now(),
    }
}

pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A URL on a local port with nothing listening.
pub async fn unused_local_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/", addr)
}

pub fn test_dispatcher(store: Arc<Store>) -> AlertDispatcher {
    AlertDispatcher::new(store, AlertSettings::default(), 3).unwrap()
}

pub fn test_runner(store: Arc<Store>, threshold: usize) -> CheckRunner {
    test_runner_with(store, threshold, ProbeSettings::default())
}

pub fn test_runner_with(store: Arc<Store>, threshold: usize, settings: ProbeSettings) -> CheckRunner {
    let incidents = Arc::new(IncidentTracker::new(
        store.clone(),
        test_dispatcher(store.clone()),
        threshold,
    ));
    CheckRunner::new(store, incidents, settings).unwrap()
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub user_agent: Option<String>,
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

/// A server that records every request and answers with `status`.
pub fn recorder(status: StatusCode) -> (Router, Arc<Mutex<Vec<RecordedRequest>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let router = Router::new().fallback(move |uri: Uri, headers: HeaderMap, body: Bytes| {
        let sink = sink.clone();
        async move {
            let header_text = |name: header::HeaderName| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            sink.lock().unwrap().push(RecordedRequest {
                path: uri.path().to_string(),
                user_agent: header_text(header::USER_AGENT),
                authorization: header_text(header::AUTHORIZATION),
                body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
            });
            status
        }
    });

    (router, received)
}
