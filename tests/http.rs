use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use parking_lot::Mutex;

use genevidence::cache::{CacheService, CacheSettings};
use genevidence::error::IngestError;
use genevidence::http::{
    BreakerPolicy, CircuitState, FetchClient, FetchRequest, FetchResponse, HttpSettings,
    RetryPolicy, Transport, TransportError, TransportErrorKind,
};

/// Replays queued responses; answers `fallback` once the queue is empty.
struct ScriptedTransport {
    queue: Mutex<VecDeque<Result<FetchResponse, TransportError>>>,
    fallback: u16,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn new(fallback: u16) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    fn push(&self, response: Result<FetchResponse, TransportError>) {
        self.queue.lock().push_back(response);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn execute(
        &self,
        _request: &FetchRequest,
        _timeout: Duration,
    ) -> Result<FetchResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(FetchResponse::with_status(self.fallback, "")))
    }
}

fn settings(max_attempts: u32, cooldown: Duration) -> HttpSettings {
    HttpSettings {
        timeout: Duration::from_secs(1),
        user_agent: "genevidence-test".to_string(),
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            retry_statuses: vec![429, 500, 502, 503, 504],
        },
        breaker: BreakerPolicy {
            failure_threshold: 10,
            window: Duration::from_secs(60),
            cooldown,
        },
    }
}

fn request() -> FetchRequest {
    FetchRequest::get("https://api.example.org/genes").no_cache()
}

#[test]
fn retries_transient_status_then_succeeds() {
    let transport = Arc::new(ScriptedTransport::new(200));
    transport.push(Ok(FetchResponse::with_status(503, "busy")));
    transport.push(Err(TransportError {
        kind: TransportErrorKind::Timeout,
        message: "timed out".to_string(),
    }));
    transport.push(Ok(FetchResponse::ok(r#"{"ok":true}"#)));
    let client = FetchClient::new(transport.clone(), None, settings(4, Duration::from_secs(30)));

    let value: serde_json::Value = client.fetch_json(&request()).unwrap();
    assert_eq!(value["ok"], true);
    assert_eq!(transport.calls(), 3);
}

#[test]
fn client_error_is_fatal_without_retry() {
    let transport = Arc::new(ScriptedTransport::new(404));
    let client = FetchClient::new(transport.clone(), None, settings(4, Duration::from_secs(30)));

    let err = client.fetch(&request()).unwrap_err();
    assert_matches!(err, IngestError::FatalFetch { status: 404, .. });
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.circuit_state("api.example.org"), CircuitState::Closed);
}

#[test]
fn exhausted_retries_report_source_unavailable() {
    let transport = Arc::new(ScriptedTransport::new(503));
    let client = FetchClient::new(transport.clone(), None, settings(3, Duration::from_secs(30)));

    let err = client.fetch(&request()).unwrap_err();
    assert_matches!(err, IngestError::SourceUnavailable { attempts: 3, .. });
    assert!(err.is_retryable());
    assert_eq!(transport.calls(), 3);
}

#[test]
fn breaker_opens_after_ten_failures_and_fails_fast() {
    let transport = Arc::new(ScriptedTransport::new(503));
    let client = FetchClient::new(transport.clone(), None, settings(1, Duration::from_secs(30)));

    for _ in 0..10 {
        let err = client.fetch(&request()).unwrap_err();
        assert_matches!(err, IngestError::SourceUnavailable { .. });
    }
    assert_eq!(transport.calls(), 10);

    let err = client.fetch(&request()).unwrap_err();
    assert_matches!(err, IngestError::CircuitOpen { ref host, .. } if host == "api.example.org");
    assert_eq!(transport.calls(), 10);
}

#[test]
fn breaker_closes_after_successful_trial() {
    let transport = Arc::new(ScriptedTransport::new(503));
    let client = FetchClient::new(
        transport.clone(),
        None,
        settings(1, Duration::from_millis(20)),
    );
    for _ in 0..10 {
        let _ = client.fetch(&request());
    }
    assert_matches!(
        client.circuit_state("api.example.org"),
        CircuitState::Open { .. }
    );

    thread::sleep(Duration::from_millis(40));
    transport.push(Ok(FetchResponse::ok("{}")));
    client.fetch(&request()).unwrap();
    assert_eq!(client.circuit_state("api.example.org"), CircuitState::Closed);
    assert_eq!(transport.calls(), 11);
}

#[test]
fn invalid_trial_request_does_not_wedge_the_breaker() {
    let transport = Arc::new(ScriptedTransport::new(503));
    let client = FetchClient::new(
        transport.clone(),
        None,
        settings(1, Duration::from_millis(20)),
    );
    for _ in 0..10 {
        let _ = client.fetch(&request());
    }

    thread::sleep(Duration::from_millis(40));
    transport.push(Err(TransportError {
        kind: TransportErrorKind::Invalid,
        message: "bad header".to_string(),
    }));
    let err = client.fetch(&request()).unwrap_err();
    assert_matches!(err, IngestError::InvalidRequest(_));
    assert_eq!(
        client.circuit_state("api.example.org"),
        CircuitState::HalfOpen {
            trial_in_flight: false
        }
    );

    transport.push(Ok(FetchResponse::ok("{}")));
    client.fetch(&request()).unwrap();
    assert_eq!(client.circuit_state("api.example.org"), CircuitState::Closed);
    assert_eq!(transport.calls(), 12);
}

#[test]
fn successful_responses_are_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let cache = Arc::new(CacheService::new(CacheSettings::new(root)).unwrap());
    let transport = Arc::new(ScriptedTransport::new(500));
    transport.push(Ok(FetchResponse::ok(r#"{"genes":["PKD1"]}"#)));
    let client = FetchClient::new(
        transport.clone(),
        Some(cache),
        settings(1, Duration::from_secs(30)),
    );

    let cached = FetchRequest::get("https://api.example.org/genes").param("q", "kidney");
    let first = client.fetch(&cached).unwrap();
    assert!(!first.from_cache);
    let second = client.fetch(&cached).unwrap();
    assert!(second.from_cache);
    assert_eq!(second.body, first.body);
    assert_eq!(transport.calls(), 1);
}
