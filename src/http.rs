use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cache::{CacheService, hash_key, namespace};
use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
    pub cacheable: bool,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            params: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            cacheable: true,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            params: Vec::new(),
            headers: Vec::new(),
            body: Some(body),
            timeout: None,
            cacheable: false,
        }
    }

    pub fn param(mut self, name: &str, value: impl ToString) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn host(&self) -> Result<String, IngestError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|err| IngestError::InvalidRequest(format!("{}: {err}", self.url)))?;
        url.host_str()
            .map(|host| host.to_string())
            .ok_or_else(|| IngestError::InvalidRequest(format!("{}: missing host", self.url)))
    }

    /// Hash of everything that determines the response.
    pub fn cache_key(&self) -> String {
        let mut params = self.params.clone();
        params.sort();
        let body = self
            .body
            .as_ref()
            .map(|body| body.to_string())
            .unwrap_or_default();
        let encoded = params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        hash_key(&format!("{:?} {}?{} {}", self.method, self.url, encoded, body))
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub retry_after: Option<Duration>,
    pub from_cache: bool,
}

impl FetchResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            retry_after: None,
            from_cache: false,
        }
    }

    pub fn with_status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
            from_cache: false,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, IngestError> {
        serde_json::from_slice(&self.body).map_err(IngestError::from)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Body,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    fn is_retryable(&self) -> bool {
        !matches!(self.kind, TransportErrorKind::Invalid)
    }
}

/// One network round trip, without retries or caching.
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<FetchResponse, TransportError>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|err| IngestError::InvalidRequest(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| IngestError::InvalidRequest(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn execute(
        &self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<FetchResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        builder = builder.timeout(timeout).query(&request.params);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().map_err(|err| TransportError {
            kind: classify_reqwest_error(&err),
            message: err.to_string(),
        })?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.bytes().map_err(|err| TransportError {
            kind: TransportErrorKind::Body,
            message: err.to_string(),
        })?;
        Ok(FetchResponse {
            status,
            body: body.to_vec(),
            retry_after,
            from_cache: false,
        })
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() || err.is_request() {
        TransportErrorKind::Connect
    } else if err.is_builder() {
        TransportErrorKind::Invalid
    } else {
        TransportErrorKind::Body
    }
}

/// Single retry policy shared by every outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            retry_statuses: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Exponential backoff for the given 1-based attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// Failures within `window` that open the circuit.
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    state: CircuitState,
    failures: VecDeque<Instant>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    /// Returns how long to wait when the call must fail fast.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { since } => {
                let elapsed = now.saturating_duration_since(since);
                if elapsed >= self.policy.cooldown {
                    self.state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(())
                } else {
                    Err(self.policy.cooldown - elapsed)
                }
            }
            CircuitState::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    Err(self.policy.cooldown)
                } else {
                    self.state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(())
                }
            }
        }
    }

    /// Gives back a half-open trial that said nothing about upstream health.
    /// The next call becomes the trial.
    pub fn release_trial(&mut self) {
        if let CircuitState::HalfOpen {
            trial_in_flight: true,
        } = self.state
        {
            self.state = CircuitState::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    pub fn record_success(&mut self) {
        self.failures.clear();
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::HalfOpen { .. } => {
                self.failures.clear();
                self.state = CircuitState::Open { since: now };
            }
            CircuitState::Closed => {
                self.failures.push_back(now);
                while let Some(oldest) = self.failures.front() {
                    if now.saturating_duration_since(*oldest) > self.policy.window {
                        self.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if self.failures.len() as u32 >= self.policy.failure_threshold {
                    self.failures.clear();
                    self.state = CircuitState::Open { since: now };
                }
            }
            CircuitState::Open { .. } => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("genevidence/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
        }
    }
}

/// Outbound client: response cache, retry with backoff, per-host breaker.
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    cache: Option<Arc<CacheService>>,
    settings: HttpSettings,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl FetchClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Option<Arc<CacheService>>,
        settings: HttpSettings,
    ) -> Self {
        Self {
            transport,
            cache,
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_reqwest(
        cache: Option<Arc<CacheService>>,
        settings: HttpSettings,
    ) -> Result<Self, IngestError> {
        let transport = ReqwestTransport::new(&settings.user_agent)?;
        Ok(Self::new(Arc::new(transport), cache, settings))
    }

    pub fn circuit_state(&self, host: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(host)
            .map(|breaker| breaker.state().clone())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, IngestError> {
        let host = request.host()?;
        let cache_key = request.cache_key();

        if request.cacheable {
            if let Some(cache) = &self.cache {
                if let Some(body) = cache.get(namespace::HTTP, &cache_key)? {
                    debug!(url = %request.url, "http cache hit");
                    let mut response = FetchResponse::ok(body);
                    response.from_cache = true;
                    return Ok(response);
                }
            }
        }

        let timeout = request.timeout.unwrap_or(self.settings.timeout);
        let retry = &self.settings.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.acquire(&host)?;

            let (message, retry_after) = match self.transport.execute(request, timeout) {
                Ok(response) if response.is_success() => {
                    self.record(&host, true);
                    if request.cacheable {
                        if let Some(cache) = &self.cache {
                            cache.set(namespace::HTTP, &cache_key, &response.body, None)?;
                        }
                    }
                    return Ok(response);
                }
                Ok(response) if retry.should_retry_status(response.status) => {
                    self.record(&host, false);
                    (
                        format!("status {}", response.status),
                        response.retry_after,
                    )
                }
                Ok(response) => {
                    // The upstream is healthy; the request itself is wrong.
                    self.record(&host, true);
                    return Err(IngestError::FatalFetch {
                        host,
                        status: response.status,
                        message: truncate(&response.text(), 200),
                    });
                }
                Err(err) if err.is_retryable() => {
                    self.record(&host, false);
                    (err.message, None)
                }
                Err(err) => {
                    self.release(&host);
                    return Err(IngestError::InvalidRequest(err.message));
                }
            };

            if attempt >= max_attempts {
                warn!(host = %host, attempts = attempt, error = %message, "giving up on upstream");
                return Err(IngestError::SourceUnavailable {
                    host,
                    attempts: attempt,
                    message,
                });
            }
            let backoff = retry.delay_for_attempt(attempt);
            let delay = retry_after
                .map(|hint| hint.max(backoff))
                .unwrap_or(backoff)
                .min(retry.max_delay);
            debug!(host = %host, attempt, delay_ms = delay.as_millis() as u64, error = %message, "retrying request");
            thread::sleep(delay);
        }
    }

    pub fn fetch_json<T: DeserializeOwned>(&self, request: &FetchRequest) -> Result<T, IngestError> {
        self.fetch(request)?.json()
    }

    fn acquire(&self, host: &str) -> Result<(), IngestError> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(host.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.settings.breaker.clone()));
        breaker
            .try_acquire(Instant::now())
            .map_err(|retry_in| IngestError::CircuitOpen {
                host: host.to_string(),
                retry_in,
            })
    }

    fn release(&self, host: &str) {
        if let Some(breaker) = self.breakers.lock().get_mut(host) {
            breaker.release_trial();
        }
    }

    fn record(&self, host: &str, success: bool) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(host.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.settings.breaker.clone()));
        if success {
            breaker.record_success();
        } else {
            let was_closed = matches!(breaker.state(), CircuitState::Closed);
            breaker.record_failure(Instant::now());
            if was_closed && matches!(breaker.state(), CircuitState::Open { .. }) {
                warn!(host, "circuit opened");
            }
        }
    }
}

fn truncate(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &value[..idx]),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            retry_statuses: vec![503],
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert!(policy.should_retry_status(503));
        assert!(!policy.should_retry_status(404));
    }

    #[test]
    fn breaker_forgets_failures_outside_window() {
        let mut breaker = CircuitBreaker::new(BreakerPolicy {
            failure_threshold: 2,
            window: Duration::from_millis(10),
            cooldown: Duration::from_secs(1),
        });
        let start = Instant::now();
        breaker.record_failure(start);
        breaker.record_failure(start + Duration::from_millis(50));
        assert_eq!(breaker.state(), &CircuitState::Closed);
        breaker.record_failure(start + Duration::from_millis(55));
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));
    }

    #[test]
    fn half_open_allows_a_single_trial() {
        let mut breaker = CircuitBreaker::new(BreakerPolicy {
            failure_threshold: 1,
            window: Duration::from_secs(1),
            cooldown: Duration::from_millis(10),
        });
        let start = Instant::now();
        breaker.record_failure(start);
        assert!(breaker.try_acquire(start).is_err());
        let later = start + Duration::from_millis(20);
        assert!(breaker.try_acquire(later).is_ok());
        assert!(breaker.try_acquire(later).is_err());
        breaker.record_success();
        assert!(breaker.try_acquire(later).is_ok());
    }

    #[test]
    fn released_trial_lets_the_next_call_through() {
        let mut breaker = CircuitBreaker::new(BreakerPolicy {
            failure_threshold: 1,
            window: Duration::from_secs(1),
            cooldown: Duration::from_millis(10),
        });
        let start = Instant::now();
        breaker.record_failure(start);
        let later = start + Duration::from_millis(20);
        assert!(breaker.try_acquire(later).is_ok());
        breaker.release_trial();
        assert_eq!(
            breaker.state(),
            &CircuitState::HalfOpen {
                trial_in_flight: false
            }
        );
        assert!(breaker.try_acquire(later).is_ok());
        assert!(breaker.try_acquire(later).is_err());
    }

    #[test]
    fn cache_key_ignores_param_order() {
        let a = FetchRequest::get("https://example.org/x")
            .param("a", 1)
            .param("b", 2);
        let b = FetchRequest::get("https://example.org/x")
            .param("b", 2)
            .param("a", 1);
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.host().unwrap(), "example.org");
    }
}
