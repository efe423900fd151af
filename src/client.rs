//! Request gateway shared by connectors that talk to remote services.
//!
//! Connectors never call a transport directly: they go through a [`Client`],
//! which the backend binds to an archive (in record or replay mode) and to a
//! cache queue before retrieval starts.
//!
//! ```text
//!  connector ──▶ Client::fetch(req)
//!                  │
//!                  ├─ replay:  Archive::retrieve(req)          (no transport)
//!                  └─ live:    Transport::send(req) ──▶ Archive::store(req, bytes)
//! ```

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::cache::CacheQueue;
use crate::error::{HarvestError, Result};

/// Default number of retries for a failed HTTP call.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default seconds to wait between retries.
pub const DEFAULT_SLEEP_TIME: u64 = 1;

/// Status codes retried after `sleep_time`.
const RETRY_STATUS: [u16; 3] = [408, 423, 504];

/// Status codes retried after the server's `Retry-After`, if any.
const RETRY_AFTER_STATUS: [u16; 3] = [413, 429, 503];

/// Requests left in the current rate-limit window.
pub const RATE_LIMIT_HEADER: &str = "X-RateLimit-Remaining";

/// Epoch second at which the rate-limit window resets.
pub const RATE_LIMIT_RESET_HEADER: &str = "X-RateLimit-Reset";

/// Default remaining-requests threshold below which the transport stops.
pub const MIN_RATE_LIMIT: u64 = 10;

/// Upper bound for the threshold; higher values could stall a fetch forever.
pub const MAX_RATE_LIMIT: u64 = 500;

/// What to do when the remote rate limit is nearly exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Sleep until the reset instead of failing with
    /// [`HarvestError::RateLimit`].
    pub sleep_for_rate: bool,
    pub min_rate_to_sleep: u64,
    /// Longest sleep accepted, in seconds. Longer waits fail.
    pub max_wait: Option<u64>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            sleep_for_rate: false,
            min_rate_to_sleep: MIN_RATE_LIMIT,
            max_wait: None,
        }
    }
}

impl RateLimitPolicy {
    pub fn new(sleep_for_rate: bool, min_rate_to_sleep: u64, max_wait: Option<u64>) -> Self {
        let min_rate_to_sleep = if min_rate_to_sleep > MAX_RATE_LIMIT {
            warn!(
                "Minimum rate to sleep value exceeded ({}); reset to {}",
                min_rate_to_sleep, MAX_RATE_LIMIT
            );
            MAX_RATE_LIMIT
        } else {
            min_rate_to_sleep
        };
        Self {
            sleep_for_rate,
            min_rate_to_sleep,
            max_wait,
        }
    }
}

/// Rate-limit state reported by the last response.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RateLimitState {
    remaining: Option<u64>,
    reset_at: Option<i64>,
}

impl RateLimitState {
    fn from_headers(headers: &HeaderMap) -> Self {
        let number = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i64>().ok())
        };
        Self {
            remaining: number(RATE_LIMIT_HEADER).map(|n| n.max(0) as u64),
            reset_at: number(RATE_LIMIT_RESET_HEADER),
        }
    }

    /// Seconds until the window resets, when `remaining` is at or below
    /// `min_rate`.
    fn wait(&self, min_rate: u64, now: i64) -> Option<u64> {
        match self.remaining {
            Some(remaining) if remaining <= min_rate => {
                Some(self.reset_at.map_or(0, |reset| (reset - now).max(0) as u64))
            }
            _ => None,
        }
    }
}

/// One request as it is archived.
///
/// Only the parts that identify a response belong here. Credentials are
/// added by the transport and never reach the archive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    pub uri: String,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

impl Request {
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Something that can turn a request into raw response bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Vec<u8>>;
}

/// reqwest-backed transport with retry and backoff.
pub struct HttpTransport {
    client: reqwest::Client,
    token: Option<String>,
    max_retries: u32,
    sleep_time: u64,
    rate_limit: RateLimitPolicy,
    rate_state: Mutex<RateLimitState>,
}

impl HttpTransport {
    pub fn new(token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("item-harvest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            token,
            max_retries: DEFAULT_MAX_RETRIES,
            sleep_time: DEFAULT_SLEEP_TIME,
            rate_limit: RateLimitPolicy::default(),
            rate_state: Mutex::new(RateLimitState::default()),
        })
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    fn rate_state(&self) -> std::sync::MutexGuard<'_, RateLimitState> {
        self.rate_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep until the rate limit resets, or fail if that is not allowed.
    async fn throttle(&self) -> Result<()> {
        let wait = self
            .rate_state()
            .wait(self.rate_limit.min_rate_to_sleep, Utc::now().timestamp());
        let Some(seconds_to_reset) = wait else {
            return Ok(());
        };

        let too_long = self.rate_limit.max_wait.map_or(false, |max| seconds_to_reset > max);
        if !self.rate_limit.sleep_for_rate || too_long {
            return Err(HarvestError::RateLimit { seconds_to_reset });
        }

        info!(
            "Rate limit exhausted. Waiting {} secs for rate limit reset.",
            seconds_to_reset
        );
        tokio::time::sleep(Duration::from_secs(seconds_to_reset)).await;
        *self.rate_state() = RateLimitState::default();
        Ok(())
    }

    pub fn with_retries(mut self, max_retries: u32, sleep_time: u64) -> Self {
        self.max_retries = max_retries;
        self.sleep_time = sleep_time;
        self
    }

    fn wait_for(&self, status: StatusCode, retry_after: Option<u64>) -> Option<u64> {
        let code = status.as_u16();
        if RETRY_STATUS.contains(&code) {
            Some(self.sleep_time)
        } else if RETRY_AFTER_STATUS.contains(&code) {
            Some(retry_after.unwrap_or(self.sleep_time))
        } else {
            None
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &Request) -> Result<Vec<u8>> {
        let mut attempt = 0;

        loop {
            self.throttle().await?;

            let mut builder = self.client.get(&request.uri).query(&request.params);
            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }
            if let Some(token) = &self.token {
                builder = builder.bearer_auth(token);
            }

            debug!("GET {} {:?}", request.uri, request.params);
            let response = builder.send().await?;
            let status = response.status();
            *self.rate_state() = RateLimitState::from_headers(response.headers());

            if !status.is_success() && attempt < self.max_retries {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());

                if let Some(wait) = self.wait_for(status, retry_after) {
                    attempt += 1;
                    warn!(
                        "{} returned {}; retry {}/{} in {}s",
                        request.uri, status, attempt, self.max_retries, wait
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
            }

            let response = response.error_for_status()?;
            return Ok(response.bytes().await?.to_vec());
        }
    }
}

/// Archive-aware gateway handed to a connector for one retrieval.
pub struct Client {
    transport: Option<Box<dyn Transport>>,
    archive: Option<Archive>,
    from_archive: bool,
    cache: Option<CacheQueue>,
}

impl Client {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            archive: None,
            from_archive: false,
            cache: None,
        }
    }

    /// Client for connectors that never issue requests, or for replays.
    pub fn offline() -> Self {
        Self {
            transport: None,
            archive: None,
            from_archive: false,
            cache: None,
        }
    }

    /// Record every response into `archive`, or answer from it when
    /// `from_archive` is set.
    pub fn bind_archive(&mut self, archive: Archive, from_archive: bool) {
        self.archive = Some(archive);
        self.from_archive = from_archive;
    }

    pub fn bind_cache(&mut self, cache: CacheQueue) {
        self.cache = Some(cache);
    }

    pub fn is_from_archive(&self) -> bool {
        self.from_archive
    }

    pub fn is_archiving(&self) -> bool {
        self.archive.is_some() && !self.from_archive
    }

    pub fn cache(&mut self) -> Option<&mut CacheQueue> {
        self.cache.as_mut()
    }

    /// Resolve `request` to raw bytes.
    pub async fn fetch(&self, request: &Request) -> Result<Vec<u8>> {
        if self.from_archive {
            let archive = self.archive.as_ref().ok_or_else(|| {
                HarvestError::ArchiveUnavailable("replay requested without an archive".to_string())
            })?;
            return archive.retrieve(request).await;
        }

        let transport = self.transport.as_ref().ok_or_else(|| {
            HarvestError::Connector(format!("no transport available to fetch {}", request.uri))
        })?;
        let data = transport.send(request).await?;

        if let Some(archive) = &self.archive {
            archive.store(request, &data).await?;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Echo {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for Echo {
        async fn send(&self, request: &Request) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(request.uri.as_bytes().to_vec())
        }
    }

    #[test]
    fn request_builder_orders_params() {
        let req = Request::get("http://example.com/")
            .param("per_page", 10)
            .param("page", 1)
            .header("Accept", "application/json");
        let keys: Vec<&str> = req.params.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["page", "per_page"]);
        assert_eq!(req.headers["Accept"], "application/json");
    }

    #[test]
    fn retry_policy() {
        let transport = HttpTransport::new(None).unwrap().with_retries(3, 2);
        assert_eq!(transport.wait_for(StatusCode::REQUEST_TIMEOUT, None), Some(2));
        assert_eq!(transport.wait_for(StatusCode::TOO_MANY_REQUESTS, Some(7)), Some(7));
        assert_eq!(transport.wait_for(StatusCode::SERVICE_UNAVAILABLE, None), Some(2));
        assert_eq!(transport.wait_for(StatusCode::NOT_FOUND, None), None);
        assert_eq!(transport.wait_for(StatusCode::INTERNAL_SERVER_ERROR, None), None);
    }

    #[tokio::test]
    async fn live_fetch_records_and_replay_answers() {
        let tmp = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let archive = Archive::create(tmp.path().join("a.sqlite3")).await.unwrap();

        let mut client = Client::new(Box::new(Echo {
            calls: calls.clone(),
        }));
        client.bind_archive(archive.clone(), false);
        assert!(client.is_archiving());

        let req = Request::get("http://example.com/issues").param("page", 1);
        assert_eq!(client.fetch(&req).await.unwrap(), b"http://example.com/issues".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut replay = Client::offline();
        replay.bind_archive(archive.clone(), true);
        assert_eq!(replay.fetch(&req).await.unwrap(), b"http://example.com/issues".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let missing = Request::get("http://example.com/issues").param("page", 2);
        assert!(matches!(
            replay.fetch(&missing).await,
            Err(HarvestError::ArchiveCorrupted(_))
        ));
        archive.close().await;
    }

    #[test]
    fn rate_limit_policy_caps_threshold() {
        assert_eq!(RateLimitPolicy::new(true, 1_000, None).min_rate_to_sleep, MAX_RATE_LIMIT);
        assert_eq!(RateLimitPolicy::new(true, 20, None).min_rate_to_sleep, 20);
    }

    #[test]
    fn rate_limit_wait() {
        let state = RateLimitState {
            remaining: Some(5),
            reset_at: Some(1_000),
        };
        assert_eq!(state.wait(10, 900), Some(100));
        assert_eq!(state.wait(10, 1_200), Some(0));
        assert_eq!(state.wait(4, 900), None);
        assert_eq!(RateLimitState::default().wait(10, 900), None);
    }

    mod rate_limited {
        use super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        async fn server(remaining: &str, reset_in: i64, expected_calls: u64) -> MockServer {
            let server = MockServer::start().await;
            let reset = (Utc::now().timestamp() + reset_in).to_string();
            Mock::given(method("GET"))
                .and(path("/api/issues"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string("[]")
                        .insert_header(RATE_LIMIT_HEADER, remaining)
                        .insert_header(RATE_LIMIT_RESET_HEADER, reset.as_str()),
                )
                .expect(expected_calls)
                .mount(&server)
                .await;
            server
        }

        fn issues(server: &MockServer) -> Request {
            Request::get(format!("{}/api/issues", server.uri()))
        }

        #[tokio::test]
        async fn exhausted_limit_fails_without_sleep_for_rate() {
            let server = server("3", 3_600, 1).await;
            let transport = HttpTransport::new(None).unwrap();

            assert_eq!(transport.send(&issues(&server)).await.unwrap(), b"[]".to_vec());
            match transport.send(&issues(&server)).await {
                Err(HarvestError::RateLimit { seconds_to_reset }) => {
                    assert!(seconds_to_reset > 3_500)
                }
                other => panic!("expected a rate limit error, got {:?}", other.map(|_| ())),
            }
        }

        #[tokio::test]
        async fn sleeps_until_an_elapsed_reset() {
            let server = server("0", -10, 2).await;
            let transport = HttpTransport::new(None)
                .unwrap()
                .with_rate_limit(RateLimitPolicy::new(true, MIN_RATE_LIMIT, None));

            transport.send(&issues(&server)).await.unwrap();
            transport.send(&issues(&server)).await.unwrap();
        }

        #[tokio::test]
        async fn too_long_a_wait_fails_even_when_sleeping() {
            let server = server("1", 3_600, 1).await;
            let transport = HttpTransport::new(None)
                .unwrap()
                .with_rate_limit(RateLimitPolicy::new(true, MIN_RATE_LIMIT, Some(5)));

            transport.send(&issues(&server)).await.unwrap();
            assert!(matches!(
                transport.send(&issues(&server)).await,
                Err(HarvestError::RateLimit { .. })
            ));
        }

        #[tokio::test]
        async fn plenty_of_requests_left_never_waits() {
            let server = server("4000", 3_600, 3).await;
            let transport = HttpTransport::new(None).unwrap();
            for _ in 0..3 {
                transport.send(&issues(&server)).await.unwrap();
            }
        }

        #[tokio::test]
        async fn retry_after_is_honoured() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/issues"))
                .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "0"))
                .up_to_n_times(1)
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/api/issues"))
                .respond_with(ResponseTemplate::new(200).set_body_string("[1]"))
                .expect(1)
                .mount(&server)
                .await;

            let transport = HttpTransport::new(None).unwrap().with_retries(2, 0);
            assert_eq!(transport.send(&issues(&server)).await.unwrap(), b"[1]".to_vec());
        }
    }

    #[tokio::test]
    async fn offline_client_cannot_fetch() {
        let client = Client::offline();
        assert!(matches!(
            client.fetch(&Request::get("http://example.com/")).await,
            Err(HarvestError::Connector(_))
        ));
    }
}
