//! Bounded-concurrency segment fetcher
//!
//! Tasks wait in a FIFO queue and start whenever a slot frees up. Each task
//! retries transient failures with exponential backoff. Cancelling the pool
//! rejects everything still queued and abandons in-flight requests.

use crate::download::retry::{RetryConfig, RetryExecutor};
use crate::error::StreamError;
use crate::platform::client::VideoClient;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// Overrides the pool's request timeout
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One unit of work for the pool
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub url: String,
    pub index: usize,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Where segment bytes come from
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch_segment(&self, task: &FetchTask) -> Result<Vec<u8>, StreamError>;
}

/// Fetches segments over HTTP with minimal media headers
pub struct HttpSegmentSource {
    client: VideoClient,
}

impl HttpSegmentSource {
    pub fn new(client: VideoClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SegmentSource for HttpSegmentSource {
    async fn fetch_segment(&self, task: &FetchTask) -> Result<Vec<u8>, StreamError> {
        let mut request = self
            .client
            .create_simple_media_request(reqwest::Method::GET, &task.url)
            .timeout(task.timeout);
        for (name, value) in &task.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StreamError::TimeoutError(format!("segment {}: {}", task.index, e))
            } else {
                StreamError::RequestFailed(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::HttpStatus {
                status: status.as_u16(),
                url: task.url.clone(),
            });
        }

        let data = response.bytes().await?;
        debug!("Segment {}: {} bytes", task.index, data.len());
        Ok(data.to_vec())
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum requests in flight
    pub concurrency: usize,
    /// Retries after the first attempt for 5xx and network errors
    pub max_retries: u32,
    /// Delay before the first retry; doubles per retry
    pub base_delay: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Optional request start rate
    pub requests_per_second: Option<NonZeroU32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            requests_per_second: None,
        }
    }
}

impl PoolConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: u32) -> Self {
        self.requests_per_second = NonZeroU32::new(requests_per_second);
        self
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: self.base_delay,
            max_delay: Duration::from_secs(3600),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

/// Counters for observing the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub queued: usize,
    pub max_active: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: bool,
}

type Reply = oneshot::Sender<Result<Vec<u8>, StreamError>>;

struct Queued {
    task: FetchTask,
    reply: Reply,
}

struct PoolState {
    queue: VecDeque<Queued>,
    active: usize,
    max_active: usize,
    completed: u64,
    failed: u64,
    cancelled: bool,
    token: CancellationToken,
    /// Bumped by `reset` so late completions from before it are ignored
    generation: u64,
}

struct PoolInner {
    state: Mutex<PoolState>,
    source: Arc<dyn SegmentSource>,
    config: PoolConfig,
    limiter: Option<DefaultDirectRateLimiter>,
}

/// Bounded-concurrency FIFO fetcher
#[derive(Clone)]
pub struct SegmentFetchPool {
    inner: Arc<PoolInner>,
}

impl SegmentFetchPool {
    pub fn new(source: Arc<dyn SegmentSource>, config: PoolConfig) -> Self {
        let limiter = config
            .requests_per_second
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    active: 0,
                    max_active: 0,
                    completed: 0,
                    failed: 0,
                    cancelled: false,
                    token: CancellationToken::new(),
                    generation: 0,
                }),
                source,
                config,
                limiter,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Queue a segment and wait for its bytes
    pub async fn fetch(
        &self,
        url: &str,
        index: usize,
        options: FetchOptions,
    ) -> Result<Vec<u8>, StreamError> {
        let (reply, receiver) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            if state.cancelled {
                return Err(StreamError::PoolCancelled);
            }
            state.queue.push_back(Queued {
                task: FetchTask {
                    url: url.to_string(),
                    index,
                    headers: options.headers,
                    timeout: options.timeout.unwrap_or(self.inner.config.request_timeout),
                },
                reply,
            });
        }
        PoolInner::drain(&self.inner);

        receiver.await.unwrap_or(Err(StreamError::PoolCancelled))
    }

    /// Reject queued tasks and abandon in-flight ones. Returns the number of
    /// queued tasks rejected.
    pub fn cancel(&self) -> usize {
        let rejected: Vec<Queued> = {
            let mut state = self.inner.lock();
            state.cancelled = true;
            state.token.cancel();
            state.queue.drain(..).collect()
        };
        let count = rejected.len();
        for queued in rejected {
            let _ = queued.reply.send(Err(StreamError::PoolCancelled));
        }
        if count > 0 {
            warn!("Pool cancelled, rejected {} queued segments", count);
        }
        count
    }

    /// Make the pool usable again. Queued tasks are rejected and tasks still
    /// in flight are abandoned, so their slots can be reused at once.
    pub fn reset(&self) {
        let leftovers: Vec<Queued> = {
            let mut state = self.inner.lock();
            state.cancelled = false;
            state.token.cancel();
            state.token = CancellationToken::new();
            state.generation += 1;
            state.active = 0;
            state.max_active = 0;
            state.completed = 0;
            state.failed = 0;
            state.queue.drain(..).collect()
        };
        for queued in leftovers {
            let _ = queued.reply.send(Err(StreamError::PoolCancelled));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            active: state.active,
            queued: state.queue.len(),
            max_active: state.max_active,
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
        }
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // The state stays consistent across panics; recover the guard
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start queued tasks while slots are free
    fn drain(inner: &Arc<Self>) {
        loop {
            let (queued, token, generation) = {
                let mut state = inner.lock();
                if state.cancelled || state.active >= inner.config.concurrency {
                    return;
                }
                let Some(queued) = state.queue.pop_front() else {
                    return;
                };
                state.active += 1;
                state.max_active = state.max_active.max(state.active);
                (queued, state.token.clone(), state.generation)
            };

            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let Queued { task, reply } = queued;
                let result = inner.run_task(&task, token).await;

                {
                    let mut state = inner.lock();
                    if state.generation == generation {
                        state.active = state.active.saturating_sub(1);
                        match &result {
                            Ok(_) => state.completed += 1,
                            Err(StreamError::PoolCancelled) => {}
                            Err(_) => state.failed += 1,
                        }
                    }
                }
                let _ = reply.send(result);
                PoolInner::drain(&inner);
            });
        }
    }

    async fn run_task(
        &self,
        task: &FetchTask,
        token: CancellationToken,
    ) -> Result<Vec<u8>, StreamError> {
        let executor =
            RetryExecutor::with_config(self.config.retry_config()).with_cancellation(token);

        let source = &self.source;
        let limiter = self.limiter.as_ref();
        let outcome = executor
            .run(move || async move {
                if let Some(limiter) = limiter {
                    limiter.until_ready().await;
                }
                match tokio::time::timeout(task.timeout, source.fetch_segment(task)).await {
                    Ok(result) => result,
                    Err(_) => Err(StreamError::TimeoutError(format!(
                        "segment {} timed out after {:?}",
                        task.index, task.timeout
                    ))),
                }
            })
            .await;

        outcome.map_err(|exhausted| match exhausted.error {
            StreamError::PoolCancelled => StreamError::PoolCancelled,
            error => {
                warn!(
                    "Segment {} failed after {} attempt(s): {}",
                    task.index, exhausted.attempts, error
                );
                StreamError::SegmentFetch {
                    index: task.index,
                    attempts: exhausted.attempts,
                    reason: error.to_string(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted statuses per URL; the last status repeats
    struct ScriptedSource {
        script: HashMap<String, Vec<u16>>,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        latency: Duration,
    }

    impl ScriptedSource {
        fn new(latency: Duration) -> Self {
            Self {
                script: HashMap::new(),
                calls: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                latency,
            }
        }

        fn with_script(mut self, url: &str, statuses: &[u16]) -> Self {
            self.script.insert(url.to_string(), statuses.to_vec());
            self
        }

        fn calls(&self, url: &str) -> usize {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl SegmentSource for ScriptedSource {
        async fn fetch_segment(&self, task: &FetchTask) -> Result<Vec<u8>, StreamError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(task.url.clone()).or_insert(0);
                *n += 1;
                *n
            };
            if task.url.contains("hang") {
                std::future::pending::<()>().await;
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            {
                let _in_flight = InFlight(&self.in_flight);
                tokio::time::sleep(self.latency).await;
            }

            let status = self
                .script
                .get(&task.url)
                .map(|s| s[(call - 1).min(s.len() - 1)])
                .unwrap_or(200);
            if status == 200 {
                Ok(task.url.as_bytes().to_vec())
            } else {
                Err(StreamError::HttpStatus {
                    status,
                    url: task.url.clone(),
                })
            }
        }
    }

    /// Abandoned requests are dropped mid-sleep and still count down
    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn url(i: usize) -> String {
        format!("https://cdn.example/seg-{}.ts", i)
    }

    async fn fetch_all(
        pool: &SegmentFetchPool,
        urls: Vec<String>,
    ) -> Vec<Result<Vec<u8>, StreamError>> {
        let fetches = urls.into_iter().enumerate().map(|(index, url)| {
            let pool = pool.clone();
            async move { pool.fetch(&url, index, FetchOptions::default()).await }
        });
        futures::future::join_all(fetches).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_segment_keeps_its_position() {
        let source = Arc::new(
            ScriptedSource::new(Duration::from_millis(5)).with_script(&url(7), &[503, 503, 200]),
        );
        let pool = SegmentFetchPool::new(
            source.clone(),
            PoolConfig::default()
                .with_concurrency(3)
                .with_base_delay(Duration::from_millis(100)),
        );

        let results = fetch_all(&pool, (0..10).map(url).collect()).await;
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.as_ref().unwrap(), url(i).as_bytes());
        }
        assert_eq!(source.calls(&url(7)), 3);
        assert_eq!(source.calls(&url(6)), 1);

        let stats = pool.stats();
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_never_exceeds_concurrency() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(20)));
        let pool = SegmentFetchPool::new(source.clone(), PoolConfig::default().with_concurrency(3));

        let results = fetch_all(&pool, (0..20).map(url).collect()).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().max_active, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_then_fails_naming_index() {
        let source = Arc::new(
            ScriptedSource::new(Duration::ZERO).with_script(&url(4), &[503]),
        );
        let pool = SegmentFetchPool::new(
            source.clone(),
            PoolConfig::default()
                .with_max_retries(3)
                .with_base_delay(Duration::from_millis(100)),
        );

        let start = tokio::time::Instant::now();
        let err = pool
            .fetch(&url(4), 4, FetchOptions::default())
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        match err {
            StreamError::SegmentFetch { index, attempts, .. } => {
                assert_eq!(index, 4);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // 100 + 200 + 400
        assert!(elapsed >= Duration::from_millis(700), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(720), "{:?}", elapsed);
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_client_error_fails_immediately() {
        let source = Arc::new(
            ScriptedSource::new(Duration::ZERO).with_script(&url(2), &[404, 200]),
        );
        let pool = SegmentFetchPool::new(source.clone(), PoolConfig::default());

        let err = pool
            .fetch(&url(2), 2, FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::SegmentFetch { index: 2, attempts: 1, .. }));
        assert_eq!(source.calls(&url(2)), 1);
    }

    #[tokio::test]
    async fn test_cancel_rejects_queued_and_abandons_active() {
        let source = Arc::new(ScriptedSource::new(Duration::ZERO));
        let pool = SegmentFetchPool::new(source.clone(), PoolConfig::default().with_concurrency(4));

        let handles: Vec<_> = (0..7)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.fetch(&format!("https://cdn.example/hang-{}", i), i, FetchOptions::default())
                        .await
                })
            })
            .collect();

        while pool.stats().queued < 3 {
            tokio::task::yield_now().await;
        }
        let stats = pool.stats();
        assert_eq!(stats.active, 4);
        assert_eq!(stats.queued, 3);

        assert_eq!(pool.cancel(), 3);
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(StreamError::PoolCancelled)));
        }

        // Cancelled pools refuse new work until reset
        assert!(matches!(
            pool.fetch(&url(0), 0, FetchOptions::default()).await,
            Err(StreamError::PoolCancelled)
        ));

        pool.reset();
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert!(!stats.cancelled);
        assert_eq!(
            pool.fetch(&url(1), 1, FetchOptions::default()).await.unwrap(),
            url(1).as_bytes()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_abandons_in_flight_requests() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(100)));
        let pool = SegmentFetchPool::new(source.clone(), PoolConfig::default().with_concurrency(2));

        let before: Vec<_> = (0..2)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.fetch(&url(i), i, FetchOptions::default()).await })
            })
            .collect();
        while source.in_flight.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        pool.reset();
        let results = fetch_all(&pool, vec![url(2), url(3)]).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().max_active, 2);

        for handle in before {
            assert!(matches!(handle.await.unwrap(), Err(StreamError::PoolCancelled)));
        }
    }

    #[tokio::test]
    async fn test_http_source_against_server() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/seg-0.ts")
            .match_header("cache-control", "no-cache")
            .match_header("x-test", "1")
            .with_status(200)
            .with_body(b"segment-zero".to_vec())
            .create_async()
            .await;
        let flaky = server
            .mock("GET", "/seg-1.ts")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;
        let gone = server
            .mock("GET", "/seg-2.ts")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let source = Arc::new(HttpSegmentSource::new(VideoClient::new().unwrap()));
        let pool = SegmentFetchPool::new(
            source,
            PoolConfig::default()
                .with_max_retries(1)
                .with_base_delay(Duration::from_millis(10)),
        );

        let data = pool
            .fetch(
                &format!("{}/seg-0.ts", server.url()),
                0,
                FetchOptions::default().with_header("x-test", "1"),
            )
            .await
            .unwrap();
        assert_eq!(data, b"segment-zero");

        let err = pool
            .fetch(&format!("{}/seg-1.ts", server.url()), 1, FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::SegmentFetch { index: 1, attempts: 2, .. }));

        let err = pool
            .fetch(&format!("{}/seg-2.ts", server.url()), 2, FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::SegmentFetch { index: 2, attempts: 1, .. }));

        ok.assert_async().await;
        flaky.assert_async().await;
        gone.assert_async().await;
    }
}
