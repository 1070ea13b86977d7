//! Single-flight multi-segment assembly
//!
//! At most one merge job runs at a time. Starting a second one fails fast
//! with [`StreamError::PoolBusy`]. The running job owns a fetch pool, a
//! keepalive and the coordinator slot; all three are released when the job
//! ends, however it ends.

use crate::core::progress::{ProgressTracker, SegmentProgress};
use crate::download::pool::{FetchOptions, PoolConfig, SegmentFetchPool, SegmentSource};
use crate::error::StreamError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Merge configuration
#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub pool: PoolConfig,
    /// Minimum spacing between progress events
    pub progress_interval: Duration,
    /// Heartbeat period of the keepalive
    pub keepalive_interval: Duration,
    /// Headers sent with every segment request
    pub headers: Vec<(String, String)>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            progress_interval: Duration::from_millis(250),
            keepalive_interval: Duration::from_secs(20),
            headers: Vec::new(),
        }
    }
}

impl MergeConfig {
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Coordinator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeState {
    Idle,
    Running(String),
}

/// Events emitted by a running job
#[derive(Debug, Clone)]
pub enum MergeEvent {
    Started { job_id: String, total: usize },
    Progress(SegmentProgress),
    Completed { job_id: String, bytes: u64 },
    Failed { job_id: String, error: String },
    Cancelled { job_id: String },
}

/// Segments of a finished job, in index order
#[derive(Debug)]
pub struct MergeOutput {
    pub job_id: String,
    pub segments: Vec<Vec<u8>>,
}

impl MergeOutput {
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    /// Concatenate all segments
    pub fn into_bytes(self) -> Vec<u8> {
        self.segments.concat()
    }
}

struct ActiveJob {
    job_id: String,
    cancel: CancellationToken,
}

type Slot = Arc<Mutex<Option<ActiveJob>>>;

/// Clears the coordinator slot when dropped
struct SlotGuard {
    slot: Slot,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(job) = slot.take() {
            debug!("Merge job {} released", job.job_id);
        }
    }
}

/// Heartbeat held for the lifetime of a job
struct Keepalive {
    heartbeat: JoinHandle<()>,
    holders: Arc<AtomicUsize>,
}

impl Keepalive {
    fn acquire(job_id: &str, period: Duration, holders: Arc<AtomicUsize>) -> Self {
        holders.fetch_add(1, Ordering::SeqCst);
        let job_id = job_id.to_string();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("Merge job {} still running", job_id);
            }
        });
        Self { heartbeat, holders }
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to a running job
pub struct MergeHandle {
    job_id: String,
    events: mpsc::UnboundedReceiver<MergeEvent>,
    cancel: CancellationToken,
    task: JoinHandle<Result<MergeOutput, StreamError>>,
}

impl MergeHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next event; `None` once the job has finished and all events are read
    pub async fn next_event(&mut self) -> Option<MergeEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the job, discarding unread events
    pub async fn wait(self) -> Result<MergeOutput, StreamError> {
        self.task
            .await
            .map_err(|e| StreamError::Generic(format!("merge task failed: {}", e)))?
    }
}

/// Runs at most one merge job at a time
pub struct MergeCoordinator {
    source: Arc<dyn SegmentSource>,
    config: MergeConfig,
    slot: Slot,
    keepalives: Arc<AtomicUsize>,
}

impl MergeCoordinator {
    pub fn new(source: Arc<dyn SegmentSource>, config: MergeConfig) -> Self {
        Self {
            source,
            config,
            slot: Arc::new(Mutex::new(None)),
            keepalives: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> MergeState {
        match self.lock_slot().as_ref() {
            Some(job) => MergeState::Running(job.job_id.clone()),
            None => MergeState::Idle,
        }
    }

    /// Whether a keepalive is currently held
    pub fn keepalive_held(&self) -> bool {
        self.keepalives.load(Ordering::SeqCst) > 0
    }

    /// Cancel the running job, if any
    pub fn cancel_active(&self) -> bool {
        match self.lock_slot().as_ref() {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Start assembling `segment_urls`. Fails immediately when another job
    /// is running.
    pub fn start_merge(
        &self,
        job_id: &str,
        segment_urls: Vec<String>,
    ) -> Result<MergeHandle, StreamError> {
        let cancel = CancellationToken::new();
        {
            let mut slot = self.lock_slot();
            if let Some(active) = slot.as_ref() {
                return Err(StreamError::PoolBusy {
                    active_job: active.job_id.clone(),
                });
            }
            *slot = Some(ActiveJob {
                job_id: job_id.to_string(),
                cancel: cancel.clone(),
            });
        }
        let guard = SlotGuard {
            slot: self.slot.clone(),
        };
        let keepalive = Keepalive::acquire(
            job_id,
            self.config.keepalive_interval,
            self.keepalives.clone(),
        );

        let (events_tx, events) = mpsc::unbounded_channel();
        let pool = SegmentFetchPool::new(self.source.clone(), self.config.pool.clone());
        let job = MergeJob {
            job_id: job_id.to_string(),
            urls: segment_urls,
            pool,
            cancel: cancel.clone(),
            events: events_tx.clone(),
            options: FetchOptions {
                headers: self.config.headers.clone(),
                timeout: None,
            },
            progress_interval: self.config.progress_interval,
        };

        let owned_id = job_id.to_string();
        let task = tokio::spawn(async move {
            let result = job.run().await;

            // Release before reporting so observers of the final event can start a new job
            drop(keepalive);
            drop(guard);

            let event = match &result {
                Ok(output) => MergeEvent::Completed {
                    job_id: owned_id,
                    bytes: output.total_bytes(),
                },
                Err(StreamError::PoolCancelled) => MergeEvent::Cancelled { job_id: owned_id },
                Err(e) => MergeEvent::Failed {
                    job_id: owned_id,
                    error: e.to_string(),
                },
            };
            let _ = events_tx.send(event);
            result
        });

        Ok(MergeHandle {
            job_id: job_id.to_string(),
            events,
            cancel,
            task,
        })
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<ActiveJob>> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct MergeJob {
    job_id: String,
    urls: Vec<String>,
    pool: SegmentFetchPool,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<MergeEvent>,
    options: FetchOptions,
    progress_interval: Duration,
}

impl MergeJob {
    async fn run(self) -> Result<MergeOutput, StreamError> {
        let total = self.urls.len();
        info!("Merge job {} started with {} segments", self.job_id, total);
        let _ = self.events.send(MergeEvent::Started {
            job_id: self.job_id.clone(),
            total,
        });

        let mut tracker = ProgressTracker::new(&self.job_id, total, self.progress_interval);
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut fetches = JoinSet::new();
        for (index, url) in self.urls.iter().enumerate() {
            let pool = self.pool.clone();
            let url = url.clone();
            let options = self.options.clone();
            fetches.spawn(async move { (index, pool.fetch(&url, index, options).await) });
        }

        let outcome = loop {
            let joined = tokio::select! {
                _ = self.cancel.cancelled() => break Err(StreamError::PoolCancelled),
                joined = fetches.join_next() => joined,
            };
            let Some(joined) = joined else {
                break Ok(());
            };
            let (index, result) = match joined {
                Ok(pair) => pair,
                Err(e) => break Err(StreamError::Generic(format!("segment task failed: {}", e))),
            };
            match result {
                Ok(data) => {
                    if let Some(progress) = tracker.record(data.len()) {
                        let _ = self.events.send(MergeEvent::Progress(progress));
                    }
                    slots[index] = Some(data);
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = outcome {
            // Stop everything still queued or in flight
            self.pool.cancel();
            fetches.abort_all();
            match &e {
                StreamError::PoolCancelled => warn!("Merge job {} cancelled", self.job_id),
                other => warn!("Merge job {} failed: {}", self.job_id, other),
            }
            return Err(e);
        }

        let segments = slots
            .into_iter()
            .enumerate()
            .map(|(index, data)| {
                data.ok_or_else(|| StreamError::SegmentFetch {
                    index,
                    attempts: 0,
                    reason: "segment missing after completion".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "Merge job {} finished: {} segments, {} bytes",
            self.job_id,
            total,
            tracker.bytes()
        );
        Ok(MergeOutput {
            job_id: self.job_id,
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::pool::FetchTask;
    use async_trait::async_trait;

    /// Returns the URL as the body; `hang` URLs never answer, `gone` URLs 404
    struct EchoSource {
        latency: Duration,
    }

    #[async_trait]
    impl SegmentSource for EchoSource {
        async fn fetch_segment(&self, task: &FetchTask) -> Result<Vec<u8>, StreamError> {
            if task.url.contains("hang") {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.latency).await;
            if task.url.contains("gone") {
                return Err(StreamError::HttpStatus {
                    status: 404,
                    url: task.url.clone(),
                });
            }
            Ok(format!("[{}]", task.index).into_bytes())
        }
    }

    fn coordinator(latency: Duration) -> MergeCoordinator {
        MergeCoordinator::new(
            Arc::new(EchoSource { latency }),
            MergeConfig::default()
                .with_pool(PoolConfig::default().with_concurrency(3))
                .with_progress_interval(Duration::from_secs(1)),
        )
    }

    fn urls(n: usize, tag: &str) -> Vec<String> {
        (0..n)
            .map(|i| format!("https://cdn.example/{}-{}.ts", tag, i))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_completes_in_order() {
        let coordinator = coordinator(Duration::from_millis(100));
        let mut handle = coordinator.start_merge("job-1", urls(10, "seg")).unwrap();
        assert_eq!(coordinator.state(), MergeState::Running("job-1".to_string()));
        assert!(coordinator.keepalive_held());

        let mut progress_events = 0;
        let mut last_progress = None;
        let mut completed = false;
        while let Some(event) = handle.next_event().await {
            match event {
                MergeEvent::Progress(p) => {
                    progress_events += 1;
                    last_progress = Some(p);
                }
                MergeEvent::Completed { bytes, .. } => {
                    completed = true;
                    assert_eq!(bytes, 30);
                    break;
                }
                MergeEvent::Started { total, .. } => assert_eq!(total, 10),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(completed);
        // 10 segments over ~400ms with a 1s interval: first and last only
        assert_eq!(progress_events, 2);
        assert!(last_progress.unwrap().is_complete());

        let output = handle.wait().await.unwrap();
        let expected: Vec<u8> = (0..10).flat_map(|i| format!("[{}]", i).into_bytes()).collect();
        assert_eq!(output.into_bytes(), expected);
        assert_eq!(coordinator.state(), MergeState::Idle);
        assert!(!coordinator.keepalive_held());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let coordinator = coordinator(Duration::ZERO);
        let handle = coordinator.start_merge("job-1", urls(4, "hang")).unwrap();

        match coordinator.start_merge("job-2", urls(1, "seg")) {
            Err(StreamError::PoolBusy { active_job }) => assert_eq!(active_job, "job-1"),
            other => panic!("expected PoolBusy, got {:?}", other.map(|h| h.job_id().to_string())),
        }

        assert!(coordinator.cancel_active());
        assert!(matches!(handle.wait().await, Err(StreamError::PoolCancelled)));
        assert_eq!(coordinator.state(), MergeState::Idle);
        assert!(!coordinator.keepalive_held());

        let next = coordinator.start_merge("job-2", urls(2, "seg")).unwrap();
        assert_eq!(next.wait().await.unwrap().segments.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_segment_ends_job_and_frees_slot() {
        let coordinator = coordinator(Duration::ZERO);
        let mut list = urls(5, "seg");
        list[3] = "https://cdn.example/gone-3.ts".to_string();
        let mut handle = coordinator.start_merge("job-1", list).unwrap();

        let mut failure = None;
        while let Some(event) = handle.next_event().await {
            if let MergeEvent::Failed { error, .. } = event {
                failure = Some(error);
                break;
            }
        }
        assert!(failure.unwrap().contains("Segment 3"));
        assert!(matches!(
            handle.wait().await,
            Err(StreamError::SegmentFetch { index: 3, .. })
        ));
        assert_eq!(coordinator.state(), MergeState::Idle);
    }

    #[tokio::test]
    async fn test_handle_cancel_emits_cancelled() {
        let coordinator = coordinator(Duration::ZERO);
        let mut handle = coordinator.start_merge("job-1", urls(3, "hang")).unwrap();
        handle.cancel();

        let mut cancelled = false;
        while let Some(event) = handle.next_event().await {
            if matches!(event, MergeEvent::Cancelled { .. }) {
                cancelled = true;
                break;
            }
        }
        assert!(cancelled);
        assert!(matches!(handle.wait().await, Err(StreamError::PoolCancelled)));
    }

    #[tokio::test]
    async fn test_empty_job_completes() {
        let coordinator = coordinator(Duration::ZERO);
        let handle = coordinator.start_merge("empty", Vec::new()).unwrap();
        let output = handle.wait().await.unwrap();
        assert!(output.segments.is_empty());
        assert_eq!(coordinator.state(), MergeState::Idle);
    }
}
