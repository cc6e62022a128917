//! Worker pool for job execution
//!
//! A fixed set of workers drains a bounded job queue. Submission never
//! blocks: it enqueues or fails with [`SubmitError`]. Each job runs under a
//! per-job deadline and every processed job produces exactly one
//! [`JobResult`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │                                                              │
//! │  submit ──try_send──► ┌──────────────────────┐               │
//! │                       │  job queue (bounded) │               │
//! │                       └──────────┬───────────┘               │
//! │                                  ▼                           │
//! │        [Worker 1] [Worker 2] ... [Worker N]  (timeout, catch)│
//! │                                  │                           │
//! │             ┌────────────────────┴─────────────┐             │
//! │             ▼                                  ▼             │
//! │    results stream (bounded)        per-job waiter (oneshot)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Result order does not follow submission order.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{duration_millis, ConfigError};
use crate::context::Context;
use crate::error::{panic_message, ContextError, SubmitError, TaskError};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Pool name, used as a log field
    pub name: String,

    /// Number of workers draining the queue
    pub worker_count: usize,

    /// Job queue capacity
    pub queue_size: usize,

    /// Per-job deadline
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Whether to accumulate [`PoolMetrics`]
    pub enable_metrics: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker-pool".to_string(),
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_size: 100,
            timeout: Duration::from_secs(30),
            enable_metrics: true,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with default sizing
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the number of workers
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the job queue capacity
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Set the per-job deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable metrics
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::invalid(
                "worker_pool",
                "worker_count must be at least 1",
            ));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::invalid(
                "worker_pool",
                "queue_size must be at least 1",
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid(
                "worker_pool",
                "timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Accepting and processing jobs
    Running,
    /// Finishing queued jobs, not accepting new ones
    Draining,
    /// All workers have exited
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// The job was not enqueued
    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// The caller's context ended while waiting for the result
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The worker went away without answering (runtime shutdown)
    #[error("job result was dropped before delivery")]
    ResultDropped,
}

/// Job processing function
pub type ProcessFn<T, R> =
    Box<dyn FnOnce(Context, T) -> BoxFuture<'static, anyhow::Result<R>> + Send>;

/// A unit of work: caller-chosen ID, input, and the function that processes it
///
/// Jobs are consumed exactly once by exactly one worker.
pub struct Job<T, R> {
    /// Caller-supplied identifier echoed in the result
    pub id: String,
    /// Input handed to `process`
    pub data: T,
    process: ProcessFn<T, R>,
}

impl<T, R> Job<T, R> {
    /// Create a job from an async closure
    pub fn new<F, Fut>(id: impl Into<String>, data: T, process: F) -> Self
    where
        F: FnOnce(Context, T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self {
            id: id.into(),
            data,
            process: Box::new(move |ctx, data| process(ctx, data).boxed()),
        }
    }
}

impl<T: std::fmt::Debug, R> std::fmt::Debug for Job<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

/// Outcome of one job
#[derive(Debug, Clone)]
pub struct JobResult<R> {
    /// ID of the job this result belongs to
    pub job_id: String,
    /// Output on success
    pub data: Option<R>,
    /// Failure, if any
    pub error: Option<TaskError>,
    /// Wall time spent executing the job
    pub timing: Duration,
}

impl<R> JobResult<R> {
    /// Whether the job succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a plain `Result`
    pub fn into_result(self) -> Result<R, TaskError> {
        match (self.data, self.error) {
            (_, Some(err)) => Err(err),
            (Some(data), None) => Ok(data),
            (None, None) => Err(TaskError::MissingResult),
        }
    }
}

/// Snapshot of pool metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Jobs that finished (either way)
    pub jobs_processed: u64,
    /// Jobs that returned `Ok`
    pub jobs_succeeded: u64,
    /// Jobs that failed, timed out, or panicked
    pub jobs_failed: u64,
    /// Mean execution time over processed jobs
    #[serde(with = "duration_millis")]
    pub average_latency: Duration,
}

#[derive(Debug, Default)]
struct MetricsState {
    processed: u64,
    succeeded: u64,
    failed: u64,
    total_latency: Duration,
}

impl MetricsState {
    fn record(&mut self, success: bool, latency: Duration) {
        self.processed += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_latency += latency;
    }

    fn snapshot(&self) -> PoolMetrics {
        let average_latency = mean_duration(self.total_latency, self.processed);
        PoolMetrics {
            jobs_processed: self.processed,
            jobs_succeeded: self.succeeded,
            jobs_failed: self.failed,
            average_latency,
        }
    }
}

/// `total / count` without narrowing the count; zero when `count` is zero
pub(crate) fn mean_duration(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

struct Envelope<T, R> {
    job: Job<T, R>,
    ctx: Context,
    reply: Option<oneshot::Sender<JobResult<R>>>,
}

type SharedQueue<T, R> = Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope<T, R>>>>;

/// Worker pool for executing jobs
///
/// # Example
///
/// ```ignore
/// use everruns_concurrency::pool::{Job, WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::start(
///     WorkerPoolConfig::new("thumbnails")
///         .with_worker_count(4)
///         .with_queue_size(64),
/// )?;
/// let mut results = pool.take_results().expect("first call");
///
/// pool.submit(Job::new("a", 1, |_ctx, n| async move { Ok(n * 2) }))?;
///
/// // ... later, graceful shutdown
/// pool.stop().await;
/// while let Some(result) = results.recv().await {
///     println!("{} -> {:?}", result.job_id, result.data);
/// }
/// ```
pub struct WorkerPool<T, R> {
    config: WorkerPoolConfig,
    queue_tx: Mutex<Option<mpsc::Sender<Envelope<T, R>>>>,
    results_rx: Mutex<Option<mpsc::Receiver<JobResult<R>>>>,
    status: RwLock<WorkerPoolStatus>,
    metrics: Arc<Mutex<MetricsState>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<T, R> WorkerPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Validate the configuration and spawn the workers
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: WorkerPoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size);
        let (results_tx, results_rx) = mpsc::channel(config.queue_size + config.worker_count);
        let queue: SharedQueue<T, R> = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let metrics = Arc::new(Mutex::new(MetricsState::default()));

        info!(
            pool = %config.name,
            worker_count = config.worker_count,
            queue_size = config.queue_size,
            timeout_ms = config.timeout.as_millis() as u64,
            "Starting worker pool"
        );

        let workers = (0..config.worker_count)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let results_tx = results_tx.clone();
                let metrics = config.enable_metrics.then(|| Arc::clone(&metrics));
                let name = config.name.clone();
                let timeout = config.timeout;
                tokio::spawn(async move {
                    run_worker(name, worker_id, queue, results_tx, metrics, timeout).await;
                })
            })
            .collect();

        Ok(Self {
            config,
            queue_tx: Mutex::new(Some(queue_tx)),
            results_rx: Mutex::new(Some(results_rx)),
            status: RwLock::new(WorkerPoolStatus::Running),
            metrics,
            workers: tokio::sync::Mutex::new(workers),
        })
    }

    /// Enqueue a job without blocking
    ///
    /// Its result is delivered on the results stream.
    pub fn submit(&self, job: Job<T, R>) -> Result<(), SubmitError> {
        self.enqueue(Envelope {
            job,
            ctx: Context::background(),
            reply: None,
        })
    }

    /// Submit a job and wait for its result
    ///
    /// The result goes to this caller, not to the results stream. Cancelling
    /// `ctx` also cancels the job's own context.
    pub async fn submit_and_wait(
        &self,
        ctx: &Context,
        job: Job<T, R>,
    ) -> Result<JobResult<R>, WorkerPoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Envelope {
            job,
            ctx: ctx.child(),
            reply: Some(reply_tx),
        })?;

        match ctx.run(reply_rx).await? {
            Ok(result) => Ok(result),
            Err(_) => Err(WorkerPoolError::ResultDropped),
        }
    }

    fn enqueue(&self, envelope: Envelope<T, R>) -> Result<(), SubmitError> {
        let queue_tx = self.queue_tx.lock();
        let Some(tx) = queue_tx.as_ref() else {
            return Err(SubmitError::ShuttingDown);
        };

        tx.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::ShuttingDown,
        })
    }

    /// Take the results stream
    ///
    /// Returns `None` after the first call. The stream ends once the pool has
    /// stopped and every result has been delivered. A stream nobody has taken
    /// by the time [`stop`](Self::stop) runs is buffered by `stop` and can
    /// still be taken afterwards.
    pub fn take_results(&self) -> Option<mpsc::Receiver<JobResult<R>>> {
        self.results_rx.lock().take()
    }

    /// Stop accepting jobs, finish every queued and running job, then close the results stream
    ///
    /// Safe to call more than once.
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;

        if self.queue_tx.lock().take().is_some() {
            info!("Draining worker pool");
            *self.status.write() = WorkerPoolStatus::Draining;
        }

        join_buffering_results(&mut workers, &self.results_rx).await;

        let mut status = self.status.write();
        if *status != WorkerPoolStatus::Stopped {
            *status = WorkerPoolStatus::Stopped;
            info!("Worker pool stopped");
        }
    }

    /// Current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Check if accepting jobs
    pub fn is_accepting(&self) -> bool {
        self.status() == WorkerPoolStatus::Running
    }

    /// Jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue_tx
            .lock()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Metrics snapshot (all zero when metrics are disabled)
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.lock().snapshot()
    }

    /// The pool configuration
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

/// Join every worker, buffering results from a stream nobody has taken
///
/// Without a consumer, workers would block on a full results stream and
/// never exit. The buffered results are put back as a closed stream.
pub(crate) async fn join_buffering_results<M>(
    workers: &mut Vec<JoinHandle<()>>,
    results: &Mutex<Option<mpsc::Receiver<M>>>,
) {
    let untaken = results.lock().take();
    let Some(mut results_rx) = untaken else {
        join_workers(workers).await;
        return;
    };

    let mut buffered = Vec::new();
    {
        let join = join_workers(workers);
        tokio::pin!(join);
        loop {
            tokio::select! {
                _ = &mut join => break,
                Some(result) = results_rx.recv() => buffered.push(result),
            }
        }
    }
    while let Some(result) = results_rx.recv().await {
        buffered.push(result);
    }

    let (tx, rx) = mpsc::channel(buffered.len().max(1));
    for result in buffered {
        // capacity covers every buffered result
        let _ = tx.try_send(result);
    }
    *results.lock() = Some(rx);
}

async fn join_workers(workers: &mut Vec<JoinHandle<()>>) {
    for handle in workers.drain(..) {
        if let Err(e) = handle.await {
            warn!("Worker task ended abnormally: {}", e);
        }
    }
}

async fn run_worker<T, R>(
    pool: String,
    worker_id: usize,
    queue: SharedQueue<T, R>,
    results_tx: mpsc::Sender<JobResult<R>>,
    metrics: Option<Arc<Mutex<MetricsState>>>,
    timeout: Duration,
) where
    T: Send + 'static,
    R: Send + 'static,
{
    debug!(%pool, worker_id, "Worker started");

    loop {
        let next = queue.lock().await.recv().await;
        let Some(Envelope { job, ctx, reply }) = next else {
            break;
        };

        let job_ctx = ctx.with_timeout(timeout);
        // The caller's deadline may be tighter than the pool timeout.
        let budget = job_ctx.remaining();
        let result = execute_job(job, job_ctx, budget).await;

        if let Some(metrics) = &metrics {
            metrics.lock().record(result.is_success(), result.timing);
        }

        if let Some(error) = &result.error {
            debug!(%pool, worker_id, job_id = %result.job_id, error = %error, "Job failed");
        }

        let undelivered = match reply {
            Some(reply) => reply.send(result).err(),
            None => Some(result),
        };

        // Waiters that gave up still get their result on the stream.
        if let Some(result) = undelivered {
            if results_tx.send(result).await.is_err() {
                debug!(%pool, worker_id, "Results stream dropped by consumer");
            }
        }
    }

    debug!(%pool, worker_id, "Worker exited");
}

async fn execute_job<T, R>(job: Job<T, R>, ctx: Context, budget: Option<Duration>) -> JobResult<R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    let Job { id, data, process } = job;
    let started = Instant::now();

    let job_ctx = ctx.clone();
    let work = AssertUnwindSafe(async move { process(job_ctx, data).await }).catch_unwind();
    let outcome = ctx.run(work).await;
    ctx.cancel();

    let (data, error) = match outcome {
        Ok(Ok(Ok(output))) => (Some(output), None),
        Ok(Ok(Err(err))) => (None, Some(TaskError::from(err))),
        Ok(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            warn!(job_id = %id, panic = %message, "Job panicked");
            (None, Some(TaskError::Panicked(message)))
        }
        Err(ContextError::DeadlineExceeded) => {
            warn!(
                job_id = %id,
                budget_ms = budget.map(|b| b.as_millis() as u64),
                "Job deadline exceeded"
            );
            (None, Some(TaskError::DeadlineExceeded(budget)))
        }
        Err(ContextError::Cancelled) => (None, Some(TaskError::Cancelled)),
    };

    JobResult {
        job_id: id,
        data,
        error,
        timing: started.elapsed(),
    }
}
