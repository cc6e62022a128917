//! Batch processing
//!
//! Items are collected into batches and handed to a caller-supplied
//! processor function as a whole. A batch is flushed when it reaches
//! `batch_size` or when the flush timer fires, whichever comes first. The
//! timer restarts after every flush. Stopping flushes whatever is left, so
//! no accepted item is dropped.
//!
//! Two front-ends share the batching loop:
//!
//! - [`BatchProcessor`]: `max_workers` workers, each with its own batch,
//!   results delivered on a stream
//! - [`AsyncBatchProcessor`]: one accumulator feeding a [`WorkerPool`],
//!   each caller waits for its own item's result
//!
//! # Result matching
//!
//! The processor returns one [`BatchResult`] per item, matched back by item
//! ID. Items sharing an ID take the results carrying that ID in order. An
//! `Err` from the processor fails every item in the batch with the same
//! error. Items with no matching result get [`TaskError::MissingResult`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{duration_millis, ConfigError};
use crate::context::Context;
use crate::error::{panic_message, ContextError, SubmitError, TaskError};
use crate::pool::{
    join_buffering_results, Job, JobResult, WorkerPool, WorkerPoolConfig, WorkerPoolError,
};
use crate::semaphore::Semaphore;

/// Batch processor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Processor name, used as a log field
    pub name: String,

    /// Items per batch before a forced flush
    pub batch_size: usize,

    /// Longest time a partial batch waits before flushing
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,

    /// Concurrent batches being collected and processed
    pub max_workers: usize,

    /// Input queue capacity
    pub input_buffer: usize,

    /// Deadline for one processor call
    #[serde(with = "duration_millis")]
    pub process_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            name: "batch".to_string(),
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            max_workers: 1,
            input_buffer: 1000,
            process_timeout: Duration::from_secs(30),
        }
    }
}

impl BatchConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_input_buffer(mut self, size: usize) -> Self {
        self.input_buffer = size;
        self
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch", "batch_size must be at least 1"));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid(
                "batch",
                "flush_interval must be greater than zero",
            ));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::invalid("batch", "max_workers must be at least 1"));
        }
        if self.input_buffer == 0 {
            return Err(ConfigError::invalid("batch", "input_buffer must be at least 1"));
        }
        if self.process_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "batch",
                "process_timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// An item submitted for batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem<T> {
    pub id: String,
    pub data: T,
}

impl<T> BatchItem<T> {
    pub fn new(id: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// Outcome for one item of a batch
#[derive(Debug, Clone)]
pub struct BatchResult<R> {
    /// ID of the item this result belongs to
    pub id: String,
    pub data: Option<R>,
    pub error: Option<TaskError>,
}

impl<R> BatchResult<R> {
    /// Successful result for item `id`
    pub fn success(id: impl Into<String>, data: R) -> Self {
        Self {
            id: id.into(),
            data: Some(data),
            error: None,
        }
    }

    /// Failed result for item `id`
    pub fn failure(id: impl Into<String>, error: impl Into<TaskError>) -> Self {
        Self {
            id: id.into(),
            data: None,
            error: Some(error.into()),
        }
    }

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

/// Errors from [`BatchProcessor::submit`]
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

type BatchOutput<R> = anyhow::Result<Vec<BatchResult<R>>>;

/// Batch processing function
pub type ProcessorFn<T, R> =
    Arc<dyn Fn(Context, Vec<BatchItem<T>>) -> BoxFuture<'static, BatchOutput<R>> + Send + Sync>;

type SharedInput<I> = Arc<tokio::sync::Mutex<mpsc::Receiver<I>>>;

fn boxed_processor<T, R, F, Fut>(processor: F) -> ProcessorFn<T, R>
where
    F: Fn(Context, Vec<BatchItem<T>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BatchOutput<R>> + Send + 'static,
{
    Arc::new(move |ctx, items| processor(ctx, items).boxed())
}

/// Collect items into batches until the input closes
///
/// The flush timer restarts after every flush, timed or size-triggered.
async fn collect_batches<I, F, Fut>(
    input: SharedInput<I>,
    batch_size: usize,
    flush_interval: Duration,
    mut flush: F,
) where
    F: FnMut(Vec<I>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut batch = Vec::with_capacity(batch_size);
    let mut next_flush = Instant::now() + flush_interval;

    loop {
        tokio::select! {
            item = async { input.lock().await.recv().await } => {
                let Some(item) = item else {
                    break;
                };
                batch.push(item);
                if batch.len() >= batch_size {
                    flush(std::mem::replace(&mut batch, Vec::with_capacity(batch_size))).await;
                    next_flush = Instant::now() + flush_interval;
                }
            }
            _ = tokio::time::sleep_until(next_flush) => {
                if !batch.is_empty() {
                    flush(std::mem::replace(&mut batch, Vec::with_capacity(batch_size))).await;
                }
                next_flush = Instant::now() + flush_interval;
            }
        }
    }

    if !batch.is_empty() {
        flush(batch).await;
    }
}

/// Run the processor on one batch and produce one result per item, in item order
async fn process_batch<T, R>(
    batcher: &str,
    processor: &ProcessorFn<T, R>,
    batch: Vec<BatchItem<T>>,
    timeout: Duration,
) -> Vec<BatchResult<R>> {
    let ids: Vec<String> = batch.iter().map(|item| item.id.clone()).collect();
    debug!(batcher, size = ids.len(), "Flushing batch");

    let ctx = Context::background().with_timeout(timeout);
    let call_ctx = ctx.clone();
    let work = AssertUnwindSafe(async move { processor(call_ctx, batch).await }).catch_unwind();
    let outcome = ctx.run(work).await;
    ctx.cancel();

    let error = match outcome {
        Ok(Ok(Ok(results))) => return match_results(batcher, ids, results),
        Ok(Ok(Err(err))) => TaskError::from(err),
        Ok(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            warn!(batcher, panic = %message, "Batch processor panicked");
            TaskError::Panicked(message)
        }
        Err(ContextError::DeadlineExceeded) => {
            warn!(
                batcher,
                timeout_ms = timeout.as_millis() as u64,
                "Batch processing deadline exceeded"
            );
            TaskError::DeadlineExceeded(Some(timeout))
        }
        Err(ContextError::Cancelled) => TaskError::Cancelled,
    };

    ids.into_iter()
        .map(|id| BatchResult::failure(id, error.clone()))
        .collect()
}

fn match_results<R>(
    batcher: &str,
    ids: Vec<String>,
    results: Vec<BatchResult<R>>,
) -> Vec<BatchResult<R>> {
    let mut by_id: HashMap<String, VecDeque<BatchResult<R>>> =
        HashMap::with_capacity(results.len());
    for result in results {
        by_id.entry(result.id.clone()).or_default().push_back(result);
    }

    let matched = ids
        .into_iter()
        .map(|id| {
            by_id
                .get_mut(&id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| BatchResult::failure(id, TaskError::MissingResult))
        })
        .collect();

    let unmatched: usize = by_id.values().map(VecDeque::len).sum();
    if unmatched > 0 {
        warn!(
            batcher,
            unmatched, "Batch processor returned results for unknown items"
        );
    }
    matched
}

/// Batching processor with a results stream
///
/// # Example
///
/// ```ignore
/// use everruns_concurrency::{BatchConfig, BatchItem, BatchProcessor, BatchResult, Context};
///
/// let batcher = BatchProcessor::start(
///     BatchConfig::new("embeddings").with_batch_size(32),
///     |ctx, items: Vec<BatchItem<String>>| async move {
///         let vectors = embed(ctx, items.iter().map(|i| &i.data)).await?;
///         Ok(items
///             .into_iter()
///             .zip(vectors)
///             .map(|(item, v)| BatchResult::success(item.id, v))
///             .collect())
///     },
/// )?;
/// let mut results = batcher.take_results().expect("first call");
///
/// batcher.submit(&Context::background(), BatchItem::new("doc-1", text)).await?;
/// batcher.stop().await;
/// ```
pub struct BatchProcessor<T, R> {
    config: BatchConfig,
    input_tx: Mutex<Option<mpsc::Sender<BatchItem<T>>>>,
    results_rx: Mutex<Option<mpsc::Receiver<BatchResult<R>>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<T, R> BatchProcessor<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Validate the configuration and spawn the batch workers
    ///
    /// Results should be drained from [`take_results`](Self::take_results);
    /// workers wait for room on the results stream. A stream that was never
    /// taken is buffered by [`stop`](Self::stop) instead.
    pub fn start<F, Fut>(config: BatchConfig, processor: F) -> Result<Self, ConfigError>
    where
        F: Fn(Context, Vec<BatchItem<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchOutput<R>> + Send + 'static,
    {
        config.validate()?;

        let processor = boxed_processor(processor);
        let (input_tx, input_rx) = mpsc::channel(config.input_buffer);
        let (results_tx, results_rx) =
            mpsc::channel(config.input_buffer + config.max_workers * config.batch_size);
        let input: SharedInput<BatchItem<T>> = Arc::new(tokio::sync::Mutex::new(input_rx));

        info!(
            batcher = %config.name,
            batch_size = config.batch_size,
            max_workers = config.max_workers,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "Starting batch processor"
        );

        let workers = (0..config.max_workers)
            .map(|worker_id| {
                let input = Arc::clone(&input);
                let processor = Arc::clone(&processor);
                let results_tx = results_tx.clone();
                let name = config.name.clone();
                let batch_size = config.batch_size;
                let flush_interval = config.flush_interval;
                let timeout = config.process_timeout;

                tokio::spawn(async move {
                    debug!(batcher = %name, worker_id, "Batch worker started");
                    collect_batches(input, batch_size, flush_interval, |batch| {
                        let processor = Arc::clone(&processor);
                        let results_tx = results_tx.clone();
                        let name = name.clone();
                        async move {
                            for result in process_batch(&name, &processor, batch, timeout).await {
                                if results_tx.send(result).await.is_err() {
                                    debug!(batcher = %name, "Results stream dropped by consumer");
                                    break;
                                }
                            }
                        }
                    })
                    .await;
                    debug!(batcher = %name, worker_id, "Batch worker exited");
                })
            })
            .collect();

        Ok(Self {
            config,
            input_tx: Mutex::new(Some(input_tx)),
            results_rx: Mutex::new(Some(results_rx)),
            workers: tokio::sync::Mutex::new(workers),
        })
    }

    /// Submit an item, waiting for queue space
    pub async fn submit(&self, ctx: &Context, item: BatchItem<T>) -> Result<(), BatchError> {
        let sender = self
            .input_tx
            .lock()
            .clone()
            .ok_or(SubmitError::ShuttingDown)?;

        ctx.run(sender.send(item))
            .await?
            .map_err(|_| SubmitError::ShuttingDown)?;
        Ok(())
    }

    /// Submit an item without waiting
    pub fn try_submit(&self, item: BatchItem<T>) -> Result<(), SubmitError> {
        let input_tx = self.input_tx.lock();
        let Some(tx) = input_tx.as_ref() else {
            return Err(SubmitError::ShuttingDown);
        };

        tx.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::ShuttingDown,
        })
    }

    /// Take the results stream (`None` after the first call)
    ///
    /// Still available after [`stop`](Self::stop) if it was not taken before.
    pub fn take_results(&self) -> Option<mpsc::Receiver<BatchResult<R>>> {
        self.results_rx.lock().take()
    }

    /// Items waiting in the input queue
    pub fn queued(&self) -> usize {
        self.input_tx
            .lock()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Check if accepting items
    pub fn is_accepting(&self) -> bool {
        self.input_tx.lock().is_some()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Stop accepting items, flush every partial batch, and close the results stream
    ///
    /// Safe to call more than once.
    #[instrument(skip(self), fields(batcher = %self.config.name))]
    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;

        if self.input_tx.lock().take().is_some() {
            info!("Draining batch processor");
        }

        join_buffering_results(&mut workers, &self.results_rx).await;
    }
}

type Waiters<R> = DashMap<Uuid, oneshot::Sender<Result<R, TaskError>>>;

/// An item tagged with the token of the call that submitted it
struct Submission<T> {
    token: Uuid,
    item: BatchItem<T>,
}

/// Batching front-end over a [`WorkerPool`] with per-item waits
///
/// A single accumulator builds batches and submits each one as a pool job;
/// `max_workers` pool workers process batches concurrently. Each caller of
/// [`submit_and_wait`](Self::submit_and_wait) receives its own item's result.
///
/// Waiters are keyed by a token minted per call, not by item ID, so a
/// result can never reach a caller other than the one that submitted it.
pub struct AsyncBatchProcessor<T, R> {
    config: BatchConfig,
    input_tx: Mutex<Option<mpsc::Sender<Submission<T>>>>,
    waiters: Arc<Waiters<R>>,
    pool: Arc<WorkerPool<Vec<BatchItem<T>>, Vec<BatchResult<R>>>>,
    dispatches: TaskTracker,
    accumulator: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T, R> AsyncBatchProcessor<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Validate the configuration, start the pool and the accumulator
    pub fn start<F, Fut>(config: BatchConfig, processor: F) -> Result<Self, ConfigError>
    where
        F: Fn(Context, Vec<BatchItem<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchOutput<R>> + Send + 'static,
    {
        config.validate()?;

        let pool_config = WorkerPoolConfig::new(format!("{}-pool", config.name))
            .with_worker_count(config.max_workers)
            .with_queue_size(config.max_workers)
            .with_timeout(config.process_timeout);
        // Dispatched batches never exceed what the pool can hold.
        let in_flight = Arc::new(Semaphore::new(
            pool_config.worker_count + pool_config.queue_size,
        )?);
        let pool = Arc::new(WorkerPool::start(pool_config)?);

        let processor = boxed_processor(processor);
        let waiters: Arc<Waiters<R>> = Arc::new(DashMap::new());
        let dispatches = TaskTracker::new();
        let (input_tx, input_rx) = mpsc::channel(config.input_buffer);
        let input: SharedInput<Submission<T>> = Arc::new(tokio::sync::Mutex::new(input_rx));

        info!(
            batcher = %config.name,
            batch_size = config.batch_size,
            max_workers = config.max_workers,
            "Starting async batch processor"
        );

        let accumulator = {
            let pool = Arc::clone(&pool);
            let waiters = Arc::clone(&waiters);
            let dispatches = dispatches.clone();
            let name = config.name.clone();
            let batch_size = config.batch_size;
            let flush_interval = config.flush_interval;

            tokio::spawn(async move {
                collect_batches(input, batch_size, flush_interval, |batch| {
                    let pool = Arc::clone(&pool);
                    let waiters = Arc::clone(&waiters);
                    let processor = Arc::clone(&processor);
                    let in_flight = Arc::clone(&in_flight);
                    let dispatches = dispatches.clone();
                    let name = name.clone();
                    async move {
                        let (tokens, items): (Vec<Uuid>, Vec<BatchItem<T>>) = batch
                            .into_iter()
                            .map(|submission| (submission.token, submission.item))
                            .unzip();
                        let permit = match in_flight.acquire_owned(&Context::background()).await {
                            Ok(permit) => permit,
                            Err(err) => {
                                deliver_error(&waiters, tokens, TaskError::from(err));
                                return;
                            }
                        };

                        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
                        let batch_id = Uuid::now_v7().to_string();
                        debug!(batcher = %name, %batch_id, size = ids.len(), "Dispatching batch");
                        dispatches.spawn(async move {
                            let job = Job::new(batch_id, items, move |ctx, items| {
                                processor(ctx, items)
                            });
                            let outcome = pool.submit_and_wait(&Context::background(), job).await;
                            drop(permit);
                            route_outcome(&name, &waiters, tokens, ids, outcome);
                        });
                    }
                })
                .await;
            })
        };

        Ok(Self {
            config,
            input_tx: Mutex::new(Some(input_tx)),
            waiters,
            pool,
            dispatches,
            accumulator: tokio::sync::Mutex::new(Some(accumulator)),
        })
    }

    /// Submit an item and wait for its individual result
    ///
    /// Items may share an ID; each call still gets the result of the item it
    /// submitted. Giving up (cancellation or deadline) does not withdraw an
    /// item that was already queued; its result is discarded when it arrives.
    pub async fn submit_and_wait(&self, ctx: &Context, item: BatchItem<T>) -> Result<R, TaskError> {
        let token = Uuid::now_v7();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.waiters.insert(token, reply_tx);

        if let Err(err) = self.enqueue(ctx, Submission { token, item }).await {
            self.waiters.remove(&token);
            return Err(err);
        }

        match ctx.run(reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::Cancelled),
            Err(err) => {
                self.waiters.remove(&token);
                Err(err.into())
            }
        }
    }

    async fn enqueue(&self, ctx: &Context, submission: Submission<T>) -> Result<(), TaskError> {
        let sender = self
            .input_tx
            .lock()
            .clone()
            .ok_or(SubmitError::ShuttingDown)?;

        ctx.run(sender.send(submission))
            .await?
            .map_err(|_| SubmitError::ShuttingDown)?;
        Ok(())
    }

    /// Callers still waiting for a result
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Stop accepting items, process everything queued, then stop the pool
    ///
    /// Safe to call more than once.
    #[instrument(skip(self), fields(batcher = %self.config.name))]
    pub async fn stop(&self) {
        let mut accumulator = self.accumulator.lock().await;

        if self.input_tx.lock().take().is_some() {
            info!("Draining async batch processor");
        }

        if let Some(handle) = accumulator.take() {
            if let Err(e) = handle.await {
                warn!("Batch accumulator ended abnormally: {}", e);
            }
        }

        self.dispatches.close();
        self.dispatches.wait().await;
        self.pool.stop().await;
    }
}

fn route_outcome<R>(
    batcher: &str,
    waiters: &Waiters<R>,
    tokens: Vec<Uuid>,
    ids: Vec<String>,
    outcome: Result<JobResult<Vec<BatchResult<R>>>, WorkerPoolError>,
) {
    let results = match outcome {
        Ok(job_result) => job_result.into_result(),
        Err(WorkerPoolError::Submit(err)) => Err(TaskError::Rejected(err)),
        Err(WorkerPoolError::Context(err)) => Err(TaskError::from(err)),
        Err(WorkerPoolError::ResultDropped) => Err(TaskError::Cancelled),
    };

    match results {
        Ok(results) => {
            for (token, result) in tokens.into_iter().zip(match_results(batcher, ids, results)) {
                let Some((_, reply)) = waiters.remove(&token) else {
                    debug!(batcher, item_id = %result.id, "Waiter gone, discarding result");
                    continue;
                };
                if reply.send(result.into_result()).is_err() {
                    debug!(batcher, %token, "Waiter dropped before delivery");
                }
            }
        }
        Err(err) => deliver_error(waiters, tokens, err),
    }
}

fn deliver_error<R>(waiters: &Waiters<R>, tokens: Vec<Uuid>, err: TaskError) {
    for token in tokens {
        if let Some((_, reply)) = waiters.remove(&token) {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn double(_ctx: Context, items: Vec<BatchItem<u32>>) -> BatchOutput<u32> {
        Ok(items
            .into_iter()
            .map(|item| BatchResult::success(item.id, item.data * 2))
            .collect())
    }

    fn config(batch_size: usize, flush_interval: Duration) -> BatchConfig {
        BatchConfig::new("test")
            .with_batch_size(batch_size)
            .with_flush_interval(flush_interval)
    }

    #[test]
    fn test_config_validation() {
        assert!(BatchConfig::default().validate().is_ok());
        assert!(BatchConfig::default().with_batch_size(0).validate().is_err());
        assert!(BatchConfig::default().with_max_workers(0).validate().is_err());
        assert!(BatchConfig::default()
            .with_flush_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BatchConfig::default()
            .with_process_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = BatchConfig::new("s").with_flush_interval(Duration::from_millis(750));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"flush_interval\":750"));
        let parsed: BatchConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_match_results_marks_missing_items() {
        let results = match_results(
            "test",
            vec!["a".into(), "b".into(), "c".into()],
            vec![
                BatchResult::success("c", 3),
                BatchResult::success("a", 1),
                BatchResult::success("zzz", 0),
            ],
        );

        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(results[0].data, Some(1));
        assert!(matches!(results[1].error, Some(TaskError::MissingResult)));
        assert_eq!(results[2].data, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_immediately() {
        let batcher = BatchProcessor::start(config(10, Duration::from_secs(5)), double).unwrap();
        let mut results = batcher.take_results().unwrap();
        let ctx = Context::background();
        let started = Instant::now();

        for i in 0..10 {
            batcher.submit(&ctx, BatchItem::new(i.to_string(), i)).await.unwrap();
        }
        for _ in 0..10 {
            assert!(results.recv().await.unwrap().is_success());
        }

        assert!(started.elapsed() < Duration::from_secs(5));
        batcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_on_interval() {
        let batcher = BatchProcessor::start(config(10, Duration::from_secs(5)), double).unwrap();
        let mut results = batcher.take_results().unwrap();
        let ctx = Context::background();
        let started = Instant::now();

        for i in 0..3 {
            batcher.submit(&ctx, BatchItem::new(i.to_string(), i)).await.unwrap();
        }
        for _ in 0..3 {
            results.recv().await.unwrap();
        }

        assert!(started.elapsed() >= Duration::from_secs(5));
        batcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_timer_restarts_after_size_flush() {
        let batcher = BatchProcessor::start(config(2, Duration::from_secs(5)), double).unwrap();
        let mut results = batcher.take_results().unwrap();
        let ctx = Context::background();
        let started = Instant::now();

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(4)).await;
        for i in 0..3 {
            batcher.submit(&ctx, BatchItem::new(i.to_string(), i)).await.unwrap();
        }

        results.recv().await.unwrap();
        results.recv().await.unwrap();
        results.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(9));
        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_processor_error_fails_every_item() {
        let batcher: BatchProcessor<u32, u32> = BatchProcessor::start(
            config(3, Duration::from_secs(60)),
            |_ctx, _items| async { Err(anyhow::anyhow!("backend unavailable")) },
        )
        .unwrap();
        let mut results = batcher.take_results().unwrap();

        for i in 0..3 {
            batcher.try_submit(BatchItem::new(i.to_string(), i)).unwrap();
        }
        for _ in 0..3 {
            let result = results.recv().await.unwrap();
            assert_eq!(result.into_result().unwrap_err().to_string(), "backend unavailable");
        }
        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_short_result_list_yields_missing_result() {
        let batcher: BatchProcessor<u32, u32> = BatchProcessor::start(
            config(4, Duration::from_secs(60)),
            |_ctx, items: Vec<BatchItem<u32>>| async move {
                Ok(items
                    .into_iter()
                    .filter(|item| item.data % 2 == 0)
                    .map(|item| BatchResult::success(item.id, item.data))
                    .collect())
            },
        )
        .unwrap();
        let mut results = batcher.take_results().unwrap();

        for i in 0..4 {
            batcher.try_submit(BatchItem::new(i.to_string(), i)).unwrap();
        }
        let mut missing = 0;
        for _ in 0..4 {
            let result = results.recv().await.unwrap();
            if matches!(result.error, Some(TaskError::MissingResult)) {
                missing += 1;
            }
        }
        assert_eq!(missing, 2);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_processor_panic_is_contained() {
        let batcher: BatchProcessor<u32, u32> = BatchProcessor::start(
            config(1, Duration::from_secs(60)),
            |ctx, items: Vec<BatchItem<u32>>| async move {
                if items[0].data == 0 {
                    panic!("poisoned batch");
                }
                double(ctx, items).await
            },
        )
        .unwrap();
        let mut results = batcher.take_results().unwrap();

        batcher.try_submit(BatchItem::new("bad", 0)).unwrap();
        let result = results.recv().await.unwrap();
        assert!(matches!(result.error, Some(TaskError::Panicked(_))));

        batcher.try_submit(BatchItem::new("good", 5)).unwrap();
        let result = results.recv().await.unwrap();
        assert_eq!(result.into_result().unwrap(), 10);
        batcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_timeout() {
        let batcher: BatchProcessor<u32, u32> = BatchProcessor::start(
            config(1, Duration::from_secs(60)).with_process_timeout(Duration::from_millis(100)),
            |_ctx, _items| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Vec::new())
            },
        )
        .unwrap();
        let mut results = batcher.take_results().unwrap();

        batcher.try_submit(BatchItem::new("slow", 1)).unwrap();
        let result = results.recv().await.unwrap();
        assert!(result.error.unwrap().is_deadline_exceeded());
        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_flushes_partial_batches() {
        let batcher = BatchProcessor::start(
            config(100, Duration::from_secs(3600)).with_max_workers(3),
            double,
        )
        .unwrap();
        let mut results = batcher.take_results().unwrap();

        for i in 0..20 {
            batcher.try_submit(BatchItem::new(i.to_string(), i)).unwrap();
        }
        batcher.stop().await;
        batcher.stop().await;

        let mut seen = HashSet::new();
        while let Some(result) = results.recv().await {
            assert!(seen.insert(result.id));
        }
        assert_eq!(seen.len(), 20);

        assert!(!batcher.is_accepting());
        assert_eq!(
            batcher.try_submit(BatchItem::new("late", 1)),
            Err(SubmitError::ShuttingDown)
        );
        assert!(matches!(
            batcher
                .submit(&Context::background(), BatchItem::new("late", 1))
                .await,
            Err(BatchError::Submit(SubmitError::ShuttingDown))
        ));
    }

    #[tokio::test]
    async fn test_stop_buffers_untaken_results() {
        let batcher = BatchProcessor::start(
            config(1, Duration::from_secs(3600)).with_input_buffer(2),
            double,
        )
        .unwrap();

        // Room for three results, one blocked worker and two queued items.
        let ctx = Context::background();
        for i in 0..6 {
            batcher.submit(&ctx, BatchItem::new(i.to_string(), i)).await.unwrap();
        }

        let stopped = tokio::time::timeout(Duration::from_secs(5), batcher.stop()).await;
        assert!(stopped.is_ok(), "stop stalled on an untaken results stream");

        let mut results = batcher.take_results().unwrap();
        let mut ids = HashSet::new();
        while let Some(result) = results.recv().await {
            assert_eq!(result.data, Some(result.id.parse::<u32>().unwrap() * 2));
            assert!(ids.insert(result.id));
        }
        assert_eq!(ids.len(), 6);
    }

    #[tokio::test]
    async fn test_try_submit_queue_full() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(tokio::sync::Notify::new());
        let (g, s) = (Arc::clone(&gate), Arc::clone(&started));

        let batcher: BatchProcessor<u32, u32> = BatchProcessor::start(
            config(1, Duration::from_secs(60)).with_input_buffer(1),
            move |ctx, items| {
                let (g, s) = (Arc::clone(&g), Arc::clone(&s));
                async move {
                    s.notify_one();
                    g.notified().await;
                    double(ctx, items).await
                }
            },
        )
        .unwrap();
        let mut results = batcher.take_results().unwrap();

        batcher.try_submit(BatchItem::new("a", 1)).unwrap();
        started.notified().await;
        batcher.try_submit(BatchItem::new("b", 2)).unwrap();
        assert_eq!(batcher.queued(), 1);
        assert_eq!(
            batcher.try_submit(BatchItem::new("c", 3)),
            Err(SubmitError::QueueFull)
        );

        gate.notify_one();
        results.recv().await.unwrap();
        started.notified().await;
        gate.notify_one();
        results.recv().await.unwrap();
        batcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_submit_and_wait_routes_results() {
        let batches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&batches);
        let batcher = Arc::new(
            AsyncBatchProcessor::start(
                config(8, Duration::from_millis(20)).with_max_workers(2),
                move |ctx, items: Vec<BatchItem<u32>>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert!(items.len() <= 8);
                    double(ctx, items)
                },
            )
            .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..50u32 {
            let batcher = Arc::clone(&batcher);
            handles.push(tokio::spawn(async move {
                let value = batcher
                    .submit_and_wait(&Context::background(), BatchItem::new(i.to_string(), i))
                    .await
                    .unwrap();
                assert_eq!(value, i * 2);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(batches.load(Ordering::SeqCst) >= 7);
        assert_eq!(batcher.pending(), 0);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_async_error_reaches_every_waiter() {
        let batcher = Arc::new(
            AsyncBatchProcessor::<u32, u32>::start(
                config(2, Duration::from_secs(60)),
                |_ctx, _items| async { Err(anyhow::anyhow!("rejected by backend")) },
            )
            .unwrap(),
        );

        let first = {
            let batcher = Arc::clone(&batcher);
            tokio::spawn(async move {
                batcher
                    .submit_and_wait(&Context::background(), BatchItem::new("a", 1))
                    .await
            })
        };
        let second = batcher
            .submit_and_wait(&Context::background(), BatchItem::new("b", 2))
            .await;

        assert_eq!(second.unwrap_err().to_string(), "rejected by backend");
        assert_eq!(
            first.await.unwrap().unwrap_err().to_string(),
            "rejected by backend"
        );
        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_async_stop_flushes_and_rejects() {
        let batcher = Arc::new(
            AsyncBatchProcessor::start(config(100, Duration::from_secs(3600)), double).unwrap(),
        );

        let waiter = {
            let batcher = Arc::clone(&batcher);
            tokio::spawn(async move {
                batcher
                    .submit_and_wait(&Context::background(), BatchItem::new("only", 21))
                    .await
            })
        };
        while batcher.pending() == 0 {
            tokio::task::yield_now().await;
        }
        batcher.stop().await;
        batcher.stop().await;
        assert_eq!(waiter.await.unwrap().unwrap(), 42);

        let late = batcher
            .submit_and_wait(&Context::background(), BatchItem::new("late", 1))
            .await;
        assert!(matches!(
            late,
            Err(TaskError::Rejected(SubmitError::ShuttingDown))
        ));
    }

    #[tokio::test]
    async fn test_async_shared_ids_get_own_results() {
        let batcher = Arc::new(
            AsyncBatchProcessor::start(config(2, Duration::from_secs(3600)), double).unwrap(),
        );

        let first = {
            let batcher = Arc::clone(&batcher);
            tokio::spawn(async move {
                batcher
                    .submit_and_wait(&Context::background(), BatchItem::new("dup", 1))
                    .await
            })
        };
        while batcher.pending() == 0 {
            tokio::task::yield_now().await;
        }

        let second = batcher
            .submit_and_wait(&Context::background(), BatchItem::new("dup", 2))
            .await;

        assert_eq!(second.unwrap(), 4);
        assert_eq!(first.await.unwrap().unwrap(), 2);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_abandoned_result_never_reaches_later_caller() {
        let batcher = Arc::new(
            AsyncBatchProcessor::start(config(100, Duration::from_millis(200)), double).unwrap(),
        );

        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let err = batcher
            .submit_and_wait(&ctx, BatchItem::new("x", 1))
            .await
            .unwrap_err();
        assert!(err.is_deadline_exceeded());

        let later = {
            let batcher = Arc::clone(&batcher);
            tokio::spawn(async move {
                batcher
                    .submit_and_wait(&Context::background(), BatchItem::new("x", 5))
                    .await
            })
        };
        while batcher.pending() == 0 {
            tokio::task::yield_now().await;
        }
        batcher.stop().await;

        assert_eq!(later.await.unwrap().unwrap(), 10);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_match_results_pairs_shared_ids_in_order() {
        let results = match_results(
            "test",
            vec!["x".into(), "y".into(), "x".into(), "x".into()],
            vec![
                BatchResult::success("x", 1),
                BatchResult::success("y", 2),
                BatchResult::success("x", 3),
            ],
        );

        assert_eq!(results[0].data, Some(1));
        assert_eq!(results[1].data, Some(2));
        assert_eq!(results[2].data, Some(3));
        assert!(matches!(results[3].error, Some(TaskError::MissingResult)));
    }

    #[tokio::test]
    async fn test_async_waiter_cancellation() {
        let batcher =
            AsyncBatchProcessor::start(config(100, Duration::from_secs(3600)), double).unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let err = batcher
            .submit_and_wait(&ctx, BatchItem::new("abandoned", 1))
            .await
            .unwrap_err();

        assert!(err.is_deadline_exceeded());
        assert_eq!(batcher.pending(), 0);
        batcher.stop().await;
    }
}
