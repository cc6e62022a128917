//! Staged processing pipeline
//!
//! A [`Pipeline`] threads one value through an ordered list of [`Stage`]s.
//! Execution stops at the first stage error, or when the context is found
//! cancelled or expired between stages.
//!
//! Decorators wrap a stage without changing the [`Stage`] contract:
//!
//! - [`RetryStage`]: re-runs the wrapped stage with backoff
//! - [`TimedStage`]: records durations into shared [`StageTimings`]
//! - [`ConditionalStage`]: skips the wrapped stage when a predicate is false
//!
//! [`ParallelPipeline`] runs one pipeline over many independent inputs with
//! bounded concurrency.

mod retry;
mod stages;

pub use retry::RetryPolicy;
pub use stages::{ConditionalStage, RetryStage, StageTiming, StageTimings, TimedStage};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::context::Context;
use crate::error::{panic_message, ContextError};
use crate::semaphore::Semaphore;

/// One step of a pipeline
#[async_trait]
pub trait Stage<T>: Send + Sync {
    /// Stage name, reported in errors and logs
    fn name(&self) -> &str;

    /// Transform the value
    async fn process(&self, ctx: &Context, input: T) -> anyhow::Result<T>;
}

/// Stage built from a name and an async closure
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F> {
    pub fn new<T, Fut>(name: impl Into<String>, f: F) -> Self
    where
        T: Send + 'static,
        F: Fn(Context, T) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> std::fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<T, F, Fut> Stage<T> for FnStage<F>
where
    T: Send + 'static,
    F: Fn(Context, T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &Context, input: T) -> anyhow::Result<T> {
        (self.f)(ctx.clone(), input).await
    }
}

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage failed or panicked
    #[error("stage {index} ({name}) failed: {source}")]
    Stage {
        index: usize,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The context was cancelled before stage `index` ran
    #[error("pipeline cancelled before stage {index}")]
    Cancelled { index: usize },

    /// The context deadline passed before stage `index` completed
    #[error("pipeline deadline exceeded at stage {index}")]
    DeadlineExceeded { index: usize },
}

impl PipelineError {
    /// Index of the stage the pipeline stopped at
    pub fn stage_index(&self) -> usize {
        match self {
            Self::Stage { index, .. }
            | Self::Cancelled { index }
            | Self::DeadlineExceeded { index } => *index,
        }
    }

    fn from_context(err: ContextError, index: usize) -> Self {
        match err {
            ContextError::Cancelled => Self::Cancelled { index },
            ContextError::DeadlineExceeded => Self::DeadlineExceeded { index },
        }
    }
}

/// Ordered list of stages applied to one value
///
/// # Example
///
/// ```
/// use everruns_concurrency::{Context, Pipeline};
/// use everruns_concurrency::pipeline::FnStage;
///
/// # tokio_test::block_on(async {
/// let pipeline = Pipeline::new("normalize")
///     .add_stage(FnStage::new("trim", |_ctx, s: String| async move { Ok(s.trim().to_string()) }))
///     .add_stage(FnStage::new("lower", |_ctx, s: String| async move { Ok(s.to_lowercase()) }));
///
/// let out = pipeline.execute(&Context::background(), "  Hello ".to_string()).await.unwrap();
/// assert_eq!(out, "hello");
/// # });
/// ```
pub struct Pipeline<T> {
    name: String,
    stages: Vec<Arc<dyn Stage<T>>>,
}

impl<T> std::fmt::Debug for Pipeline<T>
where
    T: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl<T> Pipeline<T>
where
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Append a stage
    pub fn add_stage(mut self, stage: impl Stage<T> + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append a stage that is shared with other pipelines
    pub fn add_shared_stage(mut self, stage: Arc<dyn Stage<T>>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run `input` through every stage in order
    ///
    /// A stage that panics is reported as that stage's error.
    pub async fn execute(&self, ctx: &Context, input: T) -> Result<T, PipelineError> {
        let mut value = input;

        for (index, stage) in self.stages.iter().enumerate() {
            if let Some(err) = ctx.err() {
                debug!(pipeline = %self.name, index, reason = %err, "Pipeline stopped");
                return Err(PipelineError::from_context(err, index));
            }

            let outcome = AssertUnwindSafe(stage.process(ctx, value))
                .catch_unwind()
                .await;

            value = match outcome {
                Ok(Ok(next)) => next,
                Ok(Err(source)) => {
                    // Stages that gave up because of the context report it as such
                    if let Some(&err) = source.downcast_ref::<ContextError>() {
                        return Err(PipelineError::from_context(err, index));
                    }
                    return Err(PipelineError::Stage {
                        index,
                        name: stage.name().to_string(),
                        source,
                    });
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(
                        pipeline = %self.name,
                        stage = stage.name(),
                        panic = %message,
                        "Stage panicked"
                    );
                    return Err(PipelineError::Stage {
                        index,
                        name: stage.name().to_string(),
                        source: anyhow::anyhow!("stage panicked: {message}"),
                    });
                }
            };
        }

        Ok(value)
    }
}

/// Runs one pipeline over many inputs, at most `max_concurrency` at a time
///
/// Each input gets its own result at the same index. A failing input does
/// not affect the others.
pub struct ParallelPipeline<T> {
    pipeline: Arc<Pipeline<T>>,
    limiter: Arc<Semaphore>,
}

impl<T> ParallelPipeline<T>
where
    T: Send + 'static,
{
    pub fn new(pipeline: Pipeline<T>, max_concurrency: usize) -> Result<Self, ConfigError> {
        Ok(Self {
            pipeline: Arc::new(pipeline),
            limiter: Arc::new(Semaphore::new(max_concurrency)?),
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.limiter.capacity()
    }

    pub fn pipeline(&self) -> &Pipeline<T> {
        &self.pipeline
    }

    /// Execute the pipeline once per input
    ///
    /// Inputs not yet started when `ctx` ends fail with that context error.
    pub async fn execute(&self, ctx: &Context, inputs: Vec<T>) -> Vec<Result<T, PipelineError>> {
        let mut slots = Vec::with_capacity(inputs.len());

        for input in inputs {
            let permit = match self.limiter.acquire_owned(ctx).await {
                Ok(permit) => permit,
                Err(err) => {
                    slots.push(Slot::Done(Err(PipelineError::from_context(err, 0))));
                    continue;
                }
            };

            let pipeline = Arc::clone(&self.pipeline);
            let ctx = ctx.clone();
            slots.push(Slot::Running(tokio::spawn(async move {
                let result = pipeline.execute(&ctx, input).await;
                drop(permit);
                result
            })));
        }

        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            let result = match slot {
                Slot::Done(result) => result,
                Slot::Running(handle) => handle.await.unwrap_or_else(|join_err| {
                    warn!(pipeline = %self.pipeline.name, error = %join_err, "Pipeline task aborted");
                    Err(PipelineError::Cancelled { index: 0 })
                }),
            };
            results.push(result);
        }
        results
    }
}

enum Slot<T> {
    Done(Result<T, PipelineError>),
    Running(tokio::task::JoinHandle<Result<T, PipelineError>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Ready = futures::future::Ready<anyhow::Result<String>>;

    fn append(name: &'static str) -> FnStage<impl Fn(Context, String) -> Ready + Send + Sync> {
        FnStage::new(name, move |_ctx, s: String| futures::future::ready(Ok(s + name)))
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let pipeline = Pipeline::new("letters")
            .add_stage(append("a"))
            .add_stage(append("b"))
            .add_stage(append("c"));

        assert_eq!(pipeline.len(), 3);
        assert_eq!(pipeline.stage_names(), ["a", "b", "c"]);
        let out = pipeline
            .execute(&Context::background(), String::new())
            .await
            .unwrap();
        assert_eq!(out, "abc");
    }

    #[tokio::test]
    async fn test_failing_stage_short_circuits() {
        let c_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&c_calls);

        let pipeline = Pipeline::new("abc")
            .add_stage(append("A"))
            .add_stage(FnStage::new("B", |_ctx, _s: String| async move {
                Err(anyhow::anyhow!("b broke"))
            }))
            .add_stage(FnStage::new("C", move |_ctx, s: String| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(s) }
            }));

        let err = pipeline
            .execute(&Context::background(), String::new())
            .await
            .unwrap_err();

        match &err {
            PipelineError::Stage { index, name, source } => {
                assert_eq!(*index, 1);
                assert_eq!(name, "B");
                assert_eq!(source.to_string(), "b broke");
            }
            other => panic!("expected stage error, got {other:?}"),
        }
        assert_eq!(err.to_string(), "stage 1 (B) failed: b broke");
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_observed_between_stages() {
        let pipeline = Pipeline::new("cancel")
            .add_stage(FnStage::new("cancel", |ctx: Context, s: String| async move {
                ctx.cancel();
                Ok(s)
            }))
            .add_stage(append("never"));

        let err = pipeline
            .execute(&Context::background(), String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { index: 1 }));
        assert_eq!(err.stage_index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_context_reports_deadline() {
        let pipeline = Pipeline::new("slow")
            .add_stage(FnStage::new("sleep", |_ctx, s: String| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(s)
            }))
            .add_stage(append("late"));

        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let err = pipeline.execute(&ctx, String::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::DeadlineExceeded { index: 1 }));
    }

    #[tokio::test]
    async fn test_stage_panic_becomes_stage_error() {
        let pipeline = Pipeline::new("panics").add_stage(FnStage::new(
            "explode",
            |_ctx, s: String| async move {
                if s.is_empty() {
                    panic!("stage exploded");
                }
                Ok(s)
            },
        ));

        let err = pipeline
            .execute(&Context::background(), String::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stage panicked: stage exploded"));
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_identity() {
        let pipeline: Pipeline<u32> = Pipeline::new("empty");
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.execute(&Context::background(), 7).await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_pipeline_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));

        let pipeline = Pipeline::new("parallel").add_stage(FnStage::new(
            "work",
            move |_ctx, n: u32| {
                let (a, p) = (Arc::clone(&a), Arc::clone(&p));
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    if n == 3 {
                        anyhow::bail!("three is unlucky");
                    }
                    Ok(n * 10)
                }
            },
        ));

        let parallel = ParallelPipeline::new(pipeline, 2).unwrap();
        assert_eq!(parallel.max_concurrency(), 2);

        let results = parallel
            .execute(&Context::background(), (0..8).collect())
            .await;

        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            if i == 3 {
                assert!(result.is_err());
            } else {
                assert_eq!(*result.as_ref().unwrap(), i as u32 * 10);
            }
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_parallel_pipeline_cancelled_context() {
        let parallel =
            ParallelPipeline::new(Pipeline::new("noop").add_stage(append("x")), 1).unwrap();
        let ctx = Context::background();
        ctx.cancel();

        let results = parallel
            .execute(&ctx, vec![String::new(), String::new()])
            .await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(PipelineError::Cancelled { index: 0 }))));
    }
}
