//! Stage decorators

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{RetryPolicy, Stage};
use crate::config::duration_millis;
use crate::context::Context;
use crate::pool::mean_duration;

type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Re-runs the wrapped stage on error, following a [`RetryPolicy`]
///
/// Each attempt gets a clone of the original input. Waiting between
/// attempts stops as soon as the context ends; the last stage error is then
/// returned with the context error attached.
pub struct RetryStage<S> {
    inner: S,
    policy: RetryPolicy,
    retry_if: Option<RetryPredicate>,
}

impl<S> RetryStage<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            retry_if: None,
        }
    }

    /// Only retry errors for which `predicate` returns `true`
    pub fn with_retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn is_retryable(&self, err: &anyhow::Error) -> bool {
        self.retry_if.as_ref().map_or(true, |retry_if| retry_if(err))
    }
}

#[async_trait]
impl<T, S> Stage<T> for RetryStage<S>
where
    T: Clone + Send + Sync + 'static,
    S: Stage<T>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn process(&self, ctx: &Context, input: T) -> anyhow::Result<T> {
        let mut attempt = 1;
        loop {
            let err = match self.inner.process(ctx, input.clone()).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            if !self.policy.has_attempts_remaining(attempt) || !self.is_retryable(&err) {
                return Err(err);
            }

            attempt += 1;
            let delay = self.policy.delay_for_attempt(attempt);
            debug!(
                stage = self.inner.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying stage"
            );

            if let Err(ctx_err) = ctx.sleep(delay).await {
                return Err(err.context(ctx_err));
            }
        }
    }
}

/// Aggregated durations for one stage name
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub calls: u64,
    pub failures: u64,
    #[serde(with = "duration_millis")]
    pub total: Duration,
    #[serde(with = "duration_millis")]
    pub max: Duration,
}

impl StageTiming {
    /// Mean duration per call
    pub fn average(&self) -> Duration {
        mean_duration(self.total, self.calls)
    }
}

/// Shared timing table, keyed by stage name
///
/// Cloning shares the table, so several [`TimedStage`]s (and pipelines) can
/// report into one place.
#[derive(Debug, Clone, Default)]
pub struct StageTimings {
    table: Arc<Mutex<HashMap<String, StageTiming>>>,
}

impl StageTimings {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, stage: &str, elapsed: Duration, success: bool) {
        let mut table = self.table.lock();
        let timing = table.entry(stage.to_string()).or_default();
        timing.calls += 1;
        if !success {
            timing.failures += 1;
        }
        timing.total += elapsed;
        timing.max = timing.max.max(elapsed);
    }

    pub fn get(&self, stage: &str) -> Option<StageTiming> {
        self.table.lock().get(stage).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, StageTiming> {
        self.table.lock().clone()
    }

    pub fn clear(&self) {
        self.table.lock().clear();
    }
}

/// Records how long the wrapped stage takes and logs the outcome
pub struct TimedStage<S> {
    inner: S,
    timings: StageTimings,
}

impl<S> TimedStage<S> {
    pub fn new(inner: S, timings: StageTimings) -> Self {
        Self { inner, timings }
    }

    pub fn timings(&self) -> &StageTimings {
        &self.timings
    }
}

#[async_trait]
impl<T, S> Stage<T> for TimedStage<S>
where
    T: Send + 'static,
    S: Stage<T>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn process(&self, ctx: &Context, input: T) -> anyhow::Result<T> {
        let started = Instant::now();
        let result = self.inner.process(ctx, input).await;
        let elapsed = started.elapsed();

        self.timings
            .record(self.inner.name(), elapsed, result.is_ok());

        match &result {
            Ok(_) => debug!(
                stage = self.inner.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Stage completed"
            ),
            Err(e) => warn!(
                stage = self.inner.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e,
                "Stage failed"
            ),
        }
        result
    }
}

/// Runs the wrapped stage only when `predicate(&input)` holds
///
/// Otherwise the input passes through unchanged.
pub struct ConditionalStage<S, P> {
    inner: S,
    predicate: P,
}

impl<S, P> ConditionalStage<S, P> {
    pub fn new(inner: S, predicate: P) -> Self {
        Self { inner, predicate }
    }
}

#[async_trait]
impl<T, S, P> Stage<T> for ConditionalStage<S, P>
where
    T: Send + 'static,
    S: Stage<T>,
    P: Fn(&T) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn process(&self, ctx: &Context, input: T) -> anyhow::Result<T> {
        if (self.predicate)(&input) {
            self.inner.process(ctx, input).await
        } else {
            trace!(stage = self.inner.name(), "Stage skipped");
            Ok(input)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContextError;
    use crate::pipeline::{FnStage, Pipeline, PipelineError};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Stage that fails until it has been called `succeed_on` times
    fn flaky(
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    ) -> impl Stage<u32> {
        FnStage::new("flaky", move |_ctx, n: u32| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < succeed_on {
                    anyhow::bail!("attempt {attempt} failed");
                }
                Ok(n + attempt)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stage_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = RetryStage::new(
            flaky(Arc::clone(&calls), 3),
            RetryPolicy::fixed(Duration::from_millis(10), 5),
        );

        let started = Instant::now();
        let out = stage.process(&Context::background(), 100).await.unwrap();

        assert_eq!(out, 103);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stage_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = RetryStage::new(
            flaky(Arc::clone(&calls), 10),
            RetryPolicy::fixed(Duration::from_millis(10), 3),
        );

        let err = stage.process(&Context::background(), 0).await.unwrap_err();
        assert_eq!(err.to_string(), "attempt 3 failed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_filters_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = RetryStage::new(
            flaky(Arc::clone(&calls), 10),
            RetryPolicy::fixed(Duration::ZERO, 5),
        )
        .with_retry_if(|err| !err.to_string().contains("attempt 2"));

        stage.process(&Context::background(), 0).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_aborts_on_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = Pipeline::new("retrying").add_stage(RetryStage::new(
            flaky(Arc::clone(&calls), 10),
            RetryPolicy::fixed(Duration::from_secs(10), 5),
        ));

        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let err = pipeline.execute(&ctx, 0).await.unwrap_err();

        assert!(matches!(err, PipelineError::DeadlineExceeded { index: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_context_error_is_attached() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = RetryStage::new(
            flaky(Arc::clone(&calls), 10),
            RetryPolicy::fixed(Duration::from_secs(10), 5),
        );
        let ctx = Context::background();
        ctx.cancel();

        let err = stage.process(&ctx, 0).await.unwrap_err();
        assert_eq!(err.downcast_ref::<ContextError>(), Some(&ContextError::Cancelled));
        assert_eq!(err.root_cause().to_string(), "attempt 1 failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_stage_records_durations() {
        let timings = StageTimings::new();
        let slow = FnStage::new("slow", |_ctx, n: u32| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            if n == 0 {
                anyhow::bail!("zero");
            }
            Ok(n)
        });
        let stage = TimedStage::new(slow, timings.clone());

        assert_eq!(stage.process(&Context::background(), 5).await.unwrap(), 5);
        assert!(stage.process(&Context::background(), 0).await.is_err());

        let timing = timings.get("slow").unwrap();
        assert_eq!(timing.calls, 2);
        assert_eq!(timing.failures, 1);
        assert_eq!(timing.max, Duration::from_millis(30));
        assert_eq!(timing.average(), Duration::from_millis(30));
        assert_eq!(stage.timings().snapshot().len(), 1);
    }

    #[test]
    fn test_average_with_call_count_beyond_u32() {
        let timing = StageTiming {
            calls: 1 << 32,
            failures: 0,
            total: Duration::from_secs(1 << 32),
            max: Duration::from_secs(2),
        };
        assert_eq!(timing.average(), Duration::from_secs(1));
        assert_eq!(StageTiming::default().average(), Duration::ZERO);
    }

    #[test]
    fn test_stage_timing_serialization() {
        let timing = StageTiming {
            calls: 2,
            failures: 0,
            total: Duration::from_millis(40),
            max: Duration::from_millis(25),
        };
        let json = serde_json::to_string(&timing).unwrap();
        assert!(json.contains("\"total\":40"));
        let parsed: StageTiming = serde_json::from_str(&json).unwrap();
        assert_eq!(timing, parsed);
    }

    #[tokio::test]
    async fn test_conditional_stage() {
        let double = FnStage::new("double", |_ctx, n: u32| async move { Ok(n * 2) });
        let stage = ConditionalStage::new(double, |n: &u32| *n > 10);

        assert_eq!(stage.name(), "double");
        assert_eq!(stage.process(&Context::background(), 5).await.unwrap(), 5);
        assert_eq!(stage.process(&Context::background(), 20).await.unwrap(), 40);
    }
}
