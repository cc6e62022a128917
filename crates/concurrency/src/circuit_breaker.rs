//! Circuit breaker
//!
//! Fail-fast protection for calls to an unreliable dependency, with
//! automatic recovery probing.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  consecutive failures  ┌─────────┐  timeout (lazy)  ┌──────────┐
//! │ Closed  │ ─────────────────────► │  Open   │ ───────────────► │ HalfOpen │
//! └─────────┘                        └─────────┘                  └──────────┘
//!      ▲                                  ▲          any failure       │
//!      │                                  └────────────────────────────┤
//!      │              consecutive successes                            │
//!      └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every transition starts a new generation and zeroes [`Counts`]. A call
//! remembers the generation it was admitted under; if the generation has
//! moved on by the time the call finishes, its outcome is discarded.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{duration_millis, ConfigError};
use crate::context::Context;
use crate::error::ContextError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if service recovered - limited calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # Example
///
/// ```
/// use everruns_concurrency::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::new("payments")
///     .with_failure_threshold(5)
///     .with_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Breaker name, passed to state-change observers and logs
    pub name: String,

    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,

    /// Time spent open before the next call is admitted as a probe
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Period after which closed-state counts are cleared (zero = never)
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Concurrent probes admitted while half-open
    pub max_requests: u32,

    /// Deadline applied to a call when the caller's context has none
    #[serde(with = "duration_millis")]
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "circuit-breaker".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(60),
            max_requests: 1,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold to close the circuit
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the open-state timeout (time before trying again after opening)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the closed-state count clearing interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the number of concurrent half-open probes
    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Set the fallback per-call deadline
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker",
                "failure_threshold must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker",
                "success_threshold must be at least 1",
            ));
        }
        if self.max_requests == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker",
                "max_requests must be at least 1",
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "circuit_breaker",
                "call_timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Per-generation request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Error types for circuit breaker calls
#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, the call was not attempted
    #[error("circuit breaker is open")]
    Open,

    /// Circuit is half-open and every probe slot is taken
    #[error("circuit breaker half-open, too many requests")]
    TooManyRequests,

    /// The call ran past its deadline
    #[error("call deadline exceeded")]
    DeadlineExceeded,

    /// The caller cancelled the call
    #[error("call cancelled")]
    Cancelled,

    /// The wrapped operation failed
    #[error(transparent)]
    Operation(anyhow::Error),
}

impl CircuitBreakerError {
    /// Whether the breaker refused the call without running it
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open | Self::TooManyRequests)
    }
}

/// Classifies an operation error as a failure (`true`) or acceptable (`false`)
pub type FailurePredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Observer for `(name, from, to)` transitions
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    /// Releases the probe slot without touching the counts
    Ignored,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    in_flight: u32,
    expiry: Option<Instant>,
}

type Transitions = Vec<(CircuitState, CircuitState)>;

/// In-process circuit breaker
///
/// # Example
///
/// ```ignore
/// use everruns_concurrency::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, Context};
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("search"))?
///     .with_failure_predicate(|err| !is_not_found(err))
///     .on_state_change(|name, from, to| println!("{name}: {from} -> {to}"));
///
/// match breaker.execute(&Context::background(), |ctx| search(ctx, query)).await {
///     Ok(hits) => render(hits),
///     Err(e) if e.is_rejection() => render_cached(),
///     Err(e) => return Err(e.into()),
/// }
/// ```
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    is_failure: FailurePredicate,
    on_state_change: Option<StateChangeHook>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let expiry = closed_expiry(&config, Instant::now());
        Ok(Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                in_flight: 0,
                expiry,
            }),
            is_failure: Arc::new(|_| true),
            on_state_change: None,
        })
    }

    /// Decide which operation errors count as failures
    pub fn with_failure_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(predicate);
        self
    }

    /// Observe state transitions
    ///
    /// The hook runs after the breaker's lock is released, so it may call
    /// back into the breaker.
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state (applies a pending Open -> HalfOpen transition)
    pub fn state(&self) -> CircuitState {
        let mut transitions = Transitions::new();
        let state = {
            let mut inner = self.state.lock();
            self.refresh(&mut inner, Instant::now(), &mut transitions);
            inner.state
        };
        self.notify(transitions);
        state
    }

    /// Counts for the current generation
    pub fn counts(&self) -> Counts {
        self.state.lock().counts
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Force the breaker closed and zero its counts
    pub fn reset(&self) {
        let mut transitions = Transitions::new();
        {
            let mut inner = self.state.lock();
            let now = Instant::now();
            if inner.state == CircuitState::Closed {
                self.new_generation(&mut inner, now);
            } else {
                self.set_state(&mut inner, CircuitState::Closed, now, &mut transitions);
            }
        }
        self.notify(transitions);
    }

    /// Run `f` under breaker protection
    ///
    /// Rejected calls return [`CircuitBreakerError::Open`] or
    /// [`CircuitBreakerError::TooManyRequests`] without invoking `f`. The call
    /// runs under the caller's deadline, or `call_timeout` when the caller has
    /// none. A panic inside `f` is recorded as a failure and then resumed.
    pub async fn execute<T, F, Fut>(&self, ctx: &Context, f: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let generation = self.before_call()?;

        let call_ctx = ctx.or_timeout(self.config.call_timeout);
        let op_ctx = call_ctx.clone();
        let work = AssertUnwindSafe(async move { f(op_ctx).await }).catch_unwind();
        let outcome = call_ctx.run(work).await;
        call_ctx.cancel();

        match outcome {
            Ok(Ok(Ok(value))) => {
                self.after_call(generation, Outcome::Success);
                Ok(value)
            }
            Ok(Ok(Err(err))) => {
                let outcome = if (self.is_failure)(&err) {
                    Outcome::Failure
                } else {
                    Outcome::Success
                };
                self.after_call(generation, outcome);
                Err(CircuitBreakerError::Operation(err))
            }
            Ok(Err(payload)) => {
                self.after_call(generation, Outcome::Failure);
                std::panic::resume_unwind(payload)
            }
            Err(ContextError::DeadlineExceeded) => {
                self.after_call(generation, Outcome::Failure);
                Err(CircuitBreakerError::DeadlineExceeded)
            }
            Err(ContextError::Cancelled) => {
                self.after_call(generation, Outcome::Ignored);
                Err(CircuitBreakerError::Cancelled)
            }
        }
    }

    /// Run `primary`, falling back only when the breaker rejects the call
    ///
    /// Failures of `primary` itself are returned as-is; `fallback` receives
    /// the rejection.
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(
        &self,
        ctx: &Context,
        primary: F,
        fallback: G,
    ) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        G: FnOnce(CircuitBreakerError) -> GFut,
        GFut: Future<Output = anyhow::Result<T>>,
    {
        match self.execute(ctx, primary).await {
            Err(rejection) if rejection.is_rejection() => {
                debug!(breaker = %self.config.name, reason = %rejection, "Using fallback");
                fallback(rejection).await.map_err(CircuitBreakerError::Operation)
            }
            other => other,
        }
    }

    /// Admit or reject a call, returning the generation it runs under
    fn before_call(&self) -> Result<u64, CircuitBreakerError> {
        let mut transitions = Transitions::new();
        let admitted = {
            let mut inner = self.state.lock();
            self.refresh(&mut inner, Instant::now(), &mut transitions);

            match inner.state {
                CircuitState::Open => Err(CircuitBreakerError::Open),
                CircuitState::HalfOpen if inner.in_flight >= self.config.max_requests => {
                    Err(CircuitBreakerError::TooManyRequests)
                }
                _ => {
                    inner.counts.on_request();
                    inner.in_flight += 1;
                    Ok(inner.generation)
                }
            }
        };
        self.notify(transitions);

        if let Err(rejection) = &admitted {
            debug!(breaker = %self.config.name, reason = %rejection, "Call rejected");
        }
        admitted
    }

    /// Apply a call outcome unless the generation moved on
    fn after_call(&self, generation: u64, outcome: Outcome) {
        let mut transitions = Transitions::new();
        {
            let mut inner = self.state.lock();
            let now = Instant::now();
            self.refresh(&mut inner, now, &mut transitions);

            if inner.generation != generation {
                debug!(
                    breaker = %self.config.name,
                    call_generation = generation,
                    current_generation = inner.generation,
                    ?outcome,
                    "Discarding stale call outcome"
                );
            } else {
                inner.in_flight = inner.in_flight.saturating_sub(1);
                match outcome {
                    Outcome::Success => self.on_success(&mut inner, now, &mut transitions),
                    Outcome::Failure => self.on_failure(&mut inner, now, &mut transitions),
                    Outcome::Ignored => {}
                }
            }
        }
        self.notify(transitions);
    }

    fn on_success(&self, inner: &mut BreakerState, now: Instant, transitions: &mut Transitions) {
        inner.counts.on_success();
        if inner.state == CircuitState::HalfOpen
            && inner.counts.consecutive_successes >= self.config.success_threshold
        {
            self.set_state(inner, CircuitState::Closed, now, transitions);
        }
    }

    fn on_failure(&self, inner: &mut BreakerState, now: Instant, transitions: &mut Transitions) {
        inner.counts.on_failure();
        match inner.state {
            CircuitState::Closed
                if inner.counts.consecutive_failures >= self.config.failure_threshold =>
            {
                self.set_state(inner, CircuitState::Open, now, transitions);
            }
            CircuitState::HalfOpen => {
                self.set_state(inner, CircuitState::Open, now, transitions);
            }
            _ => {}
        }
    }

    /// Apply time-driven changes: closed-interval rollover and Open -> HalfOpen
    fn refresh(&self, inner: &mut BreakerState, now: Instant, transitions: &mut Transitions) {
        let expired = inner.expiry.is_some_and(|expiry| expiry <= now);
        match inner.state {
            CircuitState::Closed if expired => self.new_generation(inner, now),
            CircuitState::Open if expired => {
                self.set_state(inner, CircuitState::HalfOpen, now, transitions);
            }
            _ => {}
        }
    }

    fn set_state(
        &self,
        inner: &mut BreakerState,
        to: CircuitState,
        now: Instant,
        transitions: &mut Transitions,
    ) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        self.new_generation(inner, now);
        transitions.push((from, to));
    }

    fn new_generation(&self, inner: &mut BreakerState, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.in_flight = 0;
        inner.expiry = match inner.state {
            CircuitState::Closed => closed_expiry(&self.config, now),
            CircuitState::Open => Some(now + self.config.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    fn notify(&self, transitions: Transitions) {
        for (from, to) in transitions {
            info!(
                breaker = %self.config.name,
                from = %from,
                to = %to,
                "Circuit breaker state changed"
            );
            if let Some(hook) = &self.on_state_change {
                hook(&self.config.name, from, to);
            }
        }
    }
}

fn closed_expiry(config: &CircuitBreakerConfig, now: Instant) -> Option<Instant> {
    (!config.interval.is_zero()).then(|| now + config.interval)
}
