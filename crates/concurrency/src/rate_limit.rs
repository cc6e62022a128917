//! Rate limiters
//!
//! Two admission policies behind one [`RateLimiter`] trait:
//!
//! - [`TokenBucket`]: bursts up to `capacity`, one token back per
//!   `refill_period`
//! - [`SlidingWindow`]: at most `limit` admissions in any trailing `window`
//!
//! Both refill lazily on each check; there is no background task.
//! Statistics count the outcome of `allow`/`check` calls and every
//! admission granted through `wait`. Retries inside `wait` are not counted
//! as denials.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

use crate::config::{duration_millis, ConfigError};
use crate::context::Context;
use crate::error::ContextError;

/// Rate limiter errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// Non-blocking check denied
    #[error("rate limit exceeded")]
    Exceeded,

    /// The caller cancelled while waiting
    #[error("cancelled while waiting for rate limit")]
    Cancelled,

    /// The caller's deadline passed while waiting
    #[error("deadline exceeded while waiting for rate limit")]
    DeadlineExceeded,
}

impl From<ContextError> for RateLimitError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Self::Cancelled,
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

/// Admission counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub denied: u64,
}

/// Common rate limiter interface
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admit one request if permitted right now
    fn allow(&self) -> bool;

    /// Like [`allow`](Self::allow), as a `Result`
    fn check(&self) -> Result<(), RateLimitError> {
        if self.allow() {
            Ok(())
        } else {
            Err(RateLimitError::Exceeded)
        }
    }

    /// Wait until a request is admitted or the context ends
    async fn wait(&self, ctx: &Context) -> Result<(), RateLimitError>;

    /// Restore the initial state and zero the statistics
    fn reset(&self);

    /// Statistics snapshot
    fn stats(&self) -> RateLimiterStats;
}

/// Token bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenBucketConfig {
    pub name: String,

    /// Maximum tokens (burst size)
    pub capacity: u32,

    /// Time to regain one token
    #[serde(with = "duration_millis")]
    pub refill_period: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            name: "token-bucket".to_string(),
            capacity: 10,
            refill_period: Duration::from_millis(100),
        }
    }
}

impl TokenBucketConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_refill_period(mut self, period: Duration) -> Self {
        self.refill_period = period;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid(
                "token_bucket",
                "capacity must be at least 1",
            ));
        }
        if self.refill_period.is_zero() {
            return Err(ConfigError::invalid(
                "token_bucket",
                "refill_period must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
    stats: RateLimiterStats,
}

/// Token bucket rate limiter
///
/// Starts full. Elapsed time is converted into whole tokens on each check;
/// the leftover fraction of a period carries over to the next check.
///
/// # Example
///
/// ```
/// use everruns_concurrency::{RateLimiter, TokenBucket, TokenBucketConfig};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let bucket = TokenBucket::new(
///     TokenBucketConfig::new("api")
///         .with_capacity(2)
///         .with_refill_period(Duration::from_secs(1)),
/// )
/// .unwrap();
/// assert!(bucket.allow());
/// assert!(bucket.allow());
/// assert!(!bucket.allow());
/// # });
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = BucketState {
            tokens: config.capacity,
            last_refill: Instant::now(),
            stats: RateLimiterStats::default(),
        };
        Ok(Self {
            config,
            state: Mutex::new(state),
        })
    }

    /// Tokens available right now
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let period = self.config.refill_period;
        let elapsed = now.saturating_duration_since(state.last_refill);
        let periods = elapsed.as_nanos() / period.as_nanos();
        if periods == 0 {
            return;
        }

        let missing = self.config.capacity - state.tokens;
        if periods >= u128::from(missing) {
            state.tokens = self.config.capacity;
            state.last_refill = now;
        } else {
            // periods < missing <= u32::MAX
            let periods = periods as u32;
            state.tokens += periods;
            state.last_refill += period * periods;
        }
    }

    /// Take a token, or report when the next one arrives
    fn try_take(&self) -> Result<(), Instant> {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.refill(&mut state, now);

        if state.tokens > 0 {
            state.tokens -= 1;
            state.stats.allowed += 1;
            Ok(())
        } else {
            Err(state.last_refill + self.config.refill_period)
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    fn allow(&self) -> bool {
        match self.try_take() {
            Ok(()) => true,
            Err(_) => {
                self.state.lock().stats.denied += 1;
                false
            }
        }
    }

    async fn wait(&self, ctx: &Context) -> Result<(), RateLimitError> {
        loop {
            match self.try_take() {
                Ok(()) => return Ok(()),
                Err(next_refill) => {
                    trace!(limiter = %self.config.name, "Waiting for token refill");
                    ctx.sleep_until(next_refill).await?;
                }
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.tokens = self.config.capacity;
        state.last_refill = Instant::now();
        state.stats = RateLimiterStats::default();
    }

    fn stats(&self) -> RateLimiterStats {
        self.state.lock().stats
    }
}

/// Sliding window configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlidingWindowConfig {
    pub name: String,

    /// Admissions allowed per window
    pub limit: u32,

    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            name: "sliding-window".to_string(),
            limit: 100,
            window: Duration::from_secs(1),
        }
    }
}

impl SlidingWindowConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::invalid(
                "sliding_window",
                "limit must be at least 1",
            ));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid(
                "sliding_window",
                "window must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct WindowState {
    /// Admission times, oldest first
    accepted: VecDeque<Instant>,
    stats: RateLimiterStats,
}

/// Sliding window rate limiter
///
/// Keeps one timestamp per admission inside the window. Expired entries are
/// dropped from the front, so each check costs time proportional to the
/// number of entries that expired since the last one.
#[derive(Debug)]
pub struct SlidingWindow {
    config: SlidingWindowConfig,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    pub fn new(config: SlidingWindowConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(WindowState {
                accepted: VecDeque::with_capacity(config.limit as usize),
                stats: RateLimiterStats::default(),
            }),
            config,
        })
    }

    /// Admissions left in the current window
    pub fn remaining(&self) -> u32 {
        let mut state = self.state.lock();
        self.evict(&mut state, Instant::now());
        self.config.limit - state.accepted.len() as u32
    }

    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    fn evict(&self, state: &mut WindowState, now: Instant) {
        while let Some(&oldest) = state.accepted.front() {
            if oldest + self.config.window > now {
                break;
            }
            state.accepted.pop_front();
        }
    }

    /// Record an admission, or report when the oldest one leaves the window
    fn try_take(&self) -> Result<(), Instant> {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.evict(&mut state, now);

        if state.accepted.len() < self.config.limit as usize {
            state.accepted.push_back(now);
            state.stats.allowed += 1;
            return Ok(());
        }

        match state.accepted.front() {
            Some(&oldest) => Err(oldest + self.config.window),
            None => Err(now + self.config.window),
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindow {
    fn allow(&self) -> bool {
        match self.try_take() {
            Ok(()) => true,
            Err(_) => {
                self.state.lock().stats.denied += 1;
                false
            }
        }
    }

    async fn wait(&self, ctx: &Context) -> Result<(), RateLimitError> {
        loop {
            match self.try_take() {
                Ok(()) => return Ok(()),
                Err(frees_at) => {
                    trace!(limiter = %self.config.name, "Waiting for window slot");
                    ctx.sleep_until(frees_at).await?;
                }
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.accepted.clear();
        state.stats = RateLimiterStats::default();
    }

    fn stats(&self) -> RateLimiterStats {
        self.state.lock().stats
    }
}
