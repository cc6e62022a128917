//! # Concurrency Primitives
//!
//! In-process coordination structures for bounded, cancellable, observable work.
//!
//! ## Features
//!
//! - **Semaphore**: bounded concurrent access with scoped, panic-safe permits
//! - **Worker pool**: fixed workers draining a bounded job queue, per-job deadlines
//! - **Circuit breaker**: fail-fast protection with lazy recovery and stale-result discard
//! - **Rate limiters**: token bucket and sliding window admission control
//! - **Batch processor**: size/interval batching, plus a pool-backed async variant
//! - **Concurrent map**: sharded key/value store with per-shard locking
//! - **Pipeline**: ordered stages with retry, timing and conditional decorators
//!
//! ## Architecture
//!
//! ```text
//!  callers ──submit──► bounded queue ──► workers (fixed count / Semaphore)
//!                                             │
//!                                             ▼
//!                                     result channels (keyed by caller IDs)
//!
//!  callers ──execute──► CircuitBreaker / RateLimiter ──► wrapped operation
//! ```
//!
//! Every blocking wait takes a [`Context`], which carries a cancellation token
//! and an optional deadline. Components fall back to their own configured
//! timeout when the caller's context has no deadline.
//!
//! ## Example
//!
//! ```ignore
//! use everruns_concurrency::prelude::*;
//!
//! let pool = WorkerPool::start(WorkerPoolConfig::new("resize").with_worker_count(4))?;
//! let result = pool
//!     .submit_and_wait(&Context::background(), Job::new("img-1", path, |ctx, path| async move {
//!         resize(ctx, path).await
//!     }))
//!     .await?;
//! pool.stop().await;
//! ```

pub mod batch;
pub mod circuit_breaker;
pub mod concurrent_map;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod rate_limit;
pub mod semaphore;

/// Prelude for common imports
pub mod prelude {
    pub use crate::batch::{
        AsyncBatchProcessor, BatchConfig, BatchItem, BatchProcessor, BatchResult,
    };
    pub use crate::circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, Counts,
    };
    pub use crate::concurrent_map::ConcurrentMap;
    pub use crate::config::ConfigError;
    pub use crate::context::Context;
    pub use crate::error::{ContextError, SubmitError, TaskError};
    pub use crate::pipeline::{
        ConditionalStage, FnStage, ParallelPipeline, Pipeline, PipelineError, RetryPolicy,
        RetryStage, Stage, StageTimings, TimedStage,
    };
    pub use crate::pool::{Job, JobResult, WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::rate_limit::{
        RateLimitError, RateLimiter, RateLimiterStats, SlidingWindow, SlidingWindowConfig,
        TokenBucket, TokenBucketConfig,
    };
    pub use crate::semaphore::{Semaphore, SemaphorePermit};
}

// Re-export key types at crate root
pub use batch::{
    AsyncBatchProcessor, BatchConfig, BatchError, BatchItem, BatchProcessor, BatchResult,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, Counts,
};
pub use concurrent_map::{ConcurrentMap, DEFAULT_SHARD_COUNT, MAX_SHARD_COUNT};
pub use config::ConfigError;
pub use context::Context;
pub use error::{ContextError, SubmitError, TaskError};
pub use pipeline::{
    ConditionalStage, FnStage, ParallelPipeline, Pipeline, PipelineError, RetryPolicy,
    RetryStage, Stage, StageTiming, StageTimings, TimedStage,
};
pub use pool::{
    Job, JobResult, PoolMetrics, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus,
};
pub use rate_limit::{
    RateLimitError, RateLimiter, RateLimiterStats, SlidingWindow, SlidingWindowConfig,
    TokenBucket, TokenBucketConfig,
};
pub use semaphore::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};
