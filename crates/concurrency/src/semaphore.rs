//! Counting semaphore with context-aware acquisition
//!
//! Bounds concurrent access to a resource. The primary API is
//! [`Semaphore::with_permit`], which holds a permit for the duration of a
//! closure and returns it on every exit path, including panics.
//!
//! # Over-release
//!
//! Calling [`Semaphore::release`] more often than permits were acquired is a
//! programming error. Debug builds panic; release builds log a warning and
//! ignore the extra release, so the capacity bound is never exceeded.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tracing::warn;

use crate::config::ConfigError;
use crate::context::Context;
use crate::error::ContextError;

/// Counting semaphore
///
/// No fairness is promised beyond what `tokio::sync::Semaphore` provides
/// (FIFO today).
///
/// # Example
///
/// ```
/// use everruns_concurrency::{Context, Semaphore};
///
/// # tokio_test::block_on(async {
/// let sem = Semaphore::new(2).unwrap();
/// let value = sem
///     .with_permit(&Context::background(), || async { 21 * 2 })
///     .await
///     .unwrap();
/// assert_eq!(value, 42);
/// assert_eq!(sem.available_permits(), 2);
/// # });
/// ```
#[derive(Debug)]
pub struct Semaphore {
    permits: tokio::sync::Semaphore,
    capacity: usize,
    outstanding: AtomicUsize,
}

impl Semaphore {
    /// Create a semaphore with `capacity` permits
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::invalid(
                "semaphore",
                "capacity must be at least 1",
            ));
        }
        if capacity > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(
                "semaphore",
                format!("capacity exceeds {}", tokio::sync::Semaphore::MAX_PERMITS),
            ));
        }

        Ok(Self {
            permits: tokio::sync::Semaphore::new(capacity),
            capacity,
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Total number of permits
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Wait for a permit, or fail when the context is cancelled or expires
    ///
    /// The permit must be returned with [`release`](Self::release).
    pub async fn acquire(&self, ctx: &Context) -> Result<(), ContextError> {
        let permit = ctx
            .run(self.permits.acquire())
            .await?
            .map_err(|_| ContextError::Cancelled)?;
        permit.forget();
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Take a permit if one is free right now
    pub fn try_acquire(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.outstanding.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    /// Return a permit obtained from [`acquire`](Self::acquire) or [`try_acquire`](Self::try_acquire)
    ///
    /// # Panics
    ///
    /// Panics in debug builds when no permit is outstanding.
    pub fn release(&self) {
        let released = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if released.is_err() {
            warn!(
                capacity = self.capacity,
                "Semaphore released without a matching acquire, ignoring"
            );
            debug_assert!(false, "semaphore released without a matching acquire");
            return;
        }

        self.permits.add_permits(1);
    }

    /// Acquire a permit that is returned when the guard drops
    pub async fn acquire_guard(&self, ctx: &Context) -> Result<SemaphorePermit<'_>, ContextError> {
        self.acquire(ctx).await?;
        Ok(SemaphorePermit { semaphore: self })
    }

    /// Non-blocking variant of [`acquire_guard`](Self::acquire_guard)
    pub fn try_acquire_guard(&self) -> Option<SemaphorePermit<'_>> {
        self.try_acquire()
            .then_some(SemaphorePermit { semaphore: self })
    }

    /// Acquire a guard that owns a handle to the semaphore (for spawned tasks)
    pub async fn acquire_owned(
        self: &Arc<Self>,
        ctx: &Context,
    ) -> Result<OwnedSemaphorePermit, ContextError> {
        self.acquire(ctx).await?;
        Ok(OwnedSemaphorePermit {
            semaphore: Arc::clone(self),
        })
    }

    /// Run `f` while holding a permit
    ///
    /// The permit is released when `f` completes, fails, or panics. A panic
    /// is re-raised after the release.
    pub async fn with_permit<F, Fut>(&self, ctx: &Context, f: F) -> Result<Fut::Output, ContextError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let permit = self.acquire_guard(ctx).await?;
        let outcome = AssertUnwindSafe(f()).catch_unwind().await;
        drop(permit);

        match outcome {
            Ok(value) => Ok(value),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

/// Borrowed permit guard
#[derive(Debug)]
#[must_use = "the permit is released as soon as the guard is dropped"]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Owned permit guard
#[derive(Debug)]
#[must_use = "the permit is released as soon as the guard is dropped"]
pub struct OwnedSemaphorePermit {
    semaphore: Arc<Semaphore>,
}

impl Drop for OwnedSemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
