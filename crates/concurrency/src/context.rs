//! Cancellation and deadline context

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ContextError;

/// Context passed to every blocking operation and caller-supplied function
///
/// The context provides:
/// - Cooperative cancellation through a [`CancellationToken`]
/// - An optional deadline on tokio's monotonic clock
///
/// Derived contexts (`child`, `with_timeout`, `with_deadline`) get a child
/// token: cancelling the parent cancels them, cancelling them leaves the
/// parent alone. A derived deadline never extends the parent's deadline.
///
/// # Example
///
/// ```ignore
/// async fn fetch(ctx: Context, url: String) -> anyhow::Result<Bytes> {
///     ctx.run(client.get(url).send()).await??.bytes().await.map_err(Into::into)
/// }
///
/// let ctx = Context::background().with_timeout(Duration::from_secs(5));
/// fetch(ctx, url).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline unless derived
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Wrap an existing cancellation token
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// The underlying cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Derived context sharing the deadline, cancelled with the parent
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derived context with a deadline (the earlier of parent and `at`)
    pub fn with_deadline(&self, at: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < at => parent,
            _ => at,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derived context expiring `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Keep the caller's deadline if there is one, otherwise apply `default`
    pub fn or_timeout(&self, default: Duration) -> Self {
        if self.deadline.is_some() {
            self.child()
        } else {
            self.with_timeout(default)
        }
    }

    /// Cancel this context and everything derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the token has fired
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline (`None` without a deadline)
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Non-blocking check: why this context is done, if it is
    pub fn err(&self) -> Option<ContextError> {
        if self.is_cancelled() {
            Some(ContextError::Cancelled)
        } else if self.is_expired() {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolve once the context is cancelled or its deadline passes
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ContextError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Race a future against this context
    ///
    /// A context that is already done wins without polling `fut`.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration` unless the context ends first
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Sleep until `at` unless the context ends first
    pub async fn sleep_until(&self, at: Instant) -> Result<(), ContextError> {
        self.run(tokio::time::sleep_until(at)).await
    }
}
