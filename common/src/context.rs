//! Request-scoped cancellation and deadlines.
//!
//! Every blocking operation in the limiter and the caches takes a [`RequestContext`]. A context
//! is done either when its cancellation token fires or when its deadline passes, and the two
//! outcomes are reported as distinct [`Interrupted`] values so callers can tell "gave up" from
//! "ran out of time".

/// Why a wait was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation signal plus an optional deadline, cheap to clone and pass down.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: tokio_util::sync::CancellationToken,
    deadline: Option<tokio::time::Instant>,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deadline(deadline: tokio::time::Instant) -> Self {
        Self {
            token: tokio_util::sync::CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    #[must_use]
    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        Self::with_deadline(tokio::time::Instant::now() + timeout)
    }

    /// Derives a context that is cancelled together with `self` but can also be cancelled
    /// on its own. The deadline is inherited.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.deadline
    }

    /// Non-blocking check, the equivalent of polling `done()` once.
    #[must_use]
    pub fn err(&self) -> Option<Interrupted> {
        if self.token.is_cancelled() {
            return Some(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if tokio::time::Instant::now() >= deadline => {
                Some(Interrupted::DeadlineExceeded)
            }
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Interrupted {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => Interrupted::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Interrupted::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Interrupted::Cancelled
            }
        }
    }

    /// Sleeps for `delay` unless the context finishes first.
    pub async fn sleep(&self, delay: std::time::Duration) -> Result<(), Interrupted> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            reason = self.done() => Err(reason),
        }
    }
}
