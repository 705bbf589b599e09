//! Cancellable query context with an optional deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ForwardError;

/// Handle bounding the lifetime of a query or of one attempt inside it.
///
/// Children created with [`QueryContext::with_timeout`] are cancelled together
/// with their parent and never carry a later deadline than the parent.
#[derive(Debug, Clone)]
pub struct QueryContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl QueryContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a child context that expires after `timeout` at the latest.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < own => parent,
            _ => own,
        };

        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `None` while the context is live, otherwise the reason it is done.
    ///
    /// Cancellation takes precedence over an expired deadline.
    pub fn err(&self) -> Option<ForwardError> {
        if self.token.is_cancelled() {
            return Some(ForwardError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ForwardError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ForwardError {
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => ForwardError::Cancelled,
            _ = expired => ForwardError::DeadlineExceeded,
        }
    }

    /// Run `fut` bounded by this context.
    ///
    /// `fut` is not polled at all when the context is already done.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, ForwardError>
    where
        F: Future<Output = Result<T, ForwardError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}
