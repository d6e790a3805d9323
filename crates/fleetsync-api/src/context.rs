// ── Call context ──
//
// Every device call runs under a CallContext: a cancellation token
// derived from the caller's token plus an optional absolute deadline.
// Deriving a child never extends the parent's deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Cancellable, deadline-bound context passed into every client call.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    budget: Option<Duration>,
}

impl CallContext {
    /// Root context driven by `cancel`, with no deadline.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            budget: None,
        }
    }

    /// Detached root context (its own token, no deadline).
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Derive a child context bounded by `timeout`.
    ///
    /// The child's deadline is the earlier of the parent's deadline and
    /// `now + timeout`. Cancelling the parent cancels the child.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
            budget: Some(timeout),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let timeout_ms = self
            .budget
            .map_or(0, |b| u64::try_from(b.as_millis()).unwrap_or(u64::MAX));

        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| Error::Timeout { timeout_ms })?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            res = bounded => res,
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}
