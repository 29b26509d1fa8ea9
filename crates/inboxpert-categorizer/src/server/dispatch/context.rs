use core::time::Duration;
use inboxpert_core::{Error, Result};
use std::future::Future;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation scope of one request.
///
/// Every request gets a fixed deadline measured from its arrival and a child
/// of the service's shutdown token. Clones share both, so batch tasks observe
/// the same end of life as the request that spawned them.
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Instant,
    token: CancellationToken,
}

impl RequestContext {
    pub fn new(timeout: Duration, parent: &CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            token: parent.child_token(),
        }
    }

    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Cancels this request and every clone of it. The parent is unaffected.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// The error describing why the context ended.
    pub fn error(&self) -> Error {
        if self.token.is_cancelled() {
            Error::RequestCancelled
        } else {
            Error::DeadlineExceeded
        }
    }

    /// Resolves once the request is cancelled or its deadline passes.
    pub async fn done(&self) -> Error {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Error::RequestCancelled,
            () = sleep_until(self.deadline) => Error::DeadlineExceeded,
        }
    }

    /// Drives `fut` until it completes or the context ends, whichever comes
    /// first. An unfinished `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}
