use super::context::RequestContext;
use crate::server::{backend::Predictor, telemetry::increment_attempt_failures};
use inboxpert_core::{
    Error, Result,
    types::{CategoryResult, Email},
};
use std::future::Future;

/// Fixed-attempt retry wrapper around a single backend call.
///
/// Attempts run strictly one after another. The first success is returned
/// immediately. Each failure is logged with its ordinal; only the last one is
/// reported to the caller, wrapped in [`Error::Invocation`]. Backoff is left
/// to the transport (see `TransportRetry`).
///
/// The request context is checked before every attempt and raced against
/// each one, so a deadline or cancellation stops retrying promptly and is
/// reported as such rather than as an exhausted invocation.
#[derive(Debug, Clone, Copy)]
pub struct RetryingInvoker {
    attempts: usize,
}

impl RetryingInvoker {
    /// `retry_attempts` of `0` still makes one attempt.
    pub fn new(retry_attempts: usize) -> Self {
        Self {
            attempts: retry_attempts.max(1),
        }
    }

    pub const fn attempts(&self) -> usize {
        self.attempts
    }

    /// Categorizes `email` through `predictor`.
    pub async fn invoke<P>(
        &self,
        ctx: &RequestContext,
        predictor: &P,
        email: &Email,
    ) -> Result<CategoryResult>
    where
        P: Predictor + ?Sized,
    {
        let prediction = self.call(ctx, || predictor.categorize(email)).await?;
        Ok(CategoryResult::from_prediction(email.id.as_str(), prediction))
    }

    /// Runs `op` up to [`attempts`](Self::attempts) times.
    pub async fn call<F, Fut, T>(&self, ctx: &RequestContext, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if ctx.is_done() {
                return Err(ctx.error());
            }

            let err = match ctx.run(op()).await? {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            increment_attempt_failures();
            tracing::warn!(
                attempt,
                max_attempts = self.attempts,
                "Categorization attempt {attempt} failed: {err}"
            );

            if attempt >= self.attempts {
                return Err(Error::Invocation {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            attempt += 1;
        }
    }
}
