//! ML backend seam.
//!
//! [`Predictor`] is the narrow interface the dispatcher and the service use
//! to label emails. [`MlConnection`] implements it over a pooled tonic
//! [`Channel`], applying a [`TransportRetry`] policy for transient
//! unavailability before a failure is reported to the caller.

use core::time::Duration;
use inboxpert_core::{
    Result,
    proto::prediction::{BatchEmailRequest, EmailRequest, email_prediction_client::EmailPredictionClient},
    types::{Email, Prediction},
};
use std::{future::Future, sync::Arc};
use tonic::{Code, Status, transport::Channel};

/// Labels emails. Implemented by the gRPC backend handle and by test doubles.
#[tonic::async_trait]
pub trait Predictor: Send + Sync + 'static {
    /// Categorizes a single email.
    async fn categorize(&self, email: &Email) -> Result<Prediction>;

    /// Categorizes several emails in one backend round trip.
    async fn batch_categorize(&self, emails: &[Email]) -> Result<Vec<Prediction>>;
}

#[tonic::async_trait]
impl<P: Predictor + ?Sized> Predictor for Arc<P> {
    async fn categorize(&self, email: &Email) -> Result<Prediction> {
        (**self).categorize(email).await
    }

    async fn batch_categorize(&self, emails: &[Email]) -> Result<Vec<Prediction>> {
        (**self).batch_categorize(emails).await
    }
}

/// Transport level retry policy for transient unavailability.
///
/// Only `UNAVAILABLE` is retried. The delay before retry `n` (zero based) is
/// `initial_backoff * multiplier^n`, capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportRetry {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2,
        }
    }
}

impl TransportRetry {
    /// Delay to wait after the `retry`-th failed attempt.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn is_retryable(status: &Status) -> bool {
        status.code() == Code::Unavailable
    }

    /// Runs `call` until it succeeds, fails with a non-retryable status, or
    /// `max_attempts` is reached.
    pub async fn run<F, Fut, T>(&self, mut call: F) -> core::result::Result<T, Status>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = core::result::Result<T, Status>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(status) if Self::is_retryable(&status) && retry + 1 < self.max_attempts => {
                    let delay = self.backoff(retry);
                    tracing::debug!(
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Backend unavailable, backing off: {}",
                        status.message()
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(status) => return Err(status),
            }
        }
    }
}

/// A pooled handle to the ML backend.
///
/// Cloning is cheap: the underlying [`Channel`] multiplexes every clone over
/// the same HTTP/2 connection.
#[derive(Debug, Clone)]
pub struct MlConnection {
    channel: Channel,
    retry: TransportRetry,
}

impl MlConnection {
    pub const fn new(channel: Channel, retry: TransportRetry) -> Self {
        Self { channel, retry }
    }

    fn client(&self) -> EmailPredictionClient<Channel> {
        EmailPredictionClient::new(self.channel.clone())
    }
}

#[tonic::async_trait]
impl Predictor for MlConnection {
    async fn categorize(&self, email: &Email) -> Result<Prediction> {
        let request = EmailRequest::from(email);
        let response = self
            .retry
            .run(|| {
                let mut client = self.client();
                let request = request.clone();
                async move { client.categorize_email(request).await }
            })
            .await?;

        Ok(response.into_inner().into())
    }

    async fn batch_categorize(&self, emails: &[Email]) -> Result<Vec<Prediction>> {
        let request = BatchEmailRequest {
            emails: emails.iter().map(EmailRequest::from).collect(),
        };
        let response = self
            .retry
            .run(|| {
                let mut client = self.client();
                let request = request.clone();
                async move { client.batch_categorize_email(request).await }
            })
            .await?;

        Ok(response
            .into_inner()
            .responses
            .into_iter()
            .map(Into::into)
            .collect())
    }
}
