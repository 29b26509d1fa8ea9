//! gRPC service implementation for email categorization.
//!
//! This module defines [`CategorizationService`], the implementation of the
//! [`EmailCategorizationService`] gRPC service. It ties the other parts of
//! the server together for every request:
//!
//! ```text
//! Received -> Validated -> ConnectionAcquired -> Dispatched -> Persisted? -> Responded
//! ```
//!
//! ## Responsibilities
//!
//! - Validate requests before any connection or backend work happens.
//! - Obtain the ML backend handle from the shared [`ConnectionPool`].
//! - Run single emails through the [`RetryingInvoker`] and batches through
//!   the [`BatchDispatcher`].
//! - Persist successful categorizations through an optional
//!   [`EmailRepository`], best-effort.
//! - Cancel in-flight work and close pooled connections on shutdown.

use super::store::{CategoryRecord, EmailRepository, Persisted};
use crate::server::{
    backend::Predictor,
    config::ServiceConfig,
    dispatch::{BatchDispatcher, RequestContext, RetryingInvoker},
    pool::{ConnectionPool, Connector},
    telemetry::{
        increment_request_errors, increment_requests, record_batch_size,
        record_request_duration,
    },
};
use futures::future::join_all;
use inboxpert_core::{
    Error, Result,
    proto::categorization::{
        BatchCategorizeRequest, BatchCategorizeResponse, CategorizeRequest, CategorizeResponse,
        email_categorization_service_server::EmailCategorizationService,
    },
    types::{BatchOutcome, CategoryResult, Email},
};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use uuid::Uuid;

/// Email categorization service backed by a pooled ML backend.
///
/// Cloning is cheap; clones share the pool, the worker slots, the repository
/// and the shutdown token.
pub struct CategorizationService<C: Connector> {
    config: Arc<ServiceConfig>,
    pool: Arc<ConnectionPool<C>>,
    invoker: RetryingInvoker,
    dispatcher: Arc<BatchDispatcher>,
    repository: Option<Arc<dyn EmailRepository>>,
    shutdown_token: CancellationToken,
}

impl<C: Connector> Clone for CategorizationService<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            pool: Arc::clone(&self.pool),
            invoker: self.invoker,
            dispatcher: Arc::clone(&self.dispatcher),
            repository: self.repository.clone(),
            shutdown_token: self.shutdown_token.clone(),
        }
    }
}

impl<C> CategorizationService<C>
where
    C: Connector,
    C::Connection: Predictor,
{
    pub fn new(config: Arc<ServiceConfig>, pool: Arc<ConnectionPool<C>>) -> Self {
        Self {
            invoker: RetryingInvoker::new(config.retry_attempts),
            dispatcher: Arc::new(BatchDispatcher::from_config(&config)),
            config,
            pool,
            repository: None,
            shutdown_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn EmailRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn dispatcher(&self) -> &BatchDispatcher {
        &self.dispatcher
    }

    fn context(&self) -> Result<RequestContext> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        Ok(RequestContext::new(
            self.config.request_timeout,
            &self.shutdown_token,
        ))
    }

    async fn connection(&self, ctx: &RequestContext) -> Result<C::Connection> {
        ctx.run(self.pool.get_connection(&self.config.ml_server_addr))
            .await?
    }

    /// Categorizes one email.
    ///
    /// An email without an id is assigned a fresh UUID; the returned result
    /// carries that id.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] when the email is missing or has neither
    ///   subject nor body. No connection is attempted.
    /// - [`Error::Connection`] when the backend handle cannot be obtained.
    /// - [`Error::Invocation`] when every attempt failed.
    /// - [`Error::DeadlineExceeded`] / [`Error::RequestCancelled`] when the
    ///   request context ended first.
    pub async fn categorize_one(&self, email: Option<Email>) -> Result<(CategoryResult, Persisted)> {
        let mut email = validate_email(email)?;
        assign_id(&mut email);

        let ctx = self.context()?;
        let connection = self.connection(&ctx).await?;
        let result = self.invoker.invoke(&ctx, &connection, &email).await?;

        let persisted = self.persist(&email, &result).await;
        Ok((result, persisted))
    }

    /// Categorizes a batch of independent emails.
    ///
    /// Item failures do not fail the call; they are returned next to the
    /// successes. An empty batch yields an empty outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] when the batch exceeds the configured
    ///   ceiling. Checked before connecting.
    /// - [`Error::Connection`] when the backend handle cannot be obtained.
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    pub async fn categorize_batch(&self, mut emails: Vec<Email>) -> Result<BatchOutcome> {
        self.dispatcher.validate(emails.len())?;
        if emails.is_empty() {
            return Ok(BatchOutcome::default());
        }
        emails.iter_mut().for_each(assign_id);

        let ctx = self.context()?;
        let connection = self.connection(&ctx).await?;

        // Dispatch consumes the emails; keep copies only when they will be
        // written afterwards.
        let originals = self.repository.as_ref().map(|_| emails.clone());
        let outcome = self.dispatcher.dispatch(&ctx, connection, emails).await?;

        if let Some(originals) = originals {
            let by_id: HashMap<&str, &Email> =
                originals.iter().map(|e| (e.id.as_str(), e)).collect();
            let writes = outcome
                .results
                .iter()
                .filter_map(|result| {
                    by_id
                        .get(result.email_id.as_str())
                        .map(|email| self.persist(email, result))
                })
                .collect::<Vec<_>>();

            let failed = join_all(writes)
                .await
                .iter()
                .filter(|p| matches!(p, Persisted::Failed(_)))
                .count();
            if failed > 0 {
                tracing::warn!("Failed to persist {failed} of {} results", outcome.results.len());
            }
        }

        Ok(outcome)
    }

    /// Writes the email and its category record. Never fails the request.
    ///
    /// The two writes are independent: a failed email write does not keep
    /// the category record from being stored, and vice versa.
    pub async fn persist(&self, email: &Email, result: &CategoryResult) -> Persisted {
        let Some(repository) = &self.repository else {
            return Persisted::Skipped;
        };

        let record = CategoryRecord::new(result);
        let (saved_email, saved_category) =
            futures::join!(repository.save_email(email), repository.save_category(&record));

        if let Err(e) = &saved_email {
            tracing::warn!("Failed to save email {}: {e}", email.id);
        }
        if let Err(e) = &saved_category {
            tracing::warn!("Failed to save category record for email {}: {e}", email.id);
        }

        match saved_email.and(saved_category) {
            Ok(()) => Persisted::Saved,
            Err(e) => Persisted::Failed(e),
        }
    }

    /// Cancels every in-flight request, stops admitting batch work and
    /// closes all pooled connections.
    ///
    /// Closing is best-effort; the last close failure is returned after
    /// every connection has been released.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Cancelling in-flight requests");
        self.shutdown_token.cancel();
        self.dispatcher.close();

        tracing::info!("Closing backend connections");
        self.pool.close_all().await
    }
}

fn validate_email(email: Option<Email>) -> Result<Email> {
    let Some(email) = email else {
        return Err(Error::InvalidRequest {
            reason: "Email is required".to_string(),
        });
    };

    if email.subject.trim().is_empty() && email.body.trim().is_empty() {
        return Err(Error::InvalidRequest {
            reason: "Email must have a subject or a body".to_string(),
        });
    }

    Ok(email)
}

fn assign_id(email: &mut Email) {
    if email.id.is_empty() {
        email.id = Uuid::new_v4().to_string();
    }
}

#[tonic::async_trait]
impl<C> EmailCategorizationService for CategorizationService<C>
where
    C: Connector,
    C::Connection: Predictor,
{
    /// Categorizes a single email.
    #[tracing::instrument(skip_all, fields(email_id))]
    async fn categorize_email(
        &self,
        req: Request<CategorizeRequest>,
    ) -> core::result::Result<Response<CategorizeResponse>, Status> {
        let start = Instant::now();
        increment_requests();

        let email = req.into_inner().email.map(Email::from);
        match self.categorize_one(email).await {
            Ok((result, _)) => {
                tracing::Span::current().record("email_id", result.email_id.as_str());
                record_request_duration(start.elapsed().as_millis() as f64);
                Ok(Response::new(CategorizeResponse {
                    result: Some(result.into()),
                }))
            }
            Err(e) => {
                increment_request_errors();
                tracing::warn!("Categorization failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Categorizes a batch of emails.
    ///
    /// The response always accounts for every submitted email: either in
    /// `results` or in `failures`.
    #[tracing::instrument(skip_all, fields(batch_size = req.get_ref().emails.len()))]
    async fn batch_categorize_emails(
        &self,
        req: Request<BatchCategorizeRequest>,
    ) -> core::result::Result<Response<BatchCategorizeResponse>, Status> {
        let start = Instant::now();
        increment_requests();

        let emails: Vec<Email> = req.into_inner().emails.into_iter().map(Into::into).collect();
        record_batch_size(emails.len() as f64);

        match self.categorize_batch(emails).await {
            Ok(outcome) => {
                tracing::info!(
                    succeeded = outcome.results.len(),
                    failed = outcome.failures.len(),
                    "Batch categorized"
                );
                record_request_duration(start.elapsed().as_millis() as f64);
                Ok(Response::new(outcome.into()))
            }
            Err(e) => {
                increment_request_errors();
                tracing::warn!("Batch categorization failed: {e}");
                Err(e.into())
            }
        }
    }
}
