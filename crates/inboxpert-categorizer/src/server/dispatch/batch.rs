//! Bounded fan-out of independent categorization calls.
//!
//! A batch spawns one task per email on a [`JoinSet`]. Before calling the
//! backend a task must hold a permit from the dispatcher's worker semaphore,
//! which caps the number of in-flight calls at `num_workers` across every
//! batch served by the same dispatcher. Tasks waiting for a permit do not
//! count as active.
//!
//! Each task reports into one of two channels sized to the batch (results
//! and failures), so no task ever waits on the collector. The dispatcher
//! joins every task before draining the channels, which makes the returned
//! [`BatchOutcome`] account for every submitted item exactly once: a task
//! that panics is matched back to its email through its task id and reported
//! as a failure.

use super::{context::RequestContext, invoker::RetryingInvoker};
use crate::server::{
    backend::Predictor, config::ServiceConfig, telemetry::increment_item_failures,
};
use inboxpert_core::{
    Error, Result,
    types::{BatchOutcome, CategoryResult, Email, ItemFailure},
};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
};

#[derive(Debug)]
pub struct BatchDispatcher {
    max_batch_size: usize,
    num_workers: usize,
    workers: Arc<Semaphore>,
    invoker: RetryingInvoker,
}

impl BatchDispatcher {
    pub fn new(max_batch_size: usize, num_workers: usize, invoker: RetryingInvoker) -> Self {
        let num_workers = num_workers.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            max_batch_size,
            num_workers,
            workers: Arc::new(Semaphore::new(num_workers)),
            invoker,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.max_batch_size,
            config.num_workers,
            RetryingInvoker::new(config.retry_attempts),
        )
    }

    pub const fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub const fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Worker slots currently free.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Rejects batches above the configured ceiling.
    pub fn validate(&self, len: usize) -> Result<()> {
        if len > self.max_batch_size {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "Batch size {len} exceeds maximum allowed size {}",
                    self.max_batch_size
                ),
            });
        }
        Ok(())
    }

    /// Stops admitting work. Tasks waiting for a slot fail with
    /// [`Error::ServiceShutdown`]; calls already holding a slot finish.
    pub fn close(&self) {
        self.workers.close();
    }

    pub fn is_closed(&self) -> bool {
        self.workers.is_closed()
    }

    /// Categorizes every email in `items` concurrently.
    ///
    /// # Errors
    ///
    /// Fails as a whole only when the batch is larger than the configured
    /// ceiling (nothing is dispatched) or the dispatcher has been closed.
    /// Per-item failures, including deadline expiry and cancellation, are
    /// reported in [`BatchOutcome::failures`].
    pub async fn dispatch<P>(
        &self,
        ctx: &RequestContext,
        predictor: P,
        items: Vec<Email>,
    ) -> Result<BatchOutcome>
    where
        P: Predictor + Clone,
    {
        self.validate(items.len())?;
        if self.is_closed() {
            return Err(Error::ServiceShutdown);
        }
        if items.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let total = items.len();
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, CategoryResult)>(total);
        let (failure_tx, mut failure_rx) = mpsc::channel::<(usize, ItemFailure)>(total);

        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::with_capacity(total);

        for (index, email) in items.into_iter().enumerate() {
            let email_id = email.id.clone();
            let ctx = ctx.clone();
            let predictor = predictor.clone();
            let workers = Arc::clone(&self.workers);
            let invoker = self.invoker;
            let result_tx = result_tx.clone();
            let failure_tx = failure_tx.clone();

            let handle = tasks.spawn(async move {
                match process_item(&ctx, &workers, invoker, &predictor, &email).await {
                    Ok(result) => {
                        if result_tx.send((index, result)).await.is_err() {
                            tracing::error!("Result collector closed before item {index}");
                        }
                    }
                    Err(error) => {
                        tracing::warn!("Failed to categorize email {}: {error}", email.id);
                        let failure = ItemFailure {
                            email_id: email.id,
                            error,
                        };
                        if failure_tx.send((index, failure)).await.is_err() {
                            tracing::error!("Failure collector closed before item {index}");
                        }
                    }
                }
            });
            spawned.insert(handle.id(), (index, email_id));
        }

        // Only the tasks hold senders now; the channels close once every
        // task has finished.
        drop(result_tx);
        drop(failure_tx);

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if let Some((index, email_id)) = spawned.remove(&e.id()) {
                    tracing::error!("Task for email {email_id} did not complete: {e}");
                    failures.push((
                        index,
                        ItemFailure {
                            email_id,
                            error: Error::ChannelError {
                                context: format!("task did not complete: {e}"),
                            },
                        },
                    ));
                }
            }
        }

        let mut results = Vec::with_capacity(total);
        while let Some(entry) = result_rx.recv().await {
            results.push(entry);
        }
        while let Some(entry) = failure_rx.recv().await {
            failures.push(entry);
        }

        results.sort_unstable_by_key(|(index, _)| *index);
        failures.sort_unstable_by_key(|(index, _)| *index);

        for _ in &failures {
            increment_item_failures();
        }

        let outcome = BatchOutcome {
            results: results.into_iter().map(|(_, r)| r).collect(),
            failures: failures.into_iter().map(|(_, f)| f).collect(),
        };
        debug_assert_eq!(outcome.total(), total);

        tracing::debug!(
            total,
            succeeded = outcome.results.len(),
            failed = outcome.failures.len(),
            "Batch dispatched"
        );

        Ok(outcome)
    }
}

/// Runs one item: wait for a worker slot, then invoke while holding it.
///
/// The slot is released when the permit drops, whether the call succeeded,
/// failed, or the task was aborted.
async fn process_item<P>(
    ctx: &RequestContext,
    workers: &Arc<Semaphore>,
    invoker: RetryingInvoker,
    predictor: &P,
    email: &Email,
) -> Result<CategoryResult>
where
    P: Predictor,
{
    let _permit = ctx
        .run(Arc::clone(workers).acquire_owned())
        .await?
        .map_err(|_| Error::ServiceShutdown)?;

    invoker.invoke(ctx, predictor, email).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use inboxpert_core::types::Prediction;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;
    use tonic::Status;

    /// Tracks how many calls are in flight at once.
    #[derive(Default)]
    struct FakeModel {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        failing: HashSet<String>,
        panicking: HashSet<String>,
        latency: Duration,
    }

    #[tonic::async_trait]
    impl Predictor for FakeModel {
        async fn categorize(&self, email: &Email) -> Result<Prediction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.latency).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.panicking.contains(&email.id) {
                panic!("predictor crashed on {}", email.id);
            }
            if self.failing.contains(&email.id) {
                return Err(Status::internal("model rejected input").into());
            }
            Ok(Prediction {
                id: email.id.clone(),
                category: "WORK".into(),
                confidence: 0.9,
                ..Default::default()
            })
        }

        async fn batch_categorize(&self, _emails: &[Email]) -> Result<Vec<Prediction>> {
            unimplemented!()
        }
    }

    fn emails(n: usize) -> Vec<Email> {
        (1..=n)
            .map(|i| Email {
                id: i.to_string(),
                subject: format!("subject {i}"),
                ..Default::default()
            })
            .collect()
    }

    fn ctx(timeout: Duration) -> RequestContext {
        RequestContext::new(timeout, &CancellationToken::new())
    }

    fn fake_model(latency_ms: u64) -> FakeModel {
        FakeModel {
            latency: Duration::from_millis(latency_ms),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_with_two_workers() {
        let dispatcher = BatchDispatcher::new(10, 2, RetryingInvoker::new(3));
        let predictor = Arc::new(FakeModel {
            failing: HashSet::from(["2".to_string()]),
            ..fake_model(20)
        });

        let outcome = dispatcher
            .dispatch(&ctx(Duration::from_secs(10)), Arc::clone(&predictor), emails(3))
            .await
            .unwrap();

        let ids: Vec<_> = outcome.results.iter().map(|r| r.email_id.as_str()).collect();
        assert_eq!(ids, ["1", "3"]);
        assert!(outcome.results.iter().all(|r| (r.confidence_score - 0.9).abs() < 1e-6));

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].email_id, "2");
        assert!(matches!(
            outcome.failures[0].error,
            Error::Invocation { attempts: 3, .. }
        ));

        assert!(predictor.peak.load(Ordering::SeqCst) <= 2);
        // One call each for 1 and 3, three attempts for 2.
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn active_calls_never_exceed_workers() {
        let dispatcher = BatchDispatcher::new(100, 4, RetryingInvoker::new(1));
        let predictor = Arc::new(fake_model(10));

        let outcome = dispatcher
            .dispatch(&ctx(Duration::from_secs(60)), Arc::clone(&predictor), emails(50))
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 50);
        assert_eq!(predictor.peak.load(Ordering::SeqCst), 4);
        assert_eq!(dispatcher.available_workers(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_input_order() {
        let dispatcher = BatchDispatcher::new(100, 8, RetryingInvoker::new(1));

        let outcome = dispatcher
            .dispatch(&ctx(Duration::from_secs(60)), Arc::new(fake_model(1)), emails(20))
            .await
            .unwrap();

        let ids: Vec<_> = outcome.results.iter().map(|r| r.email_id.clone()).collect();
        let expected: Vec<_> = (1..=20).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_is_inclusive() {
        let dispatcher = BatchDispatcher::new(5, 2, RetryingInvoker::new(1));
        let predictor = Arc::new(fake_model(1));

        let outcome = dispatcher
            .dispatch(&ctx(Duration::from_secs(10)), Arc::clone(&predictor), emails(5))
            .await
            .unwrap();
        assert_eq!(outcome.total(), 5);
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 5);

        let err = dispatcher
            .dispatch(&ctx(Duration::from_secs(10)), Arc::clone(&predictor), emails(6))
            .await
            .unwrap_err();

        assert!(err.is_validation());
        let msg = err.to_string();
        assert!(msg.contains('6') && msg.contains('5'), "{msg}");
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 5, "nothing dispatched");
    }

    #[tokio::test]
    async fn empty_batch_is_an_empty_outcome() {
        let dispatcher = BatchDispatcher::new(5, 2, RetryingInvoker::new(1));

        let outcome = dispatcher
            .dispatch(&ctx(Duration::from_secs(1)), Arc::new(fake_model(0)), Vec::new())
            .await
            .unwrap();

        assert!(outcome.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_pending_items_and_frees_slots() {
        let dispatcher = BatchDispatcher::new(10, 2, RetryingInvoker::new(3));
        let predictor = Arc::new(fake_model(60 * 60 * 1000));

        let outcome = dispatcher
            .dispatch(
                &ctx(Duration::from_millis(100)),
                Arc::clone(&predictor),
                emails(5),
            )
            .await
            .unwrap();

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.failures.len(), 5);
        assert!(outcome.failures.iter().all(|f| f.error.is_context_ended()));
        // Only the first two items ever reached the backend.
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.available_workers(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_item_is_reported_not_lost() {
        let dispatcher = BatchDispatcher::new(10, 2, RetryingInvoker::new(1));
        let predictor = Arc::new(FakeModel {
            panicking: HashSet::from(["3".to_string()]),
            ..fake_model(5)
        });

        let outcome = dispatcher
            .dispatch(&ctx(Duration::from_secs(10)), predictor, emails(4))
            .await
            .unwrap();

        assert_eq!(outcome.total(), 4);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.failures[0].email_id, "3");
        assert!(matches!(outcome.failures[0].error, Error::ChannelError { .. }));
        assert_eq!(dispatcher.available_workers(), 2);
    }

    #[tokio::test]
    async fn closed_dispatcher_rejects_batches() {
        let dispatcher = BatchDispatcher::new(10, 2, RetryingInvoker::new(1));
        dispatcher.close();

        let err = dispatcher
            .dispatch(&ctx(Duration::from_secs(1)), Arc::new(fake_model(0)), emails(2))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ServiceShutdown));
    }
}
