use std::sync::Arc;
use std::time;

use health::HealthHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use welcome_common::store::RowStore;

use crate::error::ProcessError;
use crate::notifier::NotificationSender;
use crate::processor::process_batch;

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// The maximum number of rows claimed in one transaction.
    pub batch_size: u32,
    /// Fixed wait after an empty or failed claim.
    pub poll_interval: time::Duration,
}

/// How a single claim → process → complete iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Every claimed row was notified and completed.
    Completed { claimed: usize, completed: u64 },
    /// Nothing was eligible for claiming.
    Empty,
    /// The claim transaction failed; nothing was claimed.
    ClaimFailed,
    /// A notification failed. The batch stays in process.
    ProcessingFailed { claimed: usize, sent: usize },
    /// Every notification went out but the batch could not be completed. It stays in process.
    CompletionFailed { claimed: usize },
    /// Shutdown was requested before the iteration could finish.
    Cancelled,
}

impl IterationOutcome {
    /// Only an empty or failed claim leads to waiting before the next poll; every other
    /// outcome polls again right away.
    pub fn should_back_off(&self) -> bool {
        matches!(self, IterationOutcome::Empty | IterationOutcome::ClaimFailed)
    }
}

/// A worker polling the `RowStore` for new users, notifying them and marking them done.
///
/// Workers never coordinate with each other: the store's claim is the only thing keeping two
/// of them away from the same rows.
pub struct WelcomeWorker {
    /// An identifier for this worker, used in logs.
    name: String,
    /// The store we claim rows from.
    store: Arc<dyn RowStore>,
    /// Delivers notifications for claimed rows.
    sender: Arc<dyn NotificationSender>,
    settings: WorkerSettings,
    /// The liveness check handle, reported before every claim and every send.
    liveness: HealthHandle,
}

impl WelcomeWorker {
    pub fn new(
        name: &str,
        store: Arc<dyn RowStore>,
        sender: Arc<dyn NotificationSender>,
        settings: WorkerSettings,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            store,
            sender,
            settings,
            liveness,
        }
    }

    /// Run one iteration: claim a batch, notify every row in it, then complete it.
    pub async fn run_once(&self, cancel: &CancellationToken) -> IterationOutcome {
        self.liveness.report_healthy();

        // Dropping an in-flight claim rolls its transaction back, so nothing is claimed.
        let claim = tokio::select! {
            biased;
            _ = cancel.cancelled() => return IterationOutcome::Cancelled,
            claim = self.store.claim_batch(self.settings.batch_size) => claim,
        };

        let batch = match claim {
            Ok(batch) if batch.is_empty() => {
                metrics::counter!("welcome_empty_polls_total").increment(1);
                return IterationOutcome::Empty;
            }
            Ok(batch) => batch,
            Err(error) => {
                metrics::counter!("welcome_claim_errors_total").increment(1);
                error!(worker = %self.name, %error, "failed to claim batch");
                return IterationOutcome::ClaimFailed;
            }
        };

        let claimed = batch.len();
        metrics::histogram!("welcome_claim_batch_size").record(claimed as f64);
        let started = tokio::time::Instant::now();

        match process_batch(self.sender.as_ref(), &batch, &self.liveness, cancel).await {
            Ok(_) => {}
            Err(ProcessError::Cancelled { sent }) => {
                warn!(
                    worker = %self.name,
                    claimed,
                    sent,
                    "shutdown requested mid-batch, leaving batch in process"
                );
                return IterationOutcome::Cancelled;
            }
            Err(ProcessError::Notification { sent, error }) => {
                metrics::counter!("welcome_batches_failed_total", "stage" => "processing")
                    .increment(1);
                error!(
                    worker = %self.name,
                    claimed,
                    sent,
                    %error,
                    "failed to process batch, leaving it in process"
                );
                return IterationOutcome::ProcessingFailed { claimed, sent };
            }
        }

        // Completion is not raced against cancellation: the notifications already went out,
        // and interrupting the update would only get them sent twice.
        match self.store.complete_batch(batch.keys()).await {
            Ok(completed) => {
                if completed != claimed as u64 {
                    warn!(
                        worker = %self.name,
                        claimed,
                        completed,
                        "completed fewer rows than claimed"
                    );
                }
                metrics::counter!("welcome_batches_completed_total").increment(1);
                metrics::histogram!("welcome_batch_processing_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                info!(worker = %self.name, completed, "batch completed");

                IterationOutcome::Completed { claimed, completed }
            }
            Err(error) => {
                metrics::counter!("welcome_batches_failed_total", "stage" => "completion")
                    .increment(1);
                error!(
                    worker = %self.name,
                    claimed,
                    %error,
                    "failed to complete batch, leaving it in process"
                );
                IterationOutcome::CompletionFailed { claimed }
            }
        }
    }

    /// Run iterations until `cancel` fires, waiting `poll_interval` after every empty or
    /// failed claim.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker = %self.name, "worker started");

        while !cancel.is_cancelled() {
            let outcome = self.run_once(&cancel).await;

            if outcome == IterationOutcome::Cancelled {
                break;
            }

            if outcome.should_back_off() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }

        self.liveness.deregister();
        info!(worker = %self.name, "worker stopped");
    }
}
