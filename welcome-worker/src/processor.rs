use health::HealthHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use welcome_common::store::Batch;

use crate::error::ProcessError;
use crate::notifier::NotificationSender;

/// Send a welcome notification to every key of `batch`, one after the other, in claim order.
///
/// Stops at the first failure and leaves the remaining keys untouched. Notifications sent
/// before the failure cannot be taken back, yet the whole batch is reported as failed and
/// must not be completed: those recipients get notified again if their rows are ever claimed
/// again. Delivery is at-least-once.
///
/// `cancel` is checked before every send and raced against the send in progress.
/// `liveness` is reported before every send, so a long batch of slow sends is not mistaken
/// for a stalled worker.
/// Returns the number of notifications sent, which is the batch size on success.
pub async fn process_batch(
    sender: &dyn NotificationSender,
    batch: &Batch,
    liveness: &HealthHandle,
    cancel: &CancellationToken,
) -> Result<usize, ProcessError> {
    for (sent, recipient) in batch.keys().iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled { sent });
        }
        liveness.report_healthy();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProcessError::Cancelled { sent }),
            result = sender.send(recipient) => result,
        };

        match result {
            Ok(()) => {
                metrics::counter!("welcome_notifications_sent_total").increment(1);
                debug!(email = %recipient, "welcome notification sent");
            }
            Err(error) => {
                metrics::counter!("welcome_notifications_failed_total").increment(1);
                return Err(ProcessError::Notification { sent, error });
            }
        }
    }

    Ok(batch.len())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use health::HealthRegistry;

    use super::*;
    use crate::error::NotificationError;
    use crate::test_utils::{emails, RecordingSender};

    fn liveness() -> HealthHandle {
        HealthRegistry::new("liveness")
            .register("worker-0".to_owned(), ::time::Duration::seconds(30))
    }

    #[tokio::test]
    async fn test_sends_every_key_in_order() {
        let sender = RecordingSender::new();
        let batch = Batch::new(emails(&["a", "b", "c"]));

        let sent = process_batch(&sender, &batch, &liveness(), &CancellationToken::new())
            .await
            .expect("batch failed");

        assert_eq!(sent, 3);
        assert_eq!(sender.attempts(), emails(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let sender = RecordingSender::failing_on(&["c@x.com"]);
        let batch = Batch::new(emails(&["a", "b", "c", "d", "e"]));

        let result =
            process_batch(&sender, &batch, &liveness(), &CancellationToken::new()).await;

        match result {
            Err(ProcessError::Notification {
                sent,
                error: NotificationError::StatusError { recipient, .. },
            }) => {
                assert_eq!(sent, 2);
                assert_eq!(recipient, "c@x.com");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // Keys after the failing one are never attempted.
        assert_eq!(sender.attempts(), emails(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_send() {
        let sender = RecordingSender::new();
        let batch = Batch::new(emails(&["a"]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = process_batch(&sender, &batch, &liveness(), &cancel).await;

        assert!(matches!(result, Err(ProcessError::Cancelled { sent: 0 })));
        assert!(sender.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_slow_send() {
        let sender = RecordingSender::new().with_delay(Duration::from_secs(3600));
        let batch = Batch::new(emails(&["a", "b"]));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            process_batch(&sender, &batch, &liveness(), &cancel),
        )
        .await
        .expect("cancellation did not interrupt the send");

        assert!(matches!(result, Err(ProcessError::Cancelled { sent: 0 })));
        assert_eq!(sender.attempts(), emails(&["a"]));
    }

    #[tokio::test]
    async fn test_reports_liveness_before_sending() {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("worker-0".to_owned(), ::time::Duration::seconds(30));
        let sender = RecordingSender::new();
        let batch = Batch::new(emails(&["a"]));
        assert!(!registry.get_status().healthy);

        process_batch(&sender, &batch, &liveness, &CancellationToken::new())
            .await
            .expect("batch failed");

        assert!(registry.get_status().healthy);
    }
}
