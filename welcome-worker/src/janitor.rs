use std::sync::Arc;
use std::time;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use welcome_common::store::{RowStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JanitorSettings {
    /// Rows claimed longer ago than this are handed back to the queue.
    pub timeout: time::Duration,
    /// How often to look for stale claims.
    pub interval: time::Duration,
}

/// Periodically releases rows left in process by a crashed or failed iteration.
///
/// Only runs when `STALE_CLAIM_TIMEOUT` is set. Without it, a failed batch stays in process
/// until an operator intervenes.
pub struct StaleClaimJanitor {
    store: Arc<dyn RowStore>,
    settings: JanitorSettings,
}

impl StaleClaimJanitor {
    pub fn new(store: Arc<dyn RowStore>, settings: JanitorSettings) -> Self {
        Self { store, settings }
    }

    pub async fn run_once(&self) -> Result<u64, StoreError> {
        let released = self.store.release_stale(self.settings.timeout).await?;

        if released > 0 {
            metrics::counter!("welcome_stale_claims_released_total").increment(released);
            warn!(
                released,
                timeout = ?self.settings.timeout,
                "released stale claims, their recipients may be notified twice"
            );
        } else {
            debug!("no stale claims found");
        }

        Ok(released)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.settings.interval, "janitor started");

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(error) = self.run_once().await {
                error!(%error, "failed to release stale claims");
            }
        }

        info!("janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use welcome_common::store::MemoryStore;

    use super::*;

    fn settings(timeout: Duration) -> JanitorSettings {
        JanitorSettings {
            timeout,
            interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_run_once_releases_stale_claims() {
        let store = Arc::new(MemoryStore::with_emails(["a@x.com", "b@x.com"]));
        let claimed = store.claim_batch(1).await.expect("failed to claim");
        assert_eq!(claimed.keys(), ["a@x.com".to_owned()]);

        let janitor = StaleClaimJanitor::new(store.clone(), settings(Duration::ZERO));
        let released = janitor.run_once().await.expect("failed to release");

        assert_eq!(released, 1);
        let item = store.fetch_item("a@x.com").unwrap();
        assert!(!item.in_process);
        assert!(!item.email_sent);
        assert_eq!(store.count_pending(), 2);
    }

    #[tokio::test]
    async fn test_run_once_keeps_fresh_claims() {
        let store = Arc::new(MemoryStore::with_emails(["a@x.com"]));
        store.claim_batch(1).await.expect("failed to claim");

        let janitor = StaleClaimJanitor::new(store.clone(), settings(Duration::from_secs(3600)));

        assert_eq!(janitor.run_once().await.expect("failed to release"), 0);
        assert!(store.fetch_item("a@x.com").unwrap().in_process);
    }

    #[tokio::test]
    async fn test_run_once_surfaces_store_errors() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);

        let janitor = StaleClaimJanitor::new(store, settings(Duration::ZERO));

        assert!(matches!(
            janitor.run_once().await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let janitor = StaleClaimJanitor::new(store, settings(Duration::ZERO));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { janitor.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("janitor did not stop")
            .expect("janitor panicked");
    }
}
