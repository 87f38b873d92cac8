use std::sync::Arc;
use std::time;

use health::HealthRegistry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use welcome_common::store::RowStore;

use crate::janitor::{JanitorSettings, StaleClaimJanitor};
use crate::notifier::NotificationSender;
use crate::worker::{WelcomeWorker, WorkerSettings};

/// Runs a fixed number of `WelcomeWorker`s sharing one store and one sender.
pub struct WorkerPool {
    store: Arc<dyn RowStore>,
    sender: Arc<dyn NotificationSender>,
    liveness: HealthRegistry,
    poll_interval: time::Duration,
    liveness_deadline: time::Duration,
    janitor: Option<JanitorSettings>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn RowStore>,
        sender: Arc<dyn NotificationSender>,
        liveness: HealthRegistry,
        poll_interval: time::Duration,
        liveness_deadline: time::Duration,
    ) -> Self {
        Self {
            store,
            sender,
            liveness,
            poll_interval,
            liveness_deadline,
            janitor: None,
        }
    }

    pub fn with_janitor(mut self, janitor: Option<JanitorSettings>) -> Self {
        self.janitor = janitor;
        self
    }

    /// Spawn `worker_count` workers, plus the janitor if enabled, all stopping when `cancel`
    /// fires.
    pub fn start(
        &self,
        worker_count: usize,
        batch_size: u32,
        cancel: CancellationToken,
    ) -> PoolHandle {
        let mut tasks = JoinSet::new();
        let settings = WorkerSettings {
            batch_size,
            poll_interval: self.poll_interval,
        };
        let deadline = ::time::Duration::try_from(self.liveness_deadline)
            .unwrap_or(::time::Duration::MAX);

        for index in 0..worker_count {
            let name = format!("worker-{index}");
            let liveness = self.liveness.register(name.clone(), deadline);
            let worker = WelcomeWorker::new(
                &name,
                self.store.clone(),
                self.sender.clone(),
                settings,
                liveness,
            );
            let cancel = cancel.clone();

            tasks.spawn(async move { worker.run(cancel).await });
        }

        if let Some(janitor_settings) = self.janitor {
            let janitor = StaleClaimJanitor::new(self.store.clone(), janitor_settings);
            let cancel = cancel.clone();

            tasks.spawn(async move { janitor.run(cancel).await });
        }

        info!(worker_count, batch_size, "worker pool started");

        PoolHandle { tasks, cancel }
    }
}

/// Owns the pool's tasks. Dropping it aborts them; prefer `shutdown`.
pub struct PoolHandle {
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl PoolHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal every task to stop, then wait for them. A worker in the middle of a send
    /// abandons its batch, which stays in process.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Wait for every task to exit, without asking them to.
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(error) = result {
                error!(%error, "worker task failed");
            }
        }
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use welcome_common::store::MemoryStore;

    use super::*;
    use crate::test_utils::RecordingSender;

    fn pool(store: Arc<MemoryStore>, sender: Arc<RecordingSender>) -> (WorkerPool, HealthRegistry) {
        let liveness = HealthRegistry::new("liveness");
        let pool = WorkerPool::new(
            store,
            sender,
            liveness.clone(),
            Duration::from_millis(10),
            Duration::from_secs(30),
        );
        (pool, liveness)
    }

    #[tokio::test]
    async fn test_pool_drains_store_sending_each_notification_once() {
        let emails: Vec<String> = (0..20).map(|i| format!("user{i}@x.com")).collect();
        let store = Arc::new(MemoryStore::with_emails(emails.clone()));
        let sender = Arc::new(RecordingSender::new());
        let (pool, liveness) = pool(store.clone(), sender.clone());

        let handle = pool.start(3, 4, CancellationToken::new());
        assert_eq!(liveness.get_status().components.len(), 3);

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while store.items().iter().any(|item| !item.email_sent) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        handle.shutdown().await;

        assert!(drained.is_ok(), "pool did not drain the store");
        let attempts = sender.attempts();
        let unique: HashSet<_> = attempts.iter().cloned().collect();
        assert_eq!(attempts.len(), 20);
        assert_eq!(unique, emails.into_iter().collect::<HashSet<_>>());
        // Stopped workers deregister.
        assert!(liveness.get_status().components.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_workers() {
        let store = Arc::new(MemoryStore::with_emails(["a@x.com", "b@x.com"]));
        let sender = Arc::new(RecordingSender::new().with_delay(Duration::from_secs(3600)));
        let (pool, _) = pool(store.clone(), sender);
        let pool = pool.with_janitor(Some(JanitorSettings {
            timeout: Duration::from_secs(3600),
            interval: Duration::from_millis(10),
        }));

        let handle = pool.start(2, 1, CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("pool did not shut down");

        // Abandoned batches stay claimed.
        assert!(store.items().iter().all(|item| !item.email_sent));
    }

    #[tokio::test]
    async fn test_external_cancellation_stops_pool() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::new());
        let (pool, _) = pool(store, sender);
        let cancel = CancellationToken::new();

        let handle = pool.start(2, 10, cancel.clone());
        assert!(!handle.cancellation_token().is_cancelled());
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("pool did not stop");
    }
}
