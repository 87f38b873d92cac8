use std::sync::Arc;

use tracing::info;
use welcome_common::seed::{generate_emails, Seeder};
use welcome_common::store::{MemoryStore, PgStore, RowStore};

use crate::config::{Config, StoreMode};
use crate::error::WorkerError;

/// Build the store selected by `STORE_MODE`, seeding it when `SEED_ON_START` is set.
///
/// A Postgres store is pinged first, and its table is created if missing even when seeding is
/// off. A memory store starts empty unless seeded.
pub async fn build_store(config: &Config) -> Result<Arc<dyn RowStore>, WorkerError> {
    let store: Arc<dyn RowStore> = match config.store_mode {
        StoreMode::Postgres => {
            let store = PgStore::new(
                &config.database_url,
                config.max_pg_connections,
                "welcome-worker",
            )?
            .with_order(config.claim_order);
            store.ping().await?;

            let seeder = Seeder::new(store.pool().clone());
            if config.seed_on_start {
                seeder
                    .seed(config.seed_count)
                    .await
                    .map_err(WorkerError::SeedError)?;
            } else {
                seeder.ensure_table().await.map_err(WorkerError::SeedError)?;
            }

            Arc::new(store)
        }
        StoreMode::Memory => {
            let count = if config.seed_on_start {
                config.seed_count
            } else {
                0
            };
            info!(count, "using an in-memory store");

            Arc::new(MemoryStore::with_emails(generate_emails(count)))
        }
    };

    Ok(store)
}
