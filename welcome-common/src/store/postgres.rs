use std::str::FromStr;
use std::time;

use async_trait::async_trait;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::debug;

use super::{Batch, ClaimOrder, RowStore, StoreError, StoreResult, WorkItem};

/// A `RowStore` backed by the `new_users` table in PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    /// A connection pool shared by every worker.
    pool: PgPool,
    /// Order in which claimable rows are picked.
    order: ClaimOrder,
}

impl PgStore {
    /// Initialize a new PgStore by creating a lazy connection pool to the database in `url`.
    ///
    /// # Arguments
    ///
    /// * `url`: A URL pointing to where the PostgreSQL database is hosted.
    /// * `max_connections`: Upper bound on connections shared by all workers.
    /// * `app_name`: Reported to PostgreSQL as `application_name`.
    pub fn new(url: &str, max_connections: u32, app_name: &'static str) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| StoreError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(time::Duration::from_secs(10))
            .connect_lazy_with(options);

        Ok(Self::new_from_pool(pool))
    }

    /// Initialize a new PgStore from a provided connection pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            order: ClaimOrder::default(),
        }
    }

    pub fn with_order(mut self, order: ClaimOrder) -> Self {
        self.order = order;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check the database can actually be reached.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(())
    }

    /// Insert new, unclaimed rows. Emails already present are skipped.
    /// Returns how many rows were inserted.
    pub async fn insert_emails<'c, E>(executor: E, emails: &[String]) -> StoreResult<u64>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let base_query = r#"
INSERT INTO new_users
    (email)
SELECT
    *
FROM
    UNNEST($1::text[])
ON CONFLICT (email) DO NOTHING
        "#;

        let result = sqlx::query(base_query)
            .bind(emails)
            .execute(executor)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    pub async fn fetch_item(&self, email: &str) -> StoreResult<Option<WorkItem>> {
        sqlx::query_as("SELECT * FROM new_users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    /// Number of rows neither sent nor in process.
    pub async fn count_pending(&self) -> StoreResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM new_users WHERE email_sent = FALSE AND in_process = FALSE",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }
}

#[async_trait]
impl RowStore for PgStore {
    async fn claim_batch(&self, limit: u32) -> StoreResult<Batch> {
        if limit == 0 {
            return Ok(Batch::default());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        // FOR UPDATE SKIP LOCKED: rows being claimed by a concurrent transaction are skipped
        // instead of waited on, so two claims never return the same row.
        let order_clause = match self.order {
            ClaimOrder::Id => "ORDER BY id",
            ClaimOrder::Unordered => "",
        };
        let base_query = format!(
            r#"
WITH claimable AS (
    SELECT
        id
    FROM
        new_users
    WHERE
        email_sent = FALSE
        AND in_process = FALSE
    {order_clause}
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    new_users
SET
    in_process = TRUE,
    claimed_at = NOW()
FROM
    claimable
WHERE
    new_users.id = claimable.id
RETURNING
    new_users.id,
    new_users.email
            "#
        );

        let mut rows: Vec<(i64, String)> = sqlx::query_as(&base_query)
            .bind(i64::from(limit))
            .fetch_all(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if rows.is_empty() {
            // Transaction is rolled back on drop.
            return Ok(Batch::default());
        }

        tx.commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        // RETURNING makes no ordering promise.
        if self.order == ClaimOrder::Id {
            rows.sort_unstable_by_key(|(id, _)| *id);
        }
        debug!(claimed = rows.len(), limit, "claimed batch");

        Ok(Batch::new(rows.into_iter().map(|(_, email)| email).collect()))
    }

    async fn complete_batch(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let base_query = r#"
UPDATE
    new_users
SET
    email_sent = TRUE,
    in_process = FALSE,
    claimed_at = NULL,
    sent_at = NOW()
WHERE
    email = ANY($1)
    AND in_process = TRUE
    AND email_sent = FALSE
        "#;

        let result = sqlx::query(base_query)
            .bind(keys)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    async fn release_stale(&self, older_than: time::Duration) -> StoreResult<u64> {
        // Encoding a Duration directly panics past i64 microseconds.
        let interval = PgInterval::try_from(older_than)
            .map_err(|_| StoreError::DurationOutOfRange(older_than))?;
        let base_query = r#"
UPDATE
    new_users
SET
    in_process = FALSE,
    claimed_at = NULL
WHERE
    in_process = TRUE
    AND email_sent = FALSE
    AND claimed_at <= NOW() - $1::interval
        "#;

        let result = sqlx::query(base_query)
            .bind(interval)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }
}
