//! Bootstrap the `new_users` table with synthetic rows.
//!
//! Runs once at startup, before any worker, so workers always find the table in place.
use std::collections::HashSet;

use rand::{distributions::Alphanumeric, seq::SliceRandom, Rng};
use sqlx::postgres::PgPool;
use tracing::info;

use crate::store::{PgStore, StoreError, StoreResult};

const DOMAINS: &[&str] = &["example.com", "test.com", "demo.com"];

/// Kept in sync with the migrations directory.
const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS new_users (
    id BIGSERIAL PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    email_sent BOOLEAN NOT NULL DEFAULT FALSE,
    in_process BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    claimed_at TIMESTAMPTZ,
    sent_at TIMESTAMPTZ
)
"#;

const CREATE_CLAIMABLE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_new_users_claimable ON new_users (id)
WHERE email_sent = FALSE AND in_process = FALSE
"#;

pub struct Seeder {
    pool: PgPool,
}

impl Seeder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table and its index if they don't exist yet.
    pub async fn ensure_table(&self) -> StoreResult<()> {
        for statement in [CREATE_TABLE, CREATE_CLAIMABLE_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "CREATE".to_owned(),
                    error,
                })?;
        }

        Ok(())
    }

    /// Ensure the table exists and, only if it holds no rows at all, insert `count` rows with
    /// random unique emails. Returns the number of rows inserted.
    pub async fn seed(&self, count: usize) -> StoreResult<u64> {
        self.ensure_table().await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM new_users")
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        if existing > 0 {
            info!(existing, "table already populated, skipping seed");
            return Ok(0);
        }
        if count == 0 {
            return Ok(0);
        }

        info!(count, "empty table, seeding it");
        let inserted = PgStore::insert_emails(&mut *tx, &generate_emails(count)).await?;

        tx.commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(inserted)
    }
}

/// Generate `count` distinct emails like `user<suffix>@example.com`.
pub fn generate_emails(count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    let mut seen = HashSet::with_capacity(count);
    let mut emails = Vec::with_capacity(count);

    while emails.len() < count {
        let email = random_email(&mut rng);
        if seen.insert(email.clone()) {
            emails.push(email);
        }
    }

    emails
}

fn random_email<R: Rng>(rng: &mut R) -> String {
    let domain = DOMAINS.choose(rng).unwrap_or(&DOMAINS[0]);
    let suffix: String = rng
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();

    format!("user{suffix}@{domain}")
}
