//! # Row store
//!
//! The table of users waiting for a welcome notification, and the only place allowed to
//! flip their `in_process` and `email_sent` flags.
//!
//! A row goes through `claim_batch` (marked in process) and then `complete_batch` (marked
//! sent). Rows whose batch failed are never put back by this module: they stay in process
//! until `release_stale` is called on them, if ever.
use std::str::FromStr;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Enumeration of errors for operations on a `RowStore`.
/// None of them leave a partial claim or a partial completion behind. All but
/// `DurationOutOfRange` mean the store is unavailable for now.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{0:?} cannot be expressed as a stale claim timeout")]
    DurationOutOfRange(time::Duration),
}

/// Enumeration of parsing errors for store settings.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0} is not a valid ClaimOrder")]
    ParseClaimOrderError(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Order in which eligible rows are picked by `claim_batch`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOrder {
    /// Oldest rows first. Deterministic, and what tests rely on.
    #[default]
    Id,
    /// Whatever order the database finds cheapest.
    Unordered,
}

impl FromStr for ClaimOrder {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "id" => Ok(ClaimOrder::Id),
            "unordered" => Ok(ClaimOrder::Unordered),
            invalid => Err(ParseError::ParseClaimOrderError(invalid.to_owned())),
        }
    }
}

/// One row of the store.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: i64,
    /// The business key: every bulk update targets rows by email.
    pub email: String,
    /// Done: the welcome notification went out and the batch was completed.
    pub email_sent: bool,
    /// In flight: claimed by a worker and not completed yet.
    pub in_process: bool,
    pub created_at: DateTime<Utc>,
    /// When the row was last claimed, cleared on completion.
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// The keys returned by one claim, in claim order.
/// Owned by the worker that claimed it until the batch is completed or abandoned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    keys: Vec<String>,
}

impl Batch {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn into_keys(self) -> Vec<String> {
        self.keys
    }
}

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Claim up to `limit` rows that are neither sent nor in process, marking them in process.
    /// Runs in a single transaction: either every returned row was claimed, or none was.
    /// Finding nothing to claim returns an empty `Batch`.
    async fn claim_batch(&self, limit: u32) -> StoreResult<Batch>;

    /// Mark every key as sent and no longer in process, in one statement.
    /// Only rows currently in process are touched, so completing keys that were never claimed,
    /// or were already completed, is a no-op. Returns the number of rows completed.
    async fn complete_batch(&self, keys: &[String]) -> StoreResult<u64>;

    /// Put rows claimed longer than `older_than` ago, and still not sent, back up for claiming.
    async fn release_stale(&self, older_than: time::Duration) -> StoreResult<u64>;
}
