use std::sync::{Arc, Mutex, MutexGuard};
use std::time;

use async_trait::async_trait;
use chrono::Utc;

use super::{Batch, RowStore, StoreError, StoreResult, WorkItem};

#[derive(Default)]
struct Rows {
    /// Kept sorted by id, as ids are handed out in insertion order.
    items: Vec<WorkItem>,
    next_id: i64,
    unavailable: bool,
}

/// An in-process `RowStore` with the same claim and completion semantics as `PgStore`.
/// Claims are serialized by a mutex and always follow id order.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<Rows>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_emails<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for email in emails {
            store.insert(email);
        }
        store
    }

    /// Insert a new unclaimed row. Returns false if the email is already present.
    pub fn insert(&self, email: impl Into<String>) -> bool {
        let email = email.into();
        let Ok(mut rows) = self.rows.lock() else {
            return false;
        };
        if rows.items.iter().any(|item| item.email == email) {
            return false;
        }

        rows.next_id += 1;
        let id = rows.next_id;
        rows.items.push(WorkItem {
            id,
            email,
            email_sent: false,
            in_process: false,
            created_at: Utc::now(),
            claimed_at: None,
            sent_at: None,
        });
        true
    }

    /// While unavailable, every `RowStore` operation fails like a lost database connection.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.unavailable = unavailable;
        }
    }

    pub fn fetch_item(&self, email: &str) -> Option<WorkItem> {
        let rows = self.rows.lock().ok()?;
        rows.items.iter().find(|item| item.email == email).cloned()
    }

    pub fn items(&self) -> Vec<WorkItem> {
        self.rows
            .lock()
            .map(|rows| rows.items.clone())
            .unwrap_or_default()
    }

    /// Number of rows neither sent nor in process.
    pub fn count_pending(&self) -> usize {
        self.items()
            .iter()
            .filter(|item| !item.email_sent && !item.in_process)
            .count()
    }

    fn available_rows(&self) -> StoreResult<MutexGuard<'_, Rows>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned store lock".to_owned()))?;
        if rows.unavailable {
            return Err(StoreError::Unavailable("store marked unavailable".to_owned()));
        }
        Ok(rows)
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn claim_batch(&self, limit: u32) -> StoreResult<Batch> {
        let mut rows = self.available_rows()?;
        let now = Utc::now();

        let keys = rows
            .items
            .iter_mut()
            .filter(|item| !item.email_sent && !item.in_process)
            .take(limit as usize)
            .map(|item| {
                item.in_process = true;
                item.claimed_at = Some(now);
                item.email.clone()
            })
            .collect();

        Ok(Batch::new(keys))
    }

    async fn complete_batch(&self, keys: &[String]) -> StoreResult<u64> {
        let mut rows = self.available_rows()?;
        let now = Utc::now();
        let mut completed = 0;

        for item in rows
            .items
            .iter_mut()
            .filter(|item| item.in_process && !item.email_sent && keys.contains(&item.email))
        {
            item.email_sent = true;
            item.in_process = false;
            item.claimed_at = None;
            item.sent_at = Some(now);
            completed += 1;
        }

        Ok(completed)
    }

    async fn release_stale(&self, older_than: time::Duration) -> StoreResult<u64> {
        let mut rows = self.available_rows()?;
        let cutoff = chrono::Duration::from_std(older_than)
            .map_err(|_| StoreError::DurationOutOfRange(older_than))?;
        // Older than the earliest representable instant: nothing can be that stale.
        let Some(cutoff) = Utc::now().checked_sub_signed(cutoff) else {
            return Ok(0);
        };
        let mut released = 0;

        for item in rows.items.iter_mut().filter(|item| {
            item.in_process && !item.email_sent && item.claimed_at.is_some_and(|at| at <= cutoff)
        }) {
            item.in_process = false;
            item.claimed_at = None;
            released += 1;
        }

        Ok(released)
    }
}
