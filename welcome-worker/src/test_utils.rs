use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;

use crate::error::NotificationError;
use crate::notifier::NotificationSender;

/// A `NotificationSender` that records every attempt and fails for chosen recipients.
#[derive(Default)]
pub struct RecordingSender {
    attempts: Mutex<Vec<String>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(recipients: &[&str]) -> Self {
        Self {
            failing: recipients.iter().map(|r| r.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Every send waits this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, recipient: &str) -> Result<(), NotificationError> {
        self.attempts.lock().unwrap().push(recipient.to_owned());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.contains(recipient) {
            return Err(NotificationError::StatusError {
                recipient: recipient.to_owned(),
                status: StatusCode::SERVICE_UNAVAILABLE,
            });
        }
        Ok(())
    }
}

pub fn emails(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| format!("{name}@x.com")).collect()
}
