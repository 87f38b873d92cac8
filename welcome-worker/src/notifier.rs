use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use reqwest::{header, Client, Url};
use serde::Serialize;
use tracing::info;

use crate::config::{NotificationConfig, NotificationMode};
use crate::error::NotificationError;

/// Delivers a welcome notification to one recipient.
///
/// Implementations hold no per-call state: a single sender is shared by every worker and
/// called concurrently.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, recipient: &str) -> Result<(), NotificationError>;
}

/// The JSON document posted to the mail relay.
#[derive(Serialize, Debug, PartialEq)]
pub struct WelcomeMessage<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
}

/// Build the sender selected by `NOTIFICATION_MODE`.
pub fn build_sender(
    config: &NotificationConfig,
) -> Result<Arc<dyn NotificationSender>, NotificationError> {
    let sender: Arc<dyn NotificationSender> = match config.notification_mode {
        NotificationMode::Http => Arc::new(HttpNotificationSender::new(config)?),
        NotificationMode::Log => Arc::new(LogNotificationSender::new(config)),
    };

    Ok(sender)
}

pub fn build_http_client(request_timeout: time::Duration) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("Welcome Users Worker")
        .timeout(request_timeout)
        .build()
}

/// Posts each notification to a mail relay over HTTP.
/// The client's connection pool is shared across sends and workers.
pub struct HttpNotificationSender {
    client: Client,
    url: Url,
    from: String,
    subject: String,
    body: String,
}

impl HttpNotificationSender {
    pub fn new(config: &NotificationConfig) -> Result<Self, NotificationError> {
        let url = Url::parse(&config.notification_url)?;
        let client = build_http_client(config.request_timeout.0)
            .map_err(NotificationError::ClientBuildError)?;

        Ok(Self {
            client,
            url,
            from: config.notification_from.to_owned(),
            subject: config.notification_subject.to_owned(),
            body: config.notification_body.to_owned(),
        })
    }
}

#[async_trait]
impl NotificationSender for HttpNotificationSender {
    async fn send(&self, recipient: &str) -> Result<(), NotificationError> {
        let message = WelcomeMessage {
            from: &self.from,
            to: recipient,
            subject: &self.subject,
            body: &self.body,
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&message)
            .send()
            .await
            .map_err(|error| NotificationError::RequestError {
                recipient: recipient.to_owned(),
                error,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::StatusError {
                recipient: recipient.to_owned(),
                status,
            });
        }

        Ok(())
    }
}

/// Only logs what would have been sent.
pub struct LogNotificationSender {
    from: String,
    subject: String,
}

impl LogNotificationSender {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            from: config.notification_from.to_owned(),
            subject: config.notification_subject.to_owned(),
        }
    }
}

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, recipient: &str) -> Result<(), NotificationError> {
        info!(
            to = recipient,
            from = %self.from,
            subject = %self.subject,
            "welcome notification sent"
        );
        Ok(())
    }
}
