use http::StatusCode;
use thiserror::Error;
use welcome_common::metrics::BuildError;
use welcome_common::store::StoreError;

/// Enumeration of errors related to delivering a single welcome notification.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("error parsing notification url")]
    ParseUrlError(#[from] url::ParseError),
    #[error("failed to construct notification client: {0}")]
    ClientBuildError(reqwest::Error),
    #[error("notification to {recipient} could not be delivered: {error}")]
    RequestError {
        recipient: String,
        error: reqwest::Error,
    },
    #[error("notification to {recipient} was rejected with status {status}")]
    StatusError {
        recipient: String,
        status: StatusCode,
    },
}

/// Enumeration of ways processing a claimed batch can stop short.
/// In both cases the batch is not completed: its rows stay in process.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("batch abandoned after {sent} notifications were sent: {error}")]
    Notification {
        /// Notifications that went out before the failure. They will be sent again if the
        /// rows are ever claimed again.
        sent: usize,
        error: NotificationError,
    },
    #[error("batch processing cancelled after {sent} notifications were sent")]
    Cancelled { sent: usize },
}

/// Enumeration of errors that stop the worker process from starting, or from running.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),
    #[error("failed to seed the store: {0}")]
    SeedError(#[source] StoreError),
    #[error("store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to install metrics recorder: {0}")]
    MetricsError(#[from] BuildError),
    #[error("failed to serve liveness and metrics endpoints: {0}")]
    ServerError(#[from] std::io::Error),
}
