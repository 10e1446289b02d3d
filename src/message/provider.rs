//! Message provider capability and poll error classification.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{MessageError, RawMessage};

/// Errors returned by a message provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider temporarily unavailable (dropped connection, timeout).
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// Provider rejected the request because a rate or quota limit was hit.
    #[error("Provider quota exceeded: {0}")]
    Throttled(String),

    /// Credentials were rejected.
    #[error("Provider rejected credentials: {0}")]
    Unauthorized(String),

    /// The configured queue does not exist.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// A single message exceeded the provider's size limit.
    #[error("Message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    /// A single message could not be decoded.
    #[error("Malformed message: {0}")]
    Malformed(#[from] MessageError),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// How the poll loop reacts to a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollErrorClass {
    /// Log and poll again on the normal interval.
    Transient,
    /// Log and back off before the next poll.
    QuotaExceeded,
    /// Stop the service.
    Critical,
    /// Drop the offending message and keep polling.
    MalformedMessage,
}

impl fmt::Display for PollErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollErrorClass::Transient => write!(f, "transient"),
            PollErrorClass::QuotaExceeded => write!(f, "quota-exceeded"),
            PollErrorClass::Critical => write!(f, "critical"),
            PollErrorClass::MalformedMessage => write!(f, "malformed-message"),
        }
    }
}

/// Maps a provider error onto exactly one [`PollErrorClass`].
pub fn classify(error: &ProviderError) -> PollErrorClass {
    match error {
        ProviderError::Unavailable(_) => PollErrorClass::Transient,
        ProviderError::Throttled(_) => PollErrorClass::QuotaExceeded,
        ProviderError::Unauthorized(_) | ProviderError::QueueNotFound(_) => {
            PollErrorClass::Critical
        }
        ProviderError::MessageTooLarge { .. } | ProviderError::Malformed(_) => {
            PollErrorClass::MalformedMessage
        }
        ProviderError::Redis(e) => classify_redis(e),
    }
}

fn classify_redis(error: &redis::RedisError) -> PollErrorClass {
    use redis::ErrorKind;

    match error.kind() {
        ErrorKind::AuthenticationFailed | ErrorKind::InvalidClientConfig => {
            PollErrorClass::Critical
        }
        ErrorKind::BusyLoadingError | ErrorKind::TryAgain => PollErrorClass::QuotaExceeded,
        ErrorKind::ResponseError
            if error
                .detail()
                .is_some_and(|d| d.contains("max number of clients")) =>
        {
            PollErrorClass::QuotaExceeded
        }
        _ => PollErrorClass::Transient,
    }
}

/// Source of audit requests.
///
/// Delivery is at-least-once: the same payload may be returned more than
/// once, and callers must tolerate duplicates.
#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Fetches the next batch of messages. An empty batch means no work.
    async fn poll(&self) -> Result<Vec<RawMessage>, ProviderError>;

    /// Marks a message as handled so it is never delivered again.
    async fn ack(&self, receipt: &str) -> Result<(), ProviderError>;

    /// Returns an unprocessed message to the queue for redelivery.
    async fn release(&self, receipt: &str) -> Result<(), ProviderError>;
}

/// Opens a [`MessageProvider`].
///
/// The service connects only once configuration and credentials have been
/// checked, so a failed startup never touches the queue.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn MessageProvider>, ProviderError>;
}
