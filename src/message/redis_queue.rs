//! Redis-backed message provider with reliable dequeue.
//!
//! The queue uses two Redis lists:
//!
//! - `{queue_name}`: main queue that producers `LPUSH` audit requests onto
//! - `{queue_name}:processing`: messages handed to this worker but not yet
//!   acknowledged
//!
//! Messages are moved atomically from the main queue into the processing
//! list when polled. Acknowledging removes them from the processing list;
//! releasing moves them back to the main queue. On startup, anything left in
//! the processing list by a previous run is moved back to the main queue, so
//! delivery is at-least-once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::config::QueueConfig;

use super::provider::{MessageProvider, ProviderConnector, ProviderError};
use super::types::RawMessage;

/// Message provider backed by a pair of Redis lists.
pub struct RedisMessageProvider {
    /// Connection used for the blocking dequeue only.
    poll_conn: ConnectionManager,
    /// Connection used for acknowledgements and bookkeeping.
    conn: ConnectionManager,
    queue_name: String,
    processing_queue: String,
    batch_size: usize,
    wait: Duration,
}

impl RedisMessageProvider {
    /// Connects to Redis using the queue settings.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unauthorized` for rejected credentials and
    /// `ProviderError::Unavailable` when the server cannot be reached.
    pub async fn connect(config: &QueueConfig) -> Result<Self, ProviderError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let poll_conn = ConnectionManager::new(client.clone())
            .await
            .map_err(connect_error)?;
        let conn = ConnectionManager::new(client).await.map_err(connect_error)?;

        Ok(Self {
            poll_conn,
            conn,
            queue_name: config.name.clone(),
            processing_queue: format!("{}:processing", config.name),
            batch_size: config.batch_size.max(1),
            wait: config.wait,
        })
    }

    /// Moves messages stranded in the processing list back to the main queue.
    ///
    /// Returns the number of messages recovered.
    pub async fn recover_processing(&self) -> Result<usize, ProviderError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;

        // RPOPLPUSH from processing into the consumer end of the main queue
        // keeps the recovered messages first in line.
        loop {
            let moved: Option<String> = conn
                .rpoplpush(&self.processing_queue, &self.queue_name)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!(
                queue = %self.queue_name,
                recovered = recovered,
                "Recovered messages from processing list"
            );
        }
        Ok(recovered)
    }
}

#[cfg(test)]
impl RedisMessageProvider {
    /// Pushes a payload onto the main queue.
    pub async fn enqueue(&self, body: &str) -> Result<(), ProviderError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, body).await?;
        Ok(())
    }

    /// Returns the number of messages waiting in the main queue.
    pub async fn len(&self) -> Result<usize, ProviderError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(&self.queue_name).await?)
    }

    /// Returns whether the main queue is empty.
    pub async fn is_empty(&self) -> Result<bool, ProviderError> {
        Ok(self.len().await? == 0)
    }

    /// Returns the number of messages handed out but not yet acknowledged.
    pub async fn processing_len(&self) -> Result<usize, ProviderError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(&self.processing_queue).await?)
    }
}

/// Connects to Redis and requeues anything a previous run left in flight.
pub struct RedisConnector {
    config: QueueConfig,
}

impl RedisConnector {
    pub fn new(config: QueueConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProviderConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageProvider>, ProviderError> {
        let provider = RedisMessageProvider::connect(&self.config).await?;
        provider.recover_processing().await?;
        Ok(Arc::new(provider))
    }
}

#[async_trait]
impl MessageProvider for RedisMessageProvider {
    async fn poll(&self) -> Result<Vec<RawMessage>, ProviderError> {
        let mut conn = self.poll_conn.clone();
        let timeout_secs = self.wait.as_secs().max(1) as usize;

        let first: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some(first) = first else {
            return Ok(Vec::new());
        };

        let mut batch = vec![RawMessage::new(first.clone(), first)];
        while batch.len() < self.batch_size {
            let next: Option<String> = conn
                .rpoplpush(&self.queue_name, &self.processing_queue)
                .await?;
            match next {
                Some(body) => batch.push(RawMessage::new(body.clone(), body)),
                None => break,
            }
        }

        debug!(queue = %self.queue_name, count = batch.len(), "Polled messages");
        Ok(batch)
    }

    async fn ack(&self, receipt: &str) -> Result<(), ProviderError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(&self.processing_queue, 1, receipt)
            .await?;
        Ok(())
    }

    async fn release(&self, receipt: &str) -> Result<(), ProviderError> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.processing_queue, 1, receipt)
            .rpush(&self.queue_name, receipt);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}

fn connect_error(error: redis::RedisError) -> ProviderError {
    if error.kind() == redis::ErrorKind::AuthenticationFailed {
        ProviderError::Unauthorized(error.to_string())
    } else {
        ProviderError::Unavailable(error.to_string())
    }
}
