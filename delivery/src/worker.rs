//! Queue consumer: long-polls for notifications and applies each dispatch
//! outcome to the queue.
use crate::dispatch::{Dispatcher, Outcome};
use crate::errors::ApiError;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    pub receipt_handle: String,
}

#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Waits for up to `max_messages` messages. An empty result is not an error.
    async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>, ApiError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), ApiError>;

    /// Enqueues a new message that becomes visible after `delay`.
    async fn send(&self, body: &str, delay: Duration) -> Result<(), ApiError>;
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_messages: usize,
    pub wait_time_secs: u64,
    /// How long a received message stays hidden from other consumers.
    pub visibility_timeout_secs: u64,
    /// Pause after a failed receive.
    pub error_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            max_messages: 10,
            wait_time_secs: 20,
            visibility_timeout_secs: 300,
            error_backoff_ms: 1_000,
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to receive messages: {0}")]
    Receive(ApiError),
}

pub struct Worker {
    queue: Arc<dyn NotificationQueue>,
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    ready: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn NotificationQueue>,
        dispatcher: Arc<Dispatcher>,
        config: WorkerConfig,
    ) -> Self {
        Worker {
            queue,
            dispatcher,
            config,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once the queue has answered, cleared while receives fail.
    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    pub async fn run(&self, token: CancellationToken) {
        tracing::info!(
            max_messages = self.config.max_messages,
            wait_time_secs = self.config.wait_time_secs,
            "Starting worker loop"
        );

        while !token.is_cancelled() {
            if let Err(error) = self.poll_once(&token).await {
                self.ready.store(false, Ordering::Relaxed);
                tracing::error!(error = %error, "Error polling queue");
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(self.config.error_backoff_ms)) => {}
                }
            }
        }

        tracing::info!("Worker stopped");
    }

    /// Receives one batch and handles its messages in order. Returns the number
    /// of messages received.
    pub async fn poll_once(&self, token: &CancellationToken) -> Result<usize, WorkerError> {
        let messages = tokio::select! {
            _ = token.cancelled() => return Ok(0),
            result = self.queue.receive(self.config.max_messages) => {
                result.map_err(WorkerError::Receive)?
            }
        };
        self.ready.store(true, Ordering::Relaxed);

        if messages.is_empty() {
            tracing::debug!("No messages received");
            return Ok(0);
        }
        tracing::debug!(count = messages.len(), "Received messages");

        for message in &messages {
            if token.is_cancelled() {
                break;
            }
            self.handle(message, token).await;
        }
        Ok(messages.len())
    }

    async fn handle(&self, message: &QueueMessage, token: &CancellationToken) {
        let report = self
            .dispatcher
            .process(&message.body, &message.receipt_handle, token)
            .await;

        if token.is_cancelled() {
            // Left for redelivery once the visibility timeout lapses.
            tracing::info!(
                message_id = %message.message_id,
                "Shutting down, leaving message on the queue"
            );
            return;
        }

        match &report.outcome {
            Outcome::Acknowledge | Outcome::Discard => self.delete(message).await,
            Outcome::Retry { body, delay, .. } => match self.queue.send(body, *delay).await {
                Ok(()) => self.delete(message).await,
                Err(error) => {
                    tracing::warn!(
                        message_id = %message.message_id,
                        error = %error,
                        "Could not requeue message, it will be redelivered as is"
                    );
                }
            },
        }
    }

    async fn delete(&self, message: &QueueMessage) {
        if let Err(error) = self.queue.delete(&message.receipt_handle).await {
            tracing::warn!(
                message_id = %message.message_id,
                error = %error,
                "Failed to delete message"
            );
        }
    }
}
