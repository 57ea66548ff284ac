use crate::retry::RetryPolicy;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("batch.max_events must be between 1 and {max}, got {got}")]
    InvalidMaxEvents { max: usize, got: usize },

    #[error("batch.max_bytes must exceed the per-event overhead")]
    InvalidMaxBytes,

    #[error("batch.max_span_ms must be positive")]
    InvalidMaxSpan,

    #[error("{0}.max_attempts must be at least 1")]
    InvalidAttempts(&'static str),

    #[error("dispatch.max_requeue_delay_secs must be between 1 and 900")]
    InvalidRequeueDelay,
}

/// Per-request limits of the managed log service.
///
/// Defaults are the documented PutLogEvents quotas. They are plain values so a
/// single destination or a test can override them.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchLimits {
    pub max_events: usize,
    /// Sum of message UTF-8 lengths plus `event_overhead` per event.
    pub max_bytes: usize,
    pub event_overhead: usize,
    /// Maximum distance between the oldest and newest timestamp in a batch.
    pub max_span_ms: i64,
}

pub const MAX_EVENTS_PER_BATCH: usize = 10_000;
pub const MAX_BATCH_BYTES: usize = 1_048_576;
pub const EVENT_OVERHEAD_BYTES: usize = 26;
pub const MAX_BATCH_SPAN_MS: i64 = 24 * 60 * 60 * 1000;

impl Default for BatchLimits {
    fn default() -> Self {
        BatchLimits {
            max_events: MAX_EVENTS_PER_BATCH,
            max_bytes: MAX_BATCH_BYTES,
            event_overhead: EVENT_OVERHEAD_BYTES,
            max_span_ms: MAX_BATCH_SPAN_MS,
        }
    }
}

impl BatchLimits {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_events == 0 || self.max_events > MAX_EVENTS_PER_BATCH {
            return Err(ValidationError::InvalidMaxEvents {
                max: MAX_EVENTS_PER_BATCH,
                got: self.max_events,
            });
        }
        if self.max_bytes <= self.event_overhead {
            return Err(ValidationError::InvalidMaxBytes);
        }
        if self.max_span_ms <= 0 {
            return Err(ValidationError::InvalidMaxSpan);
        }
        Ok(())
    }
}

/// Requeue policy applied by the dispatch controller.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// A notification whose retry count would exceed this is discarded.
    pub max_retries: u32,
    pub max_requeue_delay_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            max_retries: 5,
            max_requeue_delay_secs: 900,
        }
    }
}

/// Engine settings, read from the `delivery` section of the service config.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub batch: BatchLimits,
    pub submit_retry: RetryPolicy,
    pub dispatch: DispatchConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.batch.validate()?;
        if self.submit_retry.max_attempts == 0 {
            return Err(ValidationError::InvalidAttempts("submit_retry"));
        }
        // The queue refuses delays above 15 minutes.
        if self.dispatch.max_requeue_delay_secs == 0 || self.dispatch.max_requeue_delay_secs > 900
        {
            return Err(ValidationError::InvalidRequeueDelay);
        }
        Ok(())
    }
}
