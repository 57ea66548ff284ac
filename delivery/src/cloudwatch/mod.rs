//! Delivery into a tenant's managed log group.
pub mod batcher;

use crate::config::BatchLimits;
use crate::errors::{ApiError, DeliveryError};
use crate::metrics_defs::{BATCH_SUBMIT_DURATION, BATCHES_SUBMITTED, EVENTS_DELIVERED, EVENTS_FAILED};
use crate::retry::{RetryError, RetryPolicy, retry_with_backoff};
use crate::types::{DeliveryStats, LogEvent};
use async_trait::async_trait;
use batcher::{Batch, prepare_events, split_into_batches};
pub use batcher::{OutputEvent, RejectedEvents};
use shared::{counter, histogram};
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// The managed log service, as used by the engine.
#[async_trait]
pub trait LogsApi: Send + Sync {
    async fn log_group_exists(&self, log_group: &str) -> Result<bool, ApiError>;

    /// `false` when the group itself is missing.
    async fn log_stream_exists(&self, log_group: &str, log_stream: &str) -> Result<bool, ApiError>;

    async fn create_log_group(&self, log_group: &str) -> Result<(), ApiError>;

    async fn create_log_stream(&self, log_group: &str, log_stream: &str) -> Result<(), ApiError>;

    /// Submits one batch. Events rejected individually are reported through
    /// the returned boundaries rather than as an error.
    async fn put_log_events(
        &self,
        log_group: &str,
        log_stream: &str,
        events: &[OutputEvent],
    ) -> Result<RejectedEvents, ApiError>;
}

const ACCESS_DENIED: &str = "AccessDeniedException";
const PERMANENT_ERROR_CODES: &[&str] = &[ACCESS_DENIED, "InvalidParameterException"];

fn classify(error: ApiError) -> DeliveryError {
    if PERMANENT_ERROR_CODES.contains(&error.code.as_str()) {
        DeliveryError::DestinationRejected(error)
    } else {
        DeliveryError::DestinationUnavailable(error)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogTarget<'a> {
    pub log_group: &'a str,
    pub log_stream: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloudWatchReport {
    pub stats: DeliveryStats,
    /// Index, in delivery order, of the first event not confirmed delivered.
    pub confirmed_offset: usize,
}

enum BatchResult {
    Submitted(RejectedEvents),
    Oversized,
    Failed(ApiError),
}

pub struct CloudWatchDelivery {
    limits: BatchLimits,
    retry: RetryPolicy,
}

impl CloudWatchDelivery {
    pub fn new(limits: BatchLimits, retry: RetryPolicy) -> Self {
        CloudWatchDelivery { limits, retry }
    }

    /// Delivers `events[offset..]` (in chronological order) to the target stream.
    ///
    /// Returns `PartialDelivery` whenever at least one event was not accepted.
    /// The reported offset lets a later attempt resume without resending the
    /// confirmed prefix.
    pub async fn deliver(
        &self,
        client: &dyn LogsApi,
        target: LogTarget<'_>,
        events: &[LogEvent],
        file_timestamp_ms: i64,
        offset: usize,
        token: &CancellationToken,
    ) -> Result<CloudWatchReport, DeliveryError> {
        let mut prepared = prepare_events(events, file_timestamp_ms);
        let total_events = prepared.len();

        if offset >= total_events {
            tracing::debug!(
                log_group = target.log_group,
                offset,
                total_events,
                "Nothing left to deliver"
            );
            return Ok(CloudWatchReport {
                stats: DeliveryStats::default(),
                confirmed_offset: total_events,
            });
        }

        self.ensure(
            "log_group",
            target,
            token,
            |_| client.log_group_exists(target.log_group),
            |_| client.create_log_group(target.log_group),
        )
        .await?;
        self.ensure(
            "log_stream",
            target,
            token,
            |_| client.log_stream_exists(target.log_group, target.log_stream),
            |_| client.create_log_stream(target.log_group, target.log_stream),
        )
        .await?;

        let remaining = prepared.split_off(offset);
        let batches = split_into_batches(remaining, &self.limits, offset);

        let mut stats = DeliveryStats::default();
        let mut confirmed_offset = offset;
        let mut confirmed_contiguous = true;
        let mut stopped = false;

        for batch in &batches {
            stats.total += batch.len();
            if stopped {
                continue;
            }

            let accepted = match self.submit(client, target, batch, token).await? {
                BatchResult::Submitted(rejected) => {
                    let failed = rejected.failed_count(batch.len());
                    stats.successful += batch.len() - failed;
                    stats.failed += failed;
                    rejected.accepted_prefix(batch.len())
                }
                BatchResult::Oversized => {
                    stats.failed += batch.len();
                    0
                }
                BatchResult::Failed(error) => {
                    tracing::warn!(
                        log_group = target.log_group,
                        log_stream = target.log_stream,
                        batch_start = batch.start,
                        error = %error,
                        "Batch submission failed, abandoning the remaining batches"
                    );
                    stats.failed += batch.len();
                    stopped = true;
                    0
                }
            };

            if confirmed_contiguous {
                confirmed_offset = batch.start + accepted;
                confirmed_contiguous = accepted == batch.len();
            }
        }

        // Batches skipped after a failed submission count as failed as well.
        let skipped = stats.total - stats.successful - stats.failed;
        stats.failed += skipped;

        counter!(EVENTS_DELIVERED, "destination" => "cloudwatch").increment(stats.successful as u64);
        counter!(EVENTS_FAILED, "destination" => "cloudwatch").increment(stats.failed as u64);

        tracing::info!(
            log_group = target.log_group,
            log_stream = target.log_stream,
            total = stats.total,
            successful = stats.successful,
            failed = stats.failed,
            batches = batches.len(),
            "Delivered events to log stream"
        );

        if stats.failed > 0 {
            return Err(DeliveryError::PartialDelivery {
                stats,
                confirmed_offset,
            });
        }

        Ok(CloudWatchReport {
            stats,
            confirmed_offset: total_events,
        })
    }

    /// Makes sure a log resource exists, creating it only when it is missing.
    ///
    /// Tenant roles may be allowed to write into a pre-provisioned group
    /// without being allowed to list or create groups. When neither the
    /// existence check nor the create call is permitted, delivery goes ahead
    /// and the submission reports whether the resource is really there.
    async fn ensure<E, EFut, C, CFut>(
        &self,
        resource: &'static str,
        target: LogTarget<'_>,
        token: &CancellationToken,
        exists: E,
        create: C,
    ) -> Result<(), DeliveryError>
    where
        E: Fn(u32) -> EFut,
        EFut: Future<Output = Result<bool, ApiError>>,
        C: Fn(u32) -> CFut,
        CFut: Future<Output = Result<(), ApiError>>,
    {
        let checked = match retry_with_backoff(
            &self.retry,
            token,
            ApiError::is_throttling_or_unavailable,
            exists,
        )
        .await
        {
            Ok(true) => return Ok(()),
            Ok(false) => true,
            Err(RetryError::Failed { error, .. }) if error.code == ACCESS_DENIED => {
                tracing::debug!(
                    resource,
                    log_group = target.log_group,
                    error = %error,
                    "Cannot check whether log resource exists"
                );
                false
            }
            Err(RetryError::Failed { error, .. }) => return Err(classify(error)),
            Err(RetryError::Cancelled) => return Err(DeliveryError::Cancelled),
        };

        match retry_with_backoff(
            &self.retry,
            token,
            ApiError::is_throttling_or_unavailable,
            create,
        )
        .await
        {
            Ok(()) => {
                tracing::debug!(resource, log_group = target.log_group, "Created log resource");
                Ok(())
            }
            Err(RetryError::Failed { error, .. }) if error.is_already_exists() => Ok(()),
            Err(RetryError::Failed { error, .. }) if !checked && error.code == ACCESS_DENIED => {
                tracing::warn!(
                    resource,
                    log_group = target.log_group,
                    log_stream = target.log_stream,
                    "Cannot verify or create log resource, assuming it exists"
                );
                Ok(())
            }
            Err(RetryError::Failed { error, .. }) => Err(classify(error)),
            Err(RetryError::Cancelled) => Err(DeliveryError::Cancelled),
        }
    }

    async fn submit(
        &self,
        client: &dyn LogsApi,
        target: LogTarget<'_>,
        batch: &Batch,
        token: &CancellationToken,
    ) -> Result<BatchResult, DeliveryError> {
        let started = Instant::now();
        let result = retry_with_backoff(
            &self.retry,
            token,
            ApiError::is_throttling_or_unavailable,
            |_| client.put_log_events(target.log_group, target.log_stream, &batch.events),
        )
        .await;
        histogram!(BATCH_SUBMIT_DURATION).record(started.elapsed().as_secs_f64());

        // A lone event above the request limit is still sent, but counts as
        // failed whatever the destination answers.
        if batch.is_oversized(&self.limits) {
            if matches!(result, Err(RetryError::Cancelled)) {
                return Err(DeliveryError::Cancelled);
            }
            tracing::warn!(
                log_group = target.log_group,
                batch_start = batch.start,
                bytes = batch.bytes,
                max_bytes = self.limits.max_bytes,
                accepted = result.is_ok(),
                "Sent event larger than the request size limit"
            );
            counter!(BATCHES_SUBMITTED, "result" => "oversized").increment(1);
            return Ok(BatchResult::Oversized);
        }

        match result {
            Ok(rejected) => {
                if !rejected.is_empty() {
                    tracing::warn!(
                        log_group = target.log_group,
                        batch_start = batch.start,
                        too_new_start = ?rejected.too_new_start,
                        too_old_end = ?rejected.too_old_end,
                        expired_end = ?rejected.expired_end,
                        "Destination rejected part of a batch"
                    );
                }
                counter!(BATCHES_SUBMITTED, "result" => "ok").increment(1);
                Ok(BatchResult::Submitted(rejected))
            }
            Err(RetryError::Failed { error, .. }) => {
                counter!(BATCHES_SUBMITTED, "result" => "error").increment(1);
                Ok(BatchResult::Failed(error))
            }
            Err(RetryError::Cancelled) => Err(DeliveryError::Cancelled),
        }
    }
}
