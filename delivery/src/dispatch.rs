//! Per-notification control flow: resolve the tenant, deliver to every enabled
//! destination, and decide whether the queue message is acknowledged, requeued
//! with a resumption offset, or discarded.
use crate::cloudwatch::{CloudWatchDelivery, LogTarget, LogsApi};
use crate::config::{DispatchConfig, EngineConfig};
use crate::credentials::CredentialBroker;
use crate::errors::DeliveryError;
use crate::metrics_defs::{NOTIFICATIONS_PROCESSED, REQUEUES};
use crate::notification::Notification;
use crate::s3::{ObjectCopier, S3Delivery};
use crate::staged_file::{StagedFile, StagedObjectReader, load_staged_file};
use crate::tenant::TenantResolver;
use crate::types::{
    DeliveryConfig, DeliveryStats, Destination, DestinationKind, ProcessingMetadata,
    TemporaryCredentials, TenantInfo,
};
use chrono::Utc;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Builds service clients scoped to one set of credentials and one region.
pub trait ClientFactory: Send + Sync {
    fn logs_client(&self, credentials: &TemporaryCredentials, region: &str) -> Arc<dyn LogsApi>;

    fn object_client(&self, credentials: &TemporaryCredentials, region: &str)
    -> Arc<dyn ObjectCopier>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Remove the message from the queue.
    Acknowledge,
    /// Send `body` back to the queue after `delay`, then remove the original.
    Retry {
        metadata: ProcessingMetadata,
        delay: Duration,
        body: String,
    },
    /// The retry budget is spent. Remove the message.
    Discard,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Acknowledge => "acknowledge",
            Outcome::Retry { .. } => "retry",
            Outcome::Discard => "discard",
        }
    }
}

/// Result of delivering to one destination.
#[derive(Clone, Debug)]
pub struct LegReport {
    pub kind: DestinationKind,
    /// Log group or bucket name.
    pub target: String,
    pub stats: Option<DeliveryStats>,
    pub error: Option<DeliveryError>,
    /// Offset a later attempt must resume from for this leg to make progress.
    /// `None` when the leg does not constrain resumption.
    pub resume_offset: Option<usize>,
}

impl LegReport {
    fn failed(config: &DeliveryConfig, target: &str, error: DeliveryError, offset: usize) -> Self {
        let resume_offset = (config.kind() == DestinationKind::CloudWatch && error.is_recoverable())
            .then_some(offset);
        LegReport {
            kind: config.kind(),
            target: target.to_string(),
            stats: error.stats(),
            error: Some(error),
            resume_offset,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchReport {
    /// Summed over all legs; `None` when no delivery was attempted.
    pub stats: Option<DeliveryStats>,
    /// The first recoverable error, or else the first error.
    pub error: Option<DeliveryError>,
    pub legs: Vec<LegReport>,
    pub outcome: Outcome,
}

/// Delay before a requeued message becomes visible: `2^retry_count` seconds,
/// capped at `max_delay_secs`.
///
/// `retry_count` is the count the requeued message will carry, so the first
/// requeue (count 1) waits 2 seconds.
pub fn requeue_delay(retry_count: u32, max_delay_secs: u64) -> Duration {
    let secs = 1u64
        .checked_shl(retry_count)
        .unwrap_or(u64::MAX)
        .min(max_delay_secs);
    Duration::from_secs(secs)
}

pub struct Dispatcher {
    resolver: TenantResolver,
    broker: CredentialBroker,
    reader: Arc<dyn StagedObjectReader>,
    clients: Arc<dyn ClientFactory>,
    cloudwatch: CloudWatchDelivery,
    s3: S3Delivery,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        resolver: TenantResolver,
        broker: CredentialBroker,
        reader: Arc<dyn StagedObjectReader>,
        clients: Arc<dyn ClientFactory>,
        config: &EngineConfig,
    ) -> Self {
        Dispatcher {
            resolver,
            broker,
            reader,
            clients,
            cloudwatch: CloudWatchDelivery::new(config.batch.clone(), config.submit_retry.clone()),
            s3: S3Delivery::new(config.submit_retry.clone()),
            config: config.dispatch.clone(),
        }
    }

    /// Handles one raw queue message.
    pub async fn process(
        &self,
        body: &str,
        receipt_handle: &str,
        token: &CancellationToken,
    ) -> DispatchReport {
        match Notification::parse(body) {
            Ok(notification) => self.dispatch(&notification, receipt_handle, token).await,
            Err(error) => {
                tracing::warn!(error = %error, "Dropping malformed notification");
                let report = DispatchReport {
                    stats: None,
                    error: Some(error),
                    legs: Vec::new(),
                    outcome: Outcome::Acknowledge,
                };
                counter!(NOTIFICATIONS_PROCESSED, "outcome" => report.outcome.as_str()).increment(1);
                report
            }
        }
    }

    pub async fn dispatch(
        &self,
        notification: &Notification,
        receipt_handle: &str,
        token: &CancellationToken,
    ) -> DispatchReport {
        let resolution = match self.resolver.resolve(&notification.key).await {
            Ok(resolution) => resolution,
            Err(error) => return self.conclude(notification, receipt_handle, Vec::new(), Some(error)),
        };

        let offset = notification.offset();
        let staged = OnceCell::new();
        let mut legs = Vec::with_capacity(resolution.configs.len());

        for config in &resolution.configs {
            let leg = match &config.destination {
                Destination::CloudWatch { log_group_name, .. } => {
                    let file = staged
                        .get_or_init(|| {
                            load_staged_file(
                                self.reader.as_ref(),
                                &notification.bucket,
                                &notification.key,
                                token,
                            )
                        })
                        .await;
                    self.deliver_cloudwatch(
                        &resolution.tenant,
                        config,
                        log_group_name,
                        file,
                        offset,
                        token,
                    )
                    .await
                }
                Destination::S3 {
                    bucket_name,
                    bucket_prefix,
                    ..
                } => {
                    self.deliver_s3(
                        notification,
                        &resolution.tenant,
                        config,
                        bucket_name,
                        bucket_prefix,
                        token,
                    )
                    .await
                }
            };

            if let Some(error) = &leg.error {
                tracing::warn!(
                    tenant_id = %config.tenant_id,
                    destination = config.kind().as_str(),
                    target = %leg.target,
                    recoverable = error.is_recoverable(),
                    error = %error,
                    "Delivery to destination failed"
                );
            }
            legs.push(leg);
        }

        self.conclude(notification, receipt_handle, legs, None)
    }

    async fn deliver_cloudwatch(
        &self,
        tenant: &TenantInfo,
        config: &DeliveryConfig,
        log_group: &str,
        file: &Result<StagedFile, DeliveryError>,
        offset: usize,
        token: &CancellationToken,
    ) -> LegReport {
        let file = match file {
            Ok(file) => file,
            Err(error) => return LegReport::failed(config, log_group, error.clone(), offset),
        };

        let credentials = match self.broker.credentials_for(config, token).await {
            Ok(credentials) => credentials,
            Err(error) => return LegReport::failed(config, log_group, error, offset),
        };
        let client = self.clients.logs_client(&credentials, &config.region);

        let target = LogTarget {
            log_group,
            log_stream: &tenant.pod_name,
        };
        match self
            .cloudwatch
            .deliver(
                client.as_ref(),
                target,
                &file.events,
                file.timestamp_ms,
                offset,
                token,
            )
            .await
        {
            Ok(report) => LegReport {
                kind: DestinationKind::CloudWatch,
                target: log_group.to_string(),
                stats: Some(report.stats),
                error: None,
                resume_offset: Some(report.confirmed_offset),
            },
            Err(DeliveryError::PartialDelivery {
                stats,
                confirmed_offset,
            }) => LegReport {
                kind: DestinationKind::CloudWatch,
                target: log_group.to_string(),
                stats: Some(stats),
                error: Some(DeliveryError::PartialDelivery {
                    stats,
                    confirmed_offset,
                }),
                resume_offset: Some(confirmed_offset),
            },
            Err(error) => LegReport::failed(config, log_group, error, offset),
        }
    }

    async fn deliver_s3(
        &self,
        notification: &Notification,
        tenant: &TenantInfo,
        config: &DeliveryConfig,
        bucket_name: &str,
        bucket_prefix: &str,
        token: &CancellationToken,
    ) -> LegReport {
        let credentials = match self.broker.credentials_for(config, token).await {
            Ok(credentials) => credentials,
            Err(error) => return LegReport::failed(config, bucket_name, error, 0),
        };
        let client = self.clients.object_client(&credentials, &config.region);

        let result = self
            .s3
            .deliver(
                client.as_ref(),
                &notification.bucket,
                &notification.key,
                tenant,
                bucket_name,
                bucket_prefix,
                token,
            )
            .await;

        // An object copy counts as a single unit.
        let (stats, error) = match result {
            Ok(_) => (
                DeliveryStats {
                    total: 1,
                    successful: 1,
                    failed: 0,
                },
                None,
            ),
            Err(DeliveryError::Cancelled) => {
                return LegReport::failed(config, bucket_name, DeliveryError::Cancelled, 0);
            }
            Err(error) => (
                DeliveryStats {
                    total: 1,
                    successful: 0,
                    failed: 1,
                },
                Some(error),
            ),
        };

        LegReport {
            kind: DestinationKind::S3,
            target: bucket_name.to_string(),
            stats: Some(stats),
            error,
            resume_offset: None,
        }
    }

    fn conclude(
        &self,
        notification: &Notification,
        receipt_handle: &str,
        legs: Vec<LegReport>,
        early_error: Option<DeliveryError>,
    ) -> DispatchReport {
        let errors: Vec<&DeliveryError> = early_error
            .iter()
            .chain(legs.iter().filter_map(|leg| leg.error.as_ref()))
            .collect();

        let error = errors
            .iter()
            .find(|error| error.is_recoverable())
            .or_else(|| errors.first())
            .map(|error| (*error).clone());

        let stats = legs
            .iter()
            .filter_map(|leg| leg.stats)
            .reduce(|mut sum, stats| {
                sum += stats;
                sum
            });

        let outcome = match &error {
            Some(error) if error.is_recoverable() => {
                let offset = legs
                    .iter()
                    .filter_map(|leg| leg.resume_offset)
                    .min()
                    .unwrap_or_else(|| notification.offset());
                self.requeue(notification, receipt_handle, offset)
            }
            Some(error) => {
                tracing::warn!(
                    bucket = %notification.bucket,
                    key = %notification.key,
                    error = %error,
                    kind = error.kind(),
                    "Acknowledging notification that cannot be delivered"
                );
                Outcome::Acknowledge
            }
            None => Outcome::Acknowledge,
        };

        counter!(NOTIFICATIONS_PROCESSED, "outcome" => outcome.as_str()).increment(1);

        DispatchReport {
            stats,
            error,
            legs,
            outcome,
        }
    }

    fn requeue(&self, notification: &Notification, receipt_handle: &str, offset: usize) -> Outcome {
        let retry_count = notification.retry_count() + 1;
        if retry_count > self.config.max_retries {
            tracing::error!(
                bucket = %notification.bucket,
                key = %notification.key,
                retry_count,
                offset,
                "Discarding notification after exhausting retries"
            );
            return Outcome::Discard;
        }

        let original_receipt_handle = notification
            .metadata
            .as_ref()
            .map(|metadata| metadata.original_receipt_handle.clone())
            .filter(|handle| !handle.is_empty())
            .unwrap_or_else(|| receipt_handle.to_string());

        let metadata = ProcessingMetadata {
            offset,
            retry_count,
            original_receipt_handle,
            requeued_at: Utc::now(),
        };
        let delay = requeue_delay(retry_count, self.config.max_requeue_delay_secs);

        match notification.requeue_body(&metadata) {
            Ok(body) => {
                counter!(REQUEUES).increment(1);
                tracing::info!(
                    bucket = %notification.bucket,
                    key = %notification.key,
                    retry_count,
                    offset,
                    delay_secs = delay.as_secs(),
                    "Requeueing notification"
                );
                Outcome::Retry {
                    metadata,
                    delay,
                    body,
                }
            }
            Err(error) => {
                tracing::error!(
                    key = %notification.key,
                    error = %error,
                    "Could not render requeue message, discarding notification"
                );
                Outcome::Discard
            }
        }
    }
}
