//! Delivery into a tenant-owned bucket by server-side copy.
//!
//! The staged object is never downloaded: the copy runs inside the object store
//! with the central role's credentials, which the tenant's bucket policy trusts.
use crate::errors::{ApiError, DeliveryError};
use crate::metrics_defs::OBJECTS_COPIED;
use crate::retry::{RetryError, RetryPolicy, retry_with_backoff};
use crate::types::TenantInfo;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use shared::counter;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq)]
pub struct CopyObjectRequest {
    pub source_bucket: String,
    pub source_key: String,
    pub destination_bucket: String,
    pub destination_key: String,
    /// Replaces the source object's metadata on the copy.
    pub metadata: BTreeMap<String, String>,
}

/// Object store operations used for delivery.
///
/// Implementations grant the destination bucket owner full control over the
/// copied object.
#[async_trait]
pub trait ObjectCopier: Send + Sync {
    async fn copy_object(&self, request: &CopyObjectRequest) -> Result<(), ApiError>;
}

/// `{prefix}/{tenant}/{application}/{pod}/{filename}`. The cluster is internal
/// and is left out.
pub fn destination_key(prefix: &str, tenant: &TenantInfo) -> String {
    let path = format!(
        "{}/{}/{}/{}",
        tenant.tenant_id, tenant.application, tenant.pod_name, tenant.filename
    );
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        path
    } else {
        format!("{prefix}/{path}")
    }
}

pub fn provenance_metadata(
    source_bucket: &str,
    source_key: &str,
    tenant: &TenantInfo,
    delivered_at: DateTime<Utc>,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("source-bucket".to_string(), source_bucket.to_string()),
        ("source-key".to_string(), source_key.to_string()),
        ("tenant-id".to_string(), tenant.tenant_id.clone()),
        ("application".to_string(), tenant.application.clone()),
        ("pod-name".to_string(), tenant.pod_name.clone()),
        (
            "delivered-at".to_string(),
            delivered_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    ])
}

const PERMANENT_ERROR_CODES: &[&str] = &[
    "NoSuchBucket",
    "NoSuchKey",
    "AccessDenied",
    "NotFound",
    "Forbidden",
    "404",
    "403",
];

/// Missing bucket or key, or access refused. Retrying will not help.
pub(crate) fn is_permanent_object_error(error: &ApiError) -> bool {
    PERMANENT_ERROR_CODES.contains(&error.code.as_str())
}

fn classify(error: ApiError) -> DeliveryError {
    if is_permanent_object_error(&error) {
        DeliveryError::DestinationRejected(error)
    } else {
        DeliveryError::DestinationUnavailable(error)
    }
}

pub struct S3Delivery {
    retry: RetryPolicy,
}

impl S3Delivery {
    pub fn new(retry: RetryPolicy) -> Self {
        S3Delivery { retry }
    }

    /// Copies the staged object into the tenant's bucket and returns the key written.
    #[allow(clippy::too_many_arguments)]
    pub async fn deliver(
        &self,
        client: &dyn ObjectCopier,
        source_bucket: &str,
        source_key: &str,
        tenant: &TenantInfo,
        bucket_name: &str,
        bucket_prefix: &str,
        token: &CancellationToken,
    ) -> Result<String, DeliveryError> {
        let request = CopyObjectRequest {
            source_bucket: source_bucket.to_string(),
            source_key: source_key.to_string(),
            destination_bucket: bucket_name.to_string(),
            destination_key: destination_key(bucket_prefix, tenant),
            metadata: provenance_metadata(source_bucket, source_key, tenant, Utc::now()),
        };

        let result = retry_with_backoff(
            &self.retry,
            token,
            ApiError::is_throttling_or_unavailable,
            |_| client.copy_object(&request),
        )
        .await;

        match result {
            Ok(()) => {
                counter!(OBJECTS_COPIED, "result" => "ok").increment(1);
                tracing::info!(
                    tenant_id = %tenant.tenant_id,
                    bucket = bucket_name,
                    key = %request.destination_key,
                    "Copied staged object to tenant bucket"
                );
                Ok(request.destination_key)
            }
            Err(RetryError::Failed { error, .. }) => {
                counter!(OBJECTS_COPIED, "result" => "error").increment(1);
                Err(classify(error))
            }
            Err(RetryError::Cancelled) => Err(DeliveryError::Cancelled),
        }
    }
}
