//! AWS SDK implementations of the engine's service traits.
use crate::cloudwatch::{LogsApi, OutputEvent, RejectedEvents};
use crate::credentials::{AssumeRoleRequest, RoleAssumer};
use crate::dispatch::ClientFactory;
use crate::errors::{ApiError, codes};
use crate::s3::{CopyObjectRequest, ObjectCopier};
use crate::staged_file::{StagedObject, StagedObjectReader};
use crate::tenant::TenantConfigStore;
use crate::types::{DeliveryConfig, TemporaryCredentials};
use crate::worker::{NotificationQueue, QueueMessage, WorkerConfig};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_cloudwatchlogs::types::InputLogEvent;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{MetadataDirective, ObjectCannedAcl};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const CREDENTIALS_PROVIDER_NAME: &str = "logship-assumed-role";

/// Loads the process's ambient AWS configuration, optionally pinning the region.
pub async fn load_sdk_config(region: Option<String>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region));
    }
    loader.load().await
}

fn api_error<E, R>(error: SdkError<E, R>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&error).to_string();
    let code = match &error {
        SdkError::TimeoutError(_) => codes::TIMEOUT,
        SdkError::DispatchFailure(_) => codes::NETWORK,
        SdkError::ServiceError(service) => service.err().code().unwrap_or("Unknown"),
        SdkError::ConstructionFailure(_) => codes::INVALID_REQUEST,
        _ => codes::INVALID_RESPONSE,
    };
    ApiError::new(code, message)
}

fn sdk_credentials(credentials: &TemporaryCredentials) -> aws_sdk_sts::config::Credentials {
    aws_sdk_sts::config::Credentials::new(
        credentials.access_key_id.clone(),
        credentials.secret_access_key.clone(),
        Some(credentials.session_token.clone()),
        credentials.expiration,
        CREDENTIALS_PROVIDER_NAME,
    )
}

pub struct StsRoleAssumer {
    sdk_config: SdkConfig,
    client: aws_sdk_sts::Client,
}

impl StsRoleAssumer {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        StsRoleAssumer {
            sdk_config: sdk_config.clone(),
            client: aws_sdk_sts::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl RoleAssumer for StsRoleAssumer {
    async fn assume_role(
        &self,
        source: Option<&TemporaryCredentials>,
        request: &AssumeRoleRequest,
    ) -> Result<TemporaryCredentials, ApiError> {
        let client = match source {
            None => self.client.clone(),
            Some(source) => aws_sdk_sts::Client::from_conf(
                aws_sdk_sts::config::Builder::from(&self.sdk_config)
                    .credentials_provider(sdk_credentials(source))
                    .build(),
            ),
        };

        let output = client
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .set_external_id(request.external_id.clone())
            .send()
            .await
            .map_err(api_error)?;

        let credentials = output.credentials().ok_or_else(|| {
            ApiError::new(codes::INVALID_RESPONSE, "AssumeRole returned no credentials")
        })?;

        Ok(TemporaryCredentials {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            expiration: SystemTime::try_from(*credentials.expiration()).ok(),
            role_arn: request.role_arn.clone(),
        })
    }

    async fn caller_account_id(&self) -> Result<String, ApiError> {
        let output = self
            .client
            .get_caller_identity()
            .send()
            .await
            .map_err(api_error)?;
        output.account().map(str::to_string).ok_or_else(|| {
            ApiError::new(codes::INVALID_RESPONSE, "GetCallerIdentity returned no account")
        })
    }
}

pub struct CloudWatchLogsClient {
    client: aws_sdk_cloudwatchlogs::Client,
}

#[async_trait]
impl LogsApi for CloudWatchLogsClient {
    async fn log_group_exists(&self, log_group: &str) -> Result<bool, ApiError> {
        let mut next_token = None;
        loop {
            let output = self
                .client
                .describe_log_groups()
                .log_group_name_prefix(log_group)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(api_error)?;
            if output
                .log_groups()
                .iter()
                .any(|group| group.log_group_name() == Some(log_group))
            {
                return Ok(true);
            }
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(false),
            }
        }
    }

    async fn log_stream_exists(&self, log_group: &str, log_stream: &str) -> Result<bool, ApiError> {
        let mut next_token = None;
        loop {
            let result = self
                .client
                .describe_log_streams()
                .log_group_name(log_group)
                .log_stream_name_prefix(log_stream)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(api_error);
            let output = match result {
                Ok(output) => output,
                Err(error) if error.code == "ResourceNotFoundException" => return Ok(false),
                Err(error) => return Err(error),
            };
            if output
                .log_streams()
                .iter()
                .any(|stream| stream.log_stream_name() == Some(log_stream))
            {
                return Ok(true);
            }
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(false),
            }
        }
    }

    async fn create_log_group(&self, log_group: &str) -> Result<(), ApiError> {
        self.client
            .create_log_group()
            .log_group_name(log_group)
            .send()
            .await
            .map(|_| ())
            .map_err(api_error)
    }

    async fn create_log_stream(&self, log_group: &str, log_stream: &str) -> Result<(), ApiError> {
        self.client
            .create_log_stream()
            .log_group_name(log_group)
            .log_stream_name(log_stream)
            .send()
            .await
            .map(|_| ())
            .map_err(api_error)
    }

    async fn put_log_events(
        &self,
        log_group: &str,
        log_stream: &str,
        events: &[OutputEvent],
    ) -> Result<RejectedEvents, ApiError> {
        let input = events
            .iter()
            .map(|event| {
                InputLogEvent::builder()
                    .timestamp(event.timestamp)
                    .message(event.message.clone())
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ApiError::new(codes::INVALID_REQUEST, e.to_string()))?;

        let output = self
            .client
            .put_log_events()
            .log_group_name(log_group)
            .log_stream_name(log_stream)
            .set_log_events(Some(input))
            .send()
            .await
            .map_err(api_error)?;

        let index = |i: Option<i32>| i.and_then(|i| usize::try_from(i).ok());
        Ok(output
            .rejected_log_events_info()
            .map(|info| RejectedEvents {
                too_new_start: index(info.too_new_log_event_start_index()),
                too_old_end: index(info.too_old_log_event_end_index()),
                expired_end: index(info.expired_log_event_end_index()),
            })
            .unwrap_or_default())
    }
}

/// Copy URL source: `bucket/key` with the key percent-encoded, slashes kept.
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{bucket}/{}", encoded.join("/"))
}

pub struct S3Client {
    client: aws_sdk_s3::Client,
}

impl S3Client {
    /// Client acting as the process's own identity.
    pub fn new(sdk_config: &SdkConfig) -> Self {
        S3Client {
            client: aws_sdk_s3::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl ObjectCopier for S3Client {
    async fn copy_object(&self, request: &CopyObjectRequest) -> Result<(), ApiError> {
        let metadata: HashMap<String, String> = request
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        self.client
            .copy_object()
            .copy_source(copy_source(&request.source_bucket, &request.source_key))
            .bucket(&request.destination_bucket)
            .key(&request.destination_key)
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map(|_| ())
            .map_err(api_error)
    }
}

#[async_trait]
impl StagedObjectReader for S3Client {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<StagedObject, ApiError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(api_error)?;

        let last_modified_ms = output.last_modified().and_then(|at| at.to_millis().ok());
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ApiError::new(codes::NETWORK, e.to_string()))?
            .into_bytes()
            .to_vec();

        Ok(StagedObject {
            body,
            last_modified_ms,
        })
    }
}

/// Builds clients that act as assumed-role credentials in the destination region.
pub struct AwsClientFactory {
    sdk_config: SdkConfig,
}

impl AwsClientFactory {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        AwsClientFactory {
            sdk_config: sdk_config.clone(),
        }
    }
}

impl ClientFactory for AwsClientFactory {
    fn logs_client(&self, credentials: &TemporaryCredentials, region: &str) -> Arc<dyn LogsApi> {
        let config = aws_sdk_cloudwatchlogs::config::Builder::from(&self.sdk_config)
            .credentials_provider(sdk_credentials(credentials))
            .region(aws_sdk_cloudwatchlogs::config::Region::new(region.to_string()))
            .build();
        Arc::new(CloudWatchLogsClient {
            client: aws_sdk_cloudwatchlogs::Client::from_conf(config),
        })
    }

    fn object_client(
        &self,
        credentials: &TemporaryCredentials,
        region: &str,
    ) -> Arc<dyn ObjectCopier> {
        let config = aws_sdk_s3::config::Builder::from(&self.sdk_config)
            .credentials_provider(sdk_credentials(credentials))
            .region(aws_sdk_s3::config::Region::new(region.to_string()))
            .build();
        Arc::new(S3Client {
            client: aws_sdk_s3::Client::from_conf(config),
        })
    }
}

fn attribute_to_json(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => serde_json::from_str(n).unwrap_or_else(|_| Value::String(n.clone())),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attribute_to_json(v)))
                .collect(),
        ),
        AttributeValue::L(list) => Value::Array(list.iter().map(attribute_to_json).collect()),
        AttributeValue::Ss(set) => Value::Array(set.iter().cloned().map(Value::String).collect()),
        _ => Value::Null,
    }
}

fn decode_item(item: &HashMap<String, AttributeValue>) -> Result<DeliveryConfig, serde_json::Error> {
    let object: Map<String, Value> = item
        .iter()
        .filter(|(_, value)| !matches!(value, AttributeValue::Null(_)))
        .map(|(k, v)| (k.clone(), attribute_to_json(v)))
        .collect();
    serde_json::from_value(Value::Object(object))
}

/// Delivery configs in a table keyed by `tenant_id` (partition) and `type` (sort).
pub struct DynamoConfigStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoConfigStore {
    pub fn new(sdk_config: &SdkConfig, table: String) -> Self {
        DynamoConfigStore {
            client: aws_sdk_dynamodb::Client::new(sdk_config),
            table,
        }
    }
}

#[async_trait]
impl TenantConfigStore for DynamoConfigStore {
    async fn load(&self, tenant_id: &str) -> Result<Vec<DeliveryConfig>, ApiError> {
        let mut configs = Vec::new();
        let mut start_key = None;

        loop {
            let output = self
                .client
                .query()
                .table_name(&self.table)
                .key_condition_expression("tenant_id = :tenant_id")
                .expression_attribute_values(":tenant_id", AttributeValue::S(tenant_id.to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(api_error)?;

            for item in output.items() {
                match decode_item(item) {
                    Ok(config) => configs.push(config),
                    Err(error) => tracing::warn!(
                        tenant_id,
                        table = %self.table,
                        error = %error,
                        "Skipping undecodable delivery config"
                    ),
                }
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(configs)
    }
}

pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    wait_time_secs: i32,
    visibility_timeout_secs: i32,
}

impl SqsQueue {
    pub fn new(sdk_config: &SdkConfig, queue_url: String, config: &WorkerConfig) -> Self {
        SqsQueue {
            client: aws_sdk_sqs::Client::new(sdk_config),
            queue_url,
            wait_time_secs: i32::try_from(config.wait_time_secs).unwrap_or(20),
            visibility_timeout_secs: i32::try_from(config.visibility_timeout_secs).unwrap_or(300),
        }
    }
}

#[async_trait]
impl NotificationQueue for SqsQueue {
    async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>, ApiError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(i32::try_from(max_messages).unwrap_or(10))
            .wait_time_seconds(self.wait_time_secs)
            .visibility_timeout(self.visibility_timeout_secs)
            .send()
            .await
            .map_err(api_error)?;

        Ok(output
            .messages()
            .iter()
            .filter_map(|message| {
                Some(QueueMessage {
                    message_id: message.message_id().unwrap_or_default().to_string(),
                    body: message.body()?.to_string(),
                    receipt_handle: message.receipt_handle()?.to_string(),
                })
            })
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), ApiError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map(|_| ())
            .map_err(api_error)
    }

    async fn send(&self, body: &str, delay: Duration) -> Result<(), ApiError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .delay_seconds(i32::try_from(delay.as_secs()).unwrap_or(900))
            .send()
            .await
            .map(|_| ())
            .map_err(api_error)
    }
}
