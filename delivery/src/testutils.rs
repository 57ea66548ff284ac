//! In-memory stand-ins for the remote services, shared by the unit tests.
use crate::cloudwatch::{LogsApi, OutputEvent, RejectedEvents};
use crate::config::{BatchLimits, DispatchConfig, EngineConfig};
use crate::credentials::{AssumeRoleRequest, CredentialBroker, RoleAssumer};
use crate::dispatch::{ClientFactory, Dispatcher};
use crate::errors::ApiError;
use crate::retry::RetryPolicy;
use crate::s3::{CopyObjectRequest, ObjectCopier};
use crate::staged_file::{StagedObject, StagedObjectReader};
use crate::tenant::{FileConfigStore, TenantConfigStore, TenantResolver};
use crate::types::{DeliveryConfig, Destination, TemporaryCredentials};
use crate::worker::{NotificationQueue, QueueMessage};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const STAGED_BUCKET: &str = "staging";
pub const STAGED_KEY: &str = "c1/acme/payment-svc/pod-1/20240101.json.gz";
pub const STAGED_AT: i64 = 1_700_000_000_000;

pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

pub fn cloudwatch_config(tenant_id: &str) -> DeliveryConfig {
    DeliveryConfig {
        tenant_id: tenant_id.into(),
        enabled: true,
        region: "eu-west-1".into(),
        destination: Destination::CloudWatch {
            role_arn: format!("arn:aws:iam::222222222222:role/{tenant_id}-log-distribution"),
            log_group_name: format!("/{tenant_id}/application"),
        },
    }
}

pub fn s3_config(tenant_id: &str, bucket_name: &str) -> DeliveryConfig {
    DeliveryConfig {
        tenant_id: tenant_id.into(),
        enabled: true,
        region: "us-east-1".into(),
        destination: Destination::S3 {
            bucket_name: bucket_name.into(),
            bucket_prefix: "logs".into(),
            role_arn: None,
        },
    }
}

#[derive(Default)]
pub struct FakeRoleAssumer {
    failure: Option<String>,
    calls: Mutex<Vec<(Option<String>, AssumeRoleRequest)>>,
}

impl FakeRoleAssumer {
    pub fn failing(code: &str) -> Self {
        FakeRoleAssumer {
            failure: Some(code.to_string()),
            ..Default::default()
        }
    }

    /// Role ARN of the calling credentials, and the request, for every call.
    pub fn calls(&self) -> Vec<(Option<String>, AssumeRoleRequest)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RoleAssumer for FakeRoleAssumer {
    async fn assume_role(
        &self,
        source: Option<&TemporaryCredentials>,
        request: &AssumeRoleRequest,
    ) -> Result<TemporaryCredentials, ApiError> {
        self.calls
            .lock()
            .unwrap()
            .push((source.map(|s| s.role_arn.clone()), request.clone()));

        if let Some(code) = &self.failure {
            return Err(ApiError::new(code.clone(), "not authorized to perform sts:AssumeRole"));
        }
        Ok(TemporaryCredentials {
            access_key_id: "ASIAFAKE".into(),
            secret_access_key: "secret".into(),
            session_token: request.session_name.clone(),
            expiration: None,
            role_arn: request.role_arn.clone(),
        })
    }

    async fn caller_account_id(&self) -> Result<String, ApiError> {
        Ok("111111111111".into())
    }
}

#[derive(Default)]
pub struct FakeLogsApi {
    setup_error: Option<ApiError>,
    put_results: Mutex<VecDeque<Result<RejectedEvents, ApiError>>>,
    groups: Mutex<BTreeSet<String>>,
    streams: Mutex<BTreeSet<(String, String)>>,
    describe_error: Option<ApiError>,
    delivered: Mutex<Vec<OutputEvent>>,
    create_calls: Mutex<usize>,
    put_calls: Mutex<usize>,
}

impl FakeLogsApi {
    /// Results returned by successive submissions. Once exhausted, every
    /// submission is fully accepted.
    pub fn with_put_results(self, results: Vec<Result<RejectedEvents, ApiError>>) -> Self {
        *self.put_results.lock().unwrap() = results.into();
        self
    }

    /// Every create call fails with `error`.
    pub fn with_setup_error(mut self, error: ApiError) -> Self {
        self.setup_error = Some(error);
        self
    }

    /// Every existence check fails with `error`.
    pub fn with_describe_error(mut self, error: ApiError) -> Self {
        self.describe_error = Some(error);
        self
    }

    /// The group and stream exist before delivery starts.
    pub fn with_existing_stream(self, log_group: &str, log_stream: &str) -> Self {
        self.groups.lock().unwrap().insert(log_group.to_string());
        self.streams
            .lock()
            .unwrap()
            .insert((log_group.to_string(), log_stream.to_string()));
        self
    }

    /// Events from submissions that returned successfully.
    pub fn delivered(&self) -> Vec<OutputEvent> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn streams(&self) -> Vec<(String, String)> {
        self.streams.lock().unwrap().iter().cloned().collect()
    }

    pub fn create_calls(&self) -> usize {
        *self.create_calls.lock().unwrap()
    }

    pub fn put_calls(&self) -> usize {
        *self.put_calls.lock().unwrap()
    }
}

fn already_exists() -> ApiError {
    ApiError::new("ResourceAlreadyExistsException", "The specified resource already exists")
}

#[async_trait]
impl LogsApi for FakeLogsApi {
    async fn log_group_exists(&self, log_group: &str) -> Result<bool, ApiError> {
        if let Some(error) = &self.describe_error {
            return Err(error.clone());
        }
        Ok(self.groups.lock().unwrap().contains(log_group))
    }

    async fn log_stream_exists(&self, log_group: &str, log_stream: &str) -> Result<bool, ApiError> {
        if let Some(error) = &self.describe_error {
            return Err(error.clone());
        }
        let stream = (log_group.to_string(), log_stream.to_string());
        Ok(self.streams.lock().unwrap().contains(&stream))
    }

    async fn create_log_group(&self, log_group: &str) -> Result<(), ApiError> {
        *self.create_calls.lock().unwrap() += 1;
        if let Some(error) = &self.setup_error {
            return Err(error.clone());
        }
        if self.groups.lock().unwrap().insert(log_group.to_string()) {
            Ok(())
        } else {
            Err(already_exists())
        }
    }

    async fn create_log_stream(&self, log_group: &str, log_stream: &str) -> Result<(), ApiError> {
        *self.create_calls.lock().unwrap() += 1;
        if let Some(error) = &self.setup_error {
            return Err(error.clone());
        }
        let stream = (log_group.to_string(), log_stream.to_string());
        if self.streams.lock().unwrap().insert(stream) {
            Ok(())
        } else {
            Err(already_exists())
        }
    }

    async fn put_log_events(
        &self,
        _log_group: &str,
        _log_stream: &str,
        events: &[OutputEvent],
    ) -> Result<RejectedEvents, ApiError> {
        *self.put_calls.lock().unwrap() += 1;
        let result = self
            .put_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(RejectedEvents::default()));
        if result.is_ok() {
            self.delivered.lock().unwrap().extend_from_slice(events);
        }
        result
    }
}

#[derive(Default)]
pub struct FakeObjectCopier {
    errors: HashMap<String, ApiError>,
    copies: Mutex<Vec<CopyObjectRequest>>,
}

impl FakeObjectCopier {
    pub fn with_missing_bucket(self, bucket: &str) -> Self {
        self.with_error(
            bucket,
            ApiError::new("NoSuchBucket", "The specified bucket does not exist"),
        )
    }

    pub fn with_error(mut self, bucket: &str, error: ApiError) -> Self {
        self.errors.insert(bucket.to_string(), error);
        self
    }

    /// Copies that succeeded.
    pub fn copies(&self) -> Vec<CopyObjectRequest> {
        self.copies.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectCopier for FakeObjectCopier {
    async fn copy_object(&self, request: &CopyObjectRequest) -> Result<(), ApiError> {
        if let Some(error) = self.errors.get(&request.destination_bucket) {
            return Err(error.clone());
        }
        self.copies.lock().unwrap().push(request.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStagedReader {
    objects: HashMap<(String, String), StagedObject>,
    read_error: Option<ApiError>,
}

impl FakeStagedReader {
    /// Every read fails with `error`.
    pub fn with_read_error(mut self, error: ApiError) -> Self {
        self.read_error = Some(error);
        self
    }

    pub fn with_object(
        mut self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        last_modified_ms: Option<i64>,
    ) -> Self {
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StagedObject {
                body,
                last_modified_ms,
            },
        );
        self
    }
}

#[async_trait]
impl StagedObjectReader for FakeStagedReader {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<StagedObject, ApiError> {
        if let Some(error) = &self.read_error {
            return Err(error.clone());
        }
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ApiError::new("NoSuchKey", "The specified key does not exist."))
    }
}

/// Hands out the shared fakes and records the identity and region of every client.
pub struct FakeClientFactory {
    logs: Arc<FakeLogsApi>,
    objects: Arc<FakeObjectCopier>,
    sessions: Mutex<Vec<(String, String)>>,
}

impl FakeClientFactory {
    pub fn new(logs: Arc<FakeLogsApi>, objects: Arc<FakeObjectCopier>) -> Self {
        FakeClientFactory {
            logs,
            objects,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// `(role_arn, region)` per client handed out.
    pub fn sessions(&self) -> Vec<(String, String)> {
        self.sessions.lock().unwrap().clone()
    }

    fn record(&self, credentials: &TemporaryCredentials, region: &str) {
        self.sessions
            .lock()
            .unwrap()
            .push((credentials.role_arn.clone(), region.to_string()));
    }
}

impl ClientFactory for FakeClientFactory {
    fn logs_client(&self, credentials: &TemporaryCredentials, region: &str) -> Arc<dyn LogsApi> {
        self.record(credentials, region);
        self.logs.clone()
    }

    fn object_client(
        &self,
        credentials: &TemporaryCredentials,
        region: &str,
    ) -> Arc<dyn ObjectCopier> {
        self.record(credentials, region);
        self.objects.clone()
    }
}

#[derive(Default)]
pub struct FakeQueue {
    pending: Mutex<VecDeque<QueueMessage>>,
    fail_sends: bool,
    deleted: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, Duration)>>,
}

impl FakeQueue {
    pub fn with_messages(self, bodies: &[&str]) -> Self {
        {
            let mut pending = self.pending.lock().unwrap();
            for (i, body) in bodies.iter().enumerate() {
                pending.push_back(QueueMessage {
                    message_id: format!("msg-{i}"),
                    body: body.to_string(),
                    receipt_handle: format!("handle-{i}"),
                });
            }
        }
        self
    }

    pub fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(String, Duration)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationQueue for FakeQueue {
    async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>, ApiError> {
        let mut pending = self.pending.lock().unwrap();
        let count = max_messages.min(pending.len());
        Ok(pending.drain(..count).collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), ApiError> {
        self.deleted.lock().unwrap().push(receipt_handle.to_string());
        Ok(())
    }

    async fn send(&self, body: &str, delay: Duration) -> Result<(), ApiError> {
        if self.fail_sends {
            return Err(ApiError::new("AWS.SimpleQueueService.NonExistentQueue", "gone"));
        }
        self.sent.lock().unwrap().push((body.to_string(), delay));
        Ok(())
    }
}

/// Ten events, one second apart, staged under [`STAGED_KEY`].
pub fn staged_reader() -> FakeStagedReader {
    let lines: Vec<String> = (0..10)
        .map(|i| {
            format!(
                r#"{{"timestamp": {}, "message": "event {i}"}}"#,
                STAGED_AT + i * 1000
            )
        })
        .collect();
    FakeStagedReader::default().with_object(
        STAGED_BUCKET,
        STAGED_KEY,
        gzip(&lines.join("\n")),
        Some(STAGED_AT),
    )
}

pub fn test_dispatcher_with(
    store: Arc<dyn TenantConfigStore>,
    reader: FakeStagedReader,
    clients: Arc<FakeClientFactory>,
) -> Dispatcher {
    let broker = CredentialBroker::new(
        Arc::new(FakeRoleAssumer::default()),
        "arn:aws:iam::111111111111:role/central-distribution".into(),
        "111111111111".into(),
    )
    .unwrap();
    let config = EngineConfig {
        batch: BatchLimits::default(),
        submit_retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        },
        dispatch: DispatchConfig::default(),
    };
    Dispatcher::new(
        TenantResolver::new(store),
        broker,
        Arc::new(reader),
        clients,
        &config,
    )
}

pub fn test_dispatcher(
    configs: Vec<DeliveryConfig>,
    logs: FakeLogsApi,
    objects: FakeObjectCopier,
) -> Dispatcher {
    test_dispatcher_with(
        Arc::new(FileConfigStore::from_configs(configs)),
        staged_reader(),
        Arc::new(FakeClientFactory::new(Arc::new(logs), Arc::new(objects))),
    )
}
