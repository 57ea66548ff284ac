use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::time::SystemTime;

/// Payload of a single log record.
///
/// Collectors emit either plain text lines or structured JSON documents. Both
/// are carried as-is until the delivery boundary, where `to_text` applies the
/// single serialization rule.
#[derive(Clone, Debug, PartialEq)]
pub enum LogMessage {
    Text(String),
    Structured(serde_json::Value),
}

impl LogMessage {
    pub fn to_text(&self) -> String {
        match self {
            LogMessage::Text(text) => text.clone(),
            LogMessage::Structured(value) => value.to_string(),
        }
    }
}

impl From<serde_json::Value> for LogMessage {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => LogMessage::Text(text),
            other => LogMessage::Structured(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogEvent {
    /// Milliseconds or seconds since the epoch, as written by the collector.
    pub timestamp: Option<i64>,
    pub message: LogMessage,
}

impl LogEvent {
    pub fn new<M: Into<LogMessage>>(timestamp: Option<i64>, message: M) -> Self {
        LogEvent {
            timestamp,
            message: message.into(),
        }
    }
}

impl From<&str> for LogMessage {
    fn from(text: &str) -> Self {
        LogMessage::Text(text.to_string())
    }
}

impl From<String> for LogMessage {
    fn from(text: String) -> Self {
        LogMessage::Text(text)
    }
}

/// Identity of a staged object, taken from its key path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantInfo {
    pub cluster_id: String,
    pub tenant_id: String,
    pub application: String,
    pub pod_name: String,
    pub filename: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    CloudWatch,
    S3,
}

impl DestinationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::CloudWatch => "cloudwatch",
            DestinationKind::S3 => "s3",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum Destination {
    CloudWatch {
        role_arn: String,
        log_group_name: String,
    },
    S3 {
        bucket_name: String,
        #[serde(default)]
        bucket_prefix: String,
        /// Not assumed by the single-hop flow; the bucket policy grants the
        /// central role directly.
        #[serde(default)]
        role_arn: Option<String>,
    },
}

impl Destination {
    pub fn kind(&self) -> DestinationKind {
        match self {
            Destination::CloudWatch { .. } => DestinationKind::CloudWatch,
            Destination::S3 { .. } => DestinationKind::S3,
        }
    }
}

/// One configured destination for one tenant.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DeliveryConfig {
    pub tenant_id: String,
    pub enabled: bool,
    pub region: String,
    #[serde(flatten)]
    pub destination: Destination,
}

impl DeliveryConfig {
    pub fn kind(&self) -> DestinationKind {
        self.destination.kind()
    }
}

/// Resumption state carried on a requeued notification.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProcessingMetadata {
    /// Number of events (in delivery order) already confirmed by the destination.
    pub offset: usize,
    pub retry_count: u32,
    #[serde(default)]
    pub original_receipt_handle: String,
    pub requeued_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl DeliveryStats {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

impl AddAssign for DeliveryStats {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.successful += other.successful;
        self.failed += other.failed;
    }
}

/// Short-lived credentials returned by a role assumption.
#[derive(Clone, PartialEq)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: Option<SystemTime>,
    /// Role these credentials act as. Used for logging only.
    pub role_arn: String,
}

impl std::fmt::Debug for TemporaryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("role_arn", &self.role_arn)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_messages_serialize_as_json() {
        let message = LogMessage::from(serde_json::json!({"level": "info", "n": 1}));
        assert_eq!(message.to_text(), r#"{"level":"info","n":1}"#);

        let message = LogMessage::from(serde_json::json!("plain line"));
        assert_eq!(message, LogMessage::Text("plain line".into()));
        assert_eq!(message.to_text(), "plain line");
    }

    #[test]
    fn delivery_config_deserializes_by_type() {
        let cloudwatch: DeliveryConfig = serde_json::from_str(
            r#"{
                "tenant_id": "acme",
                "type": "cloudwatch",
                "enabled": true,
                "region": "eu-west-1",
                "role_arn": "arn:aws:iam::123456789012:role/log-distribution",
                "log_group_name": "/acme/logs"
            }"#,
        )
        .unwrap();
        assert_eq!(cloudwatch.kind(), DestinationKind::CloudWatch);

        let s3: DeliveryConfig = serde_json::from_str(
            r#"{
                "tenant_id": "acme",
                "type": "s3",
                "enabled": false,
                "region": "us-east-1",
                "bucket_name": "acme-logs"
            }"#,
        )
        .unwrap();
        assert_eq!(
            s3.destination,
            Destination::S3 {
                bucket_name: "acme-logs".into(),
                bucket_prefix: "".into(),
                role_arn: None,
            }
        );
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let credentials = TemporaryCredentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "very-secret".into(),
            session_token: "token".into(),
            expiration: None,
            role_arn: "arn:aws:iam::123456789012:role/central".into(),
        };
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("\"token\""));
    }
}
