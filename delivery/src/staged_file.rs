//! Reading and decoding staged log files.
//!
//! Collectors write gzip-compressed files holding either a JSON array of
//! records or one JSON record per line.
use crate::errors::{ApiError, DeliveryError};
use crate::s3::is_permanent_object_error;
use crate::types::{LogEvent, LogMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use serde_json::Value;
use std::io::Read;
use tokio_util::sync::CancellationToken;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Clone, Debug, PartialEq)]
pub struct StagedObject {
    pub body: Vec<u8>,
    pub last_modified_ms: Option<i64>,
}

#[async_trait]
pub trait StagedObjectReader: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<StagedObject, ApiError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct StagedFile {
    pub events: Vec<LogEvent>,
    /// Used for events that carry no timestamp of their own.
    pub timestamp_ms: i64,
}

pub async fn load_staged_file(
    reader: &dyn StagedObjectReader,
    bucket: &str,
    key: &str,
    token: &CancellationToken,
) -> Result<StagedFile, DeliveryError> {
    let object = tokio::select! {
        _ = token.cancelled() => return Err(DeliveryError::Cancelled),
        result = reader.get_object(bucket, key) => result.map_err(|error| {
            if is_permanent_object_error(&error) {
                DeliveryError::StagedObjectMissing(error)
            } else {
                DeliveryError::StagedObjectRead(error)
            }
        })?,
    };

    let events = decode_events(&object.body)?;
    tracing::debug!(bucket, key, events = events.len(), "Loaded staged file");

    Ok(StagedFile {
        events,
        timestamp_ms: object
            .last_modified_ms
            .unwrap_or_else(|| Utc::now().timestamp_millis()),
    })
}

pub fn decode_events(body: &[u8]) -> Result<Vec<LogEvent>, DeliveryError> {
    let text = if body.starts_with(&GZIP_MAGIC) {
        let mut text = String::new();
        MultiGzDecoder::new(body)
            .read_to_string(&mut text)
            .map_err(|e| DeliveryError::StagedObjectDecode(format!("gzip: {e}")))?;
        text
    } else {
        String::from_utf8(body.to_vec())
            .map_err(|e| DeliveryError::StagedObjectDecode(format!("utf-8: {e}")))?
    };

    let trimmed = text.trim_start();
    let records: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
            .map_err(|e| DeliveryError::StagedObjectDecode(format!("json array: {e}")))?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| {
                    DeliveryError::StagedObjectDecode(format!("line {}: {e}", i + 1))
                })
            })
            .collect::<Result<_, _>>()?
    };

    Ok(records.into_iter().map(record_to_event).collect())
}

fn record_to_event(record: Value) -> LogEvent {
    match record {
        Value::Object(mut fields) => {
            let timestamp = fields.get("timestamp").and_then(parse_timestamp);
            let message = match fields.remove("message") {
                Some(message) => LogMessage::from(message),
                None => LogMessage::Structured(Value::Object(fields)),
            };
            LogEvent { timestamp, message }
        }
        other => LogEvent {
            timestamp: None,
            message: LogMessage::from(other),
        },
    }
}

/// Accepts integer or fractional epoch values (seconds or milliseconds) and
/// RFC 3339 strings. Anything else is treated as missing.
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            let float = number.as_f64()?;
            // Fractional seconds keep their millisecond part.
            if float < crate::cloudwatch::batcher::SECONDS_THRESHOLD_MS as f64 {
                Some((float * 1000.0) as i64)
            } else {
                Some(float as i64)
            }
        }),
        Value::String(text) => text.parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|parsed| parsed.timestamp_millis())
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakeStagedReader, gzip};
    use serde_json::json;

    #[test]
    fn decodes_gzipped_ndjson() {
        let body = gzip(
            "{\"timestamp\": 1700000000000, \"message\": \"hello\"}\n\n{\"timestamp\": 1700000001, \"message\": {\"level\": \"info\"}}\n",
        );
        let events = decode_events(&body).unwrap();
        assert_eq!(
            events,
            vec![
                LogEvent::new(Some(1_700_000_000_000), "hello"),
                LogEvent::new(
                    Some(1_700_000_001),
                    LogMessage::Structured(json!({"level": "info"}))
                ),
            ]
        );
    }

    #[test]
    fn decodes_json_arrays() {
        let body = gzip(r#"[{"timestamp": "2024-01-01T00:00:00Z", "message": "a"}, "bare line"]"#);
        let events = decode_events(&body).unwrap();
        assert_eq!(
            events,
            vec![
                LogEvent::new(Some(1_704_067_200_000), "a"),
                LogEvent::new(None, "bare line"),
            ]
        );
    }

    #[test]
    fn record_without_message_is_the_message() {
        let body = gzip(r#"{"timestamp": 1700000000.5, "level": "warn", "msg": "disk"}"#);
        let events = decode_events(&body).unwrap();
        assert_eq!(events[0].timestamp, Some(1_700_000_000_500));
        assert_eq!(
            events[0].message,
            LogMessage::Structured(json!({"timestamp": 1700000000.5, "level": "warn", "msg": "disk"}))
        );
    }

    #[test]
    fn uncompressed_bodies_are_accepted() {
        let events = decode_events(br#"{"message": "plain"}"#).unwrap();
        assert_eq!(events, vec![LogEvent::new(None, "plain")]);
    }

    #[test]
    fn corrupt_content_is_not_recoverable() {
        for body in [gzip("{not json}\n"), vec![0x1f, 0x8b, 0x00, 0x01]] {
            let err = decode_events(&body).unwrap_err();
            assert!(matches!(err, DeliveryError::StagedObjectDecode(_)));
            assert!(!err.is_recoverable());
        }
    }

    #[tokio::test]
    async fn file_timestamp_comes_from_last_modified() {
        let reader = FakeStagedReader::default().with_object(
            "staging",
            "c1/acme/app/pod/f.json.gz",
            gzip(r#"{"message": "x"}"#),
            Some(1_700_000_000_000),
        );
        let file = load_staged_file(
            &reader,
            "staging",
            "c1/acme/app/pod/f.json.gz",
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(file.timestamp_ms, 1_700_000_000_000);
        assert_eq!(file.events.len(), 1);
    }

    #[tokio::test]
    async fn missing_object_is_not_recoverable() {
        let reader = FakeStagedReader::default();
        let err = load_staged_file(&reader, "staging", "missing", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::StagedObjectMissing(_)));
        assert!(!err.is_recoverable());

        let reader = FakeStagedReader::default()
            .with_read_error(ApiError::new("AccessDenied", "Access Denied"));
        let err = load_staged_file(&reader, "staging", "denied", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::StagedObjectMissing(_)));
    }

    #[tokio::test]
    async fn transient_read_failure_is_recoverable() {
        let reader = FakeStagedReader::default()
            .with_read_error(ApiError::new("SlowDown", "Please reduce your request rate."));
        let err = load_staged_file(&reader, "staging", "busy", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::StagedObjectRead(_)));
        assert!(err.is_recoverable());
    }
}
