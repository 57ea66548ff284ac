//! Queue message codec.
//!
//! Object-created events arrive wrapped in a topic envelope whose `Message`
//! field holds the event as a JSON string. Events delivered straight from the
//! bucket (no envelope) are accepted as well. A requeued message is the
//! original envelope with a `processing_metadata` field added.
use crate::errors::DeliveryError;
use crate::types::ProcessingMetadata;
use serde::Deserialize;
use serde_json::{Map, Value};

const METADATA_FIELD: &str = "processing_metadata";

#[derive(Deserialize)]
struct ObjectEvent {
    #[serde(rename = "Records", default)]
    records: Vec<EventRecord>,
}

#[derive(Deserialize)]
struct EventRecord {
    s3: EventEntity,
}

#[derive(Deserialize)]
struct EventEntity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Deserialize)]
struct ObjectEntity {
    key: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub bucket: String,
    pub key: String,
    /// Present only on requeued messages.
    pub metadata: Option<ProcessingMetadata>,
    envelope: Map<String, Value>,
}

/// Object keys in event payloads are form-encoded.
fn decode_key(key: &str) -> Result<String, DeliveryError> {
    urlencoding::decode(&key.replace('+', " "))
        .map(|decoded| decoded.into_owned())
        .map_err(|e| DeliveryError::MalformedNotification(format!("object key {key:?}: {e}")))
}

impl Notification {
    pub fn parse(body: &str) -> Result<Self, DeliveryError> {
        let malformed = |what: String| DeliveryError::MalformedNotification(what);

        let mut envelope: Map<String, Value> =
            serde_json::from_str(body).map_err(|e| malformed(format!("envelope: {e}")))?;

        let metadata = match envelope.remove(METADATA_FIELD) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<ProcessingMetadata>(value)
                    .map_err(|e| malformed(format!("processing metadata: {e}")))?,
            ),
        };

        let event: ObjectEvent = match envelope.get("Message") {
            Some(Value::String(message)) => {
                serde_json::from_str(message).map_err(|e| malformed(format!("message: {e}")))?
            }
            Some(_) => return Err(malformed("message is not a string".to_string())),
            None => serde_json::from_value(Value::Object(envelope.clone()))
                .map_err(|e| malformed(format!("event: {e}")))?,
        };

        let mut records = event.records.into_iter();
        let Some(first) = records.next() else {
            return Err(malformed("no records".to_string()));
        };
        let ignored = records.len();
        if ignored > 0 {
            tracing::warn!(ignored, "Notification carries several records, processing the first");
        }

        Ok(Notification {
            bucket: first.s3.bucket.name,
            key: decode_key(&first.s3.object.key)?,
            metadata,
            envelope,
        })
    }

    /// A notification for an object named directly, outside the queue.
    pub fn for_object(bucket: &str, key: &str) -> Self {
        let event = serde_json::json!({
            "Records": [{"s3": {"bucket": {"name": bucket}, "object": {"key": key}}}]
        });
        let envelope = match event {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Notification {
            bucket: bucket.to_string(),
            key: key.to_string(),
            metadata: None,
            envelope,
        }
    }

    pub fn offset(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| m.offset)
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata.as_ref().map_or(0, |m| m.retry_count)
    }

    /// The original envelope with `metadata` attached.
    pub fn requeue_body(&self, metadata: &ProcessingMetadata) -> Result<String, serde_json::Error> {
        let mut envelope = self.envelope.clone();
        envelope.insert(METADATA_FIELD.to_string(), serde_json::to_value(metadata)?);
        serde_json::to_string(&envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn envelope(key: &str) -> String {
        let message = json!({
            "Records": [{"s3": {"bucket": {"name": "staging"}, "object": {"key": key}}}]
        });
        json!({
            "Type": "Notification",
            "MessageId": "b1946ac9",
            "Message": message.to_string(),
        })
        .to_string()
    }

    #[test]
    fn parses_wrapped_events() {
        let notification =
            Notification::parse(&envelope("c1/acme/payment-svc/pod-1/2024+01+01%3A00.json.gz"))
                .unwrap();
        assert_eq!(notification.bucket, "staging");
        assert_eq!(
            notification.key,
            "c1/acme/payment-svc/pod-1/2024 01 01:00.json.gz"
        );
        assert_eq!(notification.metadata, None);
        assert_eq!(notification.offset(), 0);
        assert_eq!(notification.retry_count(), 0);
    }

    #[test]
    fn parses_bare_events() {
        let body = json!({
            "Records": [
                {"s3": {"bucket": {"name": "staging"}, "object": {"key": "c1/a/b/c/d"}}},
                {"s3": {"bucket": {"name": "staging"}, "object": {"key": "c1/a/b/c/e"}}},
            ]
        })
        .to_string();
        let notification = Notification::parse(&body).unwrap();
        assert_eq!(notification.key, "c1/a/b/c/d");
    }

    #[test]
    fn requeue_body_round_trips_metadata() {
        let notification = Notification::parse(&envelope("c1/acme/app/pod/f.json.gz")).unwrap();
        let metadata = ProcessingMetadata {
            offset: 4,
            retry_count: 1,
            original_receipt_handle: "handle-1".into(),
            requeued_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };

        let body = notification.requeue_body(&metadata).unwrap();
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["MessageId"], "b1946ac9");
        assert_eq!(value["processing_metadata"]["offset"], 4);
        assert_eq!(value["processing_metadata"]["requeued_at"], "2024-01-01T00:00:00Z");

        let requeued = Notification::parse(&body).unwrap();
        assert_eq!(requeued.metadata, Some(metadata));
        assert_eq!(requeued.offset(), 4);
        assert_eq!(requeued.key, notification.key);
    }

    #[test]
    fn manual_notifications_can_be_requeued() {
        let notification = Notification::for_object("staging", "c1/acme/app/pod/f.json.gz");
        let metadata = ProcessingMetadata {
            offset: 0,
            retry_count: 1,
            original_receipt_handle: String::new(),
            requeued_at: Utc::now(),
        };
        let requeued = Notification::parse(&notification.requeue_body(&metadata).unwrap()).unwrap();
        assert_eq!(requeued.bucket, "staging");
        assert_eq!(requeued.key, "c1/acme/app/pod/f.json.gz");
    }

    #[test]
    fn rejects_malformed_messages() {
        for body in [
            "not json",
            r#"{"Message": 42}"#,
            r#"{"Message": "{\"Event\": \"s3:TestEvent\"}"}"#,
            r#"{"Records": []}"#,
        ] {
            let err = Notification::parse(body).unwrap_err();
            assert!(matches!(err, DeliveryError::MalformedNotification(_)), "{body}");
            assert!(!err.is_recoverable());
        }
    }
}
