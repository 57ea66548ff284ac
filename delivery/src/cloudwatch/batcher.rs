//! Event preparation and request batching for the managed log service.
//!
//! The service enforces three limits per PutLogEvents request: event count, total
//! payload bytes (message UTF-8 length plus a fixed overhead per event) and the
//! time span covered by the batch. Each candidate event is checked against the
//! batch *before* it is appended; a batch that would overflow is closed first.
use crate::config::BatchLimits;
use crate::types::LogEvent;

/// 2001-01-01T00:00:00Z in milliseconds. Smaller timestamps are taken to be
/// seconds, matching the collector's own convention.
pub const SECONDS_THRESHOLD_MS: i64 = 978_307_200_000;

pub fn normalize_timestamp(timestamp: i64) -> i64 {
    if timestamp < SECONDS_THRESHOLD_MS {
        timestamp.saturating_mul(1000)
    } else {
        timestamp
    }
}

/// An event ready for submission: normalized timestamp, serialized message.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputEvent {
    pub timestamp: i64,
    pub message: String,
}

/// Fills missing timestamps with the file timestamp, normalizes them to
/// milliseconds and orders events chronologically.
///
/// The sort is stable, so events sharing a timestamp keep their file order and
/// the resulting sequence is identical on every attempt for the same file.
pub fn prepare_events(events: &[LogEvent], file_timestamp_ms: i64) -> Vec<OutputEvent> {
    let mut prepared: Vec<OutputEvent> = events
        .iter()
        .map(|event| OutputEvent {
            timestamp: normalize_timestamp(event.timestamp.unwrap_or(file_timestamp_ms)),
            message: event.message.to_text(),
        })
        .collect();
    prepared.sort_by_key(|event| event.timestamp);
    prepared
}

#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    /// Position of the first event in the full delivery sequence.
    pub start: usize,
    pub events: Vec<OutputEvent>,
    pub bytes: usize,
}

impl Batch {
    fn starting_at(start: usize) -> Self {
        Batch {
            start,
            events: Vec::new(),
            bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Only possible for a batch holding a single event that alone exceeds the byte limit.
    pub fn is_oversized(&self, limits: &BatchLimits) -> bool {
        self.bytes > limits.max_bytes
    }

    fn would_overflow(&self, event: &OutputEvent, size: usize, limits: &BatchLimits) -> bool {
        let Some(first) = self.events.first() else {
            return false;
        };

        self.events.len() + 1 > limits.max_events
            || self.bytes + size > limits.max_bytes
            || event.timestamp.saturating_sub(first.timestamp) > limits.max_span_ms
    }

    fn push(&mut self, event: OutputEvent, size: usize) {
        self.bytes += size;
        self.events.push(event);
    }
}

pub fn event_size(event: &OutputEvent, limits: &BatchLimits) -> usize {
    event.message.len() + limits.event_overhead
}

/// Splits chronologically ordered events into batches that each respect `limits`.
///
/// `first_index` is the position of `events[0]` in the full delivery sequence
/// and is used to number the batches.
pub fn split_into_batches(
    events: Vec<OutputEvent>,
    limits: &BatchLimits,
    first_index: usize,
) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current = Batch::starting_at(first_index);

    for (i, event) in events.into_iter().enumerate() {
        let size = event_size(&event, limits);
        if current.would_overflow(&event, size, limits) {
            let next = Batch::starting_at(first_index + i);
            batches.push(std::mem::replace(&mut current, next));
        }
        current.push(event, size);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Rejection boundaries reported by an otherwise successful submission.
///
/// The end indices are inclusive: every event up to and including them was
/// rejected. `too_new_start` rejects every event from that index on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RejectedEvents {
    pub too_new_start: Option<usize>,
    pub too_old_end: Option<usize>,
    pub expired_end: Option<usize>,
}

impl RejectedEvents {
    pub fn is_empty(&self) -> bool {
        self.too_new_start.is_none() && self.too_old_end.is_none() && self.expired_end.is_none()
    }

    fn rejected_prefix(&self, batch_len: usize) -> usize {
        self.too_old_end
            .max(self.expired_end)
            .map_or(0, |end| end + 1)
            .min(batch_len)
    }

    fn rejected_suffix_start(&self, batch_len: usize) -> usize {
        self.too_new_start
            .unwrap_or(batch_len)
            .clamp(self.rejected_prefix(batch_len), batch_len)
    }

    pub fn failed_count(&self, batch_len: usize) -> usize {
        let prefix = self.rejected_prefix(batch_len);
        prefix + (batch_len - self.rejected_suffix_start(batch_len))
    }

    /// Events accepted contiguously from the start of the batch.
    pub fn accepted_prefix(&self, batch_len: usize) -> usize {
        if self.rejected_prefix(batch_len) > 0 {
            0
        } else {
            self.rejected_suffix_start(batch_len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogMessage;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const T: i64 = 1_700_000_000_000;

    fn events_of_size(count: usize, size: usize) -> Vec<OutputEvent> {
        (0..count)
            .map(|i| OutputEvent {
                timestamp: T + i as i64,
                message: "x".repeat(size),
            })
            .collect()
    }

    #[test]
    fn normalization_is_idempotent() {
        assert_eq!(normalize_timestamp(T), T);
        assert_eq!(normalize_timestamp(1_700_000_000), 1_700_000_000_000);
        assert_eq!(normalize_timestamp(normalize_timestamp(T)), T);
        assert_eq!(
            normalize_timestamp(normalize_timestamp(1_700_000_000)),
            1_700_000_000_000
        );
        assert_eq!(normalize_timestamp(SECONDS_THRESHOLD_MS), SECONDS_THRESHOLD_MS);
    }

    #[test]
    fn events_are_sorted_chronologically() {
        let events = vec![
            LogEvent::new(Some(T + 2000), "c"),
            LogEvent::new(Some(T), "a"),
            LogEvent::new(Some(T + 1000), "b"),
            LogEvent::new(Some(T + 3000), "d"),
        ];
        let prepared = prepare_events(&events, T);
        let timestamps: Vec<i64> = prepared.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![T, T + 1000, T + 2000, T + 3000]);
        let messages: Vec<&str> = prepared.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn missing_timestamps_use_file_time_and_seconds_are_scaled() {
        let events = vec![
            LogEvent::new(None, "from file"),
            LogEvent::new(Some(1_600_000_000), "seconds"),
            LogEvent::new(
                Some(T),
                LogMessage::Structured(serde_json::json!({"k": "v"})),
            ),
        ];
        let prepared = prepare_events(&events, T + 5);
        assert_eq!(
            prepared,
            vec![
                OutputEvent {
                    timestamp: 1_600_000_000_000,
                    message: "seconds".into()
                },
                OutputEvent {
                    timestamp: T,
                    message: r#"{"k":"v"}"#.into()
                },
                OutputEvent {
                    timestamp: T + 5,
                    message: "from file".into()
                },
            ]
        );
    }

    #[test]
    fn event_that_would_overflow_starts_a_new_batch() {
        let limits = BatchLimits {
            max_events: 10_000,
            max_bytes: 1_047_576,
            event_overhead: 26,
            ..BatchLimits::default()
        };
        // 1026 bytes per event: 1021 events fit (1_047_546 bytes), the 1022nd would not.
        let batches = split_into_batches(events_of_size(2000, 1000), &limits, 0);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1021);
        assert_eq!(batches[0].bytes, 1021 * 1026);
        assert!(batches[0].bytes + 1026 > limits.max_bytes);
        assert_eq!(batches[1].start, 1021);
        assert_eq!(batches[1].len(), 979);
    }

    #[test]
    fn count_limit_is_respected() {
        let limits = BatchLimits {
            max_events: 1000,
            ..BatchLimits::default()
        };
        let batches = split_into_batches(events_of_size(2500, 10), &limits, 40);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        let starts: Vec<usize> = batches.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![40, 1040, 2040]);
    }

    #[test]
    fn span_limit_splits_batches() {
        let limits = BatchLimits {
            max_span_ms: 1000,
            ..BatchLimits::default()
        };
        let events: Vec<OutputEvent> = [0, 500, 1000, 1001, 1500, 2500]
            .into_iter()
            .map(|offset| OutputEvent {
                timestamp: T + offset,
                message: "m".into(),
            })
            .collect();

        let batches = split_into_batches(events, &limits, 0);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![3, 3]);
    }

    #[test]
    fn oversized_event_is_isolated() {
        let limits = BatchLimits {
            max_bytes: 1000,
            ..BatchLimits::default()
        };
        let mut events = events_of_size(2, 100);
        events.insert(1, OutputEvent {
            timestamp: T,
            message: "y".repeat(5000),
        });

        let batches = split_into_batches(events, &limits, 0);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
        assert!(!batches[0].is_oversized(&limits));
        assert!(batches[1].is_oversized(&limits));
        assert!(!batches[2].is_oversized(&limits));
    }

    #[test]
    fn randomized_batches_never_exceed_limits() {
        let limits = BatchLimits::default();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..20 {
            let count = rng.random_range(1..200);
            let events: Vec<OutputEvent> = (0..count)
                .map(|i| OutputEvent {
                    timestamp: T + i as i64,
                    message: "z".repeat(rng.random_range(1..=256 * 1024)),
                })
                .collect();

            let batches = split_into_batches(events, &limits, 0);
            assert_eq!(batches.iter().map(Batch::len).sum::<usize>(), count);
            for batch in &batches {
                let bytes: usize = batch.events.iter().map(|e| event_size(e, &limits)).sum();
                assert_eq!(bytes, batch.bytes);
                assert!(batch.len() <= limits.max_events);
                assert!(bytes <= limits.max_bytes);
            }
        }
    }

    #[test]
    fn rejection_accounting() {
        let rejected = RejectedEvents {
            too_old_end: Some(1),
            too_new_start: Some(8),
            expired_end: None,
        };
        assert_eq!(rejected.failed_count(10), 4);
        assert_eq!(10 - rejected.failed_count(10), 6);
        assert_eq!(rejected.accepted_prefix(10), 0);

        let too_new_only = RejectedEvents {
            too_new_start: Some(7),
            ..RejectedEvents::default()
        };
        assert_eq!(too_new_only.failed_count(10), 3);
        assert_eq!(too_new_only.accepted_prefix(10), 7);

        let expired = RejectedEvents {
            expired_end: Some(4),
            too_old_end: Some(2),
            ..RejectedEvents::default()
        };
        assert_eq!(expired.failed_count(10), 5);

        let none = RejectedEvents::default();
        assert!(none.is_empty());
        assert_eq!(none.failed_count(10), 0);
        assert_eq!(none.accepted_prefix(10), 10);

        // Overlapping and out-of-range indices never count an event twice.
        let overlapping = RejectedEvents {
            too_old_end: Some(6),
            too_new_start: Some(3),
            expired_end: None,
        };
        assert_eq!(overlapping.failed_count(10), 10);
        let out_of_range = RejectedEvents {
            too_old_end: Some(50),
            ..RejectedEvents::default()
        };
        assert_eq!(out_of_range.failed_count(10), 10);
    }
}
