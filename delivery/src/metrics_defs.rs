//! Metrics definitions for the delivery engine.

use shared::metrics_defs::{MetricDef, MetricType};

pub const NOTIFICATIONS_PROCESSED: MetricDef = MetricDef {
    name: "notifications.processed",
    metric_type: MetricType::Counter,
    description: "Notifications processed. Tagged with outcome.",
};

pub const EVENTS_DELIVERED: MetricDef = MetricDef {
    name: "events.delivered",
    metric_type: MetricType::Counter,
    description: "Log events confirmed by the destination. Tagged with destination.",
};

pub const EVENTS_FAILED: MetricDef = MetricDef {
    name: "events.failed",
    metric_type: MetricType::Counter,
    description: "Log events rejected or not delivered. Tagged with destination.",
};

pub const BATCHES_SUBMITTED: MetricDef = MetricDef {
    name: "batches.submitted",
    metric_type: MetricType::Counter,
    description: "Batches submitted to the managed log service. Tagged with result.",
};

pub const BATCH_SUBMIT_DURATION: MetricDef = MetricDef {
    name: "batches.submit.duration",
    metric_type: MetricType::Histogram,
    description: "Time to submit one batch, including retries, in seconds",
};

pub const OBJECTS_COPIED: MetricDef = MetricDef {
    name: "objects.copied",
    metric_type: MetricType::Counter,
    description: "Staged objects copied to tenant buckets. Tagged with result.",
};

pub const CREDENTIAL_ASSUMPTIONS: MetricDef = MetricDef {
    name: "credentials.assume_role",
    metric_type: MetricType::Counter,
    description: "Role assumptions. Tagged with hop and result.",
};

pub const REQUEUES: MetricDef = MetricDef {
    name: "notifications.requeued",
    metric_type: MetricType::Counter,
    description: "Notifications requeued for resumption",
};

pub const ALL_METRICS: &[MetricDef] = &[
    NOTIFICATIONS_PROCESSED,
    EVENTS_DELIVERED,
    EVENTS_FAILED,
    BATCHES_SUBMITTED,
    BATCH_SUBMIT_DURATION,
    OBJECTS_COPIED,
    CREDENTIAL_ASSUMPTIONS,
    REQUEUES,
];
