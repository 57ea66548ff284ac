//! Multi-tenant log delivery.
//!
//! A staged log file is announced by a queue notification. The dispatcher
//! resolves the owning tenant from the object key, obtains cross-account
//! credentials for each enabled destination and delivers the file either to a
//! managed log group (event by event, in batches) or to a tenant bucket (as a
//! server-side copy). Failures that may clear up are requeued with the offset
//! of the first event not yet confirmed.
pub mod aws;
pub mod cloudwatch;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod errors;
pub mod metrics_defs;
pub mod notification;
pub mod retry;
pub mod s3;
pub mod staged_file;
pub mod tenant;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testutils;

pub use config::EngineConfig;
pub use dispatch::{DispatchReport, Dispatcher, Outcome};
pub use errors::{ApiError, DeliveryError};
