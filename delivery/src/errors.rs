use crate::types::DeliveryStats;
use thiserror::Error;

/// Error returned by one of the remote services the engine talks to.
///
/// Adapters map their SDK errors into a service error code (`ThrottlingException`,
/// `NoSuchBucket`, ...) so that classification stays independent of the SDK.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Codes used by adapters when the failure did not come from the service itself.
pub mod codes {
    pub const NETWORK: &str = "NetworkError";
    pub const TIMEOUT: &str = "TimeoutError";
    pub const INVALID_RESPONSE: &str = "InvalidResponse";
    pub const INVALID_REQUEST: &str = "InvalidRequest";
}

impl ApiError {
    pub fn new<C, M>(code: C, message: M) -> Self
    where
        C: Into<String>,
        M: Into<String>,
    {
        ApiError {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Throttling, service unavailable and transport-level failures.
    pub fn is_throttling_or_unavailable(&self) -> bool {
        const RETRIABLE_CODES: &[&str] = &[
            "ThrottlingException",
            "Throttling",
            "ThrottledException",
            "TooManyRequestsException",
            "RequestLimitExceeded",
            "ServiceUnavailableException",
            "ServiceUnavailable",
            "SlowDown",
            "InternalFailure",
            "InternalError",
            codes::NETWORK,
            codes::TIMEOUT,
        ];
        RETRIABLE_CODES.contains(&self.code.as_str())
    }

    pub fn is_already_exists(&self) -> bool {
        self.code == "ResourceAlreadyExistsException"
    }
}

/// Result type alias for delivery operations
pub type Result<T, E = DeliveryError> = std::result::Result<T, E>;

/// Errors that can occur while delivering one staged file.
///
/// Every variant is either recoverable (retrying the same notification later may
/// succeed) or not; see [`DeliveryError::is_recoverable`].
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    #[error("malformed object key {key:?}: expected cluster/tenant/application/pod/file")]
    MalformedKey { key: String },

    #[error("malformed notification: {0}")]
    MalformedNotification(String),

    #[error("no enabled delivery configuration for tenant {0}")]
    UnknownTenant(String),

    #[error("tenant configuration store unavailable: {0}")]
    ConfigStore(ApiError),

    #[error("invalid role ARN {0:?}")]
    InvalidRoleArn(String),

    #[error("could not assume role {role_arn}: {source}")]
    AssumeRole { role_arn: String, source: ApiError },

    #[error("could not read staged object: {0}")]
    StagedObjectRead(ApiError),

    #[error("staged object is missing or unreadable: {0}")]
    StagedObjectMissing(ApiError),

    #[error("could not decode staged object: {0}")]
    StagedObjectDecode(String),

    #[error("destination rejected delivery permanently: {0}")]
    DestinationRejected(ApiError),

    #[error("destination temporarily unavailable: {0}")]
    DestinationUnavailable(ApiError),

    #[error("{} of {} events were not delivered", stats.failed, stats.total)]
    PartialDelivery {
        stats: DeliveryStats,
        /// Index (in delivery order) of the first event not confirmed delivered.
        confirmed_offset: usize,
    },

    #[error("delivery cancelled")]
    Cancelled,
}

impl DeliveryError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            DeliveryError::MalformedKey { .. }
            | DeliveryError::MalformedNotification(_)
            | DeliveryError::UnknownTenant(_)
            | DeliveryError::InvalidRoleArn(_)
            | DeliveryError::StagedObjectMissing(_)
            | DeliveryError::StagedObjectDecode(_)
            | DeliveryError::DestinationRejected(_) => false,
            DeliveryError::ConfigStore(_)
            | DeliveryError::AssumeRole { .. }
            | DeliveryError::StagedObjectRead(_)
            | DeliveryError::DestinationUnavailable(_)
            | DeliveryError::PartialDelivery { .. }
            | DeliveryError::Cancelled => true,
        }
    }

    /// Stats carried by a partial delivery, if any.
    pub fn stats(&self) -> Option<DeliveryStats> {
        match self {
            DeliveryError::PartialDelivery { stats, .. } => Some(*stats),
            _ => None,
        }
    }

    /// Short label used for metric tags and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::MalformedKey { .. } => "malformed_key",
            DeliveryError::MalformedNotification(_) => "malformed_notification",
            DeliveryError::UnknownTenant(_) => "unknown_tenant",
            DeliveryError::ConfigStore(_) => "config_store",
            DeliveryError::InvalidRoleArn(_) => "invalid_role_arn",
            DeliveryError::AssumeRole { .. } => "assume_role",
            DeliveryError::StagedObjectRead(_) => "staged_object_read",
            DeliveryError::StagedObjectMissing(_) => "staged_object_missing",
            DeliveryError::StagedObjectDecode(_) => "staged_object_decode",
            DeliveryError::DestinationRejected(_) => "destination_rejected",
            DeliveryError::DestinationUnavailable(_) => "destination_unavailable",
            DeliveryError::PartialDelivery { .. } => "partial_delivery",
            DeliveryError::Cancelled => "cancelled",
        }
    }
}
