//! Cross-account credential acquisition.
//!
//! Every delivery first assumes the central distribution role. Managed log service
//! deliveries then use those credentials to assume the tenant's own distribution
//! role (double hop), passing our account ID as the external ID so the tenant's
//! trust policy can pin the caller. Object store deliveries stop after the first
//! hop; the destination bucket policy grants the central role directly.
//!
//! Credentials are fetched per delivery and never cached.
use crate::errors::{ApiError, DeliveryError};
use crate::metrics_defs::CREDENTIAL_ASSUMPTIONS;
use crate::types::{DeliveryConfig, Destination, DestinationKind, TemporaryCredentials};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::counter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const SESSION_NAME_MAX_LEN: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub external_id: Option<String>,
}

/// The security token service, as seen by the broker.
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    /// Assumes `request.role_arn`, calling as `source` or, when `None`, as the
    /// process's own identity.
    async fn assume_role(
        &self,
        source: Option<&TemporaryCredentials>,
        request: &AssumeRoleRequest,
    ) -> Result<TemporaryCredentials, ApiError>;

    /// Account ID of the process's own identity.
    async fn caller_account_id(&self) -> Result<String, ApiError>;
}

/// Checks the `arn:<partition>:iam::<account>:role/<name>` shape.
pub fn validate_role_arn(arn: &str) -> Result<(), DeliveryError> {
    let invalid = || DeliveryError::InvalidRoleArn(arn.to_string());

    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    let [prefix, partition, service, region, account, resource] = parts.as_slice() else {
        return Err(invalid());
    };

    let valid = *prefix == "arn"
        && partition.starts_with("aws")
        && *service == "iam"
        && region.is_empty()
        && account.len() == 12
        && account.bytes().all(|b| b.is_ascii_digit())
        && resource
            .strip_prefix("role/")
            .is_some_and(|name| !name.is_empty());

    if valid { Ok(()) } else { Err(invalid()) }
}

/// Builds a unique, time-suffixed session name within the STS character set.
pub fn session_name(label: &str, now: DateTime<Utc>) -> String {
    let suffix = format!("-{}", now.timestamp_millis());
    let mut name: String = format!("logship-{label}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "+=,.@_-".contains(c) {
                c
            } else {
                '-'
            }
        })
        .collect();
    name.truncate(SESSION_NAME_MAX_LEN - suffix.len());
    name.push_str(&suffix);
    name
}

/// How credentials for one destination kind are obtained.
#[async_trait]
pub trait CredentialStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn credentials(
        &self,
        config: &DeliveryConfig,
        token: &CancellationToken,
    ) -> Result<TemporaryCredentials, DeliveryError>;
}

async fn assume(
    sts: &dyn RoleAssumer,
    source: Option<&TemporaryCredentials>,
    request: AssumeRoleRequest,
    hop: &'static str,
    token: &CancellationToken,
) -> Result<TemporaryCredentials, DeliveryError> {
    let result = tokio::select! {
        _ = token.cancelled() => return Err(DeliveryError::Cancelled),
        result = sts.assume_role(source, &request) => result,
    };

    match result {
        Ok(credentials) => {
            counter!(CREDENTIAL_ASSUMPTIONS, "hop" => hop, "result" => "ok").increment(1);
            tracing::debug!(
                role_arn = %request.role_arn,
                session_name = %request.session_name,
                hop,
                "Assumed role"
            );
            Ok(credentials)
        }
        Err(source) => {
            counter!(CREDENTIAL_ASSUMPTIONS, "hop" => hop, "result" => "error").increment(1);
            Err(DeliveryError::AssumeRole {
                role_arn: request.role_arn,
                source,
            })
        }
    }
}

/// Uses the central distribution role's credentials directly.
pub struct SingleHopAssume {
    sts: Arc<dyn RoleAssumer>,
    central_role_arn: String,
}

impl SingleHopAssume {
    pub fn new(sts: Arc<dyn RoleAssumer>, central_role_arn: String) -> Self {
        SingleHopAssume {
            sts,
            central_role_arn,
        }
    }

    async fn assume_central(
        &self,
        tenant_id: &str,
        token: &CancellationToken,
    ) -> Result<TemporaryCredentials, DeliveryError> {
        let request = AssumeRoleRequest {
            role_arn: self.central_role_arn.clone(),
            session_name: session_name(&format!("central-{tenant_id}"), Utc::now()),
            external_id: None,
        };
        assume(self.sts.as_ref(), None, request, "central", token).await
    }
}

#[async_trait]
impl CredentialStrategy for SingleHopAssume {
    fn name(&self) -> &'static str {
        "single_hop"
    }

    async fn credentials(
        &self,
        config: &DeliveryConfig,
        token: &CancellationToken,
    ) -> Result<TemporaryCredentials, DeliveryError> {
        if let Destination::S3 {
            role_arn: Some(role_arn),
            ..
        } = &config.destination
        {
            validate_role_arn(role_arn)?;
        }
        self.assume_central(&config.tenant_id, token).await
    }
}

/// Central role first, then the tenant's role with our account ID as external ID.
pub struct DoubleHopAssume {
    central: SingleHopAssume,
    external_id: String,
}

impl DoubleHopAssume {
    pub fn new(sts: Arc<dyn RoleAssumer>, central_role_arn: String, external_id: String) -> Self {
        DoubleHopAssume {
            central: SingleHopAssume::new(sts, central_role_arn),
            external_id,
        }
    }
}

#[async_trait]
impl CredentialStrategy for DoubleHopAssume {
    fn name(&self) -> &'static str {
        "double_hop"
    }

    async fn credentials(
        &self,
        config: &DeliveryConfig,
        token: &CancellationToken,
    ) -> Result<TemporaryCredentials, DeliveryError> {
        let Destination::CloudWatch { role_arn, .. } = &config.destination else {
            // Only managed log destinations carry a tenant role to hop into.
            return self.central.credentials(config, token).await;
        };
        validate_role_arn(role_arn)?;

        let central = self.central.assume_central(&config.tenant_id, token).await?;

        let request = AssumeRoleRequest {
            role_arn: role_arn.clone(),
            session_name: session_name(&format!("tenant-{}", config.tenant_id), Utc::now()),
            external_id: Some(self.external_id.clone()),
        };
        assume(self.central.sts.as_ref(), Some(&central), request, "tenant", token).await
    }
}

/// Selects the credential strategy for a destination.
pub struct CredentialBroker {
    single_hop: SingleHopAssume,
    double_hop: DoubleHopAssume,
}

impl CredentialBroker {
    /// `caller_account_id` becomes the external ID presented to tenant roles.
    pub fn new(
        sts: Arc<dyn RoleAssumer>,
        central_role_arn: String,
        caller_account_id: String,
    ) -> Result<Self, DeliveryError> {
        validate_role_arn(&central_role_arn)?;
        Ok(CredentialBroker {
            single_hop: SingleHopAssume::new(sts.clone(), central_role_arn.clone()),
            double_hop: DoubleHopAssume::new(sts, central_role_arn, caller_account_id),
        })
    }

    pub fn strategy_for(&self, kind: DestinationKind) -> &dyn CredentialStrategy {
        match kind {
            DestinationKind::CloudWatch => &self.double_hop,
            DestinationKind::S3 => &self.single_hop,
        }
    }

    pub async fn credentials_for(
        &self,
        config: &DeliveryConfig,
        token: &CancellationToken,
    ) -> Result<TemporaryCredentials, DeliveryError> {
        self.strategy_for(config.kind())
            .credentials(config, token)
            .await
    }
}
