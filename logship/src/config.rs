use delivery::EngineConfig;
use delivery::credentials::validate_role_arn;
use delivery::worker::WorkerConfig;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    ValidationError(#[from] ValidationError),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Invalid central role ARN: {0}")]
    InvalidCentralRole(String),

    #[error("Caller account ID must be 12 digits, got {0:?}")]
    InvalidAccountId(String),

    #[error("worker.max_messages must be between 1 and 10")]
    InvalidMaxMessages,

    #[error("worker.wait_time_secs must be at most 20")]
    InvalidWaitTime,

    #[error("Unknown log level {0:?}")]
    InvalidLogLevel(String),

    #[error(transparent)]
    Delivery(#[from] delivery::config::ValidationError),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    pub sentry_dsn: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            json: false,
            sentry_dsn: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "logship".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 8081,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Where tenant delivery configs are read from.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum TenantConfigSource {
    Dynamodb { table: String },
    File { path: PathBuf },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AwsConfig {
    /// Region of the staging bucket, queue and config table. Falls back to the
    /// SDK's own resolution when unset.
    pub region: Option<String>,
    pub central_role_arn: String,
    /// Presented as the external ID to tenant roles. Looked up through the
    /// security token service when unset.
    pub caller_account_id: Option<String>,
    pub tenant_configs: TenantConfigSource,
    /// Required by the `worker` command only.
    pub queue_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub admin_listener: Listener,
    pub aws: AwsConfig,
    #[serde(default)]
    pub delivery: EngineConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.admin_listener.validate()?;

        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ValidationError::InvalidLogLevel(self.logging.level.clone()));
        }

        validate_role_arn(&self.aws.central_role_arn)
            .map_err(|_| ValidationError::InvalidCentralRole(self.aws.central_role_arn.clone()))?;

        if let Some(account) = &self.aws.caller_account_id
            && (account.len() != 12 || !account.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(ValidationError::InvalidAccountId(account.clone()));
        }

        if !(1..=10).contains(&self.worker.max_messages) {
            return Err(ValidationError::InvalidMaxMessages);
        }
        if self.worker.wait_time_secs > 20 {
            return Err(ValidationError::InvalidWaitTime);
        }

        self.delivery.validate()?;
        Ok(())
    }
}
