use crate::config::{LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("could not install tracing subscriber: {0}")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
}

/// Keeps the error reporting client alive. Dropping it flushes pending events.
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

/// Initializes error reporting, logging and, when configured, statsd metrics.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(
    logging: &LoggingConfig,
    statsd: Option<&MetricsConfig>,
) -> Result<TelemetryGuard, TelemetryError> {
    let sentry = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let fmt_layer = if logging.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };
    let sentry_layer = sentry
        .is_some()
        .then(sentry::integrations::tracing::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(sentry_layer)
        .try_init()?;

    if let Some(statsd) = statsd {
        let recorder = StatsdBuilder::from(statsd.statsd_host.as_str(), statsd.statsd_port)
            .build(Some(statsd.prefix.as_str()))?;
        metrics::set_global_recorder(recorder).map_err(|_| TelemetryError::RecorderInstalled)?;
        shared::metrics_defs::describe_all(delivery::metrics_defs::ALL_METRICS);
        tracing::info!(
            host = %statsd.statsd_host,
            port = statsd.statsd_port,
            "Statsd metrics enabled"
        );
    }

    Ok(TelemetryGuard { _sentry: sentry })
}
