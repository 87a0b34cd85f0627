use crate::config::{CommonConfig, LoggingConfig};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use shared::metrics_defs::describe_all;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

const METRICS_PREFIX: &str = "uplink_fallback";

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("could not create statsd exporter: {0}")]
    Statsd(#[from] StatsdError),
    #[error("could not install metrics recorder: {0}")]
    Recorder(String),
    #[error("could not install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Keeps Sentry alive until the process exits.
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

/// Sets up Sentry, the tracing subscriber and the statsd recorder. Must run
/// before the tokio runtime is started.
pub fn init(common: &CommonConfig) -> Result<TelemetryGuard, TelemetryError> {
    let default_logging = LoggingConfig::default();
    let logging = common.logging.as_ref().unwrap_or(&default_logging);

    let sentry = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let sentry_layer = sentry
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .try_init()?;

    if let Some(metrics_config) = &common.metrics {
        let recorder = StatsdBuilder::from(&metrics_config.statsd_host, metrics_config.statsd_port)
            .build(Some(METRICS_PREFIX))?;
        metrics::set_global_recorder(recorder)
            .map_err(|err| TelemetryError::Recorder(err.to_string()))?;

        describe_all(fallback_store::metrics_defs::ALL_METRICS);
        describe_all(supergraph_provider::metrics_defs::ALL_METRICS);
        tracing::info!(
            host = %metrics_config.statsd_host,
            port = metrics_config.statsd_port,
            "sending metrics to statsd"
        );
    }

    Ok(TelemetryGuard { _sentry: sentry })
}
