use fallback_store::config::Config as StoreConfig;
use serde::Deserialize;
use std::fs::File;
use supergraph_provider::config::Config as ProviderConfig;
use url::Url;

pub const GRAPH_REF_ENV: &str = "APOLLO_GRAPH_REF";
pub const ENDPOINTS_ENV: &str = "APOLLO_SCHEMA_CONFIG_DELIVERY_ENDPOINT";
pub const PORT_ENV: &str = "PORT";

#[derive(Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

fn default_level() -> String {
    "info".into()
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            sentry_dsn: None,
            level: default_level(),
        }
    }
}

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub provider: Option<ProviderConfig>,
    pub store: Option<StoreConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    /// Applies the environment variables a gateway deployment usually sets.
    /// `lookup` is `std::env::var` outside of tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = &mut self.provider {
            if let Some(graph_ref) = lookup(GRAPH_REF_ENV) {
                provider.graph_ref = graph_ref;
            }
            if let Some(endpoints) = lookup(ENDPOINTS_ENV) {
                provider.uplink.endpoints = endpoints
                    .split(',')
                    .map(str::trim)
                    .filter(|endpoint| !endpoint.is_empty())
                    .map(|endpoint| {
                        Url::parse(endpoint).map_err(|_| ConfigError::InvalidEnv {
                            name: ENDPOINTS_ENV,
                            value: endpoints.clone(),
                        })
                    })
                    .collect::<Result<_, _>>()?;
            }
        }

        if let Some(store) = &mut self.store
            && let Some(port) = lookup(PORT_ENV)
        {
            store.listener.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: PORT_ENV,
                value: port.clone(),
            })?;
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}
