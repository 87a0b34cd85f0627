use crate::provider::ProviderOptions;
use crate::uplink::{DEFAULT_ENDPOINTS, RetryPolicy};
use fallback_store::GraphRef;
use fallback_store::config::StoreConfig;
use fallback_store::secrets::SecretRef;
use fallback_store::types::GraphRefError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid graph ref {graph_ref:?}: {source}")]
    InvalidGraphRef {
        graph_ref: String,
        #[source]
        source: GraphRefError,
    },

    #[error("Poll interval cannot be 0")]
    InvalidPollInterval,

    #[error("Retry base delay cannot exceed the max delay")]
    InvalidRetryDelay,

    #[error("Request timeout and fetch budget cannot be 0")]
    InvalidTimeout,

    #[error("Invalid default uplink endpoint {0}")]
    InvalidDefaultEndpoint(String),

    #[error("Invalid fallback store: {0}")]
    Store(#[from] fallback_store::config::ValidationError),
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct UplinkConfig {
    /// Uplink endpoints, tried round-robin. Empty means the public uplink
    /// endpoints.
    pub endpoints: Vec<Url>,
    /// Defaults to three attempts per endpoint.
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Applies to uplink requests and the endpoint fallback.
    pub request_timeout_ms: u64,
    pub fetch_budget_ms: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        UplinkConfig {
            endpoints: Vec::new(),
            max_retries: None,
            retry_base_delay_ms: RetryPolicy::DEFAULT_BASE_DELAY.as_millis() as u64,
            retry_max_delay_ms: RetryPolicy::DEFAULT_MAX_DELAY.as_millis() as u64,
            request_timeout_ms: RetryPolicy::DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            fetch_budget_ms: RetryPolicy::DEFAULT_FETCH_BUDGET.as_millis() as u64,
        }
    }
}

/// Where the stand-by supergraph comes from.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum FallbackConfig {
    File { path: PathBuf },
    Store { store: StoreConfig },
    Endpoint { url: Url },
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct OutputConfig {
    pub path: PathBuf,
}

fn default_api_key() -> SecretRef {
    SecretRef::Env {
        var: "APOLLO_KEY".into(),
    }
}

fn default_poll_interval_ms() -> u64 {
    ProviderOptions::DEFAULT_POLL_INTERVAL.as_millis() as u64
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub graph_ref: String,
    #[serde(default = "default_api_key")]
    pub api_key: SecretRef,
    #[serde(default)]
    pub uplink: UplinkConfig,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub subgraph_health_check: bool,
    pub fallback: FallbackConfig,
    /// Every supergraph is written here.
    pub output: OutputConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.graph_ref()?;
        self.endpoints()?;

        if self.poll_interval_ms == 0 {
            return Err(ValidationError::InvalidPollInterval);
        }
        if self.uplink.retry_base_delay_ms > self.uplink.retry_max_delay_ms {
            return Err(ValidationError::InvalidRetryDelay);
        }
        if self.uplink.request_timeout_ms == 0 || self.uplink.fetch_budget_ms == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        if let FallbackConfig::Store { store } = &self.fallback {
            store.validate()?;
        }

        Ok(())
    }

    pub fn graph_ref(&self) -> Result<GraphRef, ValidationError> {
        self.graph_ref
            .parse()
            .map_err(|source| ValidationError::InvalidGraphRef {
                graph_ref: self.graph_ref.clone(),
                source,
            })
    }

    pub fn endpoints(&self) -> Result<Vec<Url>, ValidationError> {
        if !self.uplink.endpoints.is_empty() {
            return Ok(self.uplink.endpoints.clone());
        }
        DEFAULT_ENDPOINTS
            .iter()
            .map(|endpoint| {
                Url::parse(endpoint)
                    .map_err(|_| ValidationError::InvalidDefaultEndpoint(endpoint.to_string()))
            })
            .collect()
    }

    pub fn retry_policy(&self, endpoint_count: usize) -> RetryPolicy {
        let mut policy = RetryPolicy::for_endpoints(endpoint_count);
        if let Some(max_retries) = self.uplink.max_retries {
            policy.max_retries = max_retries;
        }
        policy.base_delay = Duration::from_millis(self.uplink.retry_base_delay_ms);
        policy.max_delay = Duration::from_millis(self.uplink.retry_max_delay_ms);
        policy.request_timeout = self.request_timeout();
        policy.fetch_budget = Some(Duration::from_millis(self.uplink.fetch_budget_ms));
        policy
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.uplink.request_timeout_ms)
    }

    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            subgraph_health_check: self.subgraph_health_check,
        }
    }
}
