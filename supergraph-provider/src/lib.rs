//! Resilient supergraph bootstrap: fetch from uplink with bounded retries,
//! fall back to a persisted copy when uplink is down, keep polling.

pub mod config;
pub mod fallback;
pub mod host;
pub mod metrics_defs;
pub mod provider;
pub mod types;
pub mod uplink;

use crate::config::{Config, FallbackConfig, ValidationError};
use crate::fallback::{EndpointFallback, FallbackResolver, FileFallback, StoreFallback};
use crate::host::FileSinkHost;
use crate::provider::{ProviderError, SupergraphProvider};
use crate::uplink::{FetchError, UplinkClient};
use fallback_store::secrets::SecretCache;
use fallback_store::storage::StoreError;
use std::sync::Arc;

pub use crate::types::SchemaDocument;

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("invalid config: {0}")]
    Config(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Uplink(#[from] FetchError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("could not wait for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

pub fn fallback_resolver(config: &Config) -> Result<Arc<dyn FallbackResolver>, RunError> {
    let graph_ref = config.graph_ref()?;
    let resolver: Arc<dyn FallbackResolver> = match &config.fallback {
        FallbackConfig::File { path } => Arc::new(FileFallback::new(path)),
        FallbackConfig::Store { store } => Arc::new(StoreFallback::new(
            fallback_store::get_store(store)?,
            graph_ref,
        )),
        FallbackConfig::Endpoint { url } => Arc::new(
            EndpointFallback::new(url.clone(), graph_ref).with_timeout(config.request_timeout()),
        ),
    };
    Ok(resolver)
}

pub fn provider(config: &Config) -> Result<SupergraphProvider, RunError> {
    config.validate()?;

    let endpoints = config.endpoints()?;
    let retry = config.retry_policy(endpoints.len());
    let api_key = Arc::new(SecretCache::from_ref(config.api_key.clone()));
    let source = UplinkClient::new(config.graph_ref()?, api_key, endpoints, retry)?;

    Ok(SupergraphProvider::new(
        Arc::new(source),
        fallback_resolver(config)?,
        config.provider_options(),
    ))
}

/// Serves supergraphs to the configured output file until Ctrl-C.
pub async fn run(config: Config) -> Result<(), RunError> {
    let provider = provider(&config)?;
    let host = Arc::new(FileSinkHost::new(&config.output.path));

    tracing::info!(graph_ref = %config.graph_ref, output = ?config.output.path, "starting supergraph provider");
    // The host writes the initial document before polling starts.
    let initialized = provider.initialize(host).await?;
    tracing::info!(id = %initialized.document.id, "serving supergraph");

    let result = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
    initialized.cleanup.cleanup().await;

    Ok(result?)
}
