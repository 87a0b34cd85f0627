//! Fallback store for supergraphs: a signed webhook receiver that persists
//! each new build, and responders that serve the stored copy when uplink is
//! unavailable.

pub mod api;
pub mod config;
pub mod metrics_defs;
pub mod protocol;
pub mod reader;
pub mod secrets;
pub mod signature;
pub mod storage;
pub mod types;
pub mod webhook;

use crate::api::AppState;
use crate::config::{Config, StoreConfig, ValidationError};
use crate::reader::FallbackStoreReader;
use crate::secrets::SecretCache;
use crate::storage::{CloudStore, FilesystemStore, ObjectStore, StoreError};
use crate::webhook::FallbackStoreWriter;
use std::sync::Arc;

pub use crate::types::{GraphRef, ObjectKey};

#[derive(thiserror::Error, Debug)]
pub enum FallbackStoreError {
    #[error("invalid config: {0}")]
    Config(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Api(#[from] api::ApiError),
}

pub fn get_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let store: Arc<dyn ObjectStore> = match config {
        StoreConfig::Filesystem { base_dir } => Arc::new(FilesystemStore::new(base_dir)),
        StoreConfig::S3 { bucket, region } => Arc::new(CloudStore::s3(bucket, region.as_deref())?),
        StoreConfig::Gcs { bucket } => Arc::new(CloudStore::gcs(bucket)?),
        StoreConfig::Memory => Arc::new(CloudStore::in_memory()),
    };
    Ok(store)
}

/// Builds the service state from config. Secrets are resolved lazily on first
/// use.
pub fn app_state(config: &Config) -> Result<AppState, FallbackStoreError> {
    config.validate()?;

    let store = get_store(&config.store)?;
    let webhook_secret = Arc::new(SecretCache::from_ref(config.webhook_secret.clone()));
    let api_key = Arc::new(SecretCache::from_ref(config.api_key.clone()));

    let writer = FallbackStoreWriter::new(store.clone(), webhook_secret)
        .with_allowed_refs(config.allowed_refs()?);
    let reader = FallbackStoreReader::new(store, api_key);

    Ok(AppState {
        writer: Arc::new(writer),
        reader: Arc::new(reader),
    })
}

pub async fn run(config: Config) -> Result<(), FallbackStoreError> {
    let state = app_state(&config)?;
    tracing::info!(store = ?config.store, graph_refs = ?config.graph_refs, "starting fallback store");
    api::serve(&config.listener, state).await?;
    Ok(())
}
