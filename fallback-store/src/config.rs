use crate::secrets::SecretRef;
use crate::types::{GraphRef, GraphRefError};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Bucket name cannot be empty")]
    EmptyBucket,

    #[error("Invalid graph ref {graph_ref:?}: {source}")]
    InvalidGraphRef {
        graph_ref: String,
        #[source]
        source: GraphRefError,
    },
}

/// Backing medium of the fallback store.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreConfig {
    Filesystem {
        base_dir: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
    },
    Gcs {
        bucket: String,
    },
    /// Not persisted; for local testing.
    Memory,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StoreConfig::S3 { bucket, .. } | StoreConfig::Gcs { bucket } if bucket.is_empty() => {
                Err(ValidationError::EmptyBucket)
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 5000,
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

fn default_api_key() -> SecretRef {
    SecretRef::Env {
        var: "APOLLO_KEY".into(),
    }
}

/// Configuration of the fallback store service (webhook writer and readers).
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    pub store: StoreConfig,
    /// Shared secret used to sign build notifications.
    pub webhook_secret: SecretRef,
    /// Graph API key expected by the uplink-compatible responder.
    #[serde(default = "default_api_key")]
    pub api_key: SecretRef,
    /// When non-empty, only these graph refs are written by the webhook.
    #[serde(default)]
    pub graph_refs: Vec<String>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.store.validate()?;
        self.allowed_refs()?;
        Ok(())
    }

    pub fn allowed_refs(&self) -> Result<Vec<GraphRef>, ValidationError> {
        self.graph_refs
            .iter()
            .map(|graph_ref| {
                graph_ref
                    .parse()
                    .map_err(|source| ValidationError::InvalidGraphRef {
                        graph_ref: graph_ref.clone(),
                        source,
                    })
            })
            .collect()
    }
}
