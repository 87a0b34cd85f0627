use crate::provider::{HealthCheckError, SupergraphHost};
use crate::types::SchemaDocument;
use async_trait::async_trait;
use fallback_store::storage::write_atomic;
use std::path::PathBuf;

/// Publishes every supergraph to a file, for routers that watch a local
/// schema file.
pub struct FileSinkHost {
    path: PathBuf,
}

impl FileSinkHost {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSinkHost { path: path.into() }
    }

    async fn write(&self, document: &SchemaDocument) {
        match write_atomic(&self.path, document.sdl.as_bytes()).await {
            Ok(()) => tracing::info!(path = ?self.path, id = %document.id, "wrote supergraph"),
            Err(err) => {
                tracing::error!(path = ?self.path, id = %document.id, error = %err, "failed to write supergraph")
            }
        }
    }
}

#[async_trait]
impl SupergraphHost for FileSinkHost {
    async fn initial(&self, document: &SchemaDocument) {
        self.write(document).await;
    }

    async fn update(&self, document: SchemaDocument) {
        self.write(&document).await;
    }

    async fn health_check(&self, document: &SchemaDocument) -> Result<(), HealthCheckError> {
        if document.sdl.trim().is_empty() {
            return Err(HealthCheckError(format!(
                "supergraph {} is empty",
                document.id
            )));
        }
        Ok(())
    }
}
