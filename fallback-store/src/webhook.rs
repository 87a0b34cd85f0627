use crate::metrics_defs::{WEBHOOK_REJECTED, WEBHOOK_SKIPPED, WEBHOOK_STORED};
use crate::secrets::{SecretCache, SecretError};
use crate::signature;
use crate::storage::{ObjectStore, StoreError, StoredObject};
use crate::types::{GraphRef, ObjectKey};
use reqwest::StatusCode;
use serde::Deserialize;
use shared::counter;
use std::collections::HashSet;
use std::sync::Arc;

/// Build status notification sent by Studio after each supergraph build.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildEvent {
    pub event_type: String,
    #[serde(rename = "eventID")]
    pub event_id: String,
    // Absent when the build failed.
    #[serde(rename = "supergraphSchemaURL", default)]
    pub supergraph_schema_url: Option<String>,
    #[serde(default)]
    pub build_errors: Option<Vec<BuildError>>,
    #[serde(rename = "graphID")]
    pub graph_id: String,
    #[serde(rename = "variantID")]
    pub variant_id: String,
    // ISO 8601
    pub timestamp: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BuildError {
    pub message: String,
    #[serde(default)]
    pub locations: Vec<Location>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, PartialEq)]
pub enum WriteOutcome {
    Stored(ObjectKey),
    /// The build failed and carried no supergraph.
    NoSchema,
    /// The graph ref is not in the configured allow-list.
    Ignored(GraphRef),
}

#[derive(thiserror::Error, Debug)]
pub enum WebhookError {
    #[error("Missing body")]
    MissingBody,

    #[error("Missing signature")]
    MissingSignature,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("could not load webhook secret: {0}")]
    Secret(#[from] SecretError),

    #[error("could not download supergraph: {0}")]
    Download(#[from] reqwest::Error),

    #[error("supergraph download returned HTTP {0}")]
    DownloadStatus(StatusCode),

    #[error("could not store supergraph: {0}")]
    Store(#[from] StoreError),
}

impl WebhookError {
    /// Errors caused by the request itself. Nothing was written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            WebhookError::MissingBody
                | WebhookError::MissingSignature
                | WebhookError::InvalidSignature
                | WebhookError::InvalidPayload(_)
        )
    }

    fn reason(&self) -> &'static str {
        match self {
            WebhookError::MissingBody => "missing_body",
            WebhookError::MissingSignature => "missing_signature",
            WebhookError::InvalidSignature => "invalid_signature",
            WebhookError::InvalidPayload(_) => "invalid_payload",
            WebhookError::Secret(_) => "secret",
            WebhookError::Download(_) | WebhookError::DownloadStatus(_) => "download",
            WebhookError::Store(_) => "store",
        }
    }
}

/// Accepts build notifications and republishes the built supergraph into the
/// fallback store.
pub struct FallbackStoreWriter {
    store: Arc<dyn ObjectStore>,
    secret: Arc<SecretCache>,
    client: reqwest::Client,
    allowed_refs: Option<HashSet<GraphRef>>,
}

impl FallbackStoreWriter {
    pub fn new(store: Arc<dyn ObjectStore>, secret: Arc<SecretCache>) -> Self {
        FallbackStoreWriter {
            store,
            secret,
            client: reqwest::Client::new(),
            allowed_refs: None,
        }
    }

    /// Restricts writes to the given graph refs. Events for other refs are
    /// acknowledged without being stored.
    pub fn with_allowed_refs(mut self, refs: impl IntoIterator<Item = GraphRef>) -> Self {
        let refs: HashSet<GraphRef> = refs.into_iter().collect();
        self.allowed_refs = (!refs.is_empty()).then_some(refs);
        self
    }

    /// Ok once the webhook secret can be resolved.
    pub async fn ready(&self) -> Result<(), SecretError> {
        self.secret.get().await.map(|_| ())
    }

    /// Handles one webhook invocation. The request is fully validated before
    /// anything is downloaded or written.
    pub async fn handle(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WriteOutcome, WebhookError> {
        let result = self.try_handle(signature, body).await;
        if let Err(err) = &result {
            counter!(WEBHOOK_REJECTED, "reason" => err.reason()).increment(1);
            if err.is_validation() {
                tracing::warn!(error = %err, "rejected webhook request");
            } else {
                tracing::error!(error = %err, "failed to process webhook event");
            }
        }
        result
    }

    async fn try_handle(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WriteOutcome, WebhookError> {
        if body.is_empty() {
            return Err(WebhookError::MissingBody);
        }
        let signature = signature.ok_or(WebhookError::MissingSignature)?;

        let secret = self.secret.get().await?;
        signature::verify_header(signature, secret.as_bytes(), body).map_err(|err| {
            tracing::debug!(error = %err, "signature verification failed");
            WebhookError::InvalidSignature
        })?;

        let event: BuildEvent = serde_json::from_slice(body)
            .map_err(|err| WebhookError::InvalidPayload(err.to_string()))?;
        let graph_ref = GraphRef::from_build_event(&event.graph_id, &event.variant_id)
            .map_err(|err| WebhookError::InvalidPayload(err.to_string()))?;

        let Some(schema_url) = event
            .supergraph_schema_url
            .as_deref()
            .filter(|url| !url.is_empty())
        else {
            let build_errors = event.build_errors.as_deref().unwrap_or_default();
            tracing::info!(
                %graph_ref,
                event_id = %event.event_id,
                build_errors = build_errors.len(),
                first_error = build_errors.first().map(|e| e.message.as_str()),
                "build has no supergraph, nothing to store"
            );
            counter!(WEBHOOK_SKIPPED, "reason" => "no_schema").increment(1);
            return Ok(WriteOutcome::NoSchema);
        };

        if let Some(allowed) = &self.allowed_refs
            && !allowed.contains(&graph_ref)
        {
            tracing::warn!(%graph_ref, event_id = %event.event_id, "ignoring build for unconfigured graph ref");
            counter!(WEBHOOK_SKIPPED, "reason" => "unknown_graph_ref").increment(1);
            return Ok(WriteOutcome::Ignored(graph_ref));
        }

        let schema = self.download(schema_url).await?;
        let key = ObjectKey::for_graph_ref(&graph_ref);
        self.store
            .put(&key, StoredObject::graphql(schema, &event.timestamp))
            .await?;

        counter!(WEBHOOK_STORED).increment(1);
        tracing::info!(%key, event_id = %event.event_id, timestamp = %event.timestamp, "stored new supergraph");
        Ok(WriteOutcome::Stored(key))
    }

    async fn download(&self, url: &str) -> Result<bytes::Bytes, WebhookError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::DownloadStatus(response.status()));
        }
        Ok(response.bytes().await?)
    }
}
