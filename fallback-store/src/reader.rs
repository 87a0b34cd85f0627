use crate::metrics_defs::{FALLBACK_READ_HIT, FALLBACK_READ_MISS};
use crate::protocol::{RouterConfig, UplinkRequest, UplinkResponse};
use crate::secrets::{SecretCache, SecretError};
use crate::storage::{ObjectStore, StoreError, StoredObject};
use crate::types::{GraphRef, GraphRefError, ObjectKey};
use shared::counter;
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub const GRAPH_REF_HEADER: &str = "x-graph-ref";

/// Id reported for stored supergraphs that carry no `last-modified` marker.
pub const UNKNOWN_ID: &str = "0";

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("Missing body")]
    MissingBody,

    #[error("Missing x-graph-ref header")]
    MissingGraphRef,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Invalid graph ref: {0}")]
    GraphRef(#[from] GraphRefError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("could not load API key: {0}")]
    Secret(#[from] SecretError),
}

impl ReadError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReadError::Store(err) if err.is_not_found())
    }
}

/// A stored supergraph as served by the direct responder.
#[derive(Debug, PartialEq)]
pub struct DirectResponse {
    pub sdl: String,
    pub last_modified: Option<String>,
}

/// Serves supergraphs out of the fallback store, either raw (direct) or
/// wrapped in the uplink protocol so a gateway can list the fallback among
/// its uplink endpoints.
pub struct FallbackStoreReader {
    store: Arc<dyn ObjectStore>,
    api_key: Arc<SecretCache>,
}

impl FallbackStoreReader {
    pub fn new(store: Arc<dyn ObjectStore>, api_key: Arc<SecretCache>) -> Self {
        FallbackStoreReader { store, api_key }
    }

    /// Ok once the API key can be resolved.
    pub async fn ready(&self) -> Result<(), SecretError> {
        self.api_key.get().await.map(|_| ())
    }

    pub async fn read(&self, graph_ref: &GraphRef) -> Result<StoredObject, ReadError> {
        let key = ObjectKey::for_graph_ref(graph_ref);
        match self.store.get(&key).await {
            Ok(object) => {
                counter!(FALLBACK_READ_HIT).increment(1);
                Ok(object)
            }
            Err(err) => {
                if err.is_not_found() {
                    counter!(FALLBACK_READ_MISS).increment(1);
                    tracing::info!(%graph_ref, "no stored supergraph");
                } else {
                    tracing::error!(%graph_ref, error = %err, "failed to read stored supergraph");
                }
                Err(err.into())
            }
        }
    }

    /// Direct variant: the graph ref comes from the `x-graph-ref` header.
    pub async fn direct(&self, graph_ref: Option<&str>) -> Result<DirectResponse, ReadError> {
        let graph_ref: GraphRef = graph_ref.ok_or(ReadError::MissingGraphRef)?.parse()?;
        let object = self.read(&graph_ref).await?;

        Ok(DirectResponse {
            last_modified: object.last_modified().map(String::from),
            sdl: object.text()?,
        })
    }

    /// Uplink-compatible variant. Every failure is reported in-band as a
    /// `FetchError`, so this never fails at the HTTP level.
    pub async fn uplink(&self, body: &[u8]) -> UplinkResponse {
        match self.try_uplink(body).await {
            Ok(router_config) => UplinkResponse::router_config(router_config),
            Err(err) => {
                if !err.is_not_found() {
                    tracing::warn!(error = %err, "uplink fallback request failed");
                }
                UplinkResponse::fallback_error(err.to_string())
            }
        }
    }

    async fn try_uplink(&self, body: &[u8]) -> Result<RouterConfig, ReadError> {
        if body.is_empty() {
            return Err(ReadError::MissingBody);
        }
        let request: UplinkRequest = serde_json::from_slice(body)
            .map_err(|err| ReadError::InvalidRequest(err.to_string()))?;

        let expected = self.api_key.get().await?;
        let provided = request.variables.api_key.as_bytes();
        if !bool::from(provided.ct_eq(expected.as_bytes())) {
            return Err(ReadError::InvalidApiKey);
        }

        let graph_ref: GraphRef = request.variables.graph_ref.parse()?;
        let object = self.read(&graph_ref).await?;

        Ok(RouterConfig::RouterConfigResult {
            id: object.last_modified().unwrap_or(UNKNOWN_ID).to_string(),
            supergraph_sdl: object.text()?,
            min_delay_seconds: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FALLBACK_ERROR_CODE;
    use crate::secrets::StaticSecretSource;
    use crate::storage::CloudStore;
    use serde_json::json;

    const API_KEY: &str = "service:my-graph:key";
    const SDL: &str = "type Query { me: String }";

    async fn reader_with_schema() -> FallbackStoreReader {
        let store = Arc::new(CloudStore::in_memory());
        let key = ObjectKey::for_graph_ref(&"my-graph@current".parse().unwrap());
        store
            .put(&key, StoredObject::graphql(SDL, "2024-05-01T12:00:00.000Z"))
            .await
            .unwrap();
        FallbackStoreReader::new(
            store,
            Arc::new(SecretCache::new(StaticSecretSource::new(API_KEY))),
        )
    }

    fn uplink_body(api_key: &str, graph_ref: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({ "variables": { "apiKey": api_key, "ref": graph_ref } }))
            .unwrap()
    }

    fn fetch_error_message(response: UplinkResponse) -> String {
        match response.data.unwrap().router_config {
            RouterConfig::FetchError { code, message } => {
                assert_eq!(code, FALLBACK_ERROR_CODE);
                message
            }
            other => panic!("expected FetchError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_direct() {
        let reader = reader_with_schema().await;

        let response = reader.direct(Some("my-graph@current")).await.unwrap();
        assert_eq!(
            response,
            DirectResponse {
                sdl: SDL.into(),
                last_modified: Some("2024-05-01T12:00:00.000Z".into()),
            }
        );

        // Bare graph id reads the current variant
        assert!(reader.direct(Some("my-graph")).await.is_ok());

        assert!(matches!(
            reader.direct(None).await.unwrap_err(),
            ReadError::MissingGraphRef
        ));
        assert!(matches!(
            reader.direct(Some("")).await.unwrap_err(),
            ReadError::GraphRef(_)
        ));
        assert!(
            reader
                .direct(Some("my-graph@staging"))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_uplink() {
        let reader = reader_with_schema().await;

        let response = reader
            .uplink(&uplink_body(API_KEY, "my-graph@current"))
            .await;
        assert_eq!(
            response.data.unwrap().router_config,
            RouterConfig::RouterConfigResult {
                id: "2024-05-01T12:00:00.000Z".into(),
                supergraph_sdl: SDL.into(),
                min_delay_seconds: None,
            }
        );
    }

    #[tokio::test]
    async fn test_uplink_failures_are_fetch_errors() {
        let reader = reader_with_schema().await;

        let message = fetch_error_message(reader.uplink(b"").await);
        assert_eq!(message, "Missing body");

        let message = fetch_error_message(reader.uplink(b"{not json").await);
        assert!(message.starts_with("Invalid request"));

        let message = fetch_error_message(
            reader
                .uplink(&uplink_body("wrong-key", "my-graph@current"))
                .await,
        );
        assert_eq!(message, "Invalid API key");

        let message = fetch_error_message(
            reader
                .uplink(&uplink_body(API_KEY, "my-graph@staging"))
                .await,
        );
        assert_eq!(message, "my-graph@staging.graphql not found");
    }

    #[tokio::test]
    async fn test_missing_last_modified_reports_zero_id() {
        let store = Arc::new(CloudStore::in_memory());
        let key = ObjectKey::for_graph_ref(&"my-graph@current".parse().unwrap());
        store
            .put(
                &key,
                StoredObject {
                    body: SDL.into(),
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();
        let reader = FallbackStoreReader::new(
            store,
            Arc::new(SecretCache::new(StaticSecretSource::new(API_KEY))),
        );

        let response = reader
            .uplink(&uplink_body(API_KEY, "my-graph@current"))
            .await;
        assert!(matches!(
            response.data.unwrap().router_config,
            RouterConfig::RouterConfigResult { id, .. } if id == UNKNOWN_ID
        ));
    }
}
