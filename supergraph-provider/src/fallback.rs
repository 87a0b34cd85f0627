//! Stand-by supergraph sources, consulted once at startup.

use crate::types::SchemaDocument;
use async_trait::async_trait;
use fallback_store::reader::{GRAPH_REF_HEADER, UNKNOWN_ID};
use fallback_store::storage::{LAST_MODIFIED, ObjectStore, StoreError};
use fallback_store::{GraphRef, ObjectKey};
use reqwest::StatusCode;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Id of documents loaded from a local file.
pub const FILE_ID: &str = "file";

#[derive(thiserror::Error, Debug)]
pub enum FallbackError {
    #[error("could not read fallback supergraph {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not load fallback supergraph from store: {0}")]
    Store(#[from] StoreError),

    #[error("fallback endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("fallback endpoint returned HTTP {0}")]
    Status(StatusCode),

    #[error("fallback supergraph is empty")]
    Empty,

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait FallbackResolver: Send + Sync {
    async fn resolve(&self) -> Result<SchemaDocument, FallbackError>;
}

fn non_empty(document: SchemaDocument) -> Result<SchemaDocument, FallbackError> {
    if document.sdl.trim().is_empty() {
        return Err(FallbackError::Empty);
    }
    Ok(document)
}

/// A supergraph file on local disk, e.g. a mounted ConfigMap.
pub struct FileFallback {
    path: PathBuf,
}

impl FileFallback {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileFallback { path: path.into() }
    }
}

#[async_trait]
impl FallbackResolver for FileFallback {
    async fn resolve(&self) -> Result<SchemaDocument, FallbackError> {
        let sdl = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| FallbackError::File {
                path: self.path.clone(),
                source,
            })?;
        tracing::info!(path = ?self.path, "loaded fallback supergraph from file");
        non_empty(SchemaDocument::new(FILE_ID, sdl))
    }
}

/// Reads the copy kept in the fallback store by the webhook writer.
pub struct StoreFallback {
    store: Arc<dyn ObjectStore>,
    graph_ref: GraphRef,
}

impl StoreFallback {
    pub fn new(store: Arc<dyn ObjectStore>, graph_ref: GraphRef) -> Self {
        StoreFallback { store, graph_ref }
    }
}

#[async_trait]
impl FallbackResolver for StoreFallback {
    async fn resolve(&self) -> Result<SchemaDocument, FallbackError> {
        let key = ObjectKey::for_graph_ref(&self.graph_ref);
        let object = self.store.get(&key).await?;
        let id = object.last_modified().unwrap_or(UNKNOWN_ID).to_string();
        tracing::info!(%key, %id, "loaded fallback supergraph from store");
        non_empty(SchemaDocument::new(id, object.text()?))
    }
}

/// Asks a direct fallback responder (`/supergraph`) for the stored copy.
pub struct EndpointFallback {
    client: reqwest::Client,
    url: Url,
    graph_ref: GraphRef,
    timeout: Duration,
}

impl EndpointFallback {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(url: Url, graph_ref: GraphRef) -> Self {
        EndpointFallback {
            client: reqwest::Client::new(),
            url,
            graph_ref,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FallbackResolver for EndpointFallback {
    async fn resolve(&self) -> Result<SchemaDocument, FallbackError> {
        let response = self
            .client
            .get(self.url.clone())
            .header(GRAPH_REF_HEADER, self.graph_ref.to_string())
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FallbackError::Status(response.status()));
        }

        let id = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(UNKNOWN_ID)
            .to_string();
        let sdl = response.text().await?;

        tracing::info!(url = %self.url, %id, "loaded fallback supergraph from endpoint");
        non_empty(SchemaDocument::new(id, sdl))
    }
}

/// Adapts an async closure, for embedding hosts with their own cache.
pub struct FnFallback<F> {
    f: F,
}

impl<F> FnFallback<F> {
    pub fn new(f: F) -> Self {
        FnFallback { f }
    }
}

#[async_trait]
impl<F, Fut> FallbackResolver for FnFallback<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<SchemaDocument, FallbackError>> + Send,
{
    async fn resolve(&self) -> Result<SchemaDocument, FallbackError> {
        (self.f)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fallback_store::storage::{CloudStore, StoredObject};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SDL: &str = "type Query { me: String }";

    fn graph_ref() -> GraphRef {
        "my-graph@current".parse().unwrap()
    }

    #[tokio::test]
    async fn test_file_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supergraph.graphql");
        std::fs::write(&path, SDL).unwrap();

        let document = FileFallback::new(&path).resolve().await.unwrap();
        assert_eq!(document, SchemaDocument::new(FILE_ID, SDL));

        let err = FileFallback::new(dir.path().join("missing.graphql"))
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::File { .. }));

        std::fs::write(&path, "\n").unwrap();
        let err = FileFallback::new(&path).resolve().await.unwrap_err();
        assert!(matches!(err, FallbackError::Empty));
    }

    #[tokio::test]
    async fn test_store_fallback() {
        let store = Arc::new(CloudStore::in_memory());
        let fallback = StoreFallback::new(store.clone(), graph_ref());

        let err = fallback.resolve().await.unwrap_err();
        assert!(matches!(err, FallbackError::Store(ref e) if e.is_not_found()));

        store
            .put(
                &ObjectKey::for_graph_ref(&graph_ref()),
                StoredObject::graphql(SDL, "2024-05-01T12:00:00.000Z"),
            )
            .await
            .unwrap();
        let document = fallback.resolve().await.unwrap();
        assert_eq!(
            document,
            SchemaDocument::new("2024-05-01T12:00:00.000Z", SDL)
        );
    }

    #[tokio::test]
    async fn test_endpoint_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/supergraph"))
            .and(header(GRAPH_REF_HEADER, "my-graph@current"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(LAST_MODIFIED, "2024-05-01T12:00:00.000Z")
                    .set_body_string(SDL),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/supergraph", server.uri())).unwrap();
        let document = EndpointFallback::new(url, graph_ref())
            .resolve()
            .await
            .unwrap();
        assert_eq!(
            document,
            SchemaDocument::new("2024-05-01T12:00:00.000Z", SDL)
        );
    }

    #[tokio::test]
    async fn test_endpoint_fallback_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/supergraph", server.uri())).unwrap();
        let err = EndpointFallback::new(url, graph_ref())
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::Status(StatusCode::NOT_FOUND)));
    }

    #[tokio::test]
    async fn test_endpoint_fallback_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(SDL)
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/supergraph", server.uri())).unwrap();
        let err = EndpointFallback::new(url, graph_ref())
            .with_timeout(Duration::from_millis(100))
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::Request(ref e) if e.is_timeout()));
    }

    #[tokio::test]
    async fn test_fn_fallback() {
        let fallback =
            FnFallback::new(|| async { Ok::<_, FallbackError>(SchemaDocument::new("custom", SDL)) });
        assert_eq!(fallback.resolve().await.unwrap().id, "custom");
    }
}
