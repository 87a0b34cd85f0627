//! The fallback store keeps the last known good supergraph per graph ref so it
//! can be served even when uplink is unavailable.

use crate::types::ObjectKey;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path as StorePath;
use object_store::{Attribute, Attributes, PutOptions, PutPayload};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LAST_MODIFIED: &str = "last-modified";
pub const CONTENT_TYPE: &str = "content-type";
pub const GRAPHQL_CONTENT_TYPE: &str = "application/graphql";

pub type Metadata = BTreeMap<String, String>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("stored supergraph is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredObject {
    pub body: Bytes,
    pub metadata: Metadata,
}

impl StoredObject {
    /// A supergraph document stamped with the build timestamp it came from.
    pub fn graphql(body: impl Into<Bytes>, last_modified: &str) -> Self {
        StoredObject {
            body: body.into(),
            metadata: Metadata::from([
                (CONTENT_TYPE.to_string(), GRAPHQL_CONTENT_TYPE.to_string()),
                (LAST_MODIFIED.to_string(), last_modified.to_string()),
            ]),
        }
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.metadata.get(LAST_MODIFIED).map(String::as_str)
    }

    pub fn text(&self) -> Result<String, StoreError> {
        Ok(String::from_utf8(self.body.to_vec())?)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<StoredObject, StoreError>;
    async fn put(&self, key: &ObjectKey, object: StoredObject) -> Result<(), StoreError>;
}

/// Contents of the `<key>.meta.json` sidecar. `sha256` ties the metadata to
/// the blob it was written with.
#[derive(Serialize, Deserialize)]
struct Sidecar {
    sha256: String,
    metadata: Metadata,
}

fn digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Stores each object as a file under `base_dir`, with its metadata in a
/// `<key>.meta.json` sidecar.
///
/// Writers of the same key are serialized. Readers that catch a blob and a
/// sidecar from different writes retry, and drop the metadata if the pair
/// still does not match.
pub struct FilesystemStore {
    base_dir: PathBuf,
    write_locks: parking_lot::Mutex<HashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl FilesystemStore {
    const READ_ATTEMPTS: usize = 3;

    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FilesystemStore {
            base_dir: base_dir.into(),
            write_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn write_lock(&self, key: &ObjectKey) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks.lock().entry(key.clone()).or_default().clone()
    }

    async fn read_blob(&self, key: &ObjectKey) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.blob_path(key)).await {
            Ok(body) => Ok(body),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read_sidecar(&self, key: &ObjectKey) -> Result<Option<Sidecar>, StoreError> {
        match tokio::fs::read(self.metadata_path(key)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn blob_path(&self, key: &ObjectKey) -> PathBuf {
        self.base_dir.join(key.as_str())
    }

    fn metadata_path(&self, key: &ObjectKey) -> PathBuf {
        self.base_dir.join(format!("{key}.meta.json"))
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn get(&self, key: &ObjectKey) -> Result<StoredObject, StoreError> {
        let mut attempt = 1;
        loop {
            let body = self.read_blob(key).await?;

            // Objects written by hand (e.g. a mounted ConfigMap) have no sidecar.
            let metadata = match self.read_sidecar(key).await? {
                None => Metadata::new(),
                Some(sidecar) if sidecar.sha256 == digest(&body) => sidecar.metadata,
                Some(_) if attempt < Self::READ_ATTEMPTS => {
                    attempt += 1;
                    tokio::task::yield_now().await;
                    continue;
                }
                Some(_) => {
                    tracing::warn!(%key, "metadata does not match stored object, ignoring it");
                    Metadata::new()
                }
            };

            return Ok(StoredObject {
                body: body.into(),
                metadata,
            });
        }
    }

    #[tracing::instrument(skip_all, fields(key = %key))]
    async fn put(&self, key: &ObjectKey, object: StoredObject) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let sidecar = serde_json::to_vec(&Sidecar {
            sha256: digest(&object.body),
            metadata: object.metadata,
        })?;

        let lock = self.write_lock(key);
        let _guard = lock.lock().await;
        write_atomic(&self.blob_path(key), &object.body).await?;
        write_atomic(&self.metadata_path(key), &sidecar).await?;

        tracing::debug!(bytes = object.body.len(), base_dir = ?self.base_dir, "stored object");
        Ok(())
    }
}

/// Object storage (S3, GCS or in-memory) through the `object_store` crate.
/// Metadata entries become object attributes.
pub struct CloudStore {
    inner: Arc<dyn object_store::ObjectStore>,
}

impl CloudStore {
    pub fn new(inner: Arc<dyn object_store::ObjectStore>) -> Self {
        CloudStore { inner }
    }

    pub fn s3(bucket: &str, region: Option<&str>) -> Result<Self, StoreError> {
        let mut builder = object_store::aws::AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        Ok(CloudStore::new(Arc::new(builder.build()?)))
    }

    pub fn gcs(bucket: &str) -> Result<Self, StoreError> {
        let store = object_store::gcp::GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()?;
        Ok(CloudStore::new(Arc::new(store)))
    }

    pub fn in_memory() -> Self {
        CloudStore::new(Arc::new(object_store::memory::InMemory::new()))
    }
}

#[async_trait]
impl ObjectStore for CloudStore {
    #[tracing::instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &ObjectKey) -> Result<StoredObject, StoreError> {
        let path = StorePath::from(key.as_str());
        let result = match self.inner.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let metadata = result
            .attributes
            .iter()
            .filter_map(|(attribute, value)| {
                let value: &str = value.as_ref();
                match attribute {
                    Attribute::ContentType => Some((CONTENT_TYPE.to_string(), value.to_string())),
                    Attribute::Metadata(name) => Some((name.to_string(), value.to_string())),
                    _ => None,
                }
            })
            .collect();
        let body = result.bytes().await?;

        Ok(StoredObject { body, metadata })
    }

    #[tracing::instrument(skip_all, fields(key = %key))]
    async fn put(&self, key: &ObjectKey, object: StoredObject) -> Result<(), StoreError> {
        let mut attributes = Attributes::new();
        for (name, value) in object.metadata {
            let attribute = if name == CONTENT_TYPE {
                Attribute::ContentType
            } else {
                Attribute::Metadata(name.into())
            };
            attributes.insert(attribute, value.into());
        }

        let options = PutOptions {
            attributes,
            ..Default::default()
        };
        let put_result = self
            .inner
            .put_opts(
                &StorePath::from(key.as_str()),
                PutPayload::from(object.body),
                options,
            )
            .await?;

        tracing::debug!(?put_result, "stored object");
        Ok(())
    }
}

/// Writes `contents` to a fresh temp file next to `path` and renames it into
/// place, so readers see either the previous or the new file, never a partial
/// one. Concurrent writers each use their own temp file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let path = path.to_path_buf();
    let contents = contents.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&contents)?;
        tmp.persist(&path).map_err(|err| err.error)?;
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GraphRef;

    fn key() -> ObjectKey {
        ObjectKey::for_graph_ref(&"my-graph@current".parse::<GraphRef>().unwrap())
    }

    #[tokio::test]
    async fn test_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());

        let object = StoredObject::graphql("type Query { a: Int }", "2024-01-01T00:00:00Z");
        store.put(&key(), object.clone()).await.unwrap();

        let loaded = store.get(&key()).await.unwrap();
        assert_eq!(loaded, object);
        assert_eq!(loaded.last_modified(), Some("2024-01-01T00:00:00Z"));
        assert!(dir.path().join("my-graph@current.graphql").exists());

        // Overwrite with a newer build
        let newer = StoredObject::graphql("type Query { b: Int }", "2024-01-02T00:00:00Z");
        store.put(&key(), newer.clone()).await.unwrap();
        assert_eq!(store.get(&key()).await.unwrap(), newer);
    }

    #[tokio::test]
    async fn test_filesystem_without_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("my-graph@current.graphql"), "type Query { a: Int }").unwrap();

        let store = FilesystemStore::new(dir.path());
        let loaded = store.get(&key()).await.unwrap();
        assert_eq!(loaded.text().unwrap(), "type Query { a: Int }");
        assert_eq!(loaded.last_modified(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_filesystem_concurrent_puts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemStore::new(dir.path()));

        for round in 0..20 {
            let writers: Vec<_> = (0..8)
                .map(|writer| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        let object = StoredObject::graphql(
                            format!("type Query {{ v{round}_{writer}: Int }}"),
                            &format!("2024-01-01T00:{round:02}:{writer:02}Z"),
                        );
                        store.put(&key(), object).await
                    })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap().unwrap();
            }

            // Body and metadata always come from the same write
            let loaded = store.get(&key()).await.unwrap();
            let text = loaded.text().unwrap();
            let writer: u32 = text
                .trim_start_matches(&format!("type Query {{ v{round}_"))
                .trim_end_matches(": Int }")
                .parse()
                .unwrap();
            assert_eq!(
                loaded.last_modified(),
                Some(format!("2024-01-01T00:{round:02}:{writer:02}Z").as_str())
            );
        }

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 2, "unexpected files {leftovers:?}");
    }

    #[tokio::test]
    async fn test_filesystem_ignores_mismatched_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        store
            .put(
                &key(),
                StoredObject::graphql("type Query { a: Int }", "2024-01-01T00:00:00Z"),
            )
            .await
            .unwrap();

        // Blob replaced without its sidecar
        std::fs::write(dir.path().join("my-graph@current.graphql"), "type Query { b: Int }").unwrap();

        let loaded = store.get(&key()).await.unwrap();
        assert_eq!(loaded.text().unwrap(), "type Query { b: Int }");
        assert_eq!(loaded.last_modified(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_write_atomic_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supergraph.graphql");

        let writes: Vec<_> = (0..16)
            .map(|i| {
                let path = path.clone();
                tokio::spawn(async move {
                    write_atomic(&path, format!("type Query {{ v{i}: Int }}").as_bytes()).await
                })
            })
            .collect();
        for write in writes {
            write.await.unwrap().unwrap();
        }
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("type Query { v"));
    }

    #[tokio::test]
    async fn test_filesystem_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().join("missing"));

        let err = store.get(&key()).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "my-graph@current.graphql not found");
    }

    #[tokio::test]
    async fn test_cloud_store_in_memory() {
        let store = CloudStore::in_memory();

        assert!(store.get(&key()).await.unwrap_err().is_not_found());

        let object = StoredObject::graphql("type Query { a: Int }", "2024-01-01T00:00:00Z");
        store.put(&key(), object.clone()).await.unwrap();

        let loaded = store.get(&key()).await.unwrap();
        assert_eq!(loaded.text().unwrap(), "type Query { a: Int }");
        assert_eq!(loaded.last_modified(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(
            loaded.metadata.get(CONTENT_TYPE).map(String::as_str),
            Some(GRAPHQL_CONTENT_TYPE)
        );
    }
}
