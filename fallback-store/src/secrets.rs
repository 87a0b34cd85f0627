//! Secrets (webhook signing secret, graph API key) are looked up through an
//! opaque async source and memoized for the lifetime of the process.
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use tokio::sync::OnceCell;

#[derive(thiserror::Error, Debug)]
pub enum SecretError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("could not read secret file {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("secret is empty")]
    Empty,
}

#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self) -> Result<String, SecretError>;
}

/// Reads the secret from an environment variable.
pub struct EnvSecretSource {
    var: String,
}

impl EnvSecretSource {
    pub fn new(var: impl Into<String>) -> Self {
        EnvSecretSource { var: var.into() }
    }
}

#[async_trait]
impl SecretSource for EnvSecretSource {
    async fn fetch(&self) -> Result<String, SecretError> {
        std::env::var(&self.var).map_err(|_| SecretError::MissingEnv(self.var.clone()))
    }
}

/// Reads the secret from a mounted file. A trailing newline is dropped.
pub struct FileSecretSource {
    path: PathBuf,
}

impl FileSecretSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSecretSource { path: path.into() }
    }
}

#[async_trait]
impl SecretSource for FileSecretSource {
    async fn fetch(&self) -> Result<String, SecretError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SecretError::File {
                path: self.path.clone(),
                source,
            })?;
        Ok(contents.trim_end_matches(['\r', '\n']).to_string())
    }
}

pub struct StaticSecretSource {
    value: String,
}

impl StaticSecretSource {
    pub fn new(value: impl Into<String>) -> Self {
        StaticSecretSource {
            value: value.into(),
        }
    }
}

#[async_trait]
impl SecretSource for StaticSecretSource {
    async fn fetch(&self) -> Result<String, SecretError> {
        Ok(self.value.clone())
    }
}

/// Where a secret comes from, as written in the config file.
#[derive(Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum SecretRef {
    Env { var: String },
    File { path: PathBuf },
    Static { value: String },
}

impl SecretRef {
    pub fn into_source(self) -> Box<dyn SecretSource> {
        match self {
            SecretRef::Env { var } => Box::new(EnvSecretSource::new(var)),
            SecretRef::File { path } => Box::new(FileSecretSource::new(path)),
            SecretRef::Static { value } => Box::new(StaticSecretSource::new(value)),
        }
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRef::Env { var } => f.debug_struct("Env").field("var", var).finish(),
            SecretRef::File { path } => f.debug_struct("File").field("path", path).finish(),
            SecretRef::Static { .. } => f
                .debug_struct("Static")
                .field("value", &"<redacted>")
                .finish(),
        }
    }
}

/// Memoized secret. The first successful lookup is kept for the lifetime of
/// the cache; concurrent first callers share a single lookup. Failed lookups
/// are not cached.
pub struct SecretCache {
    source: Box<dyn SecretSource>,
    value: OnceCell<String>,
}

impl SecretCache {
    pub fn new(source: impl SecretSource + 'static) -> Self {
        SecretCache::from_source(Box::new(source))
    }

    pub fn from_source(source: Box<dyn SecretSource>) -> Self {
        SecretCache {
            source,
            value: OnceCell::new(),
        }
    }

    pub fn from_ref(secret_ref: SecretRef) -> Self {
        SecretCache::from_source(secret_ref.into_source())
    }

    pub async fn get(&self) -> Result<&str, SecretError> {
        let value = self
            .value
            .get_or_try_init(|| async {
                let value = self.source.fetch().await?;
                if value.is_empty() {
                    return Err(SecretError::Empty);
                }
                Ok(value)
            })
            .await?;
        Ok(value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSource {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SecretSource for CountingSource {
        async fn fetch(&self) -> Result<String, SecretError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok("s3cr3t".into())
        }
    }

    #[tokio::test]
    async fn test_secret_fetched_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(SecretCache::new(CountingSource {
            calls: calls.clone(),
        }));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get().await.unwrap().to_string() })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), "s3cr3t");
        }
        assert_eq!(cache.get().await.unwrap(), "s3cr3t");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_file_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webhook-secret");
        std::fs::write(&path, "from-file\n").unwrap();

        let cache = SecretCache::from_ref(SecretRef::File { path });
        assert_eq!(cache.get().await.unwrap(), "from-file");
    }

    #[tokio::test]
    async fn test_missing_secrets() {
        let cache = SecretCache::from_ref(SecretRef::Env {
            var: "UPLINK_FALLBACK_TEST_SURELY_UNSET".into(),
        });
        assert!(matches!(
            cache.get().await.unwrap_err(),
            SecretError::MissingEnv(_)
        ));

        let cache = SecretCache::new(StaticSecretSource::new(""));
        assert!(matches!(cache.get().await.unwrap_err(), SecretError::Empty));
    }

    #[test]
    fn test_static_secret_is_redacted() {
        let secret_ref = SecretRef::Static {
            value: "hunter2".into(),
        };
        assert!(!format!("{secret_ref:?}").contains("hunter2"));
    }
}
