use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use axonhub_common::{GatewayError, GatewayResult};

use crate::object::BlobStore;

/// Local-filesystem backend jailed to its configured root directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_settings(settings: &serde_json::Value) -> GatewayResult<Self> {
        let directory = settings
            .get("directory")
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                GatewayError::InternalStorage("fs storage requires a directory".to_string())
            })?;
        Ok(Self::new(directory))
    }

    /// Resolve a storage key inside the jail; traversal segments are
    /// rejected, never normalized away.
    fn resolve(&self, key: &str) -> GatewayResult<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(GatewayError::InternalStorage(format!(
                        "storage key escapes the fs root: {key}"
                    )));
                }
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl BlobStore for FsStore {
    async fn save(&self, key: &str, data: &[u8]) -> GatewayResult<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        Ok(key.to_string())
    }

    async fn load(&self, key: &str) -> GatewayResult<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(GatewayError::InternalStorage(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let key = "/42/requests/7/request_body.json";
        store.save(key, b"{\"a\":1}").await.unwrap();
        assert_eq!(store.load(key).await.unwrap(), b"{\"a\":1}");
        store.delete(key).await.unwrap();
        assert!(store.load(key).await.is_err());
        // Idempotent delete.
        store.delete(key).await.unwrap();
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        assert!(store.save("/../escape.json", b"x").await.is_err());
        assert!(store.load("/a/../../escape.json").await.is_err());
    }
}
