use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{ServiceError, ServiceResult};

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `bytes` under `path` and return a download URL.
    async fn upload(&self, bytes: Bytes, path: &str) -> ServiceResult<String>;

    async fn download(&self, url: &str) -> ServiceResult<Bytes>;

    async fn delete(&self, url: &str) -> ServiceResult<()>;
}

const MEMORY_SCHEME: &str = "mem://";

/// In-memory adapter for tests and local wiring. URLs take the form
/// `mem://<path>`.
#[derive(Default)]
pub struct InMemoryBlobStorage {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl InMemoryBlobStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn path_of(url: &str) -> ServiceResult<&str> {
        url.strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| ServiceError::Rejected(format!("unsupported blob url {url}")))
    }
}

#[async_trait]
impl BlobStorage for InMemoryBlobStorage {
    async fn upload(&self, bytes: Bytes, path: &str) -> ServiceResult<String> {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(ServiceError::Rejected("empty blob path".into()));
        }
        self.objects.write().insert(path.to_string(), bytes);
        Ok(format!("{MEMORY_SCHEME}{path}"))
    }

    async fn download(&self, url: &str) -> ServiceResult<Bytes> {
        let path = Self::path_of(url)?;
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(url.to_string()))
    }

    async fn delete(&self, url: &str) -> ServiceResult<()> {
        let path = Self::path_of(url)?;
        self.objects
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_download_delete() {
        let blobs = InMemoryBlobStorage::new();
        let url = blobs
            .upload(Bytes::from_static(b"frames"), "/recordings/s1/u1.mp4")
            .await
            .unwrap();
        assert_eq!(url, "mem://recordings/s1/u1.mp4");
        assert_eq!(
            blobs.download(&url).await.unwrap(),
            Bytes::from_static(b"frames")
        );
        blobs.delete(&url).await.unwrap();
        assert!(matches!(
            blobs.download(&url).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(blobs.is_empty());
    }
}
