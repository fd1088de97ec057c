//! 进程内存后端，用于开发与测试。

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::TryFutureExt;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use tokio::sync::RwLock;

use super::{
    BlobContent, BlobEntry, BlobStore, BlobStream, NamespaceStream, StoreError, check_blob_name,
    gateway_blob_url,
};
use crate::namespace::NamespaceKey;

#[derive(Clone, Debug)]
struct MemoryBlob {
    data: Bytes,
    created_on: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    containers: RwLock<HashMap<NamespaceKey, HashMap<String, MemoryBlob>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以指定创建时间写入 blob，容器不存在时报错。
    pub async fn insert_at(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
        data: Bytes,
        created_on: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        check_blob_name(blob_name)?;
        let mut containers = self.containers.write().await;
        let container = containers
            .get_mut(namespace)
            .ok_or_else(|| StoreError::Unavailable(format!("container {namespace} not found")))?;
        container.insert(blob_name.to_string(), MemoryBlob { data, created_on });
        Ok(())
    }
}

fn check_namespace(namespace: &NamespaceKey) -> Result<(), StoreError> {
    if namespace.as_str().is_empty() {
        return Err(StoreError::InvalidNamespace(String::new()));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ensure_container(&self, namespace: &NamespaceKey) -> Result<(), StoreError> {
        check_namespace(namespace)?;
        self.containers
            .write()
            .await
            .entry(namespace.clone())
            .or_default();
        Ok(())
    }

    async fn put_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
        source: &Path,
    ) -> Result<(), StoreError> {
        check_namespace(namespace)?;
        let data = tokio::fs::read(source)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        self.insert_at(namespace, blob_name, Bytes::from(data), Utc::now())
            .await
    }

    fn list_blobs<'a>(&'a self, namespace: &'a NamespaceKey) -> BlobStream<'a> {
        async move {
            check_namespace(namespace)?;
            let containers = self.containers.read().await;
            let container = containers.get(namespace).ok_or_else(|| {
                StoreError::Unavailable(format!("container {namespace} not found"))
            })?;
            let entries = container
                .iter()
                .map(|(name, blob)| {
                    Ok::<_, StoreError>(BlobEntry {
                        namespace: namespace.clone(),
                        name: name.clone(),
                        url: gateway_blob_url(namespace, name),
                        created_on: blob.created_on,
                    })
                })
                .collect::<Vec<_>>();
            Ok::<_, StoreError>(stream::iter(entries))
        }
        .try_flatten_stream()
        .boxed()
    }

    async fn delete_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
    ) -> Result<(), StoreError> {
        let mut containers = self.containers.write().await;
        containers
            .get_mut(namespace)
            .and_then(|container| container.remove(blob_name))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(blob_name.to_string()))
    }

    fn list_containers(&self) -> NamespaceStream<'_> {
        async move {
            let names = self
                .containers
                .read()
                .await
                .keys()
                .cloned()
                .map(Ok::<_, StoreError>)
                .collect::<Vec<_>>();
            Ok::<_, StoreError>(stream::iter(names))
        }
        .try_flatten_stream()
        .boxed()
    }

    async fn open_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
    ) -> Result<BlobContent, StoreError> {
        let containers = self.containers.read().await;
        let blob = containers
            .get(namespace)
            .and_then(|container| container.get(blob_name))
            .ok_or_else(|| StoreError::NotFound(blob_name.to_string()))?;
        Ok(BlobContent {
            size: Some(blob.data.len() as u64),
            reader: Box::pin(Cursor::new(blob.data.clone())),
        })
    }
}
