//! 容器供给与核心存储操作：确保容器存在后再读写。

use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::listing::{ListingView, project};
use crate::namespace::NamespaceKey;
use crate::store::{BlobContent, BlobEntry, BlobStore, StoreError};

/// 进程级共享，可被并发请求同时使用。
#[derive(Clone)]
pub struct Containers {
    store: Arc<dyn BlobStore>,
    default_namespace: NamespaceKey,
    timeout: Option<Duration>,
    admin_concurrency: usize,
}

impl Containers {
    pub fn new(
        store: Arc<dyn BlobStore>,
        default_namespace: NamespaceKey,
        timeout: Duration,
        admin_concurrency: usize,
    ) -> Self {
        Self {
            store,
            default_namespace,
            timeout: (!timeout.is_zero()).then_some(timeout),
            admin_concurrency: admin_concurrency.max(1),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.store.kind()
    }

    pub fn default_namespace(&self) -> &NamespaceKey {
        &self.default_namespace
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                StoreError::Unavailable(format!("{operation} timed out after {limit:?}"))
            })?,
            None => fut.await,
        }
    }

    /// 幂等：容器已存在时直接成功。
    pub async fn ensure(&self, namespace: &NamespaceKey) -> Result<(), StoreError> {
        self.bounded("ensure container", self.store.ensure_container(namespace))
            .await
    }

    pub async fn put(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
        source: &Path,
    ) -> Result<(), StoreError> {
        self.ensure(namespace).await?;
        self.bounded("put blob", self.store.put_blob(namespace, blob_name, source))
            .await?;
        info!(%namespace, blob = blob_name, "blob stored");
        Ok(())
    }

    pub async fn list(&self, namespace: &NamespaceKey) -> Result<Vec<BlobEntry>, StoreError> {
        self.ensure(namespace).await?;
        let entries: Vec<BlobEntry> = self
            .bounded("list blobs", self.store.list_blobs(namespace).try_collect())
            .await?;
        debug!(%namespace, count = entries.len(), "blobs listed");
        Ok(entries)
    }

    pub async fn delete(&self, namespace: &NamespaceKey, blob_name: &str) -> Result<(), StoreError> {
        self.bounded("delete blob", self.store.delete_blob(namespace, blob_name))
            .await?;
        info!(%namespace, blob = blob_name, "blob deleted");
        Ok(())
    }

    pub async fn open(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
    ) -> Result<BlobContent, StoreError> {
        self.bounded("open blob", self.store.open_blob(namespace, blob_name))
            .await
    }

    pub async fn namespaces(&self) -> Result<Vec<NamespaceKey>, StoreError> {
        self.bounded("list containers", self.store.list_containers().try_collect())
            .await
    }

    /// 汇总所有命名空间的条目，并发度受 `admin_concurrency` 限制。
    ///
    /// 结果按命名空间枚举顺序拼接，全局排序交给投影完成。
    pub async fn list_all(&self) -> Result<Vec<BlobEntry>, StoreError> {
        let namespaces = self.namespaces().await?;
        let count = namespaces.len();
        let per_namespace: Vec<Vec<BlobEntry>> = stream::iter(namespaces)
            .map(|namespace| async move { self.list(&namespace).await })
            .buffered(self.admin_concurrency)
            .try_collect()
            .await?;
        let entries: Vec<BlobEntry> = per_namespace.into_iter().flatten().collect();
        info!(namespaces = count, count = entries.len(), "aggregated listing");
        Ok(entries)
    }

    pub async fn personal_view(&self, namespace: &NamespaceKey) -> Result<ListingView, StoreError> {
        Ok(project(self.list(namespace).await?))
    }

    pub async fn admin_view(&self) -> Result<ListingView, StoreError> {
        Ok(project(self.list_all().await?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::namespace::resolve;
    use crate::store::memory::MemoryBlobStore;
    use crate::store::{BlobStream, NamespaceStream};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    pub(crate) fn make_containers(store: Arc<dyn BlobStore>) -> Containers {
        Containers::new(store, resolve("shared"), Duration::from_secs(5), 4)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).expect("timestamp")
    }

    /// 统计调用次数，并在 put 时返回失败。
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub inner: MemoryBlobStore,
        pub ensure_calls: AtomicUsize,
        pub fail_put: bool,
        pub hang_list: bool,
    }

    #[async_trait]
    impl BlobStore for FlakyStore {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        async fn ensure_container(&self, namespace: &NamespaceKey) -> Result<(), StoreError> {
            self.ensure_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.ensure_container(namespace).await
        }

        async fn put_blob(
            &self,
            namespace: &NamespaceKey,
            blob_name: &str,
            source: &Path,
        ) -> Result<(), StoreError> {
            if self.fail_put {
                return Err(StoreError::Unavailable("backend offline".into()));
            }
            self.inner.put_blob(namespace, blob_name, source).await
        }

        fn list_blobs<'a>(&'a self, namespace: &'a NamespaceKey) -> BlobStream<'a> {
            if self.hang_list {
                return stream::pending().boxed();
            }
            self.inner.list_blobs(namespace)
        }

        async fn delete_blob(
            &self,
            namespace: &NamespaceKey,
            blob_name: &str,
        ) -> Result<(), StoreError> {
            self.inner.delete_blob(namespace, blob_name).await
        }

        fn list_containers(&self) -> NamespaceStream<'_> {
            self.inner.list_containers()
        }

        async fn open_blob(
            &self,
            namespace: &NamespaceKey,
            blob_name: &str,
        ) -> Result<BlobContent, StoreError> {
            self.inner.open_blob(namespace, blob_name).await
        }
    }

    #[tokio::test]
    async fn ensure_repeated_has_single_effect() {
        let store = Arc::new(MemoryBlobStore::new());
        let containers = make_containers(store.clone());
        let ns = resolve("alice");
        for _ in 0..5 {
            containers.ensure(&ns).await.expect("ensure");
        }
        assert_eq!(containers.namespaces().await.expect("namespaces"), vec![ns.clone()]);
        assert!(containers.list(&ns).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn concurrent_ensure_does_not_fail() {
        let containers = make_containers(Arc::new(MemoryBlobStore::new()));
        let ns = resolve("alice");
        let results = futures_util::future::join_all((0..8).map(|_| containers.ensure(&ns))).await;
        assert!(results.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn list_provisions_missing_namespace() {
        let store = Arc::new(FlakyStore::default());
        let containers = make_containers(store.clone());
        let view = containers
            .personal_view(&resolve("newcomer"))
            .await
            .expect("view");
        assert!(view.is_empty());
        assert_eq!(store.ensure_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn put_then_list_round_trip() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("file-1.txt");
        std::fs::write(&source, b"hello").expect("write");
        let containers = make_containers(Arc::new(MemoryBlobStore::new()));
        let ns = resolve("alice");

        let before = Utc::now();
        containers.put(&ns, "hello.txt", &source).await.expect("put");
        let entries = containers.list(&ns).await.expect("list");
        let entry = entries
            .iter()
            .find(|entry| entry.name == "hello.txt")
            .expect("entry present");
        assert!(entry.created_on >= before);
    }

    #[tokio::test]
    async fn delete_then_list_and_missing_delete() {
        let store = Arc::new(MemoryBlobStore::new());
        let containers = make_containers(store.clone());
        let ns = resolve("alice");
        containers.ensure(&ns).await.expect("ensure");
        store
            .insert_at(&ns, "a.txt", Bytes::from_static(b"a"), at(10))
            .await
            .expect("insert");

        containers.delete(&ns, "a.txt").await.expect("delete");
        let entries = containers.list(&ns).await.expect("list");
        assert!(entries.iter().all(|entry| entry.name != "a.txt"));
        assert!(matches!(
            containers.delete(&ns, "a.txt").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn admin_view_orders_across_namespaces() {
        let store = Arc::new(MemoryBlobStore::new());
        let containers = make_containers(store.clone());
        let (a, b) = (resolve("a"), resolve("b"));
        for ns in [&a, &b] {
            containers.ensure(ns).await.expect("ensure");
        }
        store
            .insert_at(&a, "from-a", Bytes::from_static(b"a"), at(100))
            .await
            .expect("insert");
        store
            .insert_at(&b, "from-b", Bytes::from_static(b"b"), at(200))
            .await
            .expect("insert");

        let view = containers.admin_view().await.expect("admin view");
        assert_eq!(view.names, vec!["from-b", "from-a"]);
        assert_eq!(view.namespaces, vec![b, a]);
    }

    #[tokio::test]
    async fn hung_backend_times_out() {
        let store = Arc::new(FlakyStore {
            hang_list: true,
            ..FlakyStore::default()
        });
        let containers = Containers::new(store, resolve("shared"), Duration::from_millis(50), 1);
        let result = containers.list(&resolve("alice")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
