//! 本地目录后端：存储根目录下每个命名空间一个子目录。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryFutureExt;
use futures_util::stream::{self, StreamExt};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry, File};
use tracing::debug;

use super::{
    BlobContent, BlobEntry, BlobStore, BlobStream, NamespaceStream, StoreError, check_blob_name,
    gateway_blob_url,
};
use crate::atomic::AtomicFile;
use crate::namespace::NamespaceKey;

#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    fn container_path(&self, namespace: &NamespaceKey) -> Result<PathBuf, StoreError> {
        let name = namespace.as_str();
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
            return Err(StoreError::InvalidNamespace(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    fn blob_path(&self, namespace: &NamespaceKey, blob_name: &str) -> Result<PathBuf, StoreError> {
        let container = self.container_path(namespace)?;
        check_blob_name(blob_name)?;
        Ok(container.join(blob_name))
    }
}

fn unavailable(err: io::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

async fn blob_from_entry(
    namespace: &NamespaceKey,
    entry: &DirEntry,
) -> Result<Option<BlobEntry>, StoreError> {
    let name = entry.file_name().to_string_lossy().to_string();
    if name.starts_with('.') {
        return Ok(None);
    }
    let metadata = entry.metadata().await.map_err(unavailable)?;
    if !metadata.is_file() {
        return Ok(None);
    }
    // 不支持创建时间的文件系统上退回到修改时间。
    let created = metadata
        .created()
        .or_else(|_| metadata.modified())
        .map_err(unavailable)?;
    Ok(Some(BlobEntry {
        namespace: namespace.clone(),
        url: gateway_blob_url(namespace, &name),
        name,
        created_on: DateTime::<Utc>::from(created),
    }))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn kind(&self) -> &'static str {
        "fs"
    }

    async fn ensure_container(&self, namespace: &NamespaceKey) -> Result<(), StoreError> {
        let path = self.container_path(namespace)?;
        fs::create_dir_all(&path).await.map_err(unavailable)?;
        debug!(path = ?path, "container ready");
        Ok(())
    }

    async fn put_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
        source: &Path,
    ) -> Result<(), StoreError> {
        let target = self.blob_path(namespace, blob_name)?;
        let mut source_file = File::open(source).await.map_err(unavailable)?;
        let mut atomic = AtomicFile::new(&target).await.map_err(unavailable)?;
        if let Err(err) = tokio::io::copy(&mut source_file, atomic.file_mut()).await {
            atomic.cleanup().await;
            return Err(unavailable(err));
        }
        atomic.finalize().await.map_err(unavailable)
    }

    fn list_blobs<'a>(&'a self, namespace: &'a NamespaceKey) -> BlobStream<'a> {
        async move {
            let path = self.container_path(namespace)?;
            let dir = fs::read_dir(&path).await.map_err(unavailable)?;
            Ok::<_, StoreError>(stream::try_unfold(dir, move |mut dir| async move {
                while let Some(entry) = dir.next_entry().await.map_err(unavailable)? {
                    if let Some(blob) = blob_from_entry(namespace, &entry).await? {
                        return Ok(Some((blob, dir)));
                    }
                }
                Ok::<_, StoreError>(None)
            }))
        }
        .try_flatten_stream()
        .boxed()
    }

    async fn delete_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
    ) -> Result<(), StoreError> {
        let target = self.blob_path(namespace, blob_name)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(blob_name.to_string()))
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    fn list_containers(&self) -> NamespaceStream<'_> {
        async move {
            let dir = fs::read_dir(&self.root).await.map_err(unavailable)?;
            Ok::<_, StoreError>(stream::try_unfold(dir, |mut dir| async move {
                while let Some(entry) = dir.next_entry().await.map_err(unavailable)? {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with('.') {
                        continue;
                    }
                    let file_type = entry.file_type().await.map_err(unavailable)?;
                    if file_type.is_dir() {
                        return Ok(Some((NamespaceKey::from_backend(name), dir)));
                    }
                }
                Ok::<_, StoreError>(None)
            }))
        }
        .try_flatten_stream()
        .boxed()
    }

    async fn open_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
    ) -> Result<BlobContent, StoreError> {
        let target = self.blob_path(namespace, blob_name)?;
        let file = File::open(&target).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => StoreError::NotFound(blob_name.to_string()),
            _ => unavailable(err),
        })?;
        let metadata = file.metadata().await.map_err(unavailable)?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound(blob_name.to_string()));
        }
        Ok(BlobContent {
            size: Some(metadata.len()),
            reader: Box::pin(file),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::resolve;
    use futures_util::TryStreamExt;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    fn make_store() -> (tempfile::TempDir, FsBlobStore) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create storage root");
        (temp, FsBlobStore::new(root))
    }

    fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).expect("write source");
        path
    }

    #[tokio::test]
    async fn put_then_list_includes_blob() {
        let (temp, store) = make_store();
        let ns = resolve("alice");
        store.ensure_container(&ns).await.expect("ensure");
        let before = Utc::now();
        let source = write_source(temp.path(), "file-1.pdf", b"pdf");
        store
            .put_blob(&ns, "report.pdf", &source)
            .await
            .expect("put");

        let entries: Vec<_> = store.list_blobs(&ns).try_collect().await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "report.pdf");
        assert_eq!(entries[0].url, "/blobs/alice/report.pdf");
        // 文件系统时间戳可能使用粗粒度时钟。
        assert!(entries[0].created_on >= before - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn second_put_overwrites_first() {
        let (temp, store) = make_store();
        let ns = resolve("alice");
        store.ensure_container(&ns).await.expect("ensure");
        let first = write_source(temp.path(), "a", b"first");
        let second = write_source(temp.path(), "b", b"second");
        store.put_blob(&ns, "report.pdf", &first).await.expect("put");
        store.put_blob(&ns, "report.pdf", &second).await.expect("put");

        let entries: Vec<_> = store.list_blobs(&ns).try_collect().await.expect("list");
        assert_eq!(entries.len(), 1);

        let mut content = store.open_blob(&ns, "report.pdf").await.expect("open");
        let mut data = Vec::new();
        content.reader.read_to_end(&mut data).await.expect("read");
        assert_eq!(data, b"second");
        assert_eq!(content.size, Some(6));
    }

    #[tokio::test]
    async fn delete_removes_blob_and_reports_missing() {
        let (temp, store) = make_store();
        let ns = resolve("alice");
        store.ensure_container(&ns).await.expect("ensure");
        let source = write_source(temp.path(), "a", b"data");
        store.put_blob(&ns, "notes.txt", &source).await.expect("put");

        store.delete_blob(&ns, "notes.txt").await.expect("delete");
        let entries: Vec<_> = store.list_blobs(&ns).try_collect().await.expect("list");
        assert!(entries.is_empty());

        let result = store.delete_blob(&ns, "notes.txt").await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn ensure_is_idempotent_and_containers_are_listed() {
        let (_temp, store) = make_store();
        for _ in 0..3 {
            store.ensure_container(&resolve("alice")).await.expect("ensure");
        }
        store.ensure_container(&resolve("bob")).await.expect("ensure");

        let mut names: Vec<_> = store
            .list_containers()
            .map_ok(|ns| ns.to_string())
            .try_collect()
            .await
            .expect("list containers");
        names.sort();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn internal_files_are_not_listed() {
        let (_temp, store) = make_store();
        let ns = resolve("alice");
        store.ensure_container(&ns).await.expect("ensure");
        let container = store.container_path(&ns).expect("container path");
        std::fs::write(container.join(".report.pdf.tmp.1"), b"partial").expect("write temp");

        let entries: Vec<_> = store.list_blobs(&ns).try_collect().await.expect("list");
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn illegal_namespace_is_rejected() {
        let (_temp, store) = make_store();
        let result = store.ensure_container(&resolve("../escape")).await;
        assert!(matches!(result, Err(StoreError::InvalidNamespace(_))));
        let result = store.ensure_container(&resolve("")).await;
        assert!(matches!(result, Err(StoreError::InvalidNamespace(_))));
    }
}
