//! 对象存储适配层：每个命名空间对应一个容器。

pub mod azure;
pub mod fs;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::namespace::NamespaceKey;

/// 容器中的单个 blob 及其元数据。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobEntry {
    pub namespace: NamespaceKey,
    pub name: String,
    pub url: String,
    pub created_on: DateTime<Utc>,
}

/// 读取 blob 内容的句柄。
pub struct BlobContent {
    pub size: Option<u64>,
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
}

/// Lazily yields the entries of one container; every call re-queries the backend.
pub type BlobStream<'a> = BoxStream<'a, Result<BlobEntry, StoreError>>;
pub type NamespaceStream<'a> = BoxStream<'a, Result<NamespaceKey, StoreError>>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 后端名称，用于日志与版本信息。
    fn kind(&self) -> &'static str;

    /// 创建容器；已存在时视为成功。
    async fn ensure_container(&self, namespace: &NamespaceKey) -> Result<(), StoreError>;

    /// 上传本地文件，同名 blob 被覆盖。
    async fn put_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
        source: &Path,
    ) -> Result<(), StoreError>;

    /// 枚举容器内容，顺序不作保证。
    fn list_blobs<'a>(&'a self, namespace: &'a NamespaceKey) -> BlobStream<'a>;

    async fn delete_blob(&self, namespace: &NamespaceKey, blob_name: &str)
    -> Result<(), StoreError>;

    /// 枚举所有已创建的容器。
    fn list_containers(&self) -> NamespaceStream<'_>;

    async fn open_blob(
        &self,
        namespace: &NamespaceKey,
        blob_name: &str,
    ) -> Result<BlobContent, StoreError>;
}

#[derive(Debug)]
pub enum StoreError {
    InvalidNamespace(String),
    InvalidBlobName(String),
    Unavailable(String),
    NotFound(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidNamespace(name) => write!(f, "invalid namespace: {name:?}"),
            StoreError::InvalidBlobName(name) => write!(f, "invalid blob name: {name:?}"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::NotFound(name) => write!(f, "blob not found: {name}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// 本地后端共享的 blob 名称规则：不得包含路径分隔符，且不能以 `.` 开头。
pub(crate) fn check_blob_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidBlobName(name.to_string()));
    }
    Ok(())
}

/// URL 路径段编码：保留 RFC 3986 非保留字符。
pub(crate) const URL_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// 本地后端通过网关自身提供的下载地址。
pub(crate) fn gateway_blob_url(namespace: &NamespaceKey, blob_name: &str) -> String {
    format!(
        "/blobs/{}/{}",
        utf8_percent_encode(namespace.as_str(), URL_SEGMENT),
        utf8_percent_encode(blob_name, URL_SEGMENT)
    )
}
