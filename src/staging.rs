//! 上传暂存：入站文件先落到本地临时目录，写入后端后无论成败都会删除。

use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{Stream, StreamExt};
use std::fmt;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::containers::Containers;
use crate::namespace::NamespaceKey;
use crate::store::StoreError;

const MAX_NAME_ATTEMPTS: u32 = 64;

#[derive(Debug)]
pub enum StagingError {
    Io(io::Error),
    Body(String),
    TooLarge(u64),
}

impl fmt::Display for StagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagingError::Io(err) => write!(f, "staging io failure: {err}"),
            StagingError::Body(msg) => write!(f, "upload body error: {msg}"),
            StagingError::TooLarge(limit) => write!(f, "upload exceeds {limit} bytes"),
        }
    }
}

impl std::error::Error for StagingError {}

impl From<io::Error> for StagingError {
    fn from(err: io::Error) -> Self {
        StagingError::Io(err)
    }
}

#[derive(Debug)]
pub enum UploadError {
    Store(StoreError),
    Staging(StagingError),
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        UploadError::Store(err)
    }
}

impl From<StagingError> for UploadError {
    fn from(err: StagingError) -> Self {
        UploadError::Staging(err)
    }
}

/// 本地暂存目录。
#[derive(Debug)]
pub struct Staging {
    dir: PathBuf,
    max_size: u64,
}

impl Staging {
    /// `max_size` 为 0 时不限制大小。
    pub fn new(dir: PathBuf, max_size: u64) -> Self {
        Self { dir, max_size }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// 把字节流写入 `{field}-{毫秒时间戳}{扩展名}`。
    pub async fn stage<S, E>(
        &self,
        field: &str,
        original_name: &str,
        mut data: S,
    ) -> Result<StagedFile, StagingError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        let extension = Path::new(original_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let (file, path) = self
            .create_unique(field, &extension, Utc::now().timestamp_millis())
            .await?;
        // guard 先于 file 声明，出错时文件句柄先关闭再删除。
        let staged = StagedFile::new(path);
        let mut file = file;

        let mut written: u64 = 0;
        while let Some(chunk) = data.next().await {
            let chunk = chunk.map_err(|err| StagingError::Body(err.to_string()))?;
            written += chunk.len() as u64;
            if self.max_size > 0 && written > self.max_size {
                return Err(StagingError::TooLarge(self.max_size));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(path = ?staged.path(), bytes = written, "upload staged");
        Ok(staged)
    }

    /// 同一毫秒内的并发上传追加 `-{n}` 区分。
    async fn create_unique(
        &self,
        field: &str,
        extension: &str,
        millis: i64,
    ) -> Result<(File, PathBuf), StagingError> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = match attempt {
                0 => format!("{field}-{millis}{extension}"),
                n => format!("{field}-{millis}-{n}{extension}"),
            };
            let path = self.dir.join(name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((file, path)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StagingError::Io(io::Error::new(
            ErrorKind::AlreadyExists,
            "no free staging name",
        )))
    }

    /// 清理超过 `ttl` 的遗留暂存文件，返回删除数量。
    pub async fn cleanup_stale(&self, ttl: Duration) -> io::Result<usize> {
        if ttl.is_zero() || fs::metadata(&self.dir).await.is_err() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };
            if age >= ttl {
                let path = entry.path();
                if let Err(err) = fs::remove_file(&path).await {
                    warn!(path = ?path, error = %err, "failed to remove stale staged file");
                } else {
                    info!(path = ?path, "removed stale staged file");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// 暂存文件句柄：显式 [`StagedFile::remove`]，或在 drop 时兜底删除。
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    released: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) -> Result<(), StagingError> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = ?self.path, error = %err, "failed to remove staged file");
        }
    }
}

/// 以客户端原始文件名写入后端，然后删除暂存文件。
///
/// 写入失败时仍先删除暂存文件再返回错误。
pub async fn store_staged(
    containers: &Containers,
    namespace: &NamespaceKey,
    blob_name: &str,
    staged: StagedFile,
) -> Result<(), UploadError> {
    let stored = containers.put(namespace, blob_name, staged.path()).await;
    let released = staged.remove().await;
    match (stored, released) {
        (Err(err), released) => {
            if let Err(cleanup) = released {
                warn!(error = %cleanup, "staged file cleanup failed after store error");
            }
            Err(err.into())
        }
        (Ok(()), Err(err)) => Err(err.into()),
        (Ok(()), Ok(())) => Ok(()),
    }
}
