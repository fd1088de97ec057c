//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tracing::warn;
use uuid::Uuid;

/// 可用于原子替换的临时文件封装。
///
/// 临时文件以 `.` 开头，与目标位于同一目录，因此列举时会被跳过。
pub struct AtomicFile {
    target: PathBuf,
    file: File,
    temp: TempPath,
}

/// 未完成 `finalize` 就被丢弃（例如写入被超时取消）时删除临时文件。
struct TempPath {
    path: PathBuf,
    released: bool,
}

impl TempPath {
    async fn remove(mut self) {
        self.released = true;
        let _ = fs::remove_file(&self.path).await;
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = ?self.path, error = %err, "failed to remove temp file");
        }
    }
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "blob".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            file,
            temp: TempPath {
                path: temp_path,
                released: false,
            },
        })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        self.temp.remove().await;
    }

    /// 同步并原子替换目标文件。
    pub async fn finalize(self) -> io::Result<()> {
        let Self {
            target,
            file,
            mut temp,
        } = self;
        if let Err(err) = file.sync_all().await {
            drop(file);
            temp.remove().await;
            return Err(err);
        }
        drop(file);

        if let Err(err) = fs::rename(&temp.path, &target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&target).await.is_ok() {
                    let result = fs::rename(&temp.path, &target).await;
                    if result.is_ok() {
                        temp.released = true;
                    }
                    return result;
                }
            }
            temp.remove().await;
            return Err(err);
        }
        temp.released = true;

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
