//! 命名空间解析：把用户标签映射为存储容器键。

use serde::Serialize;
use std::fmt;

/// 隔离存储容器的键，总是由 [`resolve`] 派生。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NamespaceKey(String);

impl NamespaceKey {
    /// 后端枚举得到的容器名原样包装，不再经过解析。
    pub(crate) fn from_backend(name: String) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NamespaceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 小写化并去掉所有双引号。
///
/// 仅大小写或引号不同的标签会落到同一个命名空间。合法字符规则由后端在
/// 适配层校验，这里不做其他清洗。
pub fn resolve(raw_label: &str) -> NamespaceKey {
    NamespaceKey(raw_label.to_lowercase().replace('"', ""))
}
