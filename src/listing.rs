//! 列表投影：把 blob 条目转换为按时间倒序、下标对齐的视图。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::namespace::NamespaceKey;
use crate::store::BlobEntry;

/// 每次读取时重新计算，各数组长度相同且同一下标指向同一个 blob。
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingView {
    pub names: Vec<String>,
    pub urls: Vec<String>,
    pub display: Vec<String>,
    pub namespaces: Vec<NamespaceKey>,
}

impl ListingView {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

pub fn human_readable(created_on: &DateTime<Utc>) -> String {
    created_on.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// 按 `created_on` 倒序排列；时间相同的条目保持输入顺序。
pub fn project(mut entries: Vec<BlobEntry>) -> ListingView {
    entries.sort_by(|a, b| b.created_on.cmp(&a.created_on));

    let mut view = ListingView {
        names: Vec::with_capacity(entries.len()),
        urls: Vec::with_capacity(entries.len()),
        display: Vec::with_capacity(entries.len()),
        namespaces: Vec::with_capacity(entries.len()),
    };
    for entry in entries {
        view.display
            .push(format!("Uploaded on {}", human_readable(&entry.created_on)));
        view.names.push(entry.name);
        view.urls.push(entry.url);
        view.namespaces.push(entry.namespace);
    }
    view
}
