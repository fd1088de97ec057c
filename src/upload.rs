//! 表单上传处理器：先暂存到本地，再写入用户的命名空间。

use axum::extract::{Extension, Json, Multipart, multipart::MultipartError};
use axum::http::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::auth::CurrentUser;
use crate::config::{NAMESPACE_FIELD, UPLOAD_FIELD};
use crate::containers::Containers;
use crate::error::ApiError;
use crate::namespace::{NamespaceKey, resolve};
use crate::staging::{StagedFile, Staging, store_staged};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadResponse {
    namespace: NamespaceKey,
    name: String,
}

fn multipart_error(err: MultipartError) -> ApiError {
    ApiError::BadRequest(err.body_text())
}

/// 标签原样交给 [`resolve`]，只有空标签才回落到用户自己的命名空间。
fn target_namespace(user: &CurrentUser, label: Option<&str>) -> NamespaceKey {
    match label {
        Some(label) if !label.is_empty() => resolve(label),
        _ => user.namespace.clone(),
    }
}

/// 处理 `multipart/form-data` 上传。
///
/// `name` 字段是可选的命名空间标签，缺省为当前用户名；`file` 字段的原始文件名即 blob 名。
pub async fn upload_file(
    Extension(containers): Extension<Arc<Containers>>,
    Extension(staging): Extension<Arc<Staging>>,
    Extension(user): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let mut label: Option<String> = None;
    let mut upload: Option<(String, StagedFile)> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some(NAMESPACE_FIELD) => {
                let text = field.text().await.map_err(multipart_error)?;
                label = Some(text);
            }
            Some(UPLOAD_FIELD) if upload.is_none() => {
                // 标签先于文件到达时，越权请求不落盘。
                if label.is_some() {
                    user.authorize(&target_namespace(&user, label.as_deref()))?;
                }
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| ApiError::BadRequest("file name is required".into()))?;
                let staged = staging
                    .stage(UPLOAD_FIELD, &file_name, Box::pin(field))
                    .await?;
                upload = Some((file_name, staged));
            }
            _ => {}
        }
    }

    let Some((blob_name, staged)) = upload else {
        return Err(ApiError::BadRequest(format!(
            "missing `{UPLOAD_FIELD}` field"
        )));
    };

    let namespace = target_namespace(&user, label.as_deref());
    if let Err(denied) = user.authorize(&namespace) {
        staged.remove().await?;
        return Err(denied);
    }

    store_staged(&containers, &namespace, &blob_name, staged).await?;
    info!(%namespace, blob = %blob_name, user = %user.name, "upload complete");
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            namespace,
            name: blob_name,
        }),
    ))
}
