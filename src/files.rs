//! 文件列表、删除与 blob 下载处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::auth::CurrentUser;
use crate::containers::Containers;
use crate::error::ApiError;
use crate::listing::ListingView;
use crate::namespace::{NamespaceKey, resolve};

#[derive(Deserialize)]
pub(crate) struct DeleteQuery {
    name: String,
    namespace: Option<String>,
}

/// 当前用户命名空间的列表视图。
pub async fn list_files(
    Extension(containers): Extension<Arc<Containers>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<ListingView>, ApiError> {
    let view = containers.personal_view(&user.namespace).await?;
    info!(namespace = %user.namespace, count = view.len(), "list files");
    Ok(Json(view))
}

/// 管理员视图：汇总所有命名空间后统一排序。
pub async fn admin_list_files(
    Extension(containers): Extension<Arc<Containers>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<ListingView>, ApiError> {
    if !user.admin {
        return Err(ApiError::Forbidden("admin only".into()));
    }
    let view = containers.admin_view().await?;
    info!(count = view.len(), "admin list files");
    Ok(Json(view))
}

/// 未指定命名空间时，普通用户落到自己的命名空间，管理员落到默认命名空间。
fn target_namespace(
    containers: &Containers,
    user: &CurrentUser,
    raw: Option<&str>,
) -> NamespaceKey {
    match raw.filter(|raw| !raw.is_empty()) {
        Some(raw) => resolve(raw),
        None if user.admin => containers.default_namespace().clone(),
        None => user.namespace.clone(),
    }
}

pub async fn delete_blob(
    Query(DeleteQuery { name, namespace }): Query<DeleteQuery>,
    Extension(containers): Extension<Arc<Containers>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<StatusCode, ApiError> {
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    let namespace = target_namespace(&containers, &user, namespace.as_deref());
    user.authorize(&namespace)?;
    containers.delete(&namespace, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 以流的方式返回 blob 内容。
pub async fn download_blob(
    Path((namespace, name)): Path<(String, String)>,
    Extension(containers): Extension<Arc<Containers>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Response, ApiError> {
    let namespace = resolve(&namespace);
    user.authorize(&namespace)?;
    let content = containers.open(&namespace, &name).await?;
    let mime = mime_guess::from_path(&name).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    if let Some(size) = content.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    debug!(%namespace, blob = %name, size = ?content.size, "download blob");
    let stream = ReaderStream::new(content.reader);
    Ok((StatusCode::OK, headers, AxumBody::from_stream(stream)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::user;
    use crate::containers::tests::make_containers;
    use crate::store::memory::MemoryBlobStore;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).expect("timestamp")
    }

    async fn seeded() -> (Arc<MemoryBlobStore>, Arc<Containers>) {
        let store = Arc::new(MemoryBlobStore::new());
        let containers = Arc::new(make_containers(store.clone()));
        for (ns, name, secs) in [
            ("alice", "a.txt", 100),
            ("bob", "b.pdf", 200),
            ("shared", "s.txt", 50),
        ] {
            let ns = resolve(ns);
            containers.ensure(&ns).await.expect("ensure");
            store
                .insert_at(&ns, name, Bytes::from_static(b"data"), at(secs))
                .await
                .expect("insert");
        }
        (store, containers)
    }

    #[tokio::test]
    async fn personal_list_only_shows_own_namespace() {
        let (_store, containers) = seeded().await;
        let Json(view) = list_files(Extension(containers), Extension(user("alice", false)))
            .await
            .expect("list");
        assert_eq!(view.names, vec!["a.txt"]);
        assert_eq!(view.urls, vec!["/blobs/alice/a.txt"]);
    }

    #[tokio::test]
    async fn new_user_sees_empty_list() {
        let (_store, containers) = seeded().await;
        let Json(view) = list_files(Extension(containers), Extension(user("carol", false)))
            .await
            .expect("list");
        assert!(view.is_empty());
    }

    #[tokio::test]
    async fn admin_list_merges_every_namespace() {
        let (_store, containers) = seeded().await;
        let Json(view) = admin_list_files(Extension(containers.clone()), Extension(user("root", true)))
            .await
            .expect("admin list");
        assert_eq!(view.names, vec!["b.pdf", "a.txt", "s.txt"]);
        assert_eq!(
            view.namespaces,
            vec![resolve("bob"), resolve("alice"), resolve("shared")]
        );

        let denied =
            admin_list_files(Extension(containers), Extension(user("alice", false))).await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn delete_defaults_and_ownership() {
        let (_store, containers) = seeded().await;

        let denied = delete_blob(
            Query(DeleteQuery {
                name: "b.pdf".into(),
                namespace: Some("bob".into()),
            }),
            Extension(containers.clone()),
            Extension(user("alice", false)),
        )
        .await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));

        let own = delete_blob(
            Query(DeleteQuery {
                name: "a.txt".into(),
                namespace: None,
            }),
            Extension(containers.clone()),
            Extension(user("alice", false)),
        )
        .await
        .expect("delete own");
        assert_eq!(own, StatusCode::NO_CONTENT);

        let shared = delete_blob(
            Query(DeleteQuery {
                name: "s.txt".into(),
                namespace: None,
            }),
            Extension(containers.clone()),
            Extension(user("root", true)),
        )
        .await
        .expect("admin delete in default namespace");
        assert_eq!(shared, StatusCode::NO_CONTENT);

        let missing = delete_blob(
            Query(DeleteQuery {
                name: "a.txt".into(),
                namespace: Some("alice".into()),
            }),
            Extension(containers.clone()),
            Extension(user("root", true)),
        )
        .await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));

        let view = containers.admin_view().await.expect("admin view");
        assert_eq!(view.names, vec!["b.pdf"]);
    }

    #[test]
    fn delete_target_keeps_label_verbatim() {
        let containers = make_containers(Arc::new(MemoryBlobStore::new()));
        let admin = user("root", true);
        assert_eq!(
            target_namespace(&containers, &admin, Some(" Bob ")),
            resolve(" Bob ")
        );
        assert_ne!(target_namespace(&containers, &admin, Some(" Bob ")), resolve("bob"));
        assert_eq!(target_namespace(&containers, &admin, Some("")), resolve("shared"));
        assert_eq!(
            target_namespace(&containers, &user("alice", false), None),
            resolve("alice")
        );
    }

    #[tokio::test]
    async fn download_streams_content_with_type() {
        let (_store, containers) = seeded().await;
        let response = download_blob(
            Path(("bob".into(), "b.pdf".into())),
            Extension(containers.clone()),
            Extension(user("bob", false)),
        )
        .await
        .expect("download");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/pdf"))
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&body[..], b"data");

        let denied = download_blob(
            Path(("bob".into(), "b.pdf".into())),
            Extension(containers.clone()),
            Extension(user("alice", false)),
        )
        .await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));

        let missing = download_blob(
            Path(("bob".into(), "nope.txt".into())),
            Extension(containers),
            Extension(user("bob", false)),
        )
        .await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }
}
