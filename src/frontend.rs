//! 嵌入式前端资源服务与 SPA 回退。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

#[derive(RustEmbed)]
#[folder = "frontend/dist"]
/// 嵌入式前端页面（登录、注册、上传、账户、管理、信息）。
pub struct FrontendAssets;

/// 前端资源回退处理器（SPA）。`/api/` 与 `/blobs/` 下的未知路径直接 404。
pub async fn serve_frontend(req: Request<AxumBody>) -> Result<Response, ApiError> {
    let path = req.uri().path();
    if path.starts_with("/api/") || path.starts_with("/blobs/") {
        return Err(ApiError::NotFound("not found".into()));
    }
    let path = path.trim_start_matches('/');
    let requested = if path.is_empty() { "index.html" } else { path };
    if let Some(response) = load_embedded_asset(requested)? {
        return Ok(response);
    }

    if !requested.contains('.')
        && let Some(response) = load_embedded_asset("index.html")?
    {
        return Ok(response);
    }

    Err(ApiError::NotFound("not found".into()))
}

fn load_embedded_asset(path: &str) -> Result<Option<Response>, ApiError> {
    let Some(asset) = FrontendAssets::get(path) else {
        return Ok(None);
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(Some(
        (headers, AxumBody::from(asset.data.into_owned())).into_response(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    async fn get(uri: &str) -> Result<Response, ApiError> {
        let request = Request::builder()
            .uri(uri)
            .body(AxumBody::empty())
            .expect("request");
        serve_frontend(request).await
    }

    #[tokio::test]
    async fn index_and_spa_routes() {
        for uri in ["/", "/admin", "/account"] {
            let response = get(uri).await.expect("index");
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get(header::CONTENT_TYPE),
                Some(&HeaderValue::from_static("text/html"))
            );
        }
        let script = get("/app.js").await.expect("script");
        assert_eq!(script.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_api_and_assets_are_not_found() {
        assert!(matches!(get("/api/nope").await, Err(ApiError::NotFound(_))));
        assert!(matches!(get("/missing.png").await, Err(ApiError::NotFound(_))));
    }
}
