//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::identity::IdentityError;
use crate::staging::{StagingError, UploadError};
use crate::store::StoreError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Unauthorized(HeaderMap),
    Forbidden(String),
    Conflict(String),
    PayloadTooLarge(u64),
    BadGateway(String),
    TooManyRequests(u64),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
            ApiError::Unauthorized(headers) => {
                (StatusCode::UNAUTHORIZED, headers, "unauthorized").into_response()
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::PayloadTooLarge(limit) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("upload exceeds {limit} bytes"),
            )
                .into_response(),
            ApiError::BadGateway(msg) => {
                warn!(error = %msg, "storage backend unavailable");
                (StatusCode::BAD_GATEWAY, "storage backend unavailable").into_response()
            }
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (StatusCode::TOO_MANY_REQUESTS, headers, "too many requests").into_response()
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InvalidNamespace(msg) => {
                ApiError::BadRequest(format!("invalid namespace: {msg}"))
            }
            StoreError::InvalidBlobName(msg) => {
                ApiError::BadRequest(format!("invalid blob name: {msg}"))
            }
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            StoreError::Unavailable(msg) => ApiError::BadGateway(msg),
        }
    }
}

impl From<StagingError> for ApiError {
    fn from(error: StagingError) -> Self {
        match error {
            StagingError::TooLarge(limit) => ApiError::PayloadTooLarge(limit),
            StagingError::Body(msg) => ApiError::BadRequest(msg),
            StagingError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::Store(err) => err.into(),
            UploadError::Staging(err) => err.into(),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(error: IdentityError) -> Self {
        match error {
            IdentityError::EmailTaken => ApiError::Conflict("email already registered".into()),
            IdentityError::NamespaceTaken(ns) => {
                ApiError::Conflict(format!("namespace {ns} already taken"))
            }
            IdentityError::Hash(msg) => ApiError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_status() {
        let cases = [
            (StoreError::InvalidNamespace("x".into()), StatusCode::BAD_REQUEST),
            (StoreError::InvalidBlobName("x".into()), StatusCode::BAD_REQUEST),
            (StoreError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (StoreError::Unavailable("x".into()), StatusCode::BAD_GATEWAY),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).into_response().status(), status);
        }
    }

    #[test]
    fn rate_limit_sets_retry_after() {
        let response = ApiError::TooManyRequests(42).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER),
            Some(&HeaderValue::from_static("42"))
        );
    }

    #[test]
    fn oversized_upload_is_413() {
        let response = ApiError::from(StagingError::TooLarge(10)).into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
