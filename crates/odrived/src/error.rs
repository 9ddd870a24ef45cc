//! HTTP rendering of failures.
//!
//! Every handler error becomes an [`OdriveError`] first; its kind picks the
//! status and the body is always `{"code", "msg", "detail"?}`.

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

use odrive_auth::AuthError;
use odrive_cache::CacheError;
use odrive_core::{ErrorKind, OdriveError};
use odrive_crypto::CryptoError;
use odrive_dao::DaoError;
use odrive_storage::BlobError;

#[derive(Debug)]
pub struct ApiError(pub OdriveError);

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub msg: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub detail: Vec<String>,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }

    pub fn public_message(&self) -> String {
        self.0.public_message()
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.0.status_code(),
            msg: self.0.public_message(),
            detail: self.0.detail().to_vec(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(OdriveError::BadRequest(msg.into()))
    }

    pub fn not_authorized(msg: impl Into<String>) -> Self {
        Self(OdriveError::not_authorized(msg))
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self(OdriveError::Conflict(msg.into()))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status =
            StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if kind == ErrorKind::Internal {
            error!(kind = kind.as_str(), status = status.as_u16(), error = %self.0, "request failed");
        } else {
            warn!(kind = kind.as_str(), status = status.as_u16(), error = %self.0, "request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

impl From<OdriveError> for ApiError {
    fn from(e: OdriveError) -> Self {
        Self(e)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self(e.into())
    }
}

impl From<DaoError> for ApiError {
    fn from(e: DaoError) -> Self {
        Self(e.into())
    }
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        Self(OdriveError::Internal(format!("ciphertext cache: {e}")))
    }
}

impl From<CryptoError> for ApiError {
    fn from(e: CryptoError) -> Self {
        Self(OdriveError::Internal(format!("content cipher: {e}")))
    }
}

impl From<BlobError> for ApiError {
    fn from(e: BlobError) -> Self {
        Self(OdriveError::Internal(format!("blob store: {e}")))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        Self(OdriveError::Io(e))
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::bad_request(format!("malformed multipart body: {}", e.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_carries_policy_detail() {
        let err = ApiError::from(AuthError::NotAuthorized {
            messages: vec!["clearance insufficient".into()],
        });
        let v = serde_json::to_value(err.body()).unwrap();
        assert_eq!(v["code"], 403);
        assert_eq!(v["msg"], "clearance insufficient");
        assert_eq!(v["detail"][0], "clearance insufficient");
    }

    #[test]
    fn test_detail_omitted_when_empty() {
        let v = serde_json::to_value(ApiError::conflict("stale").body()).unwrap();
        assert_eq!(v["code"], 409);
        assert!(v.get("detail").is_none());
    }

    #[test]
    fn test_storage_failures_are_internal_and_redacted() {
        let err = ApiError::from(CacheError::NotFound("ab".repeat(32)));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.public_message(), "internal server error");

        let err = ApiError::from(BlobError::Storage("s3 503".into()));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_stale_token_is_conflict() {
        let id = odrive_core::types::ObjectId::new_random();
        assert_eq!(ApiError::from(DaoError::StaleToken(id)).kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_status_from_response() {
        let resp = ApiError(OdriveError::Gone("expunged".into())).into_response();
        assert_eq!(resp.status(), StatusCode::GONE);
    }
}
