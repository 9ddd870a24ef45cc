use serde::Serialize;
use thiserror::Error;

pub type OdriveResult<T> = Result<T, OdriveError>;

/// Classification of a failure, independent of where it was raised.
///
/// Every error that crosses the HTTP boundary is reduced to one of these,
/// and each kind maps to exactly one status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    BadRequest,
    Unauthenticated,
    NotAuthorized,
    NotFound,
    Gone,
    Conflict,
    AcmInvalid,
    ServiceUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthenticated => 401,
            ErrorKind::NotAuthorized => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Gone => 410,
            ErrorKind::AcmInvalid => 428,
            ErrorKind::ServiceUnavailable => 503,
            ErrorKind::Internal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::NotAuthorized => "not_authorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Gone => "gone",
            ErrorKind::Conflict => "conflict",
            ErrorKind::AcmInvalid => "acm_invalid",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum OdriveError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("not authorized: {msg}")]
    NotAuthorized { msg: String, detail: Vec<String> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("gone: {0}")]
    Gone(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("acm invalid: {msg}")]
    AcmInvalid { msg: String, detail: Vec<String> },

    #[error("service unavailable: {msg}")]
    ServiceUnavailable { msg: String, detail: Vec<String> },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OdriveError {
    pub fn not_authorized(msg: impl Into<String>) -> Self {
        OdriveError::NotAuthorized {
            msg: msg.into(),
            detail: Vec::new(),
        }
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        OdriveError::ServiceUnavailable {
            msg: msg.into(),
            detail: Vec::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OdriveError::BadRequest(_) => ErrorKind::BadRequest,
            OdriveError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            OdriveError::NotAuthorized { .. } => ErrorKind::NotAuthorized,
            OdriveError::NotFound(_) => ErrorKind::NotFound,
            OdriveError::Gone(_) => ErrorKind::Gone,
            OdriveError::Conflict(_) => ErrorKind::Conflict,
            OdriveError::AcmInvalid { .. } => ErrorKind::AcmInvalid,
            OdriveError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            OdriveError::Internal(_) | OdriveError::Io(_) | OdriveError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    /// Short client-facing message. Internal failures never leak their cause.
    pub fn public_message(&self) -> String {
        match self {
            OdriveError::BadRequest(m)
            | OdriveError::Unauthenticated(m)
            | OdriveError::NotFound(m)
            | OdriveError::Gone(m)
            | OdriveError::Conflict(m) => m.clone(),
            OdriveError::NotAuthorized { msg, .. }
            | OdriveError::AcmInvalid { msg, .. }
            | OdriveError::ServiceUnavailable { msg, .. } => msg.clone(),
            OdriveError::Internal(_) | OdriveError::Io(_) | OdriveError::Other(_) => {
                "internal server error".into()
            }
        }
    }

    /// Messages relayed from the policy service, if any.
    pub fn detail(&self) -> &[String] {
        match self {
            OdriveError::NotAuthorized { detail, .. }
            | OdriveError::AcmInvalid { detail, .. }
            | OdriveError::ServiceUnavailable { detail, .. } => detail,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(OdriveError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(OdriveError::Unauthenticated("x".into()).status_code(), 401);
        assert_eq!(OdriveError::not_authorized("x").status_code(), 403);
        assert_eq!(OdriveError::NotFound("x".into()).status_code(), 404);
        assert_eq!(OdriveError::Conflict("x".into()).status_code(), 409);
        assert_eq!(OdriveError::Gone("x".into()).status_code(), 410);
        assert_eq!(
            OdriveError::AcmInvalid {
                msg: "x".into(),
                detail: vec![]
            }
            .status_code(),
            428
        );
        assert_eq!(OdriveError::service_unavailable("x").status_code(), 503);
        assert_eq!(OdriveError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_internal_message_is_redacted() {
        let err = OdriveError::Io(std::io::Error::other("/var/cache/secret path"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.public_message(), "internal server error");
    }

    #[test]
    fn test_detail_carried_for_policy_errors() {
        let err = OdriveError::NotAuthorized {
            msg: "denied".into(),
            detail: vec!["missing clearance".into(), "missing sci".into()],
        };
        assert_eq!(err.detail().len(), 2);
        assert!(OdriveError::NotFound("x".into()).detail().is_empty());
    }
}
