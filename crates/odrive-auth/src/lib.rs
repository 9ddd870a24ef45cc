//! odrive-auth: who may see what
//!
//! Objects carry an ACM (access control marking), a JSON document whose
//! `share` element lists who may read. The policy service validates ACMs,
//! fills in their flattened `f_*` fields, and makes access decisions.
//! Locally, every object also carries grant rows (permissions) that must stay
//! in step with its ACM; [`permissions`] keeps them aligned.

pub mod acm;
pub mod engine;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod permissions;
pub mod policy;

pub use acm::{parse_acm, snippet_allows, AcmMap, EVERYONE_GROUP, SHARE_KEY};
pub use engine::{groups_from_snippet, AcmEngine};
pub use policy::{GrpcPolicyService, PolicyService};

use odrive_core::OdriveError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("acm not specified")]
    AcmNotSpecified,

    #[error("user not specified")]
    UserNotSpecified,

    #[error("invalid acm: {0}")]
    InvalidAcm(String),

    #[error("policy service not configured")]
    ServiceNotSet,

    #[error("policy service call {op} failed: {msg}")]
    Transport { op: &'static str, msg: String },

    #[error("policy service returned no usable response for {0}")]
    NoResponse(&'static str),

    #[error("policy service could not complete {op}{}", joined(.messages))]
    NotSuccessful {
        op: &'static str,
        messages: Vec<String>,
    },

    #[error("acm rejected by policy service{}", joined(.messages))]
    AcmNotValid { messages: Vec<String> },

    #[error("user not authorized for acm")]
    NotAuthorized { messages: Vec<String> },
}

pub type AuthResult<T> = Result<T, AuthError>;

fn joined(messages: &[String]) -> String {
    if messages.is_empty() {
        String::new()
    } else {
        format!(": {}", messages.join("; "))
    }
}

impl From<AuthError> for OdriveError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::AcmNotSpecified | AuthError::UserNotSpecified | AuthError::InvalidAcm(_) => {
                OdriveError::BadRequest(e.to_string())
            }
            AuthError::ServiceNotSet | AuthError::NoResponse(_) | AuthError::Transport { .. } => {
                OdriveError::service_unavailable(e.to_string())
            }
            AuthError::NotSuccessful { op, messages } => OdriveError::ServiceUnavailable {
                msg: format!("policy service could not complete {op}"),
                detail: messages,
            },
            AuthError::AcmNotValid { messages } => OdriveError::AcmInvalid {
                msg: "acm not valid".into(),
                detail: messages,
            },
            AuthError::NotAuthorized { messages } => {
                let msg = if messages.is_empty() {
                    "user not authorized for acm".to_string()
                } else {
                    messages.join("/")
                };
                OdriveError::NotAuthorized {
                    msg,
                    detail: messages,
                }
            }
        }
    }
}
