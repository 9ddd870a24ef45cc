//! Policy service seam and its gRPC client.

use std::time::Duration;

use async_trait::async_trait;
use odrive_core::proto::policy_service_client::PolicyServiceClient;
use odrive_core::proto::{CheckAccessRequest, GetSnippetsRequest, PopulateAndValidateAcmRequest};
use odrive_core::types::{Snippet, SnippetField, Treatment};
use serde::Deserialize;
use std::collections::BTreeMap;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::{AuthError, AuthResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessDecision {
    pub success: bool,
    pub has_access: bool,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcmValidation {
    pub success: bool,
    pub acm_valid: bool,
    /// Populated ACM; `None` when the service produced nothing.
    pub acm: Option<String>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnippetReply {
    pub success: bool,
    pub found: bool,
    pub snippets: String,
    pub messages: Vec<String>,
}

#[async_trait]
pub trait PolicyService: Send + Sync {
    async fn check_access(&self, user: &str, token_type: &str, acm: &str)
        -> AuthResult<AccessDecision>;

    async fn populate_and_validate_acm(&self, acm: &str) -> AuthResult<AcmValidation>;

    async fn get_snippets(
        &self,
        user: &str,
        token_type: &str,
        snippet_type: &str,
    ) -> AuthResult<SnippetReply>;
}

/// Tonic client for a remote policy service.
#[derive(Clone)]
pub struct GrpcPolicyService {
    client: PolicyServiceClient<Channel>,
}

impl GrpcPolicyService {
    /// Build a lazily-connecting client; the first call opens the channel.
    pub fn connect_lazy(endpoint: &str, timeout: Duration) -> AuthResult<Self> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| AuthError::Transport {
                op: "connect",
                msg: e.to_string(),
            })?
            .timeout(timeout)
            .connect_timeout(timeout)
            .connect_lazy();
        debug!(endpoint, "policy service client configured");
        Ok(Self {
            client: PolicyServiceClient::new(channel),
        })
    }
}

fn transport(op: &'static str) -> impl FnOnce(tonic::Status) -> AuthError {
    move |status| AuthError::Transport {
        op,
        msg: format!("{}: {}", status.code(), status.message()),
    }
}

#[async_trait]
impl PolicyService for GrpcPolicyService {
    async fn check_access(
        &self,
        user: &str,
        token_type: &str,
        acm: &str,
    ) -> AuthResult<AccessDecision> {
        let reply = self
            .client
            .clone()
            .check_access(CheckAccessRequest {
                user_token: user.to_string(),
                token_type: token_type.to_string(),
                acm: acm.to_string(),
            })
            .await
            .map_err(transport("CheckAccess"))?
            .into_inner();
        Ok(AccessDecision {
            success: reply.success,
            has_access: reply.has_access,
            messages: reply.messages,
        })
    }

    async fn populate_and_validate_acm(&self, acm: &str) -> AuthResult<AcmValidation> {
        let reply = self
            .client
            .clone()
            .populate_and_validate_acm(PopulateAndValidateAcmRequest {
                acm: acm.to_string(),
            })
            .await
            .map_err(transport("PopulateAndValidateAcm"))?
            .into_inner();
        Ok(AcmValidation {
            success: reply.success,
            acm_valid: reply.acm_valid,
            acm: reply.acm,
            messages: reply.messages,
        })
    }

    async fn get_snippets(
        &self,
        user: &str,
        token_type: &str,
        snippet_type: &str,
    ) -> AuthResult<SnippetReply> {
        let reply = self
            .client
            .clone()
            .get_snippets(GetSnippetsRequest {
                user_token: user.to_string(),
                token_type: token_type.to_string(),
                snippet_type: snippet_type.to_string(),
            })
            .await
            .map_err(transport("GetSnippets"))?
            .into_inner();
        Ok(SnippetReply {
            success: reply.success,
            found: reply.found,
            snippets: reply.snippets,
            messages: reply.messages,
        })
    }
}

#[derive(Deserialize)]
struct RawSnippetField {
    treatment: Treatment,
    #[serde(default)]
    values: Vec<String>,
}

/// Parse the service's snippet document: `{"f_share": {"treatment": "allow", "values": [...]}}`.
pub fn parse_snippets(raw: &str) -> AuthResult<Snippet> {
    if raw.trim().is_empty() {
        return Ok(Snippet::default());
    }
    let fields: BTreeMap<String, RawSnippetField> =
        serde_json::from_str(raw).map_err(|_| AuthError::NoResponse("GetSnippets"))?;
    Ok(Snippet {
        fields: fields
            .into_iter()
            .map(|(field, f)| SnippetField {
                field,
                treatment: f.treatment,
                values: f.values,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snippets() {
        let raw = r#"{
            "f_share": {"treatment": "allow", "values": ["cnbob", "dctc_odrive"]},
            "f_sci_ctrls": {"treatment": "disallow", "values": ["tk"]}
        }"#;
        let s = parse_snippets(raw).unwrap();
        assert_eq!(s.fields.len(), 2);
        let share = s.field("f_share").unwrap();
        assert_eq!(share.treatment, Treatment::Allow);
        assert_eq!(share.values, vec!["cnbob", "dctc_odrive"]);
        assert_eq!(s.field("f_sci_ctrls").unwrap().treatment, Treatment::Disallow);
    }

    #[test]
    fn test_parse_snippets_garbage() {
        assert!(parse_snippets("not json").is_err());
        assert!(parse_snippets("").unwrap().fields.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transport_error() {
        // Port 1 on loopback refuses connections.
        let svc = GrpcPolicyService::connect_lazy("http://127.0.0.1:1", Duration::from_millis(200))
            .unwrap();
        let err = svc.check_access("cn=a", "pki_dias", "{}").await.unwrap_err();
        assert!(matches!(err, AuthError::Transport { op: "CheckAccess", .. }), "got {err:?}");
    }
}
