//! ACM engine: the policy-service operations the server gates on.

use std::sync::Arc;

use odrive_core::flatten;
use odrive_core::types::{Permission, Snippet, SnippetField, Treatment};
use tracing::{debug, info, warn};

use crate::acm::{acm_to_string, parse_acm};
use crate::permissions::normalize_permissions_from_acm;
use crate::policy::{parse_snippets, PolicyService};
use crate::{AuthError, AuthResult};

/// Token type for callers identified by certificate DN.
pub const TOKEN_TYPE_PKI: &str = "pki_dias";

/// Snippet flavour requested for listing filters.
pub const SNIPPET_TYPE: &str = "odrive-raw";

#[derive(Clone)]
pub struct AcmEngine {
    service: Option<Arc<dyn PolicyService>>,
}

impl AcmEngine {
    pub fn new(service: Arc<dyn PolicyService>) -> Self {
        Self {
            service: Some(service),
        }
    }

    /// No policy service: flattening and authorization always fail with
    /// `ServiceNotSet`; snippets are synthesized for the caller alone.
    pub fn offline() -> Self {
        Self { service: None }
    }

    pub fn is_offline(&self) -> bool {
        self.service.is_none()
    }

    fn service(&self) -> AuthResult<&Arc<dyn PolicyService>> {
        self.service.as_ref().ok_or(AuthError::ServiceNotSet)
    }

    /// Validate `acm` and return it with its `f_*` fields populated.
    pub async fn flatten_acm(&self, acm: &str) -> AuthResult<String> {
        if acm.trim().is_empty() {
            return Err(AuthError::AcmNotSpecified);
        }
        parse_acm(acm)?;
        let reply = self.service()?.populate_and_validate_acm(acm).await?;
        log_messages("PopulateAndValidateAcm", &reply.messages);

        if !reply.success {
            return Err(AuthError::NotSuccessful {
                op: "PopulateAndValidateAcm",
                messages: reply.messages,
            });
        }
        if !reply.acm_valid {
            return Err(AuthError::AcmNotValid {
                messages: reply.messages,
            });
        }
        let populated = reply
            .acm
            .filter(|a| !a.is_empty())
            .ok_or(AuthError::NoResponse("PopulateAndValidateAcm"))?;
        // Re-serialize so stored ACMs are in canonical form.
        Ok(acm_to_string(&parse_acm(&populated)?))
    }

    /// Flatten `acm` then ask whether `user` may access content marked with it.
    pub async fn is_user_authorized_for_acm(&self, user: &str, acm: &str) -> AuthResult<()> {
        if user.is_empty() {
            return Err(AuthError::UserNotSpecified);
        }
        let flattened = self.flatten_acm(acm).await?;
        let decision = self
            .service()?
            .check_access(user, TOKEN_TYPE_PKI, &flattened)
            .await?;
        log_messages("CheckAccess", &decision.messages);

        if !decision.success {
            return Err(AuthError::NotSuccessful {
                op: "CheckAccess",
                messages: decision.messages,
            });
        }
        if !decision.has_access {
            debug!(user, "access denied by policy service");
            return Err(AuthError::NotAuthorized {
                messages: decision.messages,
            });
        }
        Ok(())
    }

    /// Listing constraints for `user`.
    pub async fn snippets_for_user(&self, user: &str) -> AuthResult<Snippet> {
        if user.is_empty() {
            return Err(AuthError::UserNotSpecified);
        }
        let Some(service) = &self.service else {
            return Ok(offline_snippet(user));
        };
        let reply = service.get_snippets(user, TOKEN_TYPE_PKI, SNIPPET_TYPE).await?;
        log_messages("GetSnippets", &reply.messages);
        if !reply.success {
            return Err(AuthError::NotSuccessful {
                op: "GetSnippets",
                messages: reply.messages,
            });
        }
        if !reply.found {
            warn!(user, "policy service has no snippets for user");
            return Err(AuthError::NoResponse("GetSnippets"));
        }
        parse_snippets(&reply.snippets)
    }

    /// Normalize grants against `acm`, then flatten the rebuilt ACM.
    pub async fn normalize_permissions_from_acm(
        &self,
        owner: &str,
        permissions: Vec<Permission>,
        acm: &str,
        is_creating: bool,
    ) -> AuthResult<(Vec<Permission>, String)> {
        let (permissions, rebuilt) =
            normalize_permissions_from_acm(owner, permissions, acm, is_creating)?;
        let flattened = self.flatten_acm(&rebuilt).await?;
        Ok((permissions, flattened))
    }
}

/// One log line per message attached to a policy-service reply.
fn log_messages(op: &'static str, messages: &[String]) {
    for m in messages {
        info!(op, detail = %m, "policy service message");
    }
}

/// Groups a snippet says the user belongs to (its `f_share` values other
/// than the user's own flattened DN).
pub fn groups_from_snippet(user: &str, snippet: &Snippet) -> Vec<String> {
    let me = flatten(user);
    snippet
        .field("f_share")
        .map(|f| {
            f.values
                .iter()
                .filter(|v| **v != me)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn offline_snippet(user: &str) -> Snippet {
    Snippet {
        fields: vec![
            SnippetField {
                field: "f_share".into(),
                treatment: Treatment::Allow,
                values: vec![flatten(user)],
            },
            SnippetField {
                field: "f_clearance".into(),
                treatment: Treatment::Allow,
                values: vec!["u".into()],
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakePolicyService;
    use crate::policy::{AccessDecision, AcmValidation, SnippetReply};
    use async_trait::async_trait;

    const ALICE: &str = "cn=alice,o=org";
    const BOB: &str = "cn=bob,o=org";

    fn engine() -> AcmEngine {
        AcmEngine::new(Arc::new(
            FakePolicyService::new()
                .with_user(ALICE, "S", &[])
                .with_user(BOB, "U", &[("dctc", "ODrive")]),
        ))
    }

    #[tokio::test]
    async fn test_flatten_populates() {
        let flat = engine().flatten_acm(r#"{"classif":"U"}"#).await.unwrap();
        assert!(flat.contains("f_clearance"));
    }

    #[tokio::test]
    async fn test_flatten_requires_acm() {
        assert!(matches!(
            engine().flatten_acm("").await,
            Err(AuthError::AcmNotSpecified)
        ));
    }

    #[tokio::test]
    async fn test_invalid_acm_rejected() {
        let err = engine().flatten_acm(r#"{"version":"2"}"#).await.unwrap_err();
        assert!(matches!(err, AuthError::AcmNotValid { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_authorization() {
        let e = engine();
        e.is_user_authorized_for_acm(ALICE, r#"{"classif":"S"}"#)
            .await
            .unwrap();
        let err = e
            .is_user_authorized_for_acm(BOB, r#"{"classif":"S"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotAuthorized { .. }));
    }

    #[tokio::test]
    async fn test_offline_refuses_gated_operations() {
        let e = AcmEngine::offline();
        assert!(matches!(
            e.flatten_acm(r#"{"classif":"U"}"#).await,
            Err(AuthError::ServiceNotSet)
        ));
        assert!(matches!(
            e.is_user_authorized_for_acm(ALICE, r#"{"classif":"U"}"#).await,
            Err(AuthError::ServiceNotSet)
        ));
        let s = e.snippets_for_user(ALICE).await.unwrap();
        assert_eq!(s.field("f_share").unwrap().values, vec![flatten(ALICE)]);
    }

    #[tokio::test]
    async fn test_snippet_groups() {
        let s = engine().snippets_for_user(BOB).await.unwrap();
        assert_eq!(groups_from_snippet(BOB, &s), vec!["dctc_odrive"]);
    }

    struct Unhappy;

    #[async_trait]
    impl PolicyService for Unhappy {
        async fn check_access(&self, _: &str, _: &str, _: &str) -> AuthResult<AccessDecision> {
            Ok(AccessDecision {
                success: false,
                has_access: false,
                messages: vec!["backend down".into()],
            })
        }
        async fn populate_and_validate_acm(&self, acm: &str) -> AuthResult<AcmValidation> {
            Ok(AcmValidation {
                success: true,
                acm_valid: true,
                acm: Some(acm.to_string()),
                messages: vec![],
            })
        }
        async fn get_snippets(&self, _: &str, _: &str, _: &str) -> AuthResult<SnippetReply> {
            Ok(SnippetReply::default())
        }
    }

    #[tokio::test]
    async fn test_unsuccessful_check_is_not_a_denial() {
        let e = AcmEngine::new(Arc::new(Unhappy));
        let err = e
            .is_user_authorized_for_acm(ALICE, r#"{"classif":"U"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotSuccessful { op: "CheckAccess", .. }));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Captured;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    struct Chatty;

    #[async_trait]
    impl PolicyService for Chatty {
        async fn check_access(&self, _: &str, _: &str, _: &str) -> AuthResult<AccessDecision> {
            Ok(AccessDecision {
                success: true,
                has_access: true,
                messages: vec!["access granted via dctc_odrive".into()],
            })
        }
        async fn populate_and_validate_acm(&self, _: &str) -> AuthResult<AcmValidation> {
            Ok(AcmValidation {
                success: true,
                acm_valid: false,
                acm: None,
                messages: vec!["classif missing".into(), "version unsupported".into()],
            })
        }
        async fn get_snippets(&self, _: &str, _: &str, _: &str) -> AuthResult<SnippetReply> {
            Ok(SnippetReply::default())
        }
    }

    #[tokio::test]
    async fn test_reply_messages_logged_one_per_line() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let e = AcmEngine::new(Arc::new(Chatty));
        let err = e.flatten_acm(r#"{"classif":"U"}"#).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "acm rejected by policy service: classif missing; version unsupported"
        );

        let out = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = out.lines().filter(|l| l.contains("policy service message")).collect();
        assert_eq!(lines.len(), 2, "{out}");
        assert!(lines[0].contains("classif missing") && lines[0].contains("PopulateAndValidateAcm"));
        assert!(lines[1].contains("version unsupported"));
    }

    #[tokio::test]
    async fn test_unsuccessful_error_text_carries_messages() {
        let err = AcmEngine::new(Arc::new(Unhappy))
            .is_user_authorized_for_acm(ALICE, r#"{"classif":"U"}"#)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "policy service could not complete CheckAccess: backend down"
        );
    }

    #[tokio::test]
    async fn test_normalize_then_flatten() {
        let (perms, acm) = engine()
            .normalize_permissions_from_acm(ALICE, vec![], r#"{"classif":"U","share":{"users":["cn=bob,o=org"]}}"#, true)
            .await
            .unwrap();
        assert!(perms.iter().any(|p| flatten(&p.grantee) == flatten(BOB)));
        assert!(acm.contains("f_share"));
    }
}
