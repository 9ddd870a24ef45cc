//! Who is calling, and what they may do to an object.
//!
//! TLS terminates in front of the daemon; the proxy forwards the client
//! certificate subject in `SSL_CLIENT_S_DN`. A peer listed in
//! `trusted_impersonators` may act for someone else by adding `USER_DN`
//! (and optionally `EXTERNAL_SYS_DN`); anyone else is bound to their own DN.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use odrive_auth::groups_from_snippet;
use odrive_auth::permissions::{caller_grantees, effective_flags, find_read_grant};
use odrive_core::flatten;
use odrive_core::types::{Object, PermissionFlags, Snippet};
use odrive_core::OdriveError;
use odrive_crypto::{unwrap_key, ContentKey, MasterKey};

use crate::error::ApiError;
use crate::server::AppServer;

pub const PEER_DN_HEADER: &str = "ssl_client_s_dn";
pub const USER_DN_HEADER: &str = "user_dn";
pub const EXTERNAL_SYS_DN_HEADER: &str = "external_sys_dn";

pub const NEED_CREATE: PermissionFlags = PermissionFlags {
    create: true,
    read: false,
    update: false,
    delete: false,
    share: false,
};
pub const NEED_READ: PermissionFlags = PermissionFlags::read_only();
pub const NEED_UPDATE: PermissionFlags = PermissionFlags {
    create: false,
    read: false,
    update: true,
    delete: false,
    share: false,
};
pub const NEED_DELETE: PermissionFlags = PermissionFlags {
    create: false,
    read: false,
    update: false,
    delete: true,
    share: false,
};
pub const NEED_SHARE: PermissionFlags = PermissionFlags {
    create: false,
    read: false,
    update: false,
    delete: false,
    share: true,
};

/// The authenticated identity of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Effective user every decision is made for.
    pub dn: String,
    /// Certificate subject of the connecting peer.
    pub peer_dn: String,
    pub external_sys_dn: Option<String>,
}

fn header(headers: &HeaderMap, name: &str) -> Result<Option<String>, ApiError> {
    match headers.get(name) {
        None => Ok(None),
        Some(v) => {
            let v = v
                .to_str()
                .map_err(|_| OdriveError::Unauthenticated(format!("{name} is not valid text")))?
                .trim();
            Ok((!v.is_empty()).then(|| v.to_string()))
        }
    }
}

pub fn is_trusted(peer_dn: &str, trusted: &[String]) -> bool {
    let peer = flatten(peer_dn);
    trusted.iter().any(|t| flatten(t) == peer)
}

impl Caller {
    pub fn resolve(headers: &HeaderMap, trusted: &[String]) -> Result<Self, ApiError> {
        let peer_dn = header(headers, PEER_DN_HEADER)?
            .ok_or_else(|| OdriveError::Unauthenticated("no client certificate subject".into()))?;
        let user_dn = header(headers, USER_DN_HEADER)?;
        let external_sys_dn = header(headers, EXTERNAL_SYS_DN_HEADER)?;

        if user_dn.is_none() && external_sys_dn.is_none() {
            return Ok(Self {
                dn: peer_dn.clone(),
                peer_dn,
                external_sys_dn: None,
            });
        }
        if !is_trusted(&peer_dn, trusted) {
            return Err(OdriveError::Unauthenticated(format!(
                "peer {peer_dn} may not act on behalf of another user"
            ))
            .into());
        }
        Ok(Self {
            dn: user_dn.unwrap_or_else(|| peer_dn.clone()),
            peer_dn,
            external_sys_dn,
        })
    }

    pub fn is_trusted_peer(&self, trusted: &[String]) -> bool {
        is_trusted(&self.peer_dn, trusted)
    }
}

impl FromRequestParts<Arc<AppServer>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppServer>,
    ) -> Result<Self, Self::Rejection> {
        Caller::resolve(&parts.headers, &state.config.server.trusted_impersonators)
    }
}

/// A caller with their groups resolved from the policy service.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub dn: String,
    pub flat_dn: String,
    pub groups: Vec<String>,
    /// Flattened DN, groups and the everyone pseudo-group.
    pub grantees: Vec<String>,
    pub snippet: Snippet,
}

impl CallerContext {
    pub fn new(dn: &str, snippet: Snippet) -> Self {
        let groups = groups_from_snippet(dn, &snippet);
        let grantees = caller_grantees(dn, &groups);
        Self {
            dn: dn.to_string(),
            flat_dn: flatten(dn),
            groups,
            grantees,
            snippet,
        }
    }

    pub fn flags_on(&self, obj: &Object) -> PermissionFlags {
        effective_flags(&obj.permissions, &self.grantees)
    }

    pub fn is_owner(&self, obj: &Object) -> bool {
        flatten(&obj.owned_by) == self.flat_dn
    }

    /// Fail unless the caller's live grants cover `needed`.
    pub fn require(&self, obj: &Object, needed: PermissionFlags, action: &str) -> Result<(), ApiError> {
        if self.flags_on(obj).covers(needed) {
            Ok(())
        } else {
            Err(ApiError::not_authorized(format!(
                "caller may not {action} object {}",
                obj.id
            )))
        }
    }

    /// Unwrap the object's content key through the caller's read grant.
    pub fn content_key(&self, master: &MasterKey, obj: &Object) -> Result<ContentKey, ApiError> {
        let grant = find_read_grant(&obj.permissions, &self.dn, &self.groups).ok_or_else(|| {
            ApiError::not_authorized(format!("caller holds no read grant on object {}", obj.id))
        })?;
        Ok(unwrap_key(master, &grant.grantee, &grant.wrapped_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use odrive_core::ErrorKind;

    const PROXY: &str = "CN=twl-server-generic2, OU=DAE, O=U.S. Government, C=US";

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn test_peer_is_caller_without_impersonation() {
        let c = Caller::resolve(&headers(&[(PEER_DN_HEADER, "cn=alice,o=org")]), &[]).unwrap();
        assert_eq!(c.dn, "cn=alice,o=org");
        assert_eq!(c.peer_dn, c.dn);
    }

    #[test]
    fn test_missing_subject_is_unauthenticated() {
        let err = Caller::resolve(&HeaderMap::new(), &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    }

    #[test]
    fn test_trusted_peer_impersonates() {
        let trusted = vec!["cn=twl-server-generic2,ou=dae,o=u.s. government,c=us".to_string()];
        let c = Caller::resolve(
            &headers(&[
                (PEER_DN_HEADER, PROXY),
                (USER_DN_HEADER, "cn=bob,o=org"),
                (EXTERNAL_SYS_DN_HEADER, "cn=portal,o=org"),
            ]),
            &trusted,
        )
        .unwrap();
        assert_eq!(c.dn, "cn=bob,o=org");
        assert_eq!(c.peer_dn, PROXY);
        assert_eq!(c.external_sys_dn.as_deref(), Some("cn=portal,o=org"));
    }

    #[test]
    fn test_untrusted_peer_cannot_impersonate() {
        let err = Caller::resolve(
            &headers(&[(PEER_DN_HEADER, "cn=mallory,o=org"), (USER_DN_HEADER, "cn=bob,o=org")]),
            &[PROXY.to_string()],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    }

    #[test]
    fn test_context_grantees_include_groups_and_everyone() {
        use odrive_core::types::{SnippetField, Treatment};
        let snippet = Snippet {
            fields: vec![SnippetField {
                field: "f_share".into(),
                treatment: Treatment::Allow,
                values: vec!["cnboboorg".into(), "dctc_odrive".into()],
            }],
        };
        let ctx = CallerContext::new("cn=bob,o=org", snippet);
        assert_eq!(ctx.groups, vec!["dctc_odrive"]);
        assert!(ctx.grantees.contains(&"cnboboorg".to_string()));
        assert!(ctx.grantees.contains(&flatten(odrive_core::types::EVERYONE_GROUP)));
    }
}
