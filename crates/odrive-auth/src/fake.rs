//! In-process policy service with a fixed user table.
//!
//! Classification levels rank `U < C < S < TS`. An ACM's `f_share` is
//! rebuilt from its share element on every populate call, and access needs
//! both sufficient clearance and (for a non-empty share) a matching user or
//! group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use odrive_core::flatten;
use serde_json::{json, Value};

use crate::acm::{group_grantee, parse_acm, SHARE_KEY};
use crate::policy::{AccessDecision, AcmValidation, PolicyService, SnippetReply};
use crate::AuthResult;

const LEVELS: [&str; 4] = ["u", "c", "s", "ts"];

fn rank(level: &str) -> Option<usize> {
    let level = level.to_lowercase();
    LEVELS.iter().position(|l| *l == level)
}

#[derive(Debug, Clone)]
struct FakeUser {
    clearance: String,
    groups: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakePolicyService {
    users: HashMap<String, FakeUser>,
    calls: AtomicUsize,
}

impl FakePolicyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user with a clearance (`"U"`, `"S"`, ...) and project groups
    /// given as `(project, group)` pairs.
    pub fn with_user(mut self, dn: &str, clearance: &str, groups: &[(&str, &str)]) -> Self {
        self.users.insert(
            flatten(dn),
            FakeUser {
                clearance: clearance.to_lowercase(),
                groups: groups
                    .iter()
                    .map(|(p, g)| flatten(&group_grantee(p, g)))
                    .collect(),
            },
        );
        self
    }

    /// Total calls received, across all operations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn user(&self, dn: &str) -> Option<&FakeUser> {
        self.users.get(&flatten(dn))
    }
}

fn share_values(share: Option<&Value>) -> Vec<String> {
    let mut out = Vec::new();
    let Some(share) = share.and_then(Value::as_object) else {
        return out;
    };
    if let Some(users) = share.get("users").and_then(Value::as_array) {
        out.extend(users.iter().filter_map(Value::as_str).map(flatten));
    }
    if let Some(projects) = share.get("projects").and_then(Value::as_object) {
        for (project, detail) in projects {
            if let Some(groups) = detail.get("groups").and_then(Value::as_array) {
                out.extend(
                    groups
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|g| flatten(&group_grantee(project, g))),
                );
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

#[async_trait]
impl PolicyService for FakePolicyService {
    async fn check_access(
        &self,
        user: &str,
        _token_type: &str,
        acm: &str,
    ) -> AuthResult<AccessDecision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Ok(acm) = parse_acm(acm) else {
            return Ok(AccessDecision {
                success: false,
                has_access: false,
                messages: vec!["acm could not be parsed".into()],
            });
        };
        let Some(u) = self.user(user) else {
            return Ok(AccessDecision {
                success: true,
                has_access: false,
                messages: vec!["user unknown".into()],
            });
        };

        let mut messages = Vec::new();
        let classif = acm.get("classif").and_then(Value::as_str).unwrap_or("");
        match (rank(classif), rank(&u.clearance)) {
            (Some(needed), Some(held)) if held >= needed => {}
            _ => messages.push(format!("clearance {} insufficient", u.clearance)),
        }

        let share = share_values(acm.get(SHARE_KEY));
        let me = flatten(user);
        if !share.is_empty() && !share.iter().any(|s| *s == me || u.groups.contains(s)) {
            messages.push("not in share".into());
        }

        Ok(AccessDecision {
            success: true,
            has_access: messages.is_empty(),
            messages,
        })
    }

    async fn populate_and_validate_acm(&self, acm: &str) -> AuthResult<AcmValidation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut map = match parse_acm(acm) {
            Ok(m) => m,
            Err(e) => {
                return Ok(AcmValidation {
                    success: true,
                    acm_valid: false,
                    acm: None,
                    messages: vec![e.to_string()],
                })
            }
        };
        let classif = map
            .get("classif")
            .and_then(Value::as_str)
            .map(str::to_lowercase);
        let Some(classif) = classif.filter(|c| rank(c).is_some()) else {
            return Ok(AcmValidation {
                success: true,
                acm_valid: false,
                acm: None,
                messages: vec!["classif missing or unknown".into()],
            });
        };

        map.insert("f_clearance".into(), json!([classif]));
        let share = share_values(map.get(SHARE_KEY));
        if share.is_empty() {
            map.remove("f_share");
        } else {
            map.insert("f_share".into(), json!(share));
        }

        Ok(AcmValidation {
            success: true,
            acm_valid: true,
            acm: Some(Value::Object(map).to_string()),
            messages: Vec::new(),
        })
    }

    async fn get_snippets(
        &self,
        user: &str,
        _token_type: &str,
        _snippet_type: &str,
    ) -> AuthResult<SnippetReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(u) = self.user(user) else {
            return Ok(SnippetReply {
                success: true,
                found: false,
                snippets: String::new(),
                messages: vec!["user unknown".into()],
            });
        };
        let held = rank(&u.clearance).unwrap_or(0);
        let mut share = vec![flatten(user)];
        share.extend(u.groups.iter().cloned());
        let snippets = json!({
            "f_share": {"treatment": "allow", "values": share},
            "f_clearance": {"treatment": "allow", "values": LEVELS[..=held].to_vec()},
        });
        Ok(SnippetReply {
            success: true,
            found: true,
            snippets: snippets.to_string(),
            messages: Vec::new(),
        })
    }
}
