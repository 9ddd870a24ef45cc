//! ACM documents and their `share` element.
//!
//! Share format:
//!
//! ```json
//! {"users": ["cn=alice,..."],
//!  "projects": {"dctc": {"disp_nm": "DCTC", "groups": ["ODrive"]}}}
//! ```
//!
//! An absent or empty share means everyone may read (subject to the rest of
//! the marking).

use odrive_core::flatten;
use odrive_core::types::{Permission, PermissionFlags, Snippet, Treatment};
use serde_json::{json, Map, Value};

use crate::{AuthError, AuthResult};

pub const SHARE_KEY: &str = "share";

pub use odrive_core::types::EVERYONE_GROUP;

pub type AcmMap = Map<String, Value>;

/// Parse an ACM document. It must be a JSON object.
pub fn parse_acm(raw: &str) -> AuthResult<AcmMap> {
    if raw.trim().is_empty() {
        return Err(AuthError::AcmNotSpecified);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AuthError::InvalidAcm("acm must be a JSON object".into())),
        Err(e) => Err(AuthError::InvalidAcm(e.to_string())),
    }
}

/// Canonical serialization: keys sorted, no whitespace.
pub fn acm_to_string(acm: &AcmMap) -> String {
    Value::Object(acm.clone()).to_string()
}

/// Accept an ACM given either as an object or as a JSON-encoded string.
pub fn normalize_acm_value(value: &Value) -> AuthResult<String> {
    match value {
        Value::String(s) => parse_acm(s).map(|m| acm_to_string(&m)),
        Value::Object(m) => Ok(acm_to_string(m)),
        Value::Null => Err(AuthError::AcmNotSpecified),
        _ => Err(AuthError::InvalidAcm("acm must be a JSON object".into())),
    }
}

pub fn is_everyone(grantee: &str) -> bool {
    flatten(grantee) == flatten(EVERYONE_GROUP)
}

/// Grantee name for a project group.
pub fn group_grantee(project: &str, group: &str) -> String {
    format!("{project}_{group}")
}

pub fn user_share_fragment(dn: &str) -> String {
    json!({ "users": [dn] }).to_string()
}

pub fn group_share_fragment(project: &str, display_name: &str, group: &str) -> String {
    json!({ "projects": { project: { "disp_nm": display_name, "groups": [group] } } }).to_string()
}

/// One read-or-better grant per user and per project group named in `share`.
pub fn share_to_permissions(share: &Value, flags: PermissionFlags) -> AuthResult<Vec<Permission>> {
    let mut out = Vec::new();
    let share = match share {
        Value::Null => return Ok(out),
        Value::Object(m) => m,
        _ => return Err(AuthError::InvalidAcm("share must be an object".into())),
    };

    if let Some(users) = share.get("users") {
        let users = users
            .as_array()
            .ok_or_else(|| AuthError::InvalidAcm("share.users must be an array".into()))?;
        for user in users {
            let dn = user
                .as_str()
                .ok_or_else(|| AuthError::InvalidAcm("share.users entries must be strings".into()))?;
            out.push(Permission::new(dn, user_share_fragment(dn), flags));
        }
    }

    if let Some(projects) = share.get("projects") {
        let projects = projects
            .as_object()
            .ok_or_else(|| AuthError::InvalidAcm("share.projects must be an object".into()))?;
        for (project, detail) in projects {
            let display_name = detail
                .get("disp_nm")
                .and_then(Value::as_str)
                .unwrap_or(project);
            let groups = detail
                .get("groups")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    AuthError::InvalidAcm(format!("share.projects.{project}.groups must be an array"))
                })?;
            for group in groups {
                let group = group.as_str().ok_or_else(|| {
                    AuthError::InvalidAcm("share project groups must be strings".into())
                })?;
                out.push(Permission::new(
                    group_grantee(project, group),
                    group_share_fragment(project, display_name, group),
                    flags,
                ));
            }
        }
    }

    Ok(out)
}

fn push_unique(list: &mut Vec<Value>, item: &Value) {
    let key = item.as_str().map(flatten);
    let dup = list
        .iter()
        .any(|existing| existing.as_str().map(flatten) == key && key.is_some());
    if !dup {
        list.push(item.clone());
    }
}

/// Merge a share fragment into `target`, deduplicating users and groups.
pub fn combine_share(target: &mut Value, fragment: &Value) {
    if !target.is_object() {
        *target = json!({});
    }
    let (Some(target), Some(fragment)) = (target.as_object_mut(), fragment.as_object()) else {
        return;
    };

    if let Some(users) = fragment.get("users").and_then(Value::as_array) {
        let slot = target.entry("users").or_insert_with(|| json!([]));
        if let Some(list) = slot.as_array_mut() {
            for u in users {
                push_unique(list, u);
            }
        }
    }

    if let Some(projects) = fragment.get("projects").and_then(Value::as_object) {
        let slot = target.entry("projects").or_insert_with(|| json!({}));
        let Some(target_projects) = slot.as_object_mut() else {
            return;
        };
        for (name, detail) in projects {
            let entry = target_projects
                .entry(name.clone())
                .or_insert_with(|| json!({ "disp_nm": detail.get("disp_nm").cloned().unwrap_or(Value::Null), "groups": [] }));
            let Some(entry) = entry.as_object_mut() else {
                continue;
            };
            let groups = entry.entry("groups").or_insert_with(|| json!([]));
            if let (Some(list), Some(new)) = (
                groups.as_array_mut(),
                detail.get("groups").and_then(Value::as_array),
            ) {
                for g in new {
                    push_unique(list, g);
                }
            }
        }
    }
}

fn string_values(acm: &AcmMap, field: &str) -> Vec<String> {
    match acm.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_lowercase)
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.to_lowercase()],
        _ => Vec::new(),
    }
}

/// Does the user's snippet admit an object carrying this flattened ACM?
///
/// `f_share` is satisfied by any overlap (or an empty share). Other allow
/// fields require every object value to be allowed; disallow fields require
/// none of them to appear.
pub fn snippet_allows(snippet: &Snippet, acm: &AcmMap) -> bool {
    snippet.fields.iter().all(|field| {
        let object_values = string_values(acm, &field.field);
        let allowed: Vec<String> = field.values.iter().map(|v| v.to_lowercase()).collect();
        match field.treatment {
            Treatment::Allow if field.field == "f_share" => {
                object_values.is_empty() || object_values.iter().any(|v| allowed.contains(v))
            }
            Treatment::Allow => object_values.iter().all(|v| allowed.contains(v)),
            Treatment::Disallow => !object_values.iter().any(|v| allowed.contains(v)),
        }
    })
}
