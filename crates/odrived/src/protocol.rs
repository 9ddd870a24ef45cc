//! JSON request and response bodies of the object API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use odrive_auth::acm::is_everyone;
use odrive_auth::permissions::{everyone_permission, permission_for_group, permission_for_user};
use odrive_core::types::{Object, ObjectId, Permission, PermissionFlags};
use odrive_dao::{Paging, ResultSet};

use crate::error::ApiError;

/// Multipart part that must precede the file part.
pub const METADATA_PART: &str = "ObjectMetadata";

/// Names longer than this many bytes are refused.
pub const MAX_NAME_BYTES: usize = 255;

/// The `ObjectMetadata` of a create.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateObjectRequest {
    pub name: String,
    pub description: String,
    pub type_name: String,
    pub content_type: String,
    pub parent_id: Option<String>,
    /// Either a JSON object or a JSON-encoded string.
    pub acm: Option<Value>,
    pub permissions: Vec<GrantRequest>,
}

/// Metadata for a properties update or the `ObjectMetadata` of a stream update.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateObjectRequest {
    pub id: Option<String>,
    pub change_token: String,
    pub parent_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub type_name: Option<String>,
    pub content_type: Option<String>,
    pub acm: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeTokenRequest {
    pub change_token: String,
}

/// One grant to add. A group grant names its project and group; anything
/// else names a user DN or `-Everyone` in `grantee`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrantRequest {
    pub grantee: String,
    pub project_name: String,
    pub project_display_name: String,
    pub group_name: String,
    pub create: bool,
    pub read: bool,
    pub update: bool,
    pub delete: bool,
    pub share: bool,
}

impl GrantRequest {
    pub fn flags(&self) -> PermissionFlags {
        PermissionFlags {
            create: self.create,
            read: self.read,
            update: self.update,
            delete: self.delete,
            share: self.share,
        }
    }

    pub fn to_permission(&self, created_by: &str) -> Result<Permission, ApiError> {
        let flags = self.flags();
        if flags.is_empty() {
            return Err(ApiError::bad_request("a grant must set at least one permission"));
        }
        let mut p = if !self.group_name.is_empty() {
            if self.project_name.is_empty() {
                return Err(ApiError::bad_request("a group grant requires projectName"));
            }
            let display = if self.project_display_name.is_empty() {
                &self.project_name
            } else {
                &self.project_display_name
            };
            permission_for_group(&self.project_name, display, &self.group_name, flags)
        } else if self.grantee.trim().is_empty() {
            return Err(ApiError::bad_request("a grant requires a grantee"));
        } else if is_everyone(&self.grantee) {
            Permission {
                flags,
                ..everyone_permission()
            }
        } else {
            permission_for_user(self.grantee.trim(), flags)
        };
        p.created_by = created_by.to_string();
        Ok(p)
    }
}

pub fn parse_object_id(raw: &str) -> Result<ObjectId, ApiError> {
    raw.parse()
        .map_err(|e: odrive_core::types::InvalidObjectId| ApiError::bad_request(e.to_string()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantResponse {
    pub id: Option<String>,
    pub grantee: String,
    #[serde(flatten)]
    pub flags: PermissionFlags,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    pub type_name: String,
    pub content_type: String,
    pub content_size: i64,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub acm: Value,
    pub change_token: String,
    pub change_count: u64,
    pub is_deleted: bool,
    pub is_ancestor_deleted: bool,
    pub is_expunged: bool,
    pub owned_by: String,
    pub created_by: String,
    pub created_date: DateTime<Utc>,
    pub modified_by: String,
    pub modified_date: DateTime<Utc>,
    /// Live grants only; wrapped keys never leave the server.
    pub permissions: Vec<GrantResponse>,
    pub caller_permission: PermissionFlags,
}

impl ObjectResponse {
    pub fn new(obj: &Object, caller_permission: PermissionFlags) -> Self {
        Self {
            id: obj.id.to_string(),
            name: obj.name.clone(),
            description: obj.description.clone(),
            type_name: obj.type_name.clone(),
            content_type: obj.content_type.clone(),
            content_size: obj.content_size,
            content_hash: hex::encode(&obj.content_hash),
            parent_id: obj.parent_id.map(|p| p.to_string()),
            acm: serde_json::from_str(&obj.raw_acm)
                .unwrap_or_else(|_| Value::String(obj.raw_acm.clone())),
            change_token: obj.change_token.clone(),
            change_count: obj.change_count,
            is_deleted: obj.state.deleted,
            is_ancestor_deleted: obj.state.ancestor_deleted,
            is_expunged: obj.state.expunged,
            owned_by: obj.owned_by.clone(),
            created_by: obj.created_by.clone(),
            created_date: obj.created_date,
            modified_by: obj.modified_by.clone(),
            modified_date: obj.modified_date,
            permissions: obj
                .live_permissions()
                .map(|p| GrantResponse {
                    id: p.id.map(|id| id.to_string()),
                    grantee: p.grantee.clone(),
                    flags: p.flags,
                })
                .collect(),
            caller_permission,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub total_rows: usize,
    pub page_count: usize,
    pub page_number: usize,
    pub page_size: usize,
    pub page_rows: usize,
    pub objects: Vec<ObjectResponse>,
}

impl ListResponse {
    pub fn new(set: &ResultSet, flags: impl Fn(&Object) -> PermissionFlags) -> Self {
        Self {
            total_rows: set.total_rows,
            page_count: set.page_count,
            page_number: set.page_number,
            page_size: set.page_size,
            page_rows: set.objects.len(),
            objects: set
                .objects
                .iter()
                .map(|o| ObjectResponse::new(o, flags(o)))
                .collect(),
        }
    }
}

/// Reply to emptying the trash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpungedStats {
    pub expunged_count: usize,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PagingParams {
    pub page_number: Option<usize>,
    pub page_size: Option<usize>,
}

impl From<PagingParams> for Paging {
    fn from(p: PagingParams) -> Self {
        let d = Paging::default();
        Paging::new(
            p.page_number.unwrap_or(d.page_number),
            p.page_size.unwrap_or(d.page_size),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odrive_core::flatten;

    #[test]
    fn test_create_request_accepts_string_acm() {
        let req: CreateObjectRequest =
            serde_json::from_str(r#"{"name":"a.txt","acm":"{\"classif\":\"U\"}"}"#).unwrap();
        assert_eq!(req.name, "a.txt");
        assert!(req.acm.as_ref().unwrap().is_string());
        assert!(req.parent_id.is_none());
    }

    #[test]
    fn test_grant_request_kinds() {
        let user: GrantRequest =
            serde_json::from_str(r#"{"grantee":"CN=Bob, O=Org","read":true}"#).unwrap();
        let p = user.to_permission("cn=alice").unwrap();
        assert_eq!(p.grantee, flatten("CN=Bob, O=Org"));
        assert!(p.acm_share.contains("users"));
        assert_eq!(p.created_by, "cn=alice");

        let group: GrantRequest = serde_json::from_str(
            r#"{"projectName":"dctc","projectDisplayName":"DCTC","groupName":"ODrive","read":true,"update":true}"#,
        )
        .unwrap();
        let p = group.to_permission("cn=alice").unwrap();
        assert_eq!(flatten(&p.grantee), "dctc_odrive");
        assert!(p.flags.update);

        let everyone: GrantRequest =
            serde_json::from_str(r#"{"grantee":"-Everyone","read":true}"#).unwrap();
        assert!(everyone.to_permission("cn=alice").unwrap().acm_share.is_empty());
    }

    #[test]
    fn test_empty_grant_rejected() {
        let req: GrantRequest = serde_json::from_str(r#"{"grantee":"cn=bob"}"#).unwrap();
        assert!(req.to_permission("cn=alice").is_err());
    }

    #[test]
    fn test_response_hides_keys_and_deleted_rows() {
        let mut obj = Object::new("cn=alice");
        obj.raw_acm = r#"{"classif":"U"}"#.into();
        let mut live = Permission::new("cn=alice", "", PermissionFlags::all());
        live.wrapped_key = vec![1; 32];
        let mut gone = Permission::new("cn=bob", "", PermissionFlags::read_only());
        gone.is_deleted = true;
        obj.permissions = vec![live, gone];

        let v = serde_json::to_value(ObjectResponse::new(&obj, PermissionFlags::all())).unwrap();
        assert_eq!(v["acm"]["classif"], "U");
        assert_eq!(v["permissions"].as_array().unwrap().len(), 1);
        assert!(v["permissions"][0].get("wrappedKey").is_none());
        assert_eq!(v["permissions"][0]["share"], true);
        assert_eq!(v["callerPermission"]["read"], true);
    }

    #[test]
    fn test_paging_params_default_and_clamp() {
        let p: Paging = PagingParams::default().into();
        assert_eq!((p.page_number, p.page_size), (1, 20));
        let p: Paging = PagingParams {
            page_number: Some(0),
            page_size: Some(1_000_000),
        }
        .into();
        assert_eq!((p.page_number, p.page_size), (1, Paging::MAX_PAGE_SIZE));
    }
}
