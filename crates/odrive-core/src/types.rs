use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::flatten;

/// 16-byte object identifier, rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 16]);

impl ObjectId {
    pub fn new_random() -> Self {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object id: {0:?}")]
pub struct InvalidObjectId(pub String);

impl FromStr for ObjectId {
    type Err = InvalidObjectId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; 16];
        hex::decode_to_slice(s, &mut id).map_err(|_| InvalidObjectId(s.to_string()))?;
        Ok(Self(id))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Capability flags carried by a single grant row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionFlags {
    pub create: bool,
    pub read: bool,
    pub update: bool,
    pub delete: bool,
    pub share: bool,
}

impl PermissionFlags {
    pub const fn all() -> Self {
        Self {
            create: true,
            read: true,
            update: true,
            delete: true,
            share: true,
        }
    }

    pub const fn read_only() -> Self {
        Self {
            create: false,
            read: true,
            update: false,
            delete: false,
            share: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.create || self.read || self.update || self.delete || self.share)
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            create: self.create || other.create,
            read: self.read || other.read,
            update: self.update || other.update,
            delete: self.delete || other.delete,
            share: self.share || other.share,
        }
    }

    /// True when every flag set in `required` is also set here.
    pub fn covers(&self, required: Self) -> bool {
        (!required.create || self.create)
            && (!required.read || self.read)
            && (!required.update || self.update)
            && (!required.delete || self.delete)
            && (!required.share || self.share)
    }
}

/// Pseudo-group that stands for every authenticated user.
pub const EVERYONE_GROUP: &str = "-Everyone";

/// Row identifier assigned by the metadata store.
pub type PermissionId = uuid::Uuid;

/// One grant row attached to an object.
///
/// Rows are never edited in place once persisted: a change is recorded by
/// marking the old row deleted and inserting a replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Assigned by the metadata store; `None` until the row is persisted.
    pub id: Option<PermissionId>,
    /// Flattened user DN or group name. The spelling a client supplied
    /// survives in `acm_share`.
    pub grantee: String,
    /// JSON fragment that this grant contributes to the ACM share element.
    pub acm_share: String,
    pub flags: PermissionFlags,
    /// Content key wrapped for this grantee; present on every live read grant.
    #[serde(default, with = "hex_bytes")]
    pub wrapped_key: Vec<u8>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub created_by: String,
}

impl Permission {
    pub fn new(grantee: impl AsRef<str>, acm_share: impl Into<String>, flags: PermissionFlags) -> Self {
        Self {
            id: None,
            grantee: flatten(grantee.as_ref()),
            acm_share: acm_share.into(),
            flags,
            wrapped_key: Vec::new(),
            is_deleted: false,
            created_by: String::new(),
        }
    }

    /// Not yet persisted.
    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_live_read(&self) -> bool {
        !self.is_deleted && self.flags.read
    }
}

/// Lifecycle flags.
///
/// `deleted` is set whenever the object is in the trash. `ancestor_deleted`
/// marks that it got there because an ancestor was trashed; an explicit
/// trash leaves it clear. Both `ancestor_deleted` and `expunged` imply
/// `deleted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectState {
    pub deleted: bool,
    pub ancestor_deleted: bool,
    pub expunged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub id: ObjectId,
    pub name: String,
    pub description: String,
    pub type_name: String,
    pub content_type: String,
    pub content_size: i64,
    #[serde(default, with = "hex_bytes")]
    pub content_hash: Vec<u8>,
    /// Opaque 64-hex-char name of the ciphertext file; changes on every new stream.
    pub content_connector: String,
    #[serde(default, with = "hex_bytes")]
    pub encrypt_iv: Vec<u8>,
    pub parent_id: Option<ObjectId>,
    /// Canonical JSON of the flattened ACM.
    pub raw_acm: String,
    pub change_token: String,
    pub change_count: u64,
    #[serde(flatten)]
    pub state: ObjectState,
    pub owned_by: String,
    pub created_by: String,
    pub created_date: DateTime<Utc>,
    pub modified_by: String,
    pub modified_date: DateTime<Utc>,
    pub permissions: Vec<Permission>,
}

impl Object {
    /// A fresh, unpersisted object owned by `owner`.
    pub fn new(owner: &str) -> Self {
        let now = Utc::now();
        Self {
            id: ObjectId::new_random(),
            name: String::new(),
            description: String::new(),
            type_name: "File".into(),
            content_type: String::new(),
            content_size: 0,
            content_hash: Vec::new(),
            content_connector: String::new(),
            encrypt_iv: Vec::new(),
            parent_id: None,
            raw_acm: String::new(),
            change_token: new_change_token(),
            change_count: 0,
            state: ObjectState::default(),
            owned_by: owner.to_string(),
            created_by: owner.to_string(),
            created_date: now,
            modified_by: owner.to_string(),
            modified_date: now,
            permissions: Vec::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.state.deleted || self.state.ancestor_deleted || self.state.expunged
    }

    pub fn live_permissions(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter().filter(|p| !p.is_deleted)
    }
}

/// Opaque optimistic-concurrency token; regenerated on every metadata write.
pub fn new_change_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub distinguished_name: String,
    pub display_name: String,
    pub created_by: String,
    pub created_date: DateTime<Utc>,
    pub modified_by: String,
    pub modified_date: DateTime<Utc>,
    pub change_token: String,
}

impl User {
    pub fn new(dn: &str, display_name: &str) -> Self {
        let now = Utc::now();
        Self {
            distinguished_name: dn.to_string(),
            display_name: display_name.to_string(),
            created_by: dn.to_string(),
            created_date: now,
            modified_by: dn.to_string(),
            modified_date: now,
            change_token: new_change_token(),
        }
    }
}

/// How a snippet field constrains the ACMs a user may list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Treatment {
    Allow,
    Disallow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnippetField {
    pub field: String,
    pub treatment: Treatment,
    pub values: Vec<String>,
}

/// Per-user search constraints returned by the policy service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    pub fields: Vec<SnippetField>,
}

impl Snippet {
    pub fn field(&self, name: &str) -> Option<&SnippetField> {
        self.fields.iter().find(|f| f.field == name)
    }
}

/// Hex encoding for byte fields in persisted JSON.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_stores_flattened_grantee() {
        let dn = "CN=Bob Smith, O=U.S. Gov";
        let p = Permission::new(dn, format!(r#"{{"users":["{dn}"]}}"#), PermissionFlags::read_only());
        assert_eq!(p.grantee, "cnbobsmithou_s_gov");
        assert!(p.acm_share.contains(dn));

        let everyone = Permission::new(EVERYONE_GROUP, "", PermissionFlags::read_only());
        assert_eq!(everyone.grantee, "_everyone");
    }

    #[test]
    fn test_object_id_hex_roundtrip() {
        let id = ObjectId::new_random();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(s.parse::<ObjectId>().unwrap(), id);
    }

    #[test]
    fn test_object_id_rejects_garbage() {
        assert!("not-hex".parse::<ObjectId>().is_err());
        assert!("abcd".parse::<ObjectId>().is_err(), "short ids must be rejected");
    }

    #[test]
    fn test_flags_covers() {
        let rw = PermissionFlags {
            read: true,
            update: true,
            ..Default::default()
        };
        assert!(PermissionFlags::all().covers(rw));
        assert!(rw.covers(PermissionFlags::read_only()));
        assert!(!PermissionFlags::read_only().covers(rw));
        assert!(PermissionFlags::default().is_empty());
    }

    #[test]
    fn test_object_state_flattens_in_json() {
        let mut obj = Object::new("cn=alice");
        obj.state.deleted = true;
        let v = serde_json::to_value(&obj).unwrap();
        assert_eq!(v["deleted"], true);
        assert_eq!(v["expunged"], false);
        let back: Object = serde_json::from_value(v).unwrap();
        assert!(back.is_deleted());
    }

    #[test]
    fn test_change_tokens_differ() {
        assert_ne!(new_change_token(), new_change_token());
    }
}
