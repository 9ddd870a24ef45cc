//! odrive-dao: persistence for objects, their grant rows, and users.
//!
//! [`MetadataStore`] is the seam the HTTP handlers talk to. Every write is
//! guarded by the object's change token and commits the object together
//! with its grant rows. [`MemoryStore`] is the bundled implementation;
//! [`Retrying`] wraps any store with bounded deadlock retry.

pub mod memory;
pub mod retry;

pub use memory::MemoryStore;
pub use retry::{with_deadlock_retry, Retrying};

use async_trait::async_trait;
use odrive_core::flatten;
use odrive_core::types::{Object, ObjectId, User, EVERYONE_GROUP};
use odrive_core::OdriveError;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum DaoError {
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("user {0:?} not found")]
    UserNotFound(String),

    #[error("object {0} already exists")]
    Duplicate(ObjectId),

    #[error("change token mismatch for object {0}")]
    StaleToken(ObjectId),

    #[error("object {id} cannot move beneath {parent}: it is that folder or one of its ancestors")]
    CircularMove { id: ObjectId, parent: ObjectId },

    #[error("transaction deadlocked")]
    Deadlock,

    #[error("persisting metadata: {0:#}")]
    Persist(anyhow::Error),
}

pub type DaoResult<T> = Result<T, DaoError>;

impl DaoError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, DaoError::Deadlock)
    }
}

impl From<DaoError> for OdriveError {
    fn from(e: DaoError) -> Self {
        match e {
            DaoError::ObjectNotFound(_) | DaoError::UserNotFound(_) => {
                OdriveError::NotFound(e.to_string())
            }
            DaoError::StaleToken(_) | DaoError::Duplicate(_) => OdriveError::Conflict(e.to_string()),
            DaoError::CircularMove { .. } => OdriveError::BadRequest(e.to_string()),
            DaoError::Deadlock | DaoError::Persist(_) => OdriveError::Internal(e.to_string()),
        }
    }
}

/// Which slice of the object table a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
    /// Objects with no parent.
    Root,
    Children(ObjectId),
    /// Owned by someone else, readable by the caller other than via everyone.
    SharedToMe,
    /// Owned by the caller and readable by at least one other grantee.
    SharedByMe,
    SharedToEveryone,
    /// Objects the caller trashed explicitly.
    Trashed,
}

impl ListScope {
    /// `caller` and `grantees` are flattened.
    pub fn admits(&self, obj: &Object, caller: &str, grantees: &[String]) -> bool {
        let owned = flatten(&obj.owned_by) == caller;
        match self {
            ListScope::Trashed => {
                owned && obj.state.deleted && !obj.state.ancestor_deleted && !obj.state.expunged
            }
            _ if obj.is_deleted() => false,
            ListScope::Root => obj.parent_id.is_none() && readable_by(obj, grantees),
            ListScope::Children(parent) => {
                obj.parent_id == Some(*parent) && readable_by(obj, grantees)
            }
            ListScope::SharedToMe => {
                let everyone = flatten(EVERYONE_GROUP);
                let personal: Vec<String> =
                    grantees.iter().filter(|g| **g != everyone).cloned().collect();
                !owned && readable_by(obj, &personal)
            }
            ListScope::SharedByMe => {
                owned
                    && obj
                        .live_permissions()
                        .any(|p| p.flags.read && flatten(&p.grantee) != caller)
            }
            ListScope::SharedToEveryone => {
                let everyone = flatten(EVERYONE_GROUP);
                obj.live_permissions()
                    .any(|p| p.flags.read && flatten(&p.grantee) == everyone)
            }
        }
    }
}

fn readable_by(obj: &Object, grantees: &[String]) -> bool {
    obj.live_permissions()
        .any(|p| p.flags.read && grantees.contains(&flatten(&p.grantee)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    /// 1-based.
    pub page_number: usize,
    pub page_size: usize,
}

impl Paging {
    pub const MAX_PAGE_SIZE: usize = 10_000;

    pub fn new(page_number: usize, page_size: usize) -> Self {
        Self {
            page_number: page_number.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }
}

impl Default for Paging {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// Extra per-object predicate applied after the scope, e.g. a snippet check.
pub type ObjectFilter<'a> = &'a (dyn Fn(&Object) -> bool + Send + Sync);

#[derive(Clone, Copy)]
pub struct ListQuery<'a> {
    pub scope: ListScope,
    /// Flattened DN of the caller.
    pub caller: &'a str,
    /// Flattened grantees the caller answers to.
    pub grantees: &'a [String],
    pub filter: Option<ObjectFilter<'a>>,
    pub paging: Paging,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultSet {
    pub total_rows: usize,
    pub page_count: usize,
    pub page_number: usize,
    pub page_size: usize,
    pub objects: Vec<Object>,
}

impl ResultSet {
    /// Page `rows` (already filtered and ordered).
    pub fn paginate(rows: Vec<Object>, paging: Paging) -> Self {
        let total_rows = rows.len();
        let page_count = total_rows.div_ceil(paging.page_size);
        let objects = rows
            .into_iter()
            .skip((paging.page_number - 1) * paging.page_size)
            .take(paging.page_size)
            .collect();
        Self {
            total_rows,
            page_count,
            page_number: paging.page_number,
            page_size: paging.page_size,
            objects,
        }
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_object(&self, id: ObjectId) -> DaoResult<Object>;

    /// Insert an object and its grant rows; new rows receive ids.
    async fn create_object(&self, object: Object) -> DaoResult<Object>;

    /// Replace the object's fields if `expected_token` is still current.
    ///
    /// Grant rows are never edited: rows with an id are matched to stored
    /// rows and only their deletion is applied; rows without an id are
    /// inserted.
    async fn update_object(&self, object: Object, expected_token: &str) -> DaoResult<Object>;

    /// Mark the object deleted, and every descendant not already in the
    /// trash both deleted and ancestor-deleted.
    async fn trash_object(&self, id: ObjectId, actor: &str, expected_token: &str)
        -> DaoResult<Object>;

    /// Reverse a trash, restoring the ancestor-deleted descendants except
    /// beneath descendants that were trashed on their own.
    async fn untrash_object(
        &self,
        id: ObjectId,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object>;

    /// Terminal delete of the object and its descendants.
    async fn expunge_object(
        &self,
        id: ObjectId,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object>;

    /// Reparent the object under `new_parent`, or to the root for `None`.
    ///
    /// Fails with [`DaoError::CircularMove`] when `new_parent` is the
    /// object itself or lies beneath it.
    async fn move_object(
        &self,
        id: ObjectId,
        new_parent: Option<ObjectId>,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object>;

    /// Like [`update_object`](Self::update_object), but `object.owned_by`
    /// replaces the stored owner.
    async fn change_owner(&self, object: Object, expected_token: &str) -> DaoResult<Object>;

    /// Expunge every object `owner` trashed explicitly, together with its
    /// descendants. Returns the objects that were in the trash listing.
    async fn expunge_deleted(&self, owner: &str, actor: &str) -> DaoResult<Vec<Object>>;

    async fn list_objects(&self, query: ListQuery<'_>) -> DaoResult<ResultSet>;

    async fn get_user(&self, dn: &str) -> DaoResult<User>;

    /// Insert a user row, or return the existing one for the same DN.
    async fn create_user(&self, user: User) -> DaoResult<User>;
}
