//! In-process metadata store, optionally persisted to a JSON snapshot.
//!
//! All tables live behind one `RwLock`, so a write that touches an object,
//! its grant rows and its descendants is a single transaction. When a
//! snapshot path is configured, every committed write is flushed with a
//! temp-file-then-rename so a crash leaves either the old or the new file.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use odrive_core::flatten;
use odrive_core::types::{new_change_token, Object, ObjectId, Permission, User};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{DaoError, DaoResult, ListQuery, ListScope, MetadataStore, ResultSet};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    objects: BTreeMap<ObjectId, Object>,
    /// Keyed by flattened DN.
    users: BTreeMap<String, User>,
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot: None,
        }
    }

    /// Load the snapshot at `path`, or start empty if there is none yet.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let tables = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading metadata snapshot: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing metadata snapshot: {}", path.display()))?
        } else {
            Tables::default()
        };
        debug!(
            path = %path.display(),
            objects = tables.objects.len(),
            users = tables.users.len(),
            "metadata snapshot loaded"
        );
        Ok(Self {
            tables: RwLock::new(tables),
            snapshot: Some(path.to_path_buf()),
        })
    }

    pub async fn object_count(&self) -> usize {
        self.tables.read().await.objects.len()
    }

    async fn flush(&self, tables: &Tables) -> anyhow::Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(tables).context("serializing metadata")?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("writing snapshot temp: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming snapshot: {}", path.display()))?;
        Ok(())
    }

    /// Store `changed` objects and flush; on flush failure the previous
    /// rows are put back so memory never runs ahead of the snapshot.
    async fn commit_objects(&self, tables: &mut Tables, changed: Vec<Object>) -> DaoResult<()> {
        let mut previous = Vec::with_capacity(changed.len());
        for obj in changed {
            previous.push((obj.id, tables.objects.insert(obj.id, obj)));
        }
        if let Err(e) = self.flush(tables).await {
            for (id, old) in previous {
                match old {
                    Some(old) => tables.objects.insert(id, old),
                    None => tables.objects.remove(&id),
                };
            }
            return Err(DaoError::Persist(e));
        }
        Ok(())
    }

    /// Every object below `root`; `descend` decides whether to continue
    /// below a given child (the child itself is always included).
    fn descendants(
        tables: &Tables,
        root: ObjectId,
        descend: impl Fn(&Object) -> bool,
    ) -> Vec<ObjectId> {
        let mut out = Vec::new();
        let mut frontier = vec![root];
        while let Some(parent) = frontier.pop() {
            for child in tables
                .objects
                .values()
                .filter(|o| o.parent_id == Some(parent))
            {
                out.push(child.id);
                if descend(child) {
                    frontier.push(child.id);
                }
            }
        }
        out
    }

    /// `from` and every folder above it, nearest first.
    fn ancestry(tables: &Tables, from: ObjectId) -> Vec<ObjectId> {
        let mut out = Vec::new();
        let mut next = Some(from);
        while let Some(id) = next {
            if out.contains(&id) {
                break;
            }
            out.push(id);
            next = tables.objects.get(&id).and_then(|o| o.parent_id);
        }
        out
    }

    fn current(tables: &Tables, id: ObjectId, expected_token: &str) -> DaoResult<Object> {
        let stored = tables
            .objects
            .get(&id)
            .ok_or(DaoError::ObjectNotFound(id))?;
        if stored.change_token != expected_token {
            return Err(DaoError::StaleToken(id));
        }
        Ok(stored.clone())
    }

    /// Apply `edit` to the object, then `cascade` to the descendants that
    /// `descend` walks into. Both closures see the edited object first;
    /// `cascade` returns false to leave a descendant untouched.
    async fn transition(
        &self,
        id: ObjectId,
        actor: &str,
        expected_token: &str,
        edit: impl Fn(&mut Object),
        descend: impl Fn(&Object, &Object) -> bool,
        cascade: impl Fn(&Object, &mut Object) -> bool,
    ) -> DaoResult<Object> {
        let mut tables = self.tables.write().await;
        let mut obj = Self::current(&tables, id, expected_token)?;
        edit(&mut obj);
        touch(&mut obj, actor);

        let mut changed = vec![obj.clone()];
        for child_id in Self::descendants(&tables, id, |c| descend(&obj, c)) {
            if let Some(child) = tables.objects.get(&child_id) {
                let mut child = child.clone();
                if cascade(&obj, &mut child) {
                    touch(&mut child, actor);
                    changed.push(child);
                }
            }
        }
        let cascaded = changed.len() - 1;
        self.commit_objects(&mut tables, changed).await?;
        debug!(object = %id, cascaded, "lifecycle transition committed");
        Ok(obj)
    }

    /// Replace the stored object, applying only deletions to stored grant
    /// rows. The stored owner survives unless `transfer_owner` is set.
    async fn replace(
        &self,
        object: Object,
        expected_token: &str,
        transfer_owner: bool,
    ) -> DaoResult<Object> {
        let mut tables = self.tables.write().await;
        let stored = Self::current(&tables, object.id, expected_token)?;

        let mut permissions = stored.permissions.clone();
        for incoming in object.permissions.iter() {
            match incoming.id {
                Some(id) => match permissions.iter_mut().find(|p| p.id == Some(id)) {
                    Some(row) => {
                        if incoming.is_deleted {
                            row.is_deleted = true;
                        }
                    }
                    None => warn!(
                        object = %object.id,
                        grant = %id,
                        "update references unknown grant row, ignored"
                    ),
                },
                None if incoming.is_deleted => {}
                None => {
                    let mut row = incoming.clone();
                    assign_id(&mut row);
                    permissions.push(row);
                }
            }
        }

        let mut updated = object;
        updated.permissions = permissions;
        updated.change_count = stored.change_count;
        updated.created_by = stored.created_by;
        updated.created_date = stored.created_date;
        if !transfer_owner {
            updated.owned_by = stored.owned_by;
        }
        let actor = updated.modified_by.clone();
        touch(&mut updated, &actor);

        self.commit_objects(&mut tables, vec![updated.clone()]).await?;
        debug!(
            object = %updated.id,
            count = updated.change_count,
            owner = %updated.owned_by,
            "object updated"
        );
        Ok(updated)
    }
}

fn expunge_self(o: &mut Object) {
    o.state.deleted = true;
    o.state.expunged = true;
}

/// A descendant keeps an explicit trash of its own.
fn expunge_below(c: &mut Object) {
    if !c.state.deleted {
        c.state.ancestor_deleted = true;
    }
    c.state.deleted = true;
    c.state.expunged = true;
}

fn touch(obj: &mut Object, actor: &str) {
    obj.change_token = new_change_token();
    obj.change_count += 1;
    obj.modified_by = actor.to_string();
    obj.modified_date = Utc::now();
}

fn assign_id(p: &mut Permission) {
    if p.id.is_none() {
        p.id = Some(Uuid::new_v4());
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_object(&self, id: ObjectId) -> DaoResult<Object> {
        self.tables
            .read()
            .await
            .objects
            .get(&id)
            .cloned()
            .ok_or(DaoError::ObjectNotFound(id))
    }

    async fn create_object(&self, mut object: Object) -> DaoResult<Object> {
        let mut tables = self.tables.write().await;
        if tables.objects.contains_key(&object.id) {
            return Err(DaoError::Duplicate(object.id));
        }
        object.permissions.retain(|p| !p.is_deleted);
        object.permissions.iter_mut().for_each(assign_id);
        object.change_token = new_change_token();
        object.change_count = 0;
        object.modified_by = object.created_by.clone();

        self.commit_objects(&mut tables, vec![object.clone()]).await?;
        debug!(object = %object.id, grants = object.permissions.len(), "object created");
        Ok(object)
    }

    async fn update_object(&self, object: Object, expected_token: &str) -> DaoResult<Object> {
        self.replace(object, expected_token, false).await
    }

    async fn trash_object(
        &self,
        id: ObjectId,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object> {
        self.transition(
            id,
            actor,
            expected_token,
            |o| o.state.deleted = true,
            // A descendant already in the trash keeps its own trash and subtree.
            |_, c| !c.state.deleted,
            |_, c| {
                if c.state.deleted {
                    return false;
                }
                c.state.deleted = true;
                c.state.ancestor_deleted = true;
                true
            },
        )
        .await
    }

    async fn untrash_object(
        &self,
        id: ObjectId,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object> {
        // Only rows deleted by this cascade come back; a descendant trashed
        // on its own stays trashed together with its subtree. Beneath a
        // trashed ancestor nothing changes.
        let restores = |c: &Object| c.state.ancestor_deleted && !c.state.expunged;
        self.transition(
            id,
            actor,
            expected_token,
            |o| {
                if !o.state.ancestor_deleted {
                    o.state.deleted = false;
                }
            },
            |root, c| !root.state.ancestor_deleted && restores(c),
            |root, c| {
                if root.state.ancestor_deleted || !restores(c) {
                    return false;
                }
                c.state.deleted = false;
                c.state.ancestor_deleted = false;
                true
            },
        )
        .await
    }

    async fn expunge_object(
        &self,
        id: ObjectId,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object> {
        self.transition(
            id,
            actor,
            expected_token,
            expunge_self,
            |_, _| true,
            |_, c| {
                expunge_below(c);
                true
            },
        )
        .await
    }

    async fn move_object(
        &self,
        id: ObjectId,
        new_parent: Option<ObjectId>,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object> {
        let mut tables = self.tables.write().await;
        let mut obj = Self::current(&tables, id, expected_token)?;
        if let Some(parent) = new_parent {
            if !tables.objects.contains_key(&parent) {
                return Err(DaoError::ObjectNotFound(parent));
            }
            if Self::ancestry(&tables, parent).contains(&id) {
                return Err(DaoError::CircularMove { id, parent });
            }
        }
        obj.parent_id = new_parent;
        touch(&mut obj, actor);

        self.commit_objects(&mut tables, vec![obj.clone()]).await?;
        debug!(object = %id, parent = ?new_parent, "object moved");
        Ok(obj)
    }

    async fn change_owner(&self, object: Object, expected_token: &str) -> DaoResult<Object> {
        self.replace(object, expected_token, true).await
    }

    async fn expunge_deleted(&self, owner: &str, actor: &str) -> DaoResult<Vec<Object>> {
        let owner = flatten(owner);
        let mut tables = self.tables.write().await;
        let roots: Vec<ObjectId> = tables
            .objects
            .values()
            .filter(|o| ListScope::Trashed.admits(o, &owner, &[]))
            .map(|o| o.id)
            .collect();

        // A trashed object may sit beneath another trashed root; whichever
        // is reached first expunges it once.
        let mut changed: BTreeMap<ObjectId, Object> = BTreeMap::new();
        let mut expunged = Vec::with_capacity(roots.len());
        for id in roots {
            if let Some(done) = changed.get(&id) {
                expunged.push(done.clone());
                continue;
            }
            let Some(stored) = tables.objects.get(&id) else {
                continue;
            };
            let mut root = stored.clone();
            expunge_self(&mut root);
            touch(&mut root, actor);
            for child_id in Self::descendants(&tables, id, |_| true) {
                if changed.contains_key(&child_id) {
                    continue;
                }
                if let Some(child) = tables.objects.get(&child_id) {
                    let mut child = child.clone();
                    expunge_below(&mut child);
                    touch(&mut child, actor);
                    changed.insert(child_id, child);
                }
            }
            expunged.push(root.clone());
            changed.insert(id, root);
        }

        let rows = changed.len();
        self.commit_objects(&mut tables, changed.into_values().collect())
            .await?;
        debug!(owner = %owner, roots = expunged.len(), rows, "trash emptied");
        Ok(expunged)
    }

    async fn list_objects(&self, query: ListQuery<'_>) -> DaoResult<ResultSet> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Object> = tables
            .objects
            .values()
            .filter(|o| query.scope.admits(o, query.caller, query.grantees))
            .filter(|o| query.filter.map(|f| f(o)).unwrap_or(true))
            .cloned()
            .collect();
        drop(tables);
        rows.sort_by(|a, b| {
            b.modified_date
                .cmp(&a.modified_date)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(ResultSet::paginate(rows, query.paging))
    }

    async fn get_user(&self, dn: &str) -> DaoResult<User> {
        self.tables
            .read()
            .await
            .users
            .get(&flatten(dn))
            .cloned()
            .ok_or_else(|| DaoError::UserNotFound(dn.to_string()))
    }

    async fn create_user(&self, mut user: User) -> DaoResult<User> {
        let key = flatten(&user.distinguished_name);
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.users.get(&key) {
            return Ok(existing.clone());
        }
        if user.modified_by.is_empty() {
            user.modified_by = user.created_by.clone();
        }
        tables.users.insert(key.clone(), user.clone());
        if let Err(e) = self.flush(&tables).await {
            tables.users.remove(&key);
            return Err(DaoError::Persist(e));
        }
        debug!(user = %user.distinguished_name, "user created");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_descendants_walk_stops_where_told() {
        let store = MemoryStore::in_memory();
        let root = store.create_object(Object::new("cn=a")).await.unwrap();
        let mut mid = Object::new("cn=a");
        mid.parent_id = Some(root.id);
        mid.state.deleted = true;
        let mid = store.create_object(mid).await.unwrap();
        let mut leaf = Object::new("cn=a");
        leaf.parent_id = Some(mid.id);
        let leaf = store.create_object(leaf).await.unwrap();

        let tables = store.tables.read().await;
        let all = MemoryStore::descendants(&tables, root.id, |_| true);
        assert_eq!(all, vec![mid.id, leaf.id]);
        let shallow = MemoryStore::descendants(&tables, root.id, |c| !c.state.deleted);
        assert_eq!(shallow, vec![mid.id]);
    }

    #[tokio::test]
    async fn test_create_drops_unsaved_deleted_rows() {
        let store = MemoryStore::in_memory();
        let mut obj = Object::new("cn=a");
        let mut dead = Permission::new("cn=b", "", Default::default());
        dead.is_deleted = true;
        obj.permissions.push(dead);
        obj.permissions.push(Permission::new(
            "cn=a",
            "",
            odrive_core::types::PermissionFlags::all(),
        ));
        let created = store.create_object(obj).await.unwrap();
        assert_eq!(created.permissions.len(), 1);
        assert!(created.permissions[0].id.is_some());
    }
}
