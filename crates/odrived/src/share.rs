//! Adding and removing grants on an object.
//!
//! The ACM share and the grant rows describe the same readers, so every
//! change to one rebuilds the other before the object is written back.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use odrive_auth::acm::is_everyone;
use odrive_auth::permissions::{grant_keys, rebuild_acm_string};
use odrive_core::flatten;
use odrive_core::types::{Object, Permission, PermissionFlags};
use odrive_core::OdriveError;
use odrive_crypto::ContentKey;

use crate::caller::{Caller, CallerContext, NEED_SHARE};
use crate::error::ApiError;
use crate::protocol::{parse_object_id, GrantRequest, ObjectResponse};
use crate::server::{object_reply, Action, AppServer};

type Outcome = Result<(Object, CallerContext), ApiError>;

pub async fn add_share(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<GrantRequest>, JsonRejection>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = add_share_inner(&app, &caller, &id, body).await;
    app.conclude(Action::Share, &caller, Some(&id), result)
        .map(object_reply)
}

async fn add_share_inner(
    app: &AppServer,
    caller: &Caller,
    id: &str,
    body: Result<Json<GrantRequest>, JsonRejection>,
) -> Outcome {
    let Json(grant) = body?;
    let id = parse_object_id(id)?;
    let ctx = app.context(caller).await?;
    let mut obj = app.load_mutable(id).await?;
    ctx.require(&obj, NEED_SHARE, "share")?;

    let requested = grant.to_permission(&ctx.dn)?;
    if !ctx.flags_on(&obj).covers(requested.flags) {
        return Err(ApiError::not_authorized(
            "caller cannot grant permissions they do not hold",
        ));
    }
    app.authorize(&ctx, &obj).await?;

    let key = if requested.flags.read {
        Some(ctx.content_key(&app.master, &obj)?)
    } else {
        ctx.content_key(&app.master, &obj).ok()
    };

    // A named reader narrows a public object to its share.
    if requested.flags.read && !is_everyone(&requested.grantee) {
        for p in obj
            .permissions
            .iter_mut()
            .filter(|p| p.is_live_read() && is_everyone(&p.grantee))
        {
            p.is_deleted = true;
        }
    }
    obj.permissions.push(requested);
    commit_grants(app, &ctx, obj, key.as_ref()).await
}

pub async fn remove_share(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path((id, share_id)): Path<(String, String)>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = remove_share_inner(&app, &caller, &id, &share_id).await;
    app.conclude(Action::Unshare, &caller, Some(&id), result)
        .map(object_reply)
}

async fn remove_share_inner(app: &AppServer, caller: &Caller, id: &str, share_id: &str) -> Outcome {
    let id = parse_object_id(id)?;
    let share_id = Uuid::parse_str(share_id)
        .map_err(|e| ApiError::bad_request(format!("invalid share id: {e}")))?;
    let ctx = app.context(caller).await?;
    let mut obj = app.load_mutable(id).await?;
    ctx.require(&obj, NEED_SHARE, "share")?;
    app.authorize(&ctx, &obj).await?;

    let owner = flatten(&obj.owned_by);
    let target = obj
        .permissions
        .iter_mut()
        .find(|p| !p.is_deleted && p.id == Some(share_id))
        .ok_or_else(|| OdriveError::NotFound(format!("share {share_id} not found on object {id}")))?;
    if is_owner_grant(target, &owner) {
        return Err(ApiError::bad_request("the owner's grant cannot be removed"));
    }
    target.is_deleted = true;

    let key = ctx.content_key(&app.master, &obj).ok();
    commit_grants(app, &ctx, obj, key.as_ref()).await
}

fn is_owner_grant(p: &Permission, owner_flat: &str) -> bool {
    flatten(&p.grantee) == owner_flat && p.flags == PermissionFlags::all()
}

/// Rebuild the ACM from the edited grants, normalize, wrap keys for new
/// readers and write the object back under its current token.
async fn commit_grants(
    app: &AppServer,
    ctx: &CallerContext,
    mut obj: Object,
    key: Option<&ContentKey>,
) -> Outcome {
    let expected = obj.change_token.clone();
    let permissions = std::mem::take(&mut obj.permissions);
    let rebuilt = rebuild_acm_string(&permissions, &obj.raw_acm)?;
    let (mut permissions, flattened) = app
        .acm
        .normalize_permissions_from_acm(&obj.owned_by, permissions, &rebuilt, false)
        .await?;
    app.acm.is_user_authorized_for_acm(&ctx.dn, &flattened).await?;
    if let Some(key) = key {
        grant_keys(&mut permissions, &app.master, key);
    }
    obj.permissions = permissions;
    obj.raw_acm = flattened;
    obj.modified_by = ctx.dn.clone();
    let updated = app.dao.update_object(obj, &expected).await?;
    Ok((updated, ctx.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_grant_detection() {
        let owner = flatten("cn=alice,o=org");
        let full = Permission::new("CN=Alice, O=Org", "", PermissionFlags::all());
        let partial = Permission::new("cn=alice,o=org", "", PermissionFlags::read_only());
        let other = Permission::new("cn=bob,o=org", "", PermissionFlags::all());
        assert!(is_owner_grant(&full, &owner));
        assert!(!is_owner_grant(&partial, &owner));
        assert!(!is_owner_grant(&other, &owner));
    }
}
