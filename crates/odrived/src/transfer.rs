//! Moving objects between folders and handing them to a new owner.
//!
//! Both are owner-only. A move needs create rights on the target folder;
//! a transfer re-derives the grants around the new owner and lands the
//! object at the root, since the new owner may not see its old folder.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use tracing::debug;

use odrive_auth::acm::is_everyone;
use odrive_auth::permissions::{grant_keys, permission_for_user};
use odrive_core::flatten;
use odrive_core::types::{Object, ObjectId, PermissionFlags};

use crate::caller::{Caller, CallerContext, NEED_CREATE, NEED_UPDATE};
use crate::error::ApiError;
use crate::lifecycle::check_token;
use crate::protocol::{parse_object_id, ChangeTokenRequest, ObjectResponse};
use crate::server::{object_reply, Action, AppServer};

type Outcome = Result<(Object, CallerContext), ApiError>;

/// Load a live object the caller owns and may update, with a current token.
async fn owned_for_update(
    app: &AppServer,
    caller: &Caller,
    id: &str,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
    action: &str,
) -> Result<(Object, CallerContext), ApiError> {
    let Json(req) = body?;
    let id = parse_object_id(id)?;
    let ctx = app.context(caller).await?;
    let obj = app.load_mutable(id).await?;
    check_token(&obj, &req.change_token)?;
    ctx.require(&obj, NEED_UPDATE, action)?;
    if !ctx.is_owner(&obj) {
        return Err(ApiError::not_authorized(format!(
            "only the owner may {action} object {}",
            obj.id
        )));
    }
    app.authorize(&ctx, &obj).await?;
    Ok((obj, ctx))
}

pub async fn move_object(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path((id, folder)): Path<(String, String)>,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = match parse_object_id(&folder) {
        Ok(folder) => move_inner(&app, &caller, &id, Some(folder), body).await,
        Err(e) => Err(e),
    };
    app.conclude(Action::Move, &caller, Some(&id), result)
        .map(object_reply)
}

pub async fn move_to_root(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = move_inner(&app, &caller, &id, None, body).await;
    app.conclude(Action::Move, &caller, Some(&id), result)
        .map(object_reply)
}

async fn move_inner(
    app: &AppServer,
    caller: &Caller,
    id: &str,
    folder: Option<ObjectId>,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Outcome {
    let (obj, ctx) = owned_for_update(app, caller, id, body, "move").await?;
    if obj.parent_id == folder {
        return Ok((obj, ctx));
    }
    if let Some(folder) = folder {
        if folder == obj.id {
            return Err(ApiError::bad_request("an object cannot be moved into itself"));
        }
        let target = app.load_mutable(folder).await?;
        ctx.require(&target, NEED_CREATE, "move objects into")?;
    }
    let expected = obj.change_token.clone();
    let moved = app
        .dao
        .move_object(obj.id, folder, &ctx.dn, &expected)
        .await?;
    Ok((moved, ctx))
}

pub async fn change_owner(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path((id, new_owner)): Path<(String, String)>,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = change_owner_inner(&app, &caller, &id, &new_owner, body).await;
    app.conclude(Action::ChangeOwner, &caller, Some(&id), result)
        .map(object_reply)
}

async fn change_owner_inner(
    app: &AppServer,
    caller: &Caller,
    id: &str,
    new_owner: &str,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Outcome {
    let new_owner = new_owner.trim();
    if new_owner.is_empty() {
        return Err(ApiError::bad_request("a new owner is required"));
    }
    if is_everyone(new_owner) {
        return Err(ApiError::bad_request(
            "ownership cannot be transferred to everyone",
        ));
    }
    let (mut obj, ctx) = owned_for_update(app, caller, id, body, "transfer").await?;
    if flatten(new_owner) == flatten(&obj.owned_by) {
        return Ok((obj, ctx));
    }

    let key = ctx.content_key(&app.master, &obj)?;
    let mut grant = permission_for_user(new_owner, PermissionFlags::all());
    grant.created_by = ctx.dn.clone();
    let mut current = std::mem::take(&mut obj.permissions);
    current.push(grant);
    let (mut permissions, flattened) = app
        .acm
        .normalize_permissions_from_acm(new_owner, current, &obj.raw_acm, false)
        .await?;
    app.acm.is_user_authorized_for_acm(&ctx.dn, &flattened).await?;
    grant_keys(&mut permissions, &app.master, &key);

    let expected = obj.change_token.clone();
    obj.permissions = permissions;
    obj.raw_acm = flattened;
    obj.parent_id = None;
    obj.owned_by = new_owner.to_string();
    obj.modified_by = ctx.dn.clone();
    let transferred = app.dao.change_owner(obj, &expected).await?;
    debug!(object = %transferred.id, owner = %transferred.owned_by, "ownership transferred");
    Ok((transferred, ctx))
}
