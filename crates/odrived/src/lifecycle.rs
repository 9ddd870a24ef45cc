//! Properties, trash, untrash, expunge and emptying the trash.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;

use odrive_auth::acm::normalize_acm_value;
use odrive_auth::permissions::grant_keys;
use odrive_core::types::Object;

use crate::caller::{Caller, CallerContext, NEED_DELETE, NEED_READ, NEED_UPDATE};
use crate::error::ApiError;
use crate::protocol::{
    parse_object_id, ChangeTokenRequest, ExpungedStats, ObjectResponse, UpdateObjectRequest,
    MAX_NAME_BYTES,
};
use crate::server::{object_reply, Action, AppServer};

type Outcome = Result<(Object, CallerContext), ApiError>;

pub fn check_name(name: &str) -> Result<(), ApiError> {
    if name.len() > MAX_NAME_BYTES {
        return Err(ApiError::bad_request(format!(
            "name exceeds {MAX_NAME_BYTES} bytes"
        )));
    }
    Ok(())
}

/// The token a client sent must name the current revision.
pub fn check_token(obj: &Object, token: &str) -> Result<(), ApiError> {
    if token.is_empty() {
        return Err(ApiError::bad_request("changeToken is required"));
    }
    if token != obj.change_token {
        return Err(ApiError::conflict(format!(
            "changeToken does not match the current revision of object {}",
            obj.id
        )));
    }
    Ok(())
}

/// Fold the fields present in `meta` into `obj`.
///
/// A new ACM re-derives the grants from its share, is checked against the
/// caller's clearance, and gets the content key wrapped for any new reader.
pub async fn apply_properties(
    app: &AppServer,
    ctx: &CallerContext,
    obj: &mut Object,
    meta: &UpdateObjectRequest,
) -> Result<(), ApiError> {
    if let Some(raw) = meta.id.as_deref().filter(|s| !s.is_empty()) {
        if parse_object_id(raw)? != obj.id {
            return Err(ApiError::bad_request("id in body does not match the object"));
        }
    }
    if let Some(raw) = meta.parent_id.as_deref().filter(|s| !s.is_empty()) {
        if Some(parse_object_id(raw)?) != obj.parent_id {
            return Err(ApiError::bad_request("parentId cannot be changed by an update"));
        }
    }
    if let Some(name) = &meta.name {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::bad_request("name cannot be empty"));
        }
        check_name(name)?;
        obj.name = name.to_string();
    }
    if let Some(description) = &meta.description {
        obj.description = description.clone();
    }
    if let Some(type_name) = meta.type_name.as_deref().filter(|s| !s.is_empty()) {
        obj.type_name = type_name.to_string();
    }
    if let Some(content_type) = meta.content_type.as_deref().filter(|s| !s.is_empty()) {
        obj.content_type = content_type.to_string();
    }

    if let Some(acm) = &meta.acm {
        let raw = normalize_acm_value(acm)?;
        let key = ctx.content_key(&app.master, obj)?;
        let current = std::mem::take(&mut obj.permissions);
        let (mut permissions, flattened) = app
            .acm
            .normalize_permissions_from_acm(&obj.owned_by, current, &raw, false)
            .await?;
        app.acm.is_user_authorized_for_acm(&ctx.dn, &flattened).await?;
        grant_keys(&mut permissions, &app.master, &key);
        obj.permissions = permissions;
        obj.raw_acm = flattened;
    }
    Ok(())
}

pub async fn get_properties(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = get_properties_inner(&app, &caller, &id).await;
    app.conclude(Action::Read, &caller, Some(&id), result)
        .map(object_reply)
}

async fn get_properties_inner(app: &AppServer, caller: &Caller, id: &str) -> Outcome {
    let id = parse_object_id(id)?;
    let ctx = app.context(caller).await?;
    let obj = app.load_readable(id).await?;
    ctx.require(&obj, NEED_READ, "read")?;
    app.authorize(&ctx, &obj).await?;
    Ok((obj, ctx))
}

pub async fn update_properties(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<UpdateObjectRequest>, JsonRejection>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = update_properties_inner(&app, &caller, &id, body).await;
    app.conclude(Action::Update, &caller, Some(&id), result)
        .map(object_reply)
}

async fn update_properties_inner(
    app: &AppServer,
    caller: &Caller,
    id: &str,
    body: Result<Json<UpdateObjectRequest>, JsonRejection>,
) -> Outcome {
    let Json(meta) = body?;
    let id = parse_object_id(id)?;
    let ctx = app.context(caller).await?;
    let mut obj = app.load_mutable(id).await?;
    check_token(&obj, &meta.change_token)?;
    ctx.require(&obj, NEED_UPDATE, "update")?;
    app.authorize(&ctx, &obj).await?;

    let expected = obj.change_token.clone();
    apply_properties(app, &ctx, &mut obj, &meta).await?;
    obj.modified_by = ctx.dn.clone();
    let updated = app.dao.update_object(obj, &expected).await?;
    Ok((updated, ctx))
}

/// Load, check the token, and check delete rights plus clearance.
async fn deletable(
    app: &AppServer,
    caller: &Caller,
    id: &str,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
    precondition: impl FnOnce(&Object) -> Result<(), ApiError>,
) -> Result<(Object, CallerContext, String), ApiError> {
    let Json(req) = body?;
    let id = parse_object_id(id)?;
    let ctx = app.context(caller).await?;
    let obj = app.load_object(id).await?;
    precondition(&obj)?;
    check_token(&obj, &req.change_token)?;
    ctx.require(&obj, NEED_DELETE, "delete")?;
    app.authorize(&ctx, &obj).await?;
    Ok((obj, ctx, req.change_token))
}

pub async fn trash(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = trash_inner(&app, &caller, &id, body).await;
    app.conclude(Action::Delete, &caller, Some(&id), result)
        .map(object_reply)
}

async fn trash_inner(
    app: &AppServer,
    caller: &Caller,
    id: &str,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Outcome {
    let (obj, ctx, token) = deletable(app, caller, id, body, |obj| {
        if obj.state.deleted || obj.state.ancestor_deleted {
            return Err(ApiError::conflict(format!("object {} is already in the trash", obj.id)));
        }
        Ok(())
    })
    .await?;
    let trashed = app.dao.trash_object(obj.id, &ctx.dn, &token).await?;
    Ok((trashed, ctx))
}

pub async fn untrash(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = untrash_inner(&app, &caller, &id, body).await;
    app.conclude(Action::Undelete, &caller, Some(&id), result)
        .map(object_reply)
}

async fn untrash_inner(
    app: &AppServer,
    caller: &Caller,
    id: &str,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Outcome {
    let (obj, ctx, token) = deletable(app, caller, id, body, |obj| {
        if !obj.state.deleted {
            return Err(ApiError::conflict(format!("object {} is not in the trash", obj.id)));
        }
        if obj.state.ancestor_deleted {
            return Err(ApiError::conflict(format!(
                "object {} is beneath a trashed folder; restore that first",
                obj.id
            )));
        }
        Ok(())
    })
    .await?;
    let restored = app.dao.untrash_object(obj.id, &ctx.dn, &token).await?;
    Ok((restored, ctx))
}

pub async fn expunge(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = expunge_inner(&app, &caller, &id, body).await;
    app.conclude(Action::Expunge, &caller, Some(&id), result)
        .map(object_reply)
}

async fn expunge_inner(
    app: &AppServer,
    caller: &Caller,
    id: &str,
    body: Result<Json<ChangeTokenRequest>, JsonRejection>,
) -> Outcome {
    let (obj, ctx, token) = deletable(app, caller, id, body, |_| Ok(())).await?;
    let expunged = app.dao.expunge_object(obj.id, &ctx.dn, &token).await?;
    Ok((expunged, ctx))
}

/// Expunge everything the caller trashed. Each object gets its own
/// expunge record; a failure is recorded once against no object.
pub async fn empty_trash(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
) -> Result<Json<ExpungedStats>, ApiError> {
    let result = empty_trash_inner(&app, &caller).await;
    let expunged = match result {
        Ok(objects) => objects,
        Err(e) => {
            return app
                .conclude::<ExpungedStats>(Action::Expunge, &caller, None, Err(e))
                .map(Json);
        }
    };
    let stats = ExpungedStats {
        expunged_count: expunged.len(),
    };
    for obj in expunged {
        let _ = app.conclude(Action::Expunge, &caller, None, Ok(obj));
    }
    Ok(Json(stats))
}

async fn empty_trash_inner(app: &AppServer, caller: &Caller) -> Result<Vec<Object>, ApiError> {
    let ctx = app.context(caller).await?;
    Ok(app.dao.expunge_deleted(&ctx.dn, &ctx.dn).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use odrive_core::ErrorKind;

    #[test]
    fn test_check_token() {
        let obj = Object::new("cn=alice");
        assert_eq!(
            check_token(&obj, "").unwrap_err().kind(),
            ErrorKind::BadRequest
        );
        assert_eq!(
            check_token(&obj, "stale").unwrap_err().kind(),
            ErrorKind::Conflict
        );
        assert!(check_token(&obj, &obj.change_token).is_ok());
    }

    #[test]
    fn test_check_name_limit() {
        assert!(check_name(&"a".repeat(MAX_NAME_BYTES)).is_ok());
        assert_eq!(
            check_name(&"a".repeat(MAX_NAME_BYTES + 1)).unwrap_err().kind(),
            ErrorKind::BadRequest
        );
    }
}
