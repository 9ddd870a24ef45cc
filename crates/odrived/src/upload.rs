//! Object creation and stream replacement.
//!
//! A multipart upload carries `ObjectMetadata` first and the file second.
//! The file is encrypted into `<connector>.uploading` while it arrives, moved
//! to `.uploaded` once complete, and only then is the metadata committed and
//! the connector handed to the drain queue. If the commit fails the staged
//! ciphertext is thrown away.

use std::io;
use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::Json;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use tokio_util::io::StreamReader;
use tracing::{debug, error, warn};

use odrive_auth::acm::{acm_to_string, normalize_acm_value, parse_acm};
use odrive_auth::permissions::{grant_keys, inject_permissions_into_acm};
use odrive_cache::{CiphertextCache, FileState};
use odrive_core::types::Object;
use odrive_crypto::{
    encrypt, generate_connector, generate_content_key, generate_iv, ContentKey, CryptoError,
    StreamSummary,
};

use crate::caller::{Caller, CallerContext, NEED_CREATE, NEED_UPDATE};
use crate::contenttype::guess_content_type;
use crate::error::ApiError;
use crate::lifecycle::{apply_properties, check_name, check_token};
use crate::protocol::{
    parse_object_id, CreateObjectRequest, ObjectResponse, UpdateObjectRequest, METADATA_PART,
};
use crate::server::{object_reply, Action, AppServer};

type Outcome = Result<(Object, CallerContext), ApiError>;

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("multipart/form-data"))
}

/// Read the leading `ObjectMetadata` part, refusing anything over `limit` bytes.
pub async fn read_metadata<T: DeserializeOwned>(
    multipart: &mut Multipart,
    limit: usize,
) -> Result<T, ApiError> {
    let mut field = multipart.next_field().await?.ok_or_else(|| {
        ApiError::bad_request(format!("{METADATA_PART} must be the first multipart part"))
    })?;
    if field.name() != Some(METADATA_PART) {
        return Err(ApiError::bad_request(format!(
            "{METADATA_PART} must be the first multipart part"
        )));
    }
    let mut buf = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        if buf.len() + chunk.len() > limit {
            return Err(ApiError::bad_request(format!(
                "{METADATA_PART} exceeds {limit} bytes"
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    serde_json::from_slice(&buf)
        .map_err(|e| ApiError::bad_request(format!("{METADATA_PART} is not valid JSON: {e}")))
}

pub async fn next_file_field(multipart: &mut Multipart) -> Result<Field<'_>, ApiError> {
    match multipart.next_field().await? {
        Some(field) if field.file_name().is_some() => Ok(field),
        _ => Err(ApiError::bad_request(
            "file must be supplied as multipart mime part",
        )),
    }
}

fn staging_error(e: CryptoError) -> ApiError {
    if let CryptoError::Io(io) = &e {
        if let Some(m) = io
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<MultipartError>())
        {
            return ApiError::bad_request(format!("reading file part: {}", m.body_text()));
        }
    }
    e.into()
}

/// Encrypt the file part into `.uploading`, then promote it to `.uploaded`.
pub async fn stage_field(
    cache: &CiphertextCache,
    connector: &str,
    field: Field<'_>,
    key: &ContentKey,
    iv: &[u8],
) -> Result<StreamSummary, ApiError> {
    let mut file = cache.create(connector, FileState::Uploading).await?;
    let reader = StreamReader::new(Box::pin(field.map_err(io::Error::other)));
    let summary = match encrypt(reader, &mut file, key, iv).await {
        Ok(summary) => summary,
        Err(e) => {
            drop(file);
            if let Err(rm) = cache.remove(connector, FileState::Uploading).await {
                warn!(connector, error = %rm, "removing partial upload failed");
            }
            return Err(staging_error(e));
        }
    };
    file.sync_all().await?;
    drop(file);
    cache
        .rename(connector, FileState::Uploading, FileState::Uploaded)
        .await?;
    debug!(connector, bytes = summary.length, "upload staged");
    Ok(summary)
}

/// Drop a staged upload whose metadata never committed.
pub async fn discard_staged(cache: &CiphertextCache, connector: &str) {
    let Err(e) = cache.remove(connector, FileState::Uploaded).await else {
        return;
    };
    warn!(connector, error = %e, "removing staged upload failed; marking orphaned");
    if let Err(e) = cache
        .rename(connector, FileState::Uploaded, FileState::Orphaned)
        .await
    {
        error!(connector, error = %e, "orphaning staged upload failed");
    }
}

/// Build the object a create describes: parent, ACM and grants settled.
async fn prepare_create(
    app: &AppServer,
    ctx: &CallerContext,
    meta: CreateObjectRequest,
) -> Result<Object, ApiError> {
    let mut obj = Object::new(&ctx.dn);
    obj.name = meta.name.trim().to_string();
    check_name(&obj.name)?;
    obj.description = meta.description;
    if !meta.type_name.is_empty() {
        obj.type_name = meta.type_name;
    }
    obj.content_type = meta.content_type;

    if let Some(raw) = meta.parent_id.as_deref().filter(|s| !s.is_empty()) {
        let parent = app.load_readable(parse_object_id(raw)?).await?;
        ctx.require(&parent, NEED_CREATE, "create objects under")?;
        obj.parent_id = Some(parent.id);
    }

    let acm = meta
        .acm
        .as_ref()
        .filter(|v| !v.is_null())
        .ok_or_else(|| ApiError::bad_request("An ACM must be specified"))?;
    let mut acm = parse_acm(&normalize_acm_value(acm)?)?;
    let requested = meta
        .permissions
        .iter()
        .map(|g| g.to_permission(&ctx.dn))
        .collect::<Result<Vec<_>, _>>()?;
    inject_permissions_into_acm(&requested, &mut acm)?;

    let (permissions, flattened) = app
        .acm
        .normalize_permissions_from_acm(&ctx.dn, requested, &acm_to_string(&acm), true)
        .await?;
    app.acm.is_user_authorized_for_acm(&ctx.dn, &flattened).await?;
    obj.permissions = permissions;
    obj.raw_acm = flattened;
    Ok(obj)
}

pub async fn create_object(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    req: Request,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = create_inner(&app, &caller, req).await;
    app.conclude(Action::Create, &caller, None, result)
        .map(object_reply)
}

async fn create_inner(app: &AppServer, caller: &Caller, req: Request) -> Outcome {
    let ctx = app.context(caller).await?;
    let key = generate_content_key();

    if !is_multipart(req.headers()) {
        let Json(meta) = Json::<CreateObjectRequest>::from_request(req, &()).await?;
        let mut obj = prepare_create(app, &ctx, meta).await?;
        if obj.name.is_empty() {
            return Err(ApiError::bad_request("name is required"));
        }
        obj.encrypt_iv = generate_iv().to_vec();
        grant_keys(&mut obj.permissions, &app.master, &key);
        let created = app.dao.create_object(obj).await?;
        return Ok((created, ctx));
    }

    let mut multipart = Multipart::from_request(req, &()).await?;
    let meta: CreateObjectRequest =
        read_metadata(&mut multipart, app.config.server.metadata_part_limit).await?;
    let mut obj = prepare_create(app, &ctx, meta).await?;

    let field = next_file_field(&mut multipart).await?;
    if obj.name.is_empty() {
        obj.name = field.file_name().unwrap_or_default().trim().to_string();
        check_name(&obj.name)?;
    }
    if obj.content_type.is_empty() {
        obj.content_type = guess_content_type(&obj.name);
    }

    let iv = generate_iv();
    let connector = generate_connector();
    let summary = stage_field(app.cache(), &connector, field, &key, &iv).await?;
    obj.content_connector = connector.clone();
    obj.encrypt_iv = iv.to_vec();
    obj.content_size = i64::try_from(summary.length).unwrap_or(i64::MAX);
    obj.content_hash = summary.hash.to_vec();
    grant_keys(&mut obj.permissions, &app.master, &key);

    match app.dao.create_object(obj).await {
        Ok(created) => {
            app.drain.enqueue(&connector);
            app.metrics.upload_bytes.inc_by(summary.length);
            Ok((created, ctx))
        }
        Err(e) => {
            discard_staged(app.cache(), &connector).await;
            Err(e.into())
        }
    }
}

pub async fn update_stream(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(id): Path<String>,
    req: Request,
) -> Result<Json<ObjectResponse>, ApiError> {
    let result = update_stream_inner(&app, &caller, &id, req).await;
    app.conclude(Action::Update, &caller, Some(&id), result)
        .map(object_reply)
}

async fn update_stream_inner(app: &AppServer, caller: &Caller, id: &str, req: Request) -> Outcome {
    let id = parse_object_id(id)?;
    let ctx = app.context(caller).await?;
    let mut multipart = Multipart::from_request(req, &()).await?;
    let meta: UpdateObjectRequest =
        read_metadata(&mut multipart, app.config.server.metadata_part_limit).await?;

    let mut obj = app.load_mutable(id).await?;
    check_token(&obj, &meta.change_token)?;
    ctx.require(&obj, NEED_UPDATE, "update")?;
    app.authorize(&ctx, &obj).await?;
    // The content key survives a new stream; only the IV and connector change.
    let key = ctx.content_key(&app.master, &obj)?;
    let expected = obj.change_token.clone();
    apply_properties(app, &ctx, &mut obj, &meta).await?;

    let field = next_file_field(&mut multipart).await?;
    let iv = generate_iv();
    let connector = generate_connector();
    let summary = stage_field(app.cache(), &connector, field, &key, &iv).await?;
    obj.content_connector = connector.clone();
    obj.encrypt_iv = iv.to_vec();
    obj.content_size = i64::try_from(summary.length).unwrap_or(i64::MAX);
    obj.content_hash = summary.hash.to_vec();
    obj.modified_by = ctx.dn.clone();

    match app.dao.update_object(obj, &expected).await {
        Ok(updated) => {
            app.drain.enqueue(&connector);
            app.metrics.upload_bytes.inc_by(summary.length);
            Ok((updated, ctx))
        }
        Err(e) => {
            discard_staged(app.cache(), &connector).await;
            Err(e.into())
        }
    }
}
