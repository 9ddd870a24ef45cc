//! Decrypting stream downloads and the raw ciphertext route used by peers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio_util::io::ReaderStream;
use tracing::warn;

use odrive_cache::CacheError;
use odrive_core::types::Object;
use odrive_core::OdriveError;
use odrive_crypto::{CipherReader, Direction};

use crate::caller::{Caller, NEED_READ};
use crate::error::ApiError;
use crate::protocol::{parse_object_id, ObjectResponse};
use crate::server::{Action, AppServer};

/// Response header carrying the object's properties as JSON.
pub const OBJECT_DATA_HEADER: HeaderName = HeaderName::from_static("object-data");

const FILENAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

pub fn content_disposition(name: &str) -> String {
    format!("inline; filename={}", utf8_percent_encode(name, FILENAME))
}

fn internal(msg: impl std::fmt::Display) -> ApiError {
    ApiError(OdriveError::Internal(msg.to_string()))
}

pub async fn get_stream(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let result = get_stream_inner(&app, &caller, &id).await;
    app.conclude(Action::Access, &caller, Some(&id), result)
        .map(|(_, response)| response)
}

async fn get_stream_inner(
    app: &AppServer,
    caller: &Caller,
    id: &str,
) -> Result<(Object, Response), ApiError> {
    let id = parse_object_id(id)?;
    let ctx = app.context(caller).await?;
    let obj = app.load_readable(id).await?;
    ctx.require(&obj, NEED_READ, "read")?;
    let key = ctx.content_key(&app.master, &obj)?;
    app.authorize(&ctx, &obj).await?;

    if obj.content_size <= 0 || obj.content_connector.is_empty() {
        return Ok((obj, StatusCode::NO_CONTENT.into_response()));
    }

    let (file, _, _) = app.drain.open_local(&obj.content_connector).await?;
    let reader = CipherReader::new(file, &key, &obj.encrypt_iv, Direction::Decrypt)?;
    let object_id = obj.id;
    let stream = ReaderStream::new(reader)
        .inspect_err(move |e| warn!(object = %object_id, error = %e, "download stream failed"));

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&obj.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(obj.content_size));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&obj.name)).map_err(internal)?,
    );
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("none"));
    let properties = serde_json::to_vec(&ObjectResponse::new(&obj, ctx.flags_on(&obj)))
        .map_err(internal)?;
    headers.insert(
        OBJECT_DATA_HEADER,
        HeaderValue::from_bytes(&properties).map_err(internal)?,
    );

    app.metrics
        .download_bytes
        .inc_by(u64::try_from(obj.content_size).unwrap_or(0));
    let response = (StatusCode::OK, headers, Body::from_stream(stream)).into_response();
    Ok((obj, response))
}

/// Raw ciphertext for a peer filling its own cache. Trusted peers only.
pub async fn get_ciphertext(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(connector): Path<String>,
) -> Result<Response, ApiError> {
    if !caller.is_trusted_peer(&app.config.server.trusted_impersonators) {
        return Err(ApiError::not_authorized(
            "ciphertext is only served to trusted peers",
        ));
    }
    let found = app
        .cache()
        .open_readable(&connector)
        .await
        .map_err(|e| match e {
            CacheError::InvalidConnector(c) => {
                ApiError::bad_request(format!("invalid connector {c:?}"))
            }
            other => other.into(),
        })?;
    let Some((file, _, len)) = found else {
        return Err(OdriveError::NotFound(format!("no local ciphertext for {connector}")).into());
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    Ok((
        StatusCode::OK,
        headers,
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_encodes_name() {
        assert_eq!(content_disposition("a.txt"), "inline; filename=a.txt");
        assert_eq!(
            content_disposition("my report (v2).pdf"),
            "inline; filename=my%20report%20%28v2%29.pdf"
        );
        assert_eq!(content_disposition("x-y_z~"), "inline; filename=x-y_z~");
    }
}
