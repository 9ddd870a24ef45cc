//! Paged listings. Every row must also pass the caller's snippet filter.

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::Json;

use odrive_auth::{parse_acm, snippet_allows};
use odrive_core::types::Object;
use odrive_dao::{ListQuery, ListScope, Paging};

use crate::caller::{Caller, NEED_READ};
use crate::error::ApiError;
use crate::protocol::{parse_object_id, ListResponse, PagingParams};
use crate::server::{Action, AppServer};

type PagingQuery = Result<Query<PagingParams>, QueryRejection>;

fn paging(query: PagingQuery) -> Result<Paging, ApiError> {
    let Query(params) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(params.into())
}

async fn list_scope(
    app: &AppServer,
    caller: &Caller,
    scope: ListScope,
    query: PagingQuery,
) -> Result<ListResponse, ApiError> {
    let paging = paging(query)?;
    let ctx = app.context(caller).await?;
    if let ListScope::Children(parent) = scope {
        let parent = app.load_readable(parent).await?;
        ctx.require(&parent, NEED_READ, "list")?;
        app.authorize(&ctx, &parent).await?;
    }

    let snippet = &ctx.snippet;
    let visible =
        move |obj: &Object| parse_acm(&obj.raw_acm).is_ok_and(|acm| snippet_allows(snippet, &acm));
    let set = app
        .dao
        .list_objects(ListQuery {
            scope,
            caller: &ctx.flat_dn,
            grantees: &ctx.grantees,
            filter: Some(&visible),
            paging,
        })
        .await?;
    Ok(ListResponse::new(&set, |o| ctx.flags_on(o)))
}

fn respond(
    app: &AppServer,
    caller: &Caller,
    target: Option<&str>,
    result: Result<ListResponse, ApiError>,
) -> Result<Json<ListResponse>, ApiError> {
    app.conclude(Action::List, caller, target, result).map(Json)
}

pub async fn list_roots(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    query: PagingQuery,
) -> Result<Json<ListResponse>, ApiError> {
    let result = list_scope(&app, &caller, ListScope::Root, query).await;
    respond(&app, &caller, None, result)
}

pub async fn list_children(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    Path(id): Path<String>,
    query: PagingQuery,
) -> Result<Json<ListResponse>, ApiError> {
    let result = match parse_object_id(&id) {
        Ok(parent) => list_scope(&app, &caller, ListScope::Children(parent), query).await,
        Err(e) => Err(e),
    };
    respond(&app, &caller, Some(&id), result)
}

pub async fn list_shared_to_me(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    query: PagingQuery,
) -> Result<Json<ListResponse>, ApiError> {
    let result = list_scope(&app, &caller, ListScope::SharedToMe, query).await;
    respond(&app, &caller, None, result)
}

pub async fn list_shared_by_me(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    query: PagingQuery,
) -> Result<Json<ListResponse>, ApiError> {
    let result = list_scope(&app, &caller, ListScope::SharedByMe, query).await;
    respond(&app, &caller, None, result)
}

pub async fn list_shared_to_everyone(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    query: PagingQuery,
) -> Result<Json<ListResponse>, ApiError> {
    let result = list_scope(&app, &caller, ListScope::SharedToEveryone, query).await;
    respond(&app, &caller, None, result)
}

pub async fn list_trashed(
    State(app): State<Arc<AppServer>>,
    caller: Caller,
    query: PagingQuery,
) -> Result<Json<ListResponse>, ApiError> {
    let result = list_scope(&app, &caller, ListScope::Trashed, query).await;
    respond(&app, &caller, None, result)
}
