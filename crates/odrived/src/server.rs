//! Shared application state and the object API router.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use prometheus_client::registry::Registry;
use serde::Serialize;

use odrive_auth::AcmEngine;
use odrive_cache::{CiphertextCache, DrainController, Inventory};
use odrive_core::config::OdriveConfig;
use odrive_core::types::{Object, ObjectId};
use odrive_core::OdriveError;
use odrive_crypto::MasterKey;
use odrive_dao::MetadataStore;
use odrive_events::{AuditRecord, AuditSink, EventSink, ObjectEvent};

use crate::caller::{Caller, CallerContext};
use crate::error::ApiError;
use crate::metrics::ServerMetrics;
use crate::protocol::{ExpungedStats, ListResponse, ObjectResponse};
use crate::usercache::{SnippetCache, UserCache, SNIPPET_TTL, USER_TTL};
use crate::{download, lifecycle, list, share, transfer, upload};

/// Every action a request can perform, as named in events, audit and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    /// Stream download.
    Access,
    /// Properties read.
    Read,
    Update,
    Delete,
    Undelete,
    Expunge,
    Share,
    Unshare,
    List,
    Move,
    ChangeOwner,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Access => "access",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Undelete => "undelete",
            Action::Expunge => "expunge",
            Action::Share => "share",
            Action::Unshare => "unshare",
            Action::List => "list",
            Action::Move => "move",
            Action::ChangeOwner => "changeowner",
        }
    }

    pub fn audit_type(self) -> &'static str {
        match self {
            Action::Create => "EventCreate",
            Action::Access | Action::Read | Action::List => "EventAccess",
            Action::Update
            | Action::Share
            | Action::Unshare
            | Action::Undelete
            | Action::Move
            | Action::ChangeOwner => "EventModify",
            Action::Delete | Action::Expunge => "EventDelete",
        }
    }

    pub fn audit_action(self) -> String {
        self.name().to_uppercase()
    }
}

/// The object an outcome is about, when there is one.
pub trait Subject {
    fn subject(&self) -> Option<&Object>;
}

impl Subject for Object {
    fn subject(&self) -> Option<&Object> {
        Some(self)
    }
}

impl<T> Subject for (Object, T) {
    fn subject(&self) -> Option<&Object> {
        Some(&self.0)
    }
}

impl Subject for ListResponse {
    fn subject(&self) -> Option<&Object> {
        None
    }
}

impl Subject for ExpungedStats {
    fn subject(&self) -> Option<&Object> {
        None
    }
}

/// Long-lived collaborators handed to [`AppServer::new`].
pub struct Services {
    pub master: Arc<MasterKey>,
    pub dao: Arc<dyn MetadataStore>,
    pub acm: AcmEngine,
    pub drain: Arc<DrainController>,
    pub audit: Arc<AuditSink>,
    pub events: Arc<EventSink>,
}

pub struct AppServer {
    pub config: Arc<OdriveConfig>,
    pub master: Arc<MasterKey>,
    pub dao: Arc<dyn MetadataStore>,
    pub acm: AcmEngine,
    pub drain: Arc<DrainController>,
    pub users: UserCache,
    pub snippets: SnippetCache,
    pub audit: Arc<AuditSink>,
    pub events: Arc<EventSink>,
    pub metrics: Arc<ServerMetrics>,
}

impl AppServer {
    pub fn new(config: Arc<OdriveConfig>, services: Services, registry: &mut Registry) -> Self {
        Self {
            users: UserCache::new(services.dao.clone(), USER_TTL),
            snippets: SnippetCache::new(services.acm.clone(), SNIPPET_TTL),
            metrics: Arc::new(ServerMetrics::new(registry)),
            config,
            master: services.master,
            dao: services.dao,
            acm: services.acm,
            drain: services.drain,
            audit: services.audit,
            events: services.events,
        }
    }

    pub fn cache(&self) -> &CiphertextCache {
        self.drain.cache()
    }

    /// Resolve the caller's user row and policy snippets.
    pub async fn context(&self, caller: &Caller) -> Result<CallerContext, ApiError> {
        self.users.get_or_create(&caller.dn).await?;
        let snippet = self.snippets.get(&caller.dn).await?;
        Ok(CallerContext::new(&caller.dn, snippet))
    }

    /// Fail unless the caller's clearance satisfies the object's ACM.
    pub async fn authorize(&self, ctx: &CallerContext, obj: &Object) -> Result<(), ApiError> {
        self.acm
            .is_user_authorized_for_acm(&ctx.dn, &obj.raw_acm)
            .await?;
        Ok(())
    }

    /// Any object that has not been expunged.
    pub async fn load_object(&self, id: ObjectId) -> Result<Object, ApiError> {
        let obj = self.dao.get_object(id).await?;
        if obj.state.expunged {
            return Err(OdriveError::Gone(format!("object {id} has been expunged")).into());
        }
        Ok(obj)
    }

    /// An object that is neither trashed nor under a trashed ancestor.
    pub async fn load_readable(&self, id: ObjectId) -> Result<Object, ApiError> {
        let obj = self.load_object(id).await?;
        if obj.is_deleted() {
            return Err(OdriveError::NotFound(format!("object {id} is in the trash")).into());
        }
        Ok(obj)
    }

    /// Like [`load_readable`](Self::load_readable), but a trashed object is a conflict.
    pub async fn load_mutable(&self, id: ObjectId) -> Result<Object, ApiError> {
        let obj = self.load_object(id).await?;
        if obj.is_deleted() {
            return Err(ApiError::conflict(format!(
                "object {id} is in the trash and cannot be changed"
            )));
        }
        Ok(obj)
    }

    /// Record the outcome of `action` in metrics, audit and events, then
    /// hand the result back unchanged.
    pub fn conclude<T: Subject>(
        &self,
        action: Action,
        caller: &Caller,
        target: Option<&str>,
        result: Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let (subject, err) = match &result {
            Ok(v) => (v.subject(), None),
            Err(e) => (None, Some(e)),
        };
        let ok = err.is_none();
        self.metrics.request(
            action.name(),
            err.map_or("success", |e| e.kind().as_str()),
        );

        let mut record = AuditRecord::new(action.audit_type(), &action.audit_action(), ok, &caller.dn)
            .with_info("USER_DN", &caller.dn)
            .with_info("SSL_CLIENT_S_DN", &caller.peer_dn);
        if let Some(ext) = &caller.external_sys_dn {
            record = record.with_info("EXTERNAL_SYS_DN", ext);
        }
        let mut event = ObjectEvent::new(action.name(), &caller.dn, ok);
        match subject {
            Some(obj) => {
                let id = obj.id.to_string();
                record = record.with_object(&id, &obj.name, &obj.raw_acm);
                event = event.with_object(&id, &obj.name, &obj.change_token, obj.content_size);
            }
            None => {
                if let Some(target) = target {
                    record = record.with_info("OBJECT_ID", target);
                }
            }
        }
        if let Some(e) = err {
            record = record.with_info("ERROR", e.to_string());
            event = event.with_error(e.public_message());
        }
        self.audit.record(record);
        self.events.emit(event);
        result
    }
}

/// The JSON body for a single-object reply.
pub fn object_reply((obj, ctx): (Object, CallerContext)) -> Json<ObjectResponse> {
    let flags = ctx.flags_on(&obj);
    Json(ObjectResponse::new(&obj, flags))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub cache: Inventory,
    pub drain_pending: usize,
    pub audit_pending: usize,
    pub audit_dropped: u64,
    pub events_dropped: u64,
}

async fn stats(
    State(app): State<Arc<AppServer>>,
    _caller: Caller,
) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        cache: app.cache().inventory().await?,
        drain_pending: app.drain.pending(),
        audit_pending: app.audit.pending(),
        audit_dropped: app.audit.dropped(),
        events_dropped: app.events.dropped(),
    }))
}

pub fn router(app: Arc<AppServer>) -> Router {
    let base = app.config.server.base_path.trim_matches('/').to_string();
    let api = Router::new()
        .route(
            "/objects",
            post(upload::create_object)
                .layer(DefaultBodyLimit::disable())
                .get(list::list_roots),
        )
        .route(
            "/objects/{id}",
            get(list::list_children).delete(lifecycle::expunge),
        )
        .route(
            "/objects/{id}/stream",
            post(upload::update_stream)
                .layer(DefaultBodyLimit::disable())
                .get(download::get_stream),
        )
        .route(
            "/objects/{id}/properties",
            get(lifecycle::get_properties)
                .post(lifecycle::update_properties)
                .put(lifecycle::update_properties),
        )
        .route("/objects/{id}/trash", post(lifecycle::trash))
        .route("/objects/{id}/untrash", post(lifecycle::untrash))
        .route("/objects/{id}/move", post(transfer::move_to_root))
        .route("/objects/{id}/move/{folder_id}", post(transfer::move_object))
        .route("/objects/{id}/owner/{new_owner}", post(transfer::change_owner))
        .route("/shared/{id}", post(share::add_share))
        .route("/shared/{id}/{share_id}", delete(share::remove_share))
        .route("/shares", get(list::list_shared_to_me))
        .route("/shared", get(list::list_shared_by_me))
        .route("/sharedpublic", get(list::list_shared_to_everyone))
        .route(
            "/trashed",
            get(list::list_trashed).delete(lifecycle::empty_trash),
        )
        .route("/stats", get(stats))
        .route("/ciphertext/{connector}", get(download::get_ciphertext))
        .with_state(app);

    if base.is_empty() {
        api
    } else {
        Router::new().nest(&format!("/{base}"), api)
    }
}
