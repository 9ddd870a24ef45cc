//! Process-wide caches of user rows and policy snippets, keyed by flattened DN.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use odrive_auth::{AcmEngine, AuthResult};
use odrive_core::flatten;
use odrive_core::types::{Snippet, User};
use odrive_dao::{DaoError, DaoResult, MetadataStore};

pub const USER_TTL: Duration = Duration::from_secs(300);
pub const SNIPPET_TTL: Duration = Duration::from_secs(60);

/// Delay before the single retry of a failed user insert.
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A map whose entries expire `ttl` after insertion.
pub struct TtlMap<V> {
    entries: Mutex<HashMap<String, (Instant, V)>>,
    ttl: Duration,
}

impl<V: Clone> TtlMap<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, v)| v.clone())
    }

    pub fn insert(&self, key: String, value: V) {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(key, (Instant::now(), value));
    }

    pub fn remove(&self, key: &str) {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(key);
    }

    /// Drop expired entries. Returns how many remain.
    pub fn evict_expired(&self) -> usize {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, (at, _)| at.elapsed() < self.ttl);
        map.len()
    }
}

/// The CN of a DN, or the whole DN when it has none.
pub fn display_name(dn: &str) -> String {
    dn.split(',')
        .map(str::trim)
        .find_map(|rdn| {
            let (k, v) = rdn.split_once('=')?;
            k.trim().eq_ignore_ascii_case("cn").then(|| v.trim().to_string())
        })
        .filter(|cn| !cn.is_empty())
        .unwrap_or_else(|| dn.to_string())
}

pub struct UserCache {
    dao: Arc<dyn MetadataStore>,
    users: TtlMap<User>,
}

impl UserCache {
    pub fn new(dao: Arc<dyn MetadataStore>, ttl: Duration) -> Self {
        Self {
            dao,
            users: TtlMap::new(ttl),
        }
    }

    /// The user row for `dn`, created on first sight.
    pub async fn get_or_create(&self, dn: &str) -> DaoResult<User> {
        let key = flatten(dn);
        if let Some(user) = self.users.get(&key) {
            return Ok(user);
        }
        let user = match self.dao.get_user(dn).await {
            Ok(user) => user,
            Err(DaoError::UserNotFound(_)) => self.create(dn).await?,
            Err(e) => return Err(e),
        };
        self.users.insert(key, user.clone());
        Ok(user)
    }

    async fn create(&self, dn: &str) -> DaoResult<User> {
        let user = User::new(dn, &display_name(dn));
        match self.dao.create_user(user.clone()).await {
            Ok(created) => {
                debug!(dn, "user created on first request");
                Ok(created)
            }
            Err(e) => {
                warn!(dn, error = %e, "creating user failed, retrying once");
                tokio::time::sleep(CREATE_RETRY_DELAY).await;
                self.dao.create_user(user).await
            }
        }
    }

    pub fn evict_expired(&self) -> usize {
        self.users.evict_expired()
    }
}

pub struct SnippetCache {
    acm: AcmEngine,
    snippets: TtlMap<Snippet>,
}

impl SnippetCache {
    pub fn new(acm: AcmEngine, ttl: Duration) -> Self {
        Self {
            acm,
            snippets: TtlMap::new(ttl),
        }
    }

    pub async fn get(&self, dn: &str) -> AuthResult<Snippet> {
        let key = flatten(dn);
        if let Some(snippet) = self.snippets.get(&key) {
            return Ok(snippet);
        }
        let snippet = self.acm.snippets_for_user(dn).await?;
        self.snippets.insert(key, snippet.clone());
        Ok(snippet)
    }

    pub fn invalidate(&self, dn: &str) {
        self.snippets.remove(&flatten(dn));
    }

    pub fn evict_expired(&self) -> usize {
        self.snippets.evict_expired()
    }
}
