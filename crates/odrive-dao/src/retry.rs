//! Bounded retry of transactions that lost a deadlock.

use async_trait::async_trait;
use odrive_core::types::{Object, ObjectId, User};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::{DaoResult, ListQuery, MetadataStore, ResultSet};

/// Run `op` until it succeeds, fails with something other than a deadlock,
/// or `attempts` tries are spent. The delay grows linearly per attempt.
pub async fn with_deadlock_retry<T, F, Fut>(
    op_name: &'static str,
    attempts: u32,
    delay: Duration,
    mut op: F,
) -> DaoResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DaoResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_deadlock() && attempt < attempts => {
                warn!(op = op_name, attempt, attempts, "deadlock, retrying");
                tokio::time::sleep(delay * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// A [`MetadataStore`] that retries every call of the inner store on deadlock.
pub struct Retrying<S> {
    inner: S,
    attempts: u32,
    delay: Duration,
}

impl<S: MetadataStore> Retrying<S> {
    pub fn new(inner: S, attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            attempts,
            delay,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: MetadataStore> MetadataStore for Retrying<S> {
    async fn get_object(&self, id: ObjectId) -> DaoResult<Object> {
        with_deadlock_retry("get_object", self.attempts, self.delay, || {
            self.inner.get_object(id)
        })
        .await
    }

    async fn create_object(&self, object: Object) -> DaoResult<Object> {
        with_deadlock_retry("create_object", self.attempts, self.delay, || {
            self.inner.create_object(object.clone())
        })
        .await
    }

    async fn update_object(&self, object: Object, expected_token: &str) -> DaoResult<Object> {
        with_deadlock_retry("update_object", self.attempts, self.delay, || {
            self.inner.update_object(object.clone(), expected_token)
        })
        .await
    }

    async fn trash_object(
        &self,
        id: ObjectId,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object> {
        with_deadlock_retry("trash_object", self.attempts, self.delay, || {
            self.inner.trash_object(id, actor, expected_token)
        })
        .await
    }

    async fn untrash_object(
        &self,
        id: ObjectId,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object> {
        with_deadlock_retry("untrash_object", self.attempts, self.delay, || {
            self.inner.untrash_object(id, actor, expected_token)
        })
        .await
    }

    async fn expunge_object(
        &self,
        id: ObjectId,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object> {
        with_deadlock_retry("expunge_object", self.attempts, self.delay, || {
            self.inner.expunge_object(id, actor, expected_token)
        })
        .await
    }

    async fn move_object(
        &self,
        id: ObjectId,
        new_parent: Option<ObjectId>,
        actor: &str,
        expected_token: &str,
    ) -> DaoResult<Object> {
        with_deadlock_retry("move_object", self.attempts, self.delay, || {
            self.inner.move_object(id, new_parent, actor, expected_token)
        })
        .await
    }

    async fn change_owner(&self, object: Object, expected_token: &str) -> DaoResult<Object> {
        with_deadlock_retry("change_owner", self.attempts, self.delay, || {
            self.inner.change_owner(object.clone(), expected_token)
        })
        .await
    }

    async fn expunge_deleted(&self, owner: &str, actor: &str) -> DaoResult<Vec<Object>> {
        with_deadlock_retry("expunge_deleted", self.attempts, self.delay, || {
            self.inner.expunge_deleted(owner, actor)
        })
        .await
    }

    async fn list_objects(&self, query: ListQuery<'_>) -> DaoResult<ResultSet> {
        with_deadlock_retry("list_objects", self.attempts, self.delay, || {
            self.inner.list_objects(query)
        })
        .await
    }

    async fn get_user(&self, dn: &str) -> DaoResult<User> {
        with_deadlock_retry("get_user", self.attempts, self.delay, || {
            self.inner.get_user(dn)
        })
        .await
    }

    async fn create_user(&self, user: User) -> DaoResult<User> {
        with_deadlock_retry("create_user", self.attempts, self.delay, || {
            self.inner.create_user(user.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DaoError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_deadlock_then_succeeds() {
        let calls = &AtomicU32::new(0);
        let out = with_deadlock_retry("t", 3, Duration::from_millis(1), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DaoError::Deadlock)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = &AtomicU32::new(0);
        let out: DaoResult<()> = with_deadlock_retry("t", 2, Duration::from_millis(1), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DaoError::Deadlock)
        })
        .await;
        assert!(matches!(out, Err(DaoError::Deadlock)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let id = ObjectId::new_random();
        let out: DaoResult<()> = with_deadlock_retry("t", 5, Duration::from_millis(1), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DaoError::StaleToken(id))
        })
        .await;
        assert!(matches!(out, Err(DaoError::StaleToken(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
