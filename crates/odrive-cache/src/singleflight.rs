//! Collapse concurrent fetches of the same key into one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

use crate::{CacheError, CacheResult};

type Outcome = Option<Result<(), String>>;

/// At most one leader runs per key; everyone else waits for its outcome.
#[derive(Default)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<String, watch::Receiver<Outcome>>>,
}

enum Role {
    Leader(watch::Sender<Outcome>),
    Follower(watch::Receiver<Outcome>),
}

/// Removes the key when the leader finishes or is cancelled.
struct FlightGuard<'a> {
    flights: &'a SingleFlight,
    key: &'a str,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flights
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key);
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a leader currently running.
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run `f` unless another caller is already running it for `key`, in
    /// which case wait and share that caller's result.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> CacheResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<()>>,
    {
        let role = {
            let mut map = self
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match map.get(key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    map.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let _guard = FlightGuard { flights: self, key };
                let result = f().await;
                let shared = match &result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = tx.send(Some(shared));
                result
            }
            Role::Follower(mut rx) => {
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(v) => v.clone(),
                    Err(_) => None,
                };
                match outcome {
                    Some(Ok(())) => Ok(()),
                    Some(Err(msg)) => Err(CacheError::Fetch {
                        connector: key.to_string(),
                        msg,
                    }),
                    None => Err(CacheError::Fetch {
                        connector: key.to_string(),
                        msg: "fetch abandoned by its leader".into(),
                    }),
                }
            }
        }
    }
}
