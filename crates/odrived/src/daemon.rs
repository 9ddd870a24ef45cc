//! Daemon lifecycle: startup, background workers, HTTP server, shutdown

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use odrive_auth::{AcmEngine, GrpcPolicyService};
use odrive_cache::{spawn_sweeper, CiphertextCache, DrainController, DrainSettings, EvictionPolicy};
use odrive_core::config::OdriveConfig;
use odrive_crypto::MasterKey;
use odrive_dao::{MemoryStore, MetadataStore, Retrying};
use odrive_events::{
    AuditClient, AuditSettings, AuditSink, EventSink, GrpcAuditClient, LogAuditClient,
    NatsPublisher,
};
use odrive_storage::open_blob_store;

use crate::metrics::HealthState;
use crate::server::{router, AppServer, Services};

/// Per-call timeout for the audit service.
const AUDIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often expired user and snippet cache entries are dropped.
const CACHE_EVICT_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on waiting for queued write-backs at shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Process exit code for a failed startup, picked from the error chain.
///
/// 7 = connection refused, 28 = timed out, 6 = name resolution, 1 = other.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            match io.kind() {
                io::ErrorKind::ConnectionRefused => return 7,
                io::ErrorKind::TimedOut => return 28,
                _ => {}
            }
        }
    }
    let text = format!("{err:#}").to_lowercase();
    if text.contains("connection refused") {
        7
    } else if text.contains("timed out") || text.contains("timeout") {
        28
    } else if ["dns", "lookup", "name or service not known", "no such host"]
        .iter()
        .any(|needle| text.contains(needle))
    {
        6
    } else {
        1
    }
}

fn s3_credentials() -> Option<(String, String)> {
    let key = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
    let secret = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
    Some((key, secret))
}

pub async fn run(config: OdriveConfig) -> Result<()> {
    info!("daemon starting");
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let master = MasterKey::from_env(&config.crypto.master_key_env).with_context(|| {
        format!(
            "master key not available in ${}",
            config.crypto.master_key_env
        )
    })?;

    // ── Blob store ───────────────────────────────────────────────────────
    let creds = s3_credentials();
    let (blobs, operator) = open_blob_store(
        &config.storage,
        creds.as_ref().map(|(k, s)| (k.as_str(), s.as_str())),
    )?;
    if let Some(op) = &operator {
        match odrive_storage::check_health(op).await {
            Ok(()) => info!(backend = blobs.name(), "blob store: connected"),
            Err(e) => warn!(backend = blobs.name(), "blob store: {e}  (continuing; drains will retry)"),
        }
    } else {
        warn!("null blob store: ciphertext lives only in the local cache");
    }

    // ── Ciphertext cache + drain ─────────────────────────────────────────
    let cache = Arc::new(
        CiphertextCache::open(&config.cache.root, &config.cache.partition)
            .await
            .with_context(|| format!("opening cache at {}", config.cache.root.display()))?,
    );
    let drain = DrainController::start(cache.clone(), blobs.clone(), DrainSettings::from(&config.cache));
    match drain.recover().await {
        Ok(report) => info!(
            requeued = report.requeued,
            removed = report.removed,
            "cache recovery complete"
        ),
        Err(e) => warn!("cache recovery failed: {e}"),
    }
    if blobs.is_durable() {
        spawn_sweeper(
            cache.clone(),
            EvictionPolicy::from(&config.cache),
            Duration::from_secs(config.cache.sweep_interval_secs.max(1)),
            shutdown_tx.subscribe(),
        );
    } else {
        info!("eviction disabled: no durable copy behind the cache");
    }

    // ── Metadata ─────────────────────────────────────────────────────────
    let store = match &config.dao.state_file {
        Some(path) => MemoryStore::open(path)?,
        None => {
            warn!("no dao.state_file configured: metadata is kept in memory only");
            MemoryStore::in_memory()
        }
    };
    let dao: Arc<dyn MetadataStore> = Arc::new(Retrying::new(
        store,
        config.dao.deadlock_retries,
        Duration::from_millis(config.dao.deadlock_delay_ms),
    ));

    // ── Policy service ───────────────────────────────────────────────────
    let acm = if config.policy.offline {
        warn!("policy service offline: ACM-gated operations will be refused");
        AcmEngine::offline()
    } else {
        let service = GrpcPolicyService::connect_lazy(
            &config.policy.endpoint,
            Duration::from_millis(config.policy.timeout_ms),
        )?;
        info!(endpoint = %config.policy.endpoint, "policy service configured");
        AcmEngine::new(Arc::new(service))
    };

    // ── Audit + events ───────────────────────────────────────────────────
    let audit_client: Arc<dyn AuditClient> = match &config.audit.endpoint {
        Some(endpoint) => Arc::new(GrpcAuditClient::connect_lazy(endpoint, AUDIT_TIMEOUT)?),
        None => {
            info!("no audit endpoint: audit records go to the log");
            Arc::new(LogAuditClient)
        }
    };
    let audit = AuditSink::start(audit_client, AuditSettings::from(&config.audit));

    let events = match &config.events.nats_url {
        Some(url) => {
            let publisher = NatsPublisher::connect(url)
                .await
                .with_context(|| format!("connecting to NATS at {url}"))?;
            info!(url = %url, topic = %config.events.topic, "event publishing enabled");
            EventSink::start(Arc::new(publisher), &config.events)
        }
        None => EventSink::disabled(),
    };
    let events = Arc::new(events);

    // ── Application ──────────────────────────────────────────────────────
    let config = Arc::new(config);
    let mut registry = Registry::default();
    let app = Arc::new(AppServer::new(
        config.clone(),
        Services {
            master: Arc::new(master),
            dao,
            acm,
            drain: drain.clone(),
            audit: audit.clone(),
            events: events.clone(),
        },
        &mut registry,
    ));

    if let Some(addr) = config.server.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            metrics: app.metrics.clone(),
            operator,
            drain: drain.clone(),
            audit: audit.clone(),
            events,
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    spawn_cache_eviction(app.clone(), shutdown_tx.subscribe());

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    info!(
        addr = %config.server.listen,
        base_path = %config.server.base_path,
        "object API: listening"
    );

    notify_ready();

    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("object API server")?;

    info!("draining pending write-backs");
    if tokio::time::timeout(DRAIN_GRACE, drain.wait_idle()).await.is_err() {
        warn!(
            pending = drain.pending(),
            "write-backs still pending at shutdown; they resume on next start"
        );
    }
    audit.flush().await;
    info!("daemon stopped");
    Ok(())
}

fn spawn_cache_eviction(app: Arc<AppServer>, mut shutdown: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_EVICT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let users = app.users.evict_expired();
                    let snippets = app.snippets.evict_expired();
                    debug!(users, snippets, "identity caches trimmed");
                }
            }
        }
    });
}

async fn shutdown_signal(tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler failed: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    let _ = tx.send(());
}

#[cfg(not(unix))]
fn notify_ready() {}

#[cfg(unix)]
fn notify_ready() {
    // sd_notify(READY=1) when running under systemd; no-op without $NOTIFY_SOCKET
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_from_io_kind() {
        let err = anyhow::Error::new(io::Error::from(io::ErrorKind::ConnectionRefused))
            .context("connecting to NATS at nats://localhost:4222");
        assert_eq!(exit_code_for(&err), 7);

        let err = anyhow::Error::new(io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(exit_code_for(&err), 28);
    }

    #[test]
    fn test_exit_code_from_message() {
        assert_eq!(exit_code_for(&anyhow::anyhow!("dial: Connection refused")), 7);
        assert_eq!(exit_code_for(&anyhow::anyhow!("request timeout after 5s")), 28);
        assert_eq!(
            exit_code_for(&anyhow::anyhow!("failed to lookup address information")),
            6
        );
        assert_eq!(exit_code_for(&anyhow::anyhow!("master key is empty")), 1);
    }
}
