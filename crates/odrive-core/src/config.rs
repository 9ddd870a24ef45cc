use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level daemon configuration (loaded from odrive.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OdriveConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub policy: PolicyConfig,
    pub dao: DaoConfig,
    pub audit: AuditConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address for the object API
    pub listen: String,
    /// Path prefix every API route is mounted under (empty = root)
    pub base_path: String,
    /// Peer DNs allowed to act on behalf of another user via USER_DN
    pub trusted_impersonators: Vec<String>,
    /// Upper bound for the ObjectMetadata multipart part, in bytes
    pub metadata_part_limit: usize,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root directory
    pub root: PathBuf,
    /// Partition under the root; also the key prefix in the blob store
    pub partition: String,
    /// Files younger than this are never evicted (seconds)
    pub min_age_secs: u64,
    /// Non-cached leftovers older than this are removed (seconds)
    pub gc_age_secs: u64,
    /// Interval between eviction sweeps (seconds)
    pub sweep_interval_secs: u64,
    /// Disk usage fraction above which eviction may run
    pub low_watermark: f64,
    /// Disk usage fraction above which any file past min age is evicted
    pub high_watermark: f64,
    /// Concurrent drain workers
    pub drain_workers: usize,
    /// Bounded drain queue depth
    pub drain_queue: usize,
    /// Write-back attempts before giving up until the next cycle
    pub drain_retries: u32,
    /// Base delay between write-back attempts (milliseconds)
    pub retry_delay_ms: u64,
    /// Delay before a failed drain is re-queued once more (seconds, 0 = off)
    pub redrain_delay_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Fs,
    Memory,
    /// No durable store: ciphertext lives only in the local cache.
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Environment variable that holds the master key
    pub master_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// gRPC endpoint of the policy service
    pub endpoint: String,
    /// Run without a policy service; every gated operation is refused
    pub offline: bool,
    /// Per-call timeout (milliseconds)
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaoConfig {
    /// JSON snapshot file; unset keeps metadata in memory only
    pub state_file: Option<PathBuf>,
    /// Attempts for a transaction that hit a deadlock
    pub deadlock_retries: u32,
    /// Delay between deadlock retries (milliseconds)
    pub deadlock_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// gRPC endpoint of the audit service; unset logs events locally
    pub endpoint: Option<String>,
    /// Events per submitted batch
    pub batch_size: usize,
    /// Flush interval (milliseconds)
    pub flush_interval_ms: u64,
    /// Events held per type before the oldest are dropped
    pub queue_bound: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// NATS endpoint; unset disables event publishing
    pub nats_url: Option<String>,
    /// Subject events are published to
    pub topic: String,
    /// Actions published on success ("*" = all)
    pub publish_success_actions: Vec<String>,
    /// Actions published on failure ("*" = all)
    pub publish_failure_actions: Vec<String>,
    /// Events buffered while the publisher is busy
    pub queue_bound: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:4430".into(),
            base_path: "/services/object-drive/1.0".into(),
            trusted_impersonators: Vec::new(),
            metadata_part_limit: 5 * 1024 * 1024,
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/cache/odrive"),
            partition: "cache".into(),
            min_age_secs: 60,
            gc_age_secs: 7 * 24 * 60 * 60,
            sweep_interval_secs: 30,
            low_watermark: 0.0,
            high_watermark: 0.95,
            drain_workers: 4,
            drain_queue: 1024,
            drain_retries: 3,
            retry_delay_ms: 1000,
            redrain_delay_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "odrive".into(),
            root: PathBuf::from("/var/lib/odrive/blobs"),
            enforce_tls: false,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            master_key_env: "OD_ENCRYPT_MASTERKEY".into(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            offline: false,
            timeout_ms: 5000,
        }
    }
}

impl Default for DaoConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            deadlock_retries: 3,
            deadlock_delay_ms: 100,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            batch_size: 10,
            flush_interval_ms: 1000,
            queue_bound: 10_000,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            topic: "odrive-event".into(),
            publish_success_actions: vec!["*".into()],
            publish_failure_actions: vec!["*".into()],
            queue_bound: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[server]
listen = "0.0.0.0:8443"
base_path = ""
trusted_impersonators = ["cn=twl-server-generic2,ou=dae,o=u.s. government,c=us"]
log_level = "debug"
log_format = "text"

[cache]
root = "/srv/odrive/cache"
partition = "p1"
min_age_secs = 120
low_watermark = 0.5
high_watermark = 0.9
drain_workers = 8

[storage]
backend = "s3"
endpoint = "https://s3.example.com"
region = "us-west-2"
bucket = "drive-bucket"
enforce_tls = true

[policy]
endpoint = "http://aac.internal:9093"
timeout_ms = 2500

[dao]
state_file = "/var/lib/odrive/meta.json"

[audit]
endpoint = "http://audit.internal:7000"
batch_size = 25

[events]
nats_url = "nats://nats.internal:4222"
publish_success_actions = ["create", "update"]
publish_failure_actions = []
"#;
        let config: OdriveConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:8443");
        assert_eq!(config.server.base_path, "");
        assert_eq!(config.server.trusted_impersonators.len(), 1);
        assert_eq!(config.cache.root, PathBuf::from("/srv/odrive/cache"));
        assert_eq!(config.cache.min_age_secs, 120);
        assert_eq!(config.cache.drain_workers, 8);
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert!(config.storage.enforce_tls);
        assert_eq!(config.policy.timeout_ms, 2500);
        assert_eq!(
            config.dao.state_file,
            Some(PathBuf::from("/var/lib/odrive/meta.json"))
        );
        assert_eq!(config.audit.batch_size, 25);
        assert_eq!(config.events.publish_success_actions, vec!["create", "update"]);
        assert!(config.events.publish_failure_actions.is_empty());
    }

    #[test]
    fn test_parse_defaults() {
        let config: OdriveConfig = toml::from_str("").unwrap();

        assert_eq!(config.server.base_path, "/services/object-drive/1.0");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.cache.min_age_secs, 60);
        assert_eq!(config.cache.gc_age_secs, 604_800);
        assert_eq!(config.cache.drain_retries, 3);
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.crypto.master_key_env, "OD_ENCRYPT_MASTERKEY");
        assert!(!config.policy.offline);
        assert_eq!(config.audit.batch_size, 10);
        assert_eq!(config.events.topic, "odrive-event");
        assert_eq!(config.events.publish_success_actions, vec!["*"]);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[storage]
backend = "null"
"#;
        let config: OdriveConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.storage.backend, StorageBackend::Null);
        // Defaults
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.cache.partition, "cache");
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = toml::from_str::<OdriveConfig>("[storage]\nbackend = \"ftp\"\n");
        assert!(err.is_err(), "unknown backend must fail to parse");
    }
}
