//! OpenDAL Operator factory for odrive storage backends

use anyhow::{Context, Result};
use opendal::Operator;
use std::path::Path;

/// Minimal config needed to build an S3 operator
/// (full config lives in odrive-core's StorageConfig)
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

fn with_layers(op: Operator) -> Operator {
    op.layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
}

/// Build an OpenDAL Operator for any S3-compatible endpoint
///
/// Uses path-style addressing (default in opendal 0.55), which is what
/// MinIO-style gateways expect.
pub fn build_operator(cfg: &S3Config) -> Result<Operator> {
    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .finish();

    Ok(with_layers(op))
}

/// Build an operator rooted at a local directory.
pub fn build_fs_operator(root: &Path) -> Result<Operator> {
    let root = root
        .to_str()
        .with_context(|| format!("fs storage root is not valid UTF-8: {}", root.display()))?;
    let op = Operator::new(opendal::services::Fs::default().root(root))
        .with_context(|| format!("creating OpenDAL fs operator at {root}"))?
        .finish();
    Ok(with_layers(op))
}

/// Build an in-process operator; contents vanish with the process.
pub fn build_memory_operator() -> Result<Operator> {
    let op = Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish();
    Ok(op)
}

/// Build an S3 operator from odrive-core config + credentials.
///
/// If `enforce_tls` is true and the endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_from_core_config(
    storage: &odrive_core::config::StorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            );
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted. \
             Set storage.enforce_tls = true and use HTTPS in production."
        );
    }

    build_operator(&S3Config {
        endpoint: storage.endpoint.clone(),
        region: storage.region.clone(),
        bucket: storage.bucket.clone(),
        access_key_id: access_key_id.to_string(),
        secret_access_key: secret_access_key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_operator_valid() {
        let cfg = S3Config {
            endpoint: "http://localhost:8333".to_string(),
            region: "us-east-1".to_string(),
            bucket: "test-bucket".to_string(),
            access_key_id: "test-key".to_string(),
            secret_access_key: "test-secret".to_string(),
        };
        assert!(build_operator(&cfg).is_ok(), "operator construction should succeed");
    }

    #[test]
    fn test_build_from_core_config_http_enforce_tls() {
        let storage = odrive_core::config::StorageConfig {
            endpoint: "http://insecure:8333".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let result = build_from_core_config(&storage, "key", "secret");
        assert!(result.is_err(), "HTTP + enforce_tls must fail");
        assert!(
            result.unwrap_err().to_string().contains("enforce_tls"),
            "error message should mention enforce_tls"
        );
    }

    #[test]
    fn test_build_from_core_config_https() {
        let storage = odrive_core::config::StorageConfig {
            endpoint: "https://s3.example.com".into(),
            enforce_tls: true,
            ..Default::default()
        };
        assert!(build_from_core_config(&storage, "key", "secret").is_ok());
    }

    #[test]
    fn test_build_fs_operator() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(build_fs_operator(tmp.path()).is_ok());
    }
}
