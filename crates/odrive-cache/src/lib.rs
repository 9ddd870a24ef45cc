//! odrive-cache: the local ciphertext cache and its write-back machinery
//!
//! Each ciphertext file is named `<connector>.<state>`. The suffix is the
//! authoritative state of that copy, and every transition between states is
//! a single rename within one directory:
//!
//! ```text
//! upload:   .uploading ──► .uploaded ──(blob put ok)──► .cached
//! refill:   .caching ──(blob get ok)──► .cached
//! failure:  .uploaded ──(metadata commit failed)──► .orphaned
//! ```

pub mod cache;
pub mod drain;
pub mod evict;
pub mod singleflight;
pub mod state;

pub use cache::{CacheEntry, CiphertextCache, Inventory, StateStats};
pub use drain::{DrainController, DrainSettings, RecoveryReport};
pub use evict::{disk_usage, spawn_sweeper, sweep, EvictionPolicy, SweepReport, Verdict};
pub use singleflight::SingleFlight;
pub use state::FileState;

use odrive_storage::BlobError;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no local copy of {0}")]
    NotFound(String),

    #[error("invalid connector name: {0:?}")]
    InvalidConnector(String),

    #[error("fetch of {connector} failed: {msg}")]
    Fetch { connector: String, msg: String },

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Connectors are hex names generated by the server; anything else never
/// touches the filesystem.
pub fn validate_connector(connector: &str) -> CacheResult<()> {
    if connector.is_empty()
        || connector.len() > 128
        || !connector.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(CacheError::InvalidConnector(connector.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_connector() {
        assert!(validate_connector(&"ab".repeat(32)).is_ok());
        assert!(validate_connector("").is_err());
        assert!(validate_connector("../etc/passwd").is_err());
        assert!(validate_connector("abc.cached").is_err());
    }
}
