//! odrive-crypto: content encryption for Object Drive
//!
//! Every object stream is encrypted under its own random content key with
//! AES-256 in counter mode. The plaintext SHA-256 is computed on the same
//! pass. Content keys are never stored in the clear: each read grant holds
//! the key XORed with a pad derived from the master key and the grantee.
//!
//! ```text
//! plaintext ──┬── SHA-256 ──────────────► content hash
//!             └── AES-256-CTR(key, iv) ─► ciphertext file
//!
//! wrapped_key = key ⊕ SHA-256(master ‖ ":" ‖ flatten(grantee))
//! ```

pub mod keys;
pub mod stream;
pub mod wrap;

pub use keys::{generate_connector, generate_content_key, generate_iv, ContentKey, MasterKey};
pub use stream::{decrypt, encrypt, CipherReader, Direction, StreamSummary};
pub use wrap::{apply_passphrase, unwrap_key, wrap_key};

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// AES block / CTR initial counter size in bytes
pub const IV_SIZE: usize = 16;

/// SHA-256 digest size in bytes
pub const HASH_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key length: {0} bytes (expected {KEY_SIZE})")]
    KeyLength(usize),

    #[error("invalid iv length: {0} bytes (expected {IV_SIZE})")]
    IvLength(usize),

    #[error("master key is empty")]
    EmptyMasterKey,

    #[error("I/O error during cipher stream: {0}")]
    Io(#[from] std::io::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
