//! Key material: content keys, IVs, ciphertext names, and the master key

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::{CryptoError, CryptoResult, IV_SIZE, KEY_SIZE};

/// A per-object 256-bit content key. Zeroized on drop.
#[derive(Clone)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyLength(bytes.len()))?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The process-wide master secret used to derive wrap pads.
///
/// Held as a [`SecretString`] so it never shows up in logs or debug output.
#[derive(Clone)]
pub struct MasterKey {
    secret: SecretString,
}

impl MasterKey {
    pub fn new(secret: SecretString) -> CryptoResult<Self> {
        if secret.expose_secret().is_empty() {
            return Err(CryptoError::EmptyMasterKey);
        }
        Ok(Self { secret })
    }

    pub fn from_env(var: &str) -> CryptoResult<Self> {
        let value = std::env::var(var).unwrap_or_default();
        Self::new(SecretString::from(value))
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.secret.expose_secret().as_bytes()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit content key.
pub fn generate_content_key() -> ContentKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    ContentKey::from_bytes(bytes)
}

/// Generate a CTR initial counter block.
///
/// The low four bytes are zero so the counter has 2^32 blocks of headroom
/// before it touches the random prefix.
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv[..IV_SIZE - 4]);
    iv
}

/// Generate an opaque ciphertext file name: 32 random bytes as 64 hex chars.
pub fn generate_connector() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_generation() {
        let k1 = generate_content_key();
        let k2 = generate_content_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_content_key_from_short_slice() {
        assert!(matches!(
            ContentKey::from_slice(&[0u8; 16]),
            Err(CryptoError::KeyLength(16))
        ));
    }

    #[test]
    fn test_iv_counter_bytes_zeroed() {
        for _ in 0..16 {
            let iv = generate_iv();
            assert_eq!(&iv[IV_SIZE - 4..], &[0, 0, 0, 0]);
        }
    }

    #[test]
    fn test_connector_shape() {
        let c = generate_connector();
        assert_eq!(c.len(), 64);
        assert!(c.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_ne!(c, generate_connector());
    }

    #[test]
    fn test_debug_redacts() {
        let k = generate_content_key();
        let m = MasterKey::new(SecretString::from("hunter2".to_string())).unwrap();
        assert!(!format!("{k:?}{m:?}").contains("hunter2"));
        assert!(format!("{m:?}").contains("REDACTED"));
    }

    #[test]
    fn test_empty_master_rejected() {
        assert!(MasterKey::new(SecretString::from(String::new())).is_err());
    }
}
