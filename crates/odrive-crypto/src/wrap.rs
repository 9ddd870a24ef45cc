//! Per-grantee key wrapping.
//!
//! The pad for a grantee is `SHA-256(master ‖ flatten(grantee))`, and
//! wrapping is a plain XOR with that pad. XOR is its own inverse, so the
//! same function both wraps and unwraps. Grantee names are flattened first,
//! so any spelling of a DN yields the same pad.

use odrive_core::flatten;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::keys::{ContentKey, MasterKey};
use crate::{CryptoError, CryptoResult, KEY_SIZE};

fn pad_for(master: &MasterKey, grantee: &str) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(master.expose());
    hasher.update(flatten(grantee).as_bytes());
    hasher.finalize().into()
}

/// XOR `bytes` with the grantee's pad. Involutive.
pub fn apply_passphrase(
    master: &MasterKey,
    grantee: &str,
    bytes: &[u8],
) -> CryptoResult<[u8; KEY_SIZE]> {
    if bytes.len() != KEY_SIZE {
        return Err(CryptoError::KeyLength(bytes.len()));
    }
    let mut pad = pad_for(master, grantee);
    let mut out = [0u8; KEY_SIZE];
    for (o, (b, p)) in out.iter_mut().zip(bytes.iter().zip(pad.iter())) {
        *o = b ^ p;
    }
    pad.zeroize();
    Ok(out)
}

/// Wrap a content key for storage on a grantee's permission row.
pub fn wrap_key(master: &MasterKey, grantee: &str, key: &ContentKey) -> Vec<u8> {
    let mut pad = pad_for(master, grantee);
    let wrapped = key
        .as_bytes()
        .iter()
        .zip(pad.iter())
        .map(|(k, p)| k ^ p)
        .collect();
    pad.zeroize();
    wrapped
}

/// Recover the content key from a grantee's wrapped key.
pub fn unwrap_key(master: &MasterKey, grantee: &str, wrapped: &[u8]) -> CryptoResult<ContentKey> {
    let mut raw = apply_passphrase(master, grantee, wrapped)?;
    let key = ContentKey::from_bytes(raw);
    raw.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_content_key;
    use proptest::prelude::*;
    use secrecy::SecretString;

    fn master(s: &str) -> MasterKey {
        MasterKey::new(SecretString::from(s.to_string())).unwrap()
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let m = master("master-secret");
        let key = generate_content_key();
        let wrapped = wrap_key(&m, "cn=alice,o=org", &key);
        assert_eq!(wrapped.len(), KEY_SIZE);
        assert_ne!(wrapped.as_slice(), key.as_bytes().as_slice());

        let back = unwrap_key(&m, "cn=alice,o=org", &wrapped).unwrap();
        assert_eq!(back.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_grantee_spelling_does_not_matter() {
        let m = master("master-secret");
        let key = generate_content_key();
        let wrapped = wrap_key(&m, "CN=Alice, O=Org", &key);
        let back = unwrap_key(&m, "cn=alice,o=org", &wrapped).unwrap();
        assert_eq!(back.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_wrong_grantee_yields_different_key() {
        let m = master("master-secret");
        let key = generate_content_key();
        let wrapped = wrap_key(&m, "cn=alice", &key);
        let other = unwrap_key(&m, "cn=mallory", &wrapped).unwrap();
        assert_ne!(other.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_wrong_master_yields_different_key() {
        let key = generate_content_key();
        let wrapped = wrap_key(&master("one"), "cn=alice", &key);
        let other = unwrap_key(&master("two"), "cn=alice", &wrapped).unwrap();
        assert_ne!(other.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_pad_is_digest_of_master_then_grantee() {
        let m = master("mk");
        let dn = "cn=alice,o=org";
        let wrapped = wrap_key(&m, dn, &ContentKey::from_bytes([0u8; KEY_SIZE]));

        let mut expected = Sha256::new();
        expected.update(b"mk");
        expected.update(flatten(dn).as_bytes());
        let expected: [u8; KEY_SIZE] = expected.finalize().into();
        assert_eq!(wrapped.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_bad_length_rejected() {
        let m = master("x");
        assert!(matches!(
            apply_passphrase(&m, "cn=a", &[1, 2, 3]),
            Err(CryptoError::KeyLength(3))
        ));
    }

    proptest! {
        #[test]
        fn prop_apply_twice_is_identity(bytes in proptest::array::uniform32(any::<u8>()), grantee in ".{0,64}") {
            let m = master("prop-master");
            let once = apply_passphrase(&m, &grantee, &bytes).unwrap();
            let twice = apply_passphrase(&m, &grantee, &once).unwrap();
            prop_assert_eq!(twice, bytes);
        }
    }
}
