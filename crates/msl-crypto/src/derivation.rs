//! Key derivation using HKDF

use hkdf::Hkdf;
use sha2::Sha256;

use crate::session::SessionKeys;

/// Derive session keys from a shared secret.
///
/// Produces 64 bytes of output keying material split into a 32-byte
/// encryption key and a 32-byte HMAC key. `context` binds the derivation to
/// the exchange that produced the secret (e.g. both public keys).
///
/// # Security
///
/// - Different labels produce independent keys (domain separation)
/// - Deterministic: same inputs always produce same output
pub fn derive_session_keys(shared_secret: &[u8], label: &[u8], context: &[u8]) -> SessionKeys {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);

    let mut info = Vec::with_capacity(label.len() + context.len());
    info.extend_from_slice(label);
    info.extend_from_slice(context);

    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(&info, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut encryption = [0u8; 32];
    let mut hmac = [0u8; 32];
    encryption.copy_from_slice(&okm[..32]);
    hmac.copy_from_slice(&okm[32..]);

    SessionKeys::new(encryption, hmac)
}

/// Derive a 32-byte subkey from `key` for a single purpose.
pub fn derive_subkey(key: &[u8], label: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, key);

    let mut subkey = [0u8; 32];
    let Ok(()) = hkdf.expand(label, &mut subkey) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    subkey
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = derive_session_keys(b"shared secret", b"label", b"context");
        let b = derive_session_keys(b"shared secret", b"label", b"context");
        assert_eq!(a, b);
    }

    #[test]
    fn encryption_and_hmac_keys_differ() {
        let keys = derive_session_keys(b"shared secret", b"label", b"");
        assert_ne!(keys.encryption_key(), keys.hmac_key());
    }

    #[test]
    fn different_context_produces_different_keys() {
        let a = derive_session_keys(b"shared secret", b"label", b"alice");
        let b = derive_session_keys(b"shared secret", b"label", b"bob");
        assert_ne!(a, b, "context must separate derivations");
    }

    #[test]
    fn subkeys_are_domain_separated() {
        let key = [0x42u8; 32];
        assert_ne!(derive_subkey(&key, b"wrap"), derive_subkey(&key, b"siv"));
    }

    #[test]
    fn works_with_empty_secret() {
        let keys = derive_session_keys(&[], b"label", b"");
        assert_eq!(keys.encryption_key().len(), 32);
    }
}
