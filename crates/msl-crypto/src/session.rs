//! Session crypto context built from master token session keys.

use std::fmt;

use zeroize::Zeroize;

use crate::{
    context::{CryptoContext, Entropy},
    derivation::derive_subkey,
    error::CryptoError,
    symmetric::{KEY_SIZE, SymmetricCryptoContext},
};

const SESSION_WRAP_LABEL: &[u8] = b"msl session wrap";

/// Session key pair carried inside a master token.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    encryption: [u8; KEY_SIZE],
    hmac: [u8; KEY_SIZE],
}

impl SessionKeys {
    /// Create session keys from raw key material.
    pub fn new(encryption: [u8; KEY_SIZE], hmac: [u8; KEY_SIZE]) -> Self {
        Self { encryption, hmac }
    }

    /// Create session keys from untrusted slices.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyLength` if either slice is not 32 bytes
    pub fn from_slices(encryption: &[u8], hmac: &[u8]) -> Result<Self, CryptoError> {
        let encryption = <[u8; KEY_SIZE]>::try_from(encryption).map_err(|_| {
            CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: encryption.len() }
        })?;
        let hmac = <[u8; KEY_SIZE]>::try_from(hmac)
            .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: hmac.len() })?;
        Ok(Self::new(encryption, hmac))
    }

    /// Encryption key.
    pub fn encryption_key(&self) -> &[u8; KEY_SIZE] {
        &self.encryption
    }

    /// HMAC key.
    pub fn hmac_key(&self) -> &[u8; KEY_SIZE] {
        &self.hmac
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(<redacted>)")
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.encryption.zeroize();
        self.hmac.zeroize();
    }
}

/// Crypto context protecting messages under a master token session.
///
/// The key id is `<identity>_<sequence number>`, so contexts of successive
/// renewals never accept each other's ciphertext. Wrapping uses a subkey
/// derived from the encryption key, letting the session wrap renewed keys.
#[derive(Clone)]
pub struct SessionCryptoContext {
    keys: SessionKeys,
    inner: SymmetricCryptoContext,
}

impl SessionCryptoContext {
    /// Build a session context for `identity` at `sequence_number`.
    pub fn new(identity: &str, sequence_number: u64, keys: SessionKeys) -> Self {
        Self::with_key_id(format!("{identity}_{sequence_number}"), keys)
    }

    /// Build a session context with an explicit key id.
    pub fn with_key_id(key_id: impl Into<String>, keys: SessionKeys) -> Self {
        let mut wrap_key = derive_subkey(keys.encryption_key(), SESSION_WRAP_LABEL);
        let inner = SymmetricCryptoContext::new(key_id, *keys.encryption_key(), *keys.hmac_key())
            .with_wrap_key(wrap_key);
        wrap_key.zeroize();
        Self { keys, inner }
    }

    /// Key identifier of this session.
    pub fn key_id(&self) -> &str {
        self.inner.key_id()
    }

    /// Session keys, for persisting the store.
    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }
}

impl CryptoContext for SessionCryptoContext {
    fn encrypt(&self, plaintext: &[u8], entropy: &Entropy) -> Result<Vec<u8>, CryptoError> {
        self.inner.encrypt(plaintext, entropy)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner.decrypt(ciphertext)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner.sign(data)
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        self.inner.verify(data, signature)
    }

    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner.wrap(data)
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner.unwrap(wrapped)
    }
}

impl fmt::Debug for SessionCryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCryptoContext").field("key_id", &self.key_id()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SessionKeys {
        SessionKeys::new([0x0A; 32], [0x0B; 32])
    }

    #[test]
    fn key_id_combines_identity_and_sequence() {
        let ctx = SessionCryptoContext::new("device-1", 7, keys());
        assert_eq!(ctx.key_id(), "device-1_7");
    }

    #[test]
    fn successive_sequence_numbers_do_not_share_ciphertext() {
        let old = SessionCryptoContext::new("device-1", 7, keys());
        let new = SessionCryptoContext::new("device-1", 8, keys());

        let ciphertext = old.encrypt(b"payload", &[0x05; 32]).unwrap();
        assert!(new.decrypt(&ciphertext).is_err());
        assert_eq!(old.decrypt(&ciphertext).unwrap(), b"payload");
    }

    #[test]
    fn session_can_wrap() {
        let ctx = SessionCryptoContext::new("device-1", 1, keys());
        let wrapped = ctx.wrap(b"renewed keys").unwrap();
        assert_eq!(ctx.unwrap(&wrapped).unwrap(), b"renewed keys");
    }

    #[test]
    fn keys_are_exposed_for_persistence() {
        let ctx = SessionCryptoContext::new("device-1", 1, keys());
        assert_eq!(ctx.keys(), &keys());
    }

    #[test]
    fn from_slices_validates_length() {
        assert!(SessionKeys::from_slices(&[0u8; 32], &[0u8; 31]).is_err());
        assert!(SessionKeys::from_slices(&[0u8; 32], &[0u8; 32]).is_ok());
    }

    #[test]
    fn debug_is_redacted() {
        assert_eq!(format!("{:?}", keys()), "SessionKeys(<redacted>)");
    }
}
