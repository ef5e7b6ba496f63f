//! Pre-shared key crypto context.
//!
//! # Envelope Format
//!
//! ```text
//! ┌─────────┬────────────┬───────────────────────────┐
//! │ version │ nonce (24) │ ciphertext || tag (16)    │
//! └─────────┴────────────┴───────────────────────────┘
//! ```
//!
//! The key id is bound as associated data, so a ciphertext produced under
//! one key id never decrypts under another, even if the key bytes collide.
//!
//! # Key Wrapping
//!
//! Wrapping is a synthetic-IV construction. The nonce is the truncated
//! HMAC of the plaintext under a derived subkey, and unwrapping recomputes it
//! after decryption. Identical inputs produce identical wrapped blobs and no
//! entropy is needed.

use std::fmt;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{
    context::{CryptoContext, Entropy},
    derivation::derive_subkey,
    error::CryptoError,
};

type HmacSha256 = Hmac<Sha256>;

/// Size of every symmetric key (32 bytes).
pub const KEY_SIZE: usize = 32;

/// Current envelope version
const ENVELOPE_VERSION: u8 = 0x01;

/// `XChaCha20` nonce size
pub(crate) const NONCE_SIZE: usize = 24;

/// Poly1305 tag size
const TAG_SIZE: usize = 16;

const WRAP_CIPHER_LABEL: &[u8] = b"msl wrap cipher";
const WRAP_SIV_LABEL: &[u8] = b"msl wrap siv";

/// Crypto context over a pre-shared encryption, HMAC and optional wrap key.
///
/// Used for PSK entity authentication and as the engine behind
/// [`SessionCryptoContext`](crate::SessionCryptoContext).
#[derive(Clone)]
pub struct SymmetricCryptoContext {
    key_id: String,
    encryption_key: [u8; KEY_SIZE],
    hmac_key: [u8; KEY_SIZE],
    wrap_key: Option<[u8; KEY_SIZE]>,
}

impl SymmetricCryptoContext {
    /// Create a context without a wrap key.
    pub fn new(
        key_id: impl Into<String>,
        encryption_key: [u8; KEY_SIZE],
        hmac_key: [u8; KEY_SIZE],
    ) -> Self {
        Self { key_id: key_id.into(), encryption_key, hmac_key, wrap_key: None }
    }

    /// Create a context from untrusted key slices.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyLength` if either key is not [`KEY_SIZE`] bytes
    pub fn from_slices(
        key_id: impl Into<String>,
        encryption_key: &[u8],
        hmac_key: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self::new(key_id, to_key(encryption_key)?, to_key(hmac_key)?))
    }

    /// Attach a wrap key, enabling [`CryptoContext::wrap`].
    #[must_use]
    pub fn with_wrap_key(mut self, wrap_key: [u8; KEY_SIZE]) -> Self {
        self.wrap_key = Some(wrap_key);
        self
    }

    /// Key identifier bound into every ciphertext.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Whether this context can wrap key material.
    pub fn can_wrap(&self) -> bool {
        self.wrap_key.is_some()
    }
}

impl CryptoContext for SymmetricCryptoContext {
    fn encrypt(&self, plaintext: &[u8], entropy: &Entropy) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&entropy[..NONCE_SIZE]);
        Ok(seal(&self.encryption_key, self.key_id.as_bytes(), &nonce, plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(&self.encryption_key, self.key_id.as_bytes(), ciphertext)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(hmac_sha256(&self.hmac_key, data).to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        hmac_verify(&self.hmac_key, data, signature)
    }

    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let wrap_key = self.wrap_key.as_ref().ok_or(CryptoError::Unsupported { operation: "wrap" })?;
        Ok(siv_wrap(wrap_key, data))
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let wrap_key =
            self.wrap_key.as_ref().ok_or(CryptoError::Unsupported { operation: "unwrap" })?;
        siv_unwrap(wrap_key, wrapped)
    }
}

impl fmt::Debug for SymmetricCryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricCryptoContext")
            .field("key_id", &self.key_id)
            .field("can_wrap", &self.can_wrap())
            .finish_non_exhaustive()
    }
}

impl Drop for SymmetricCryptoContext {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
        self.hmac_key.zeroize();
        if let Some(key) = self.wrap_key.as_mut() {
            key.zeroize();
        }
    }
}

fn to_key(bytes: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    <[u8; KEY_SIZE]>::try_from(bytes)
        .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: bytes.len() })
}

/// Encrypt into a versioned envelope.
pub(crate) fn seal(
    key: &[u8; KEY_SIZE],
    aad: &[u8],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let Ok(ciphertext) =
        cipher.encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut envelope = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    envelope.push(ENVELOPE_VERSION);
    envelope.extend_from_slice(nonce);
    envelope.extend_from_slice(&ciphertext);
    envelope
}

/// Decrypt a versioned envelope produced by [`seal`].
pub(crate) fn open(key: &[u8; KEY_SIZE], aad: &[u8], envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let Some((&version, rest)) = envelope.split_first() else {
        return Err(CryptoError::MalformedEnvelope { reason: "empty ciphertext".to_string() });
    };
    if version != ENVELOPE_VERSION {
        return Err(CryptoError::MalformedEnvelope {
            reason: format!("unknown envelope version {version:#04x}"),
        });
    }
    if rest.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::MalformedEnvelope {
            reason: format!("envelope too short: {} bytes", envelope.len()),
        });
    }

    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() })
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC-SHA256 verification.
pub(crate) fn hmac_verify(key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(data);
    mac.verify_slice(signature).is_ok()
}

/// Deterministic synthetic-IV key wrap.
pub(crate) fn siv_wrap(wrap_key: &[u8; KEY_SIZE], data: &[u8]) -> Vec<u8> {
    let mut cipher_key = derive_subkey(wrap_key, WRAP_CIPHER_LABEL);
    let mut siv_key = derive_subkey(wrap_key, WRAP_SIV_LABEL);

    let siv = hmac_sha256(&siv_key, data);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&siv[..NONCE_SIZE]);

    let wrapped = seal(&cipher_key, WRAP_SIV_LABEL, &nonce, data);

    cipher_key.zeroize();
    siv_key.zeroize();
    wrapped
}

/// Inverse of [`siv_wrap`]. Fails if the blob was altered or wrapped under
/// another key.
pub(crate) fn siv_unwrap(wrap_key: &[u8; KEY_SIZE], wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut cipher_key = derive_subkey(wrap_key, WRAP_CIPHER_LABEL);
    let mut siv_key = derive_subkey(wrap_key, WRAP_SIV_LABEL);

    let result = open(&cipher_key, WRAP_SIV_LABEL, wrapped).and_then(|data| {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&siv_key) else {
            unreachable!("HMAC accepts keys of any length");
        };
        mac.update(&data);
        // open() already checked the length, so the nonce is present
        let nonce = &wrapped[1..=NONCE_SIZE];
        mac.verify_truncated_left(nonce)
            .map(|()| data)
            .map_err(|_| CryptoError::DecryptionFailed { reason: "synthetic IV mismatch".to_string() })
    });

    cipher_key.zeroize();
    siv_key.zeroize();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(id: &str) -> SymmetricCryptoContext {
        SymmetricCryptoContext::new(id, [0x11; KEY_SIZE], [0x22; KEY_SIZE])
            .with_wrap_key([0x33; KEY_SIZE])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let ctx = context("device-1");
        let ciphertext = ctx.encrypt(b"hello", &[0x01; 32]).unwrap();

        assert_ne!(ciphertext.as_slice(), b"hello");
        assert_eq!(ctx.decrypt(&ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn different_entropy_produces_different_ciphertext() {
        let ctx = context("device-1");
        let a = ctx.encrypt(b"hello", &[0x01; 32]).unwrap();
        let b = ctx.encrypt(b"hello", &[0x02; 32]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn key_id_is_bound_to_ciphertext() {
        let ciphertext = context("device-1").encrypt(b"hello", &[0x01; 32]).unwrap();
        let result = context("device-2").decrypt(&ciphertext);

        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let ctx = context("device-1");
        let mut ciphertext = ctx.encrypt(b"hello", &[0x01; 32]).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;

        assert!(matches!(ctx.decrypt(&ciphertext), Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn truncated_envelope_is_malformed() {
        let ctx = context("device-1");
        assert!(matches!(ctx.decrypt(&[]), Err(CryptoError::MalformedEnvelope { .. })));
        assert!(matches!(ctx.decrypt(&[ENVELOPE_VERSION; 8]), Err(CryptoError::MalformedEnvelope { .. })));
    }

    #[test]
    fn unknown_version_is_malformed() {
        let ctx = context("device-1");
        let mut ciphertext = ctx.encrypt(b"hello", &[0x01; 32]).unwrap();
        ciphertext[0] = 0x7F;

        assert!(matches!(ctx.decrypt(&ciphertext), Err(CryptoError::MalformedEnvelope { .. })));
    }

    #[test]
    fn sign_verify() {
        let ctx = context("device-1");
        let signature = ctx.sign(b"header data").unwrap();

        assert_eq!(signature.len(), 32);
        assert!(ctx.verify(b"header data", &signature));
        assert!(!ctx.verify(b"other data", &signature));
        assert!(!ctx.verify(b"header data", &signature[..16]));
        assert!(!ctx.verify(b"header data", &[]));
    }

    #[test]
    fn wrap_is_deterministic() {
        let ctx = context("device-1");
        let a = ctx.wrap(b"session keys").unwrap();
        let b = ctx.wrap(b"session keys").unwrap();

        assert_eq!(a, b);
        assert_eq!(ctx.unwrap(&a).unwrap(), b"session keys");
    }

    #[test]
    fn unwrap_rejects_foreign_wrap_key() {
        let wrapped = context("device-1").wrap(b"session keys").unwrap();
        let other = SymmetricCryptoContext::new("device-1", [0x11; KEY_SIZE], [0x22; KEY_SIZE])
            .with_wrap_key([0x44; KEY_SIZE]);

        assert!(other.unwrap(&wrapped).is_err());
    }

    #[test]
    fn unwrap_rejects_tampered_blob() {
        let ctx = context("device-1");
        let mut wrapped = ctx.wrap(b"session keys").unwrap();
        wrapped[5] ^= 0x80;

        assert!(ctx.unwrap(&wrapped).is_err());
    }

    #[test]
    fn wrap_without_wrap_key_is_unsupported() {
        let ctx = SymmetricCryptoContext::new("device-1", [0x11; KEY_SIZE], [0x22; KEY_SIZE]);

        assert_eq!(ctx.wrap(b"x"), Err(CryptoError::Unsupported { operation: "wrap" }));
        assert_eq!(ctx.unwrap(b"x"), Err(CryptoError::Unsupported { operation: "unwrap" }));
    }

    #[test]
    fn from_slices_rejects_short_keys() {
        let result = SymmetricCryptoContext::from_slices("id", &[0u8; 16], &[0u8; 32]);
        assert_eq!(result.err(), Some(CryptoError::InvalidKeyLength { expected: 32, actual: 16 }));
    }

    #[test]
    fn debug_redacts_keys() {
        let rendered = format!("{:?}", context("device-1"));
        assert!(rendered.contains("device-1"));
        assert!(!rendered.contains("17"), "key bytes must not be printed");
    }

    proptest::proptest! {
        #[test]
        fn any_flipped_bit_is_rejected(
            plaintext in proptest::collection::vec(proptest::num::u8::ANY, 0..256),
            index in proptest::num::usize::ANY,
            bit in 0u8..8,
        ) {
            let ctx = context("device-1");
            let mut ciphertext = ctx.encrypt(&plaintext, &[0x05; 32]).unwrap();
            let index = index % ciphertext.len();
            ciphertext[index] ^= 1 << bit;

            proptest::prop_assert!(ctx.decrypt(&ciphertext).is_err());
        }
    }
}
