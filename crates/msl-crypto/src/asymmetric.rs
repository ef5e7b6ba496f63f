//! Public key crypto context.
//!
//! Signatures are Ed25519. Encryption is an X25519 sealed box: the caller's
//! entropy becomes an ephemeral secret, and the shared secret with the
//! recipient's static key is expanded by HKDF into an `XChaCha20` key and nonce.
//!
//! ```text
//! ┌─────────┬──────────────────┬───────────────────────────┐
//! │ version │ ephemeral pk (32)│ ciphertext || tag (16)    │
//! └─────────┴──────────────────┴───────────────────────────┘
//! ```

use std::fmt;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{
    context::{CryptoContext, Entropy},
    error::CryptoError,
    symmetric::NONCE_SIZE,
};

const SEALED_BOX_VERSION: u8 = 0x02;
const SEALED_BOX_LABEL: &[u8] = b"msl sealed box";
const PUBLIC_KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;

/// Which operations an [`AsymmetricCryptoContext`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsymmetricMode {
    /// Sign and verify; encryption passes data through unchanged.
    SignVerify,
    /// Encrypt and decrypt; signatures are empty and always verify.
    EncryptDecrypt,
    /// Both signatures and encryption.
    All,
}

impl AsymmetricMode {
    fn signs(self) -> bool {
        matches!(self, Self::SignVerify | Self::All)
    }

    fn encrypts(self) -> bool {
        matches!(self, Self::EncryptDecrypt | Self::All)
    }
}

/// Crypto context over Ed25519 and X25519 keys.
///
/// Either half of each key pair may be absent: a verifier holds only the
/// verifying key, an encrypting peer holds only the recipient's public key.
/// Operations needing a missing key fail with `MissingKey`.
#[derive(Clone)]
pub struct AsymmetricCryptoContext {
    key_id: String,
    mode: AsymmetricMode,
    signing_key: Option<SigningKey>,
    verifying_key: Option<VerifyingKey>,
    encryption_secret: Option<StaticSecret>,
    encryption_public: Option<PublicKey>,
}

impl AsymmetricCryptoContext {
    /// Create a context with no keys.
    pub fn new(key_id: impl Into<String>, mode: AsymmetricMode) -> Self {
        Self {
            key_id: key_id.into(),
            mode,
            signing_key: None,
            verifying_key: None,
            encryption_secret: None,
            encryption_public: None,
        }
    }

    /// Install an Ed25519 signing key; the verifying key is derived from it.
    #[must_use]
    pub fn with_signing_key(mut self, seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        self.verifying_key = Some(signing_key.verifying_key());
        self.signing_key = Some(signing_key);
        self
    }

    /// Install an Ed25519 verifying key.
    ///
    /// # Errors
    ///
    /// - `InvalidPublicKey` if the bytes are not a valid curve point
    pub fn with_verifying_key(mut self, public_key: &[u8; 32]) -> Result<Self, CryptoError> {
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| CryptoError::InvalidPublicKey { reason: e.to_string() })?;
        self.verifying_key = Some(key);
        Ok(self)
    }

    /// Install an X25519 secret; the public key is derived from it.
    #[must_use]
    pub fn with_encryption_secret(mut self, secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        self.encryption_public = Some(PublicKey::from(&secret));
        self.encryption_secret = Some(secret);
        self
    }

    /// Install the recipient's X25519 public key.
    #[must_use]
    pub fn with_encryption_public_key(mut self, public_key: [u8; 32]) -> Self {
        self.encryption_public = Some(PublicKey::from(public_key));
        self
    }

    /// Key identifier.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Operating mode.
    pub fn mode(&self) -> AsymmetricMode {
        self.mode
    }

    /// Ed25519 verifying key bytes, if present.
    pub fn verifying_key_bytes(&self) -> Option<[u8; 32]> {
        self.verifying_key.map(|k| k.to_bytes())
    }

    /// X25519 public key bytes, if present.
    pub fn encryption_public_key_bytes(&self) -> Option<[u8; 32]> {
        self.encryption_public.map(|k| k.to_bytes())
    }

    fn sealed_box_cipher(
        &self,
        shared: &[u8; 32],
        ephemeral: &PublicKey,
        recipient: &PublicKey,
    ) -> (XChaCha20Poly1305, [u8; NONCE_SIZE]) {
        let hkdf = Hkdf::<Sha256>::new(Some(SEALED_BOX_LABEL), shared);

        let mut info = Vec::with_capacity(2 * PUBLIC_KEY_SIZE);
        info.extend_from_slice(ephemeral.as_bytes());
        info.extend_from_slice(recipient.as_bytes());

        let mut okm = [0u8; 32 + NONCE_SIZE];
        let Ok(()) = hkdf.expand(&info, &mut okm) else {
            unreachable!("56 bytes is a valid HKDF-SHA256 output length");
        };

        let mut key = [0u8; 32];
        let mut nonce = [0u8; NONCE_SIZE];
        key.copy_from_slice(&okm[..32]);
        nonce.copy_from_slice(&okm[32..]);

        let cipher = XChaCha20Poly1305::new((&key).into());
        key.zeroize();
        okm.zeroize();
        (cipher, nonce)
    }
}

impl CryptoContext for AsymmetricCryptoContext {
    fn encrypt(&self, plaintext: &[u8], entropy: &Entropy) -> Result<Vec<u8>, CryptoError> {
        if !self.mode.encrypts() {
            return Ok(plaintext.to_vec());
        }
        let recipient =
            self.encryption_public.ok_or(CryptoError::MissingKey { key: "encryption public key" })?;

        let ephemeral_secret = StaticSecret::from(*entropy);
        let ephemeral = PublicKey::from(&ephemeral_secret);
        let shared = ephemeral_secret.diffie_hellman(&recipient);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey {
                reason: "non-contributory shared secret".to_string(),
            });
        }

        let (cipher, nonce) = self.sealed_box_cipher(shared.as_bytes(), &ephemeral, &recipient);
        let Ok(ciphertext) = cipher.encrypt(
            XNonce::from_slice(&nonce),
            Payload { msg: plaintext, aad: self.key_id.as_bytes() },
        ) else {
            unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
        };

        let mut sealed = Vec::with_capacity(1 + PUBLIC_KEY_SIZE + ciphertext.len());
        sealed.push(SEALED_BOX_VERSION);
        sealed.extend_from_slice(ephemeral.as_bytes());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.mode.encrypts() {
            return Ok(ciphertext.to_vec());
        }
        let secret = self
            .encryption_secret
            .as_ref()
            .ok_or(CryptoError::MissingKey { key: "encryption secret key" })?;

        if ciphertext.len() < 1 + PUBLIC_KEY_SIZE + TAG_SIZE {
            return Err(CryptoError::MalformedEnvelope {
                reason: format!("sealed box too short: {} bytes", ciphertext.len()),
            });
        }
        if ciphertext[0] != SEALED_BOX_VERSION {
            return Err(CryptoError::MalformedEnvelope {
                reason: format!("unknown sealed box version {:#04x}", ciphertext[0]),
            });
        }

        let mut ephemeral_bytes = [0u8; PUBLIC_KEY_SIZE];
        ephemeral_bytes.copy_from_slice(&ciphertext[1..=PUBLIC_KEY_SIZE]);
        let ephemeral = PublicKey::from(ephemeral_bytes);
        let recipient = PublicKey::from(secret);

        let shared = secret.diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey {
                reason: "non-contributory shared secret".to_string(),
            });
        }

        let (cipher, nonce) = self.sealed_box_cipher(shared.as_bytes(), &ephemeral, &recipient);
        cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload { msg: &ciphertext[1 + PUBLIC_KEY_SIZE..], aad: self.key_id.as_bytes() },
            )
            .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() })
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.mode.signs() {
            return Ok(Vec::new());
        }
        let signing_key = self.signing_key.as_ref().ok_or(CryptoError::MissingKey { key: "signing key" })?;
        Ok(signing_key.sign(data).to_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        if !self.mode.signs() {
            return true;
        }
        let Some(verifying_key) = self.verifying_key.as_ref() else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify_strict(data, &signature).is_ok()
    }

    fn wrap(&self, _data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::Unsupported { operation: "wrap" })
    }

    fn unwrap(&self, _wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::Unsupported { operation: "unwrap" })
    }
}

impl fmt::Debug for AsymmetricCryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsymmetricCryptoContext")
            .field("key_id", &self.key_id)
            .field("mode", &self.mode)
            .field("can_sign", &self.signing_key.is_some())
            .field("can_decrypt", &self.encryption_secret.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNING_SEED: [u8; 32] = [0x07; 32];
    const ENCRYPTION_SECRET: [u8; 32] = [0x09; 32];

    fn full_context() -> AsymmetricCryptoContext {
        AsymmetricCryptoContext::new("server", AsymmetricMode::All)
            .with_signing_key(SIGNING_SEED)
            .with_encryption_secret(ENCRYPTION_SECRET)
    }

    #[test]
    fn sign_verify_roundtrip() {
        let ctx = full_context();
        let signature = ctx.sign(b"header").unwrap();

        assert_eq!(signature.len(), 64);
        assert!(ctx.verify(b"header", &signature));
        assert!(!ctx.verify(b"tampered", &signature));
        assert!(!ctx.verify(b"header", b"garbage"));
    }

    #[test]
    fn verify_only_context_accepts_peer_signature() {
        let signer = full_context();
        let public = signer.verifying_key_bytes().unwrap();
        let verifier = AsymmetricCryptoContext::new("server", AsymmetricMode::SignVerify)
            .with_verifying_key(&public)
            .unwrap();

        let signature = signer.sign(b"header").unwrap();
        assert!(verifier.verify(b"header", &signature));
        assert_eq!(verifier.sign(b"header"), Err(CryptoError::MissingKey { key: "signing key" }));
    }

    #[test]
    fn sealed_box_roundtrip() {
        let recipient = full_context();
        let sender = AsymmetricCryptoContext::new("server", AsymmetricMode::EncryptDecrypt)
            .with_encryption_public_key(recipient.encryption_public_key_bytes().unwrap());

        let sealed = sender.encrypt(b"session keys", &[0x33; 32]).unwrap();
        assert_eq!(recipient.decrypt(&sealed).unwrap(), b"session keys");
        assert_eq!(
            sender.decrypt(&sealed),
            Err(CryptoError::MissingKey { key: "encryption secret key" })
        );
    }

    #[test]
    fn sealed_box_rejects_tamper() {
        let ctx = full_context();
        let mut sealed = ctx.encrypt(b"session keys", &[0x33; 32]).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(ctx.decrypt(&sealed), Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn sign_verify_mode_passes_encryption_through() {
        let ctx = AsymmetricCryptoContext::new("entity", AsymmetricMode::SignVerify)
            .with_signing_key(SIGNING_SEED);

        assert_eq!(ctx.encrypt(b"clear", &[0u8; 32]).unwrap(), b"clear");
        assert_eq!(ctx.decrypt(b"clear").unwrap(), b"clear");
    }

    #[test]
    fn encrypt_decrypt_mode_skips_signatures() {
        let ctx = AsymmetricCryptoContext::new("entity", AsymmetricMode::EncryptDecrypt)
            .with_encryption_secret(ENCRYPTION_SECRET);

        assert!(ctx.sign(b"data").unwrap().is_empty());
        assert!(ctx.verify(b"data", b""));
    }

    #[test]
    fn wrap_is_unsupported() {
        let ctx = full_context();
        assert_eq!(ctx.wrap(b"key"), Err(CryptoError::Unsupported { operation: "wrap" }));
        assert_eq!(ctx.unwrap(b"key"), Err(CryptoError::Unsupported { operation: "unwrap" }));
    }
}
