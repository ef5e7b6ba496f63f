//! The crypto context contract and the null context.

use crate::error::CryptoError;

/// Size of the caller-supplied entropy block (32 bytes).
pub const ENTROPY_SIZE: usize = 32;

/// Caller-supplied randomness for operations that need it.
///
/// Symmetric encryption takes its nonce from the first 24 bytes; sealed-box
/// encryption uses all 32 bytes as the ephemeral X25519 secret.
pub type Entropy = [u8; ENTROPY_SIZE];

/// Protects opaque byte payloads.
///
/// # Invariants
///
/// - `decrypt(encrypt(p, e)) == p` for every entropy block `e`
/// - `unwrap(wrap(k)) == k`
/// - `verify(d, sign(d)) == true`
/// - `verify` never fails: a malformed or mismatched signature is `false`
///
/// # Concurrency
///
/// Implementations hold no mutable state. A single context is cached in the
/// token store and shared across concurrent requests through `Arc`.
pub trait CryptoContext: Send + Sync {
    /// Encrypt `plaintext`, drawing any randomness from `entropy`.
    fn encrypt(&self, plaintext: &[u8], entropy: &Entropy) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt ciphertext produced by [`Self::encrypt`].
    ///
    /// # Errors
    ///
    /// - `DecryptionFailed` on tamper or wrong key
    /// - `MalformedEnvelope` on a truncated or unknown envelope
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Sign `data`.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verify `signature` over `data`.
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;

    /// Wrap key material for transport.
    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Unwrap key material produced by [`Self::wrap`].
    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// A crypto context where every operation is a no-op.
///
/// Encryption and wrapping pass data through unchanged, signatures are empty
/// and verification always succeeds. Only used for explicitly
/// unauthenticated entities and test scaffolding.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCryptoContext;

impl CryptoContext for NullCryptoContext {
    fn encrypt(&self, plaintext: &[u8], _entropy: &Entropy) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }

    fn sign(&self, _data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(Vec::new())
    }

    fn verify(&self, _data: &[u8], _signature: &[u8]) -> bool {
        true
    }

    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(data.to_vec())
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(wrapped.to_vec())
    }
}
