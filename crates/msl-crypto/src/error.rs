//! Error types for crypto context operations

use thiserror::Error;

/// Errors from crypto context operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Decryption or unwrapping failed (authentication tag mismatch)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Encryption failed
    #[error("encryption failed: {reason}")]
    EncryptionFailed {
        /// Reason for encryption failure
        reason: String,
    },

    /// Ciphertext envelope is structurally invalid
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// What was wrong with the envelope
        reason: String,
    },

    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Public key is malformed or produced a non-contributory shared secret
    #[error("invalid public key: {reason}")]
    InvalidPublicKey {
        /// Why the key was rejected
        reason: String,
    },

    /// The context does not support this operation
    #[error("operation not supported by this crypto context: {operation}")]
    Unsupported {
        /// The rejected operation
        operation: &'static str,
    },

    /// The context lacks the key required for this operation
    #[error("missing key: {key}")]
    MissingKey {
        /// Which key is missing
        key: &'static str,
    },
}

impl CryptoError {
    /// Returns true if this error indicates tampered or foreign ciphertext.
    ///
    /// Configuration problems (missing keys, unsupported operations) are not
    /// tamper evidence; they indicate a local setup bug.
    pub fn is_tamper_evidence(&self) -> bool {
        matches!(self, Self::DecryptionFailed { .. } | Self::MalformedEnvelope { .. })
    }
}
