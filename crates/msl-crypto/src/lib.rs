//! Message Security Layer Crypto Contexts
//!
//! Every protected byte in the protocol (token data, header data, payload
//! chunks, wrapped key material) goes through a [`CryptoContext`]. The
//! protocol never touches a cipher directly: it only asks a context to
//! encrypt, decrypt, sign, verify, wrap or unwrap.
//!
//! # Context Hierarchy
//!
//! ```text
//! Entity authentication            Key exchange
//!   PSK    -> SymmetricCryptoContext    shared secret / wrapped keys
//!   Signed -> AsymmetricCryptoContext          │
//!   None   -> NullCryptoContext                ▼
//!                                     HKDF -> SessionKeys
//!                                              │
//!                                              ▼
//!                                     SessionCryptoContext
//!                                     (master token session)
//! ```
//!
//! # Determinism
//!
//! Operations that need randomness take an [`Entropy`] block supplied by the
//! caller. Given the same inputs every context produces the same output,
//! which keeps protocol tests reproducible. Callers MUST supply
//! cryptographically secure entropy in production.
//!
//! # Security
//!
//! - Confidentiality and integrity: XChaCha20-Poly1305 with the key id bound
//!   as associated data, so ciphertext cannot be replayed under another key.
//! - Signatures: HMAC-SHA256 (constant-time verification) or Ed25519.
//! - Key wrapping: deterministic synthetic-IV construction; wrapping the same
//!   key twice yields the same blob and any bit flip fails unwrapping.
//! - Key material is zeroized on drop.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod agreement;
mod asymmetric;
mod context;
mod derivation;
mod error;
mod session;
mod symmetric;

pub use agreement::X25519KeyPair;
pub use asymmetric::{AsymmetricCryptoContext, AsymmetricMode};
pub use context::{CryptoContext, ENTROPY_SIZE, Entropy, NullCryptoContext};
pub use derivation::{derive_session_keys, derive_subkey};
pub use error::CryptoError;
pub use session::{SessionCryptoContext, SessionKeys};
pub use symmetric::{KEY_SIZE, SymmetricCryptoContext};
