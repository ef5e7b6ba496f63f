//! Key exchange request and response data.

use serde::{Deserialize, Serialize};

use crate::tokens::TokenEnvelope;

/// Key exchange scheme identifier.
///
/// Ordering is only used for deterministic iteration; negotiation follows
/// the requester's preference list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyExchangeScheme {
    /// Session keys wrapped under a symmetric key
    SymmetricWrapped,
    /// Session keys sealed to an ephemeral X25519 key
    AsymmetricWrapped,
    /// X25519 Diffie-Hellman
    DiffieHellman,
    /// Rotating wrapping keys with responder-sealed wrap data
    WrapLadder,
}

/// Symmetric key used to wrap fresh session keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymmetricKeyId {
    /// The entity's pre-shared key
    Psk,
    /// The current master token's session keys
    Session,
}

/// Wrapping key used by the wrap ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LadderMechanism {
    /// The entity's pre-shared key (first exchange)
    Psk,
    /// The wrapping key from the previous exchange
    Wrap,
}

/// Requester half of a key exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRequestData {
    /// Ask for session keys wrapped under a symmetric key.
    SymmetricWrapped {
        /// Which key wraps the response
        key_id: SymmetricKeyId,
    },
    /// Ask for session keys sealed to `public_key`.
    AsymmetricWrapped {
        /// Requester-chosen key pair identifier
        key_pair_id: String,
        /// Ephemeral X25519 public key
        public_key: Vec<u8>,
    },
    /// Offer a Diffie-Hellman public key.
    DiffieHellman {
        /// Parameter set identifier
        parameters_id: String,
        /// Requester X25519 public key
        public_key: Vec<u8>,
    },
    /// Ask for a new rung of the wrap ladder.
    WrapLadder {
        /// Which key wraps the new wrapping key
        mechanism: LadderMechanism,
        /// Wrap data from the previous exchange (required for `Wrap`)
        wrapdata: Option<Vec<u8>>,
    },
}

impl KeyRequestData {
    /// Scheme of this request.
    pub fn scheme(&self) -> KeyExchangeScheme {
        match self {
            Self::SymmetricWrapped { .. } => KeyExchangeScheme::SymmetricWrapped,
            Self::AsymmetricWrapped { .. } => KeyExchangeScheme::AsymmetricWrapped,
            Self::DiffieHellman { .. } => KeyExchangeScheme::DiffieHellman,
            Self::WrapLadder { .. } => KeyExchangeScheme::WrapLadder,
        }
    }
}

/// Scheme-specific part of a key exchange response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyResponseParams {
    /// Session keys wrapped under the requested symmetric key.
    SymmetricWrapped {
        /// Key used for wrapping
        key_id: SymmetricKeyId,
        /// Wrapped encryption key
        encryption_key: Vec<u8>,
        /// Wrapped HMAC key
        hmac_key: Vec<u8>,
    },
    /// Session keys sealed to the requester's public key.
    AsymmetricWrapped {
        /// Echo of the requester's key pair identifier
        key_pair_id: String,
        /// Sealed encryption key
        encryption_key: Vec<u8>,
        /// Sealed HMAC key
        hmac_key: Vec<u8>,
    },
    /// Responder Diffie-Hellman public key.
    DiffieHellman {
        /// Parameter set identifier
        parameters_id: String,
        /// Responder X25519 public key
        public_key: Vec<u8>,
    },
    /// New wrapping key and session keys.
    WrapLadder {
        /// New wrapping key, wrapped under the previous one
        wrap_key: Vec<u8>,
        /// Opaque blob to echo on the next exchange
        wrapdata: Vec<u8>,
        /// Encryption key wrapped under the new wrapping key
        encryption_key: Vec<u8>,
        /// HMAC key wrapped under the new wrapping key
        hmac_key: Vec<u8>,
    },
}

impl KeyResponseParams {
    /// Scheme of this response.
    pub fn scheme(&self) -> KeyExchangeScheme {
        match self {
            Self::SymmetricWrapped { .. } => KeyExchangeScheme::SymmetricWrapped,
            Self::AsymmetricWrapped { .. } => KeyExchangeScheme::AsymmetricWrapped,
            Self::DiffieHellman { .. } => KeyExchangeScheme::DiffieHellman,
            Self::WrapLadder { .. } => KeyExchangeScheme::WrapLadder,
        }
    }
}

/// Responder half of a key exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResponseData {
    /// Newly issued or renewed master token
    pub master_token: TokenEnvelope,
    /// Scheme-specific parameters
    pub params: KeyResponseParams,
}

impl KeyResponseData {
    /// Scheme of this response.
    pub fn scheme(&self) -> KeyExchangeScheme {
        self.params.scheme()
    }
}
