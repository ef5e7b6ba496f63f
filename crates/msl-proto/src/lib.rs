//! Message Security Layer Wire Protocol
//!
//! Serializable structures for everything that crosses the wire: token
//! envelopes, message and error headers, key exchange data, payload chunks
//! and response codes. This crate performs no cryptography. Protected fields
//! are opaque byte vectors filled in and checked by `msl-core`.
//!
//! # Encodings
//!
//! Structures encode as binary CBOR or textual JSON through
//! [`EncoderFormat`]. Decoding auto-detects the format, so peers may use
//! either encoding interchangeably.
//!
//! # Counters
//!
//! Serial numbers, sequence numbers and message ids share a 53-bit space
//! ([`MAX_COUNTER`]) and wrap with [`next_counter`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod auth;
pub mod codes;
pub mod encoding;
pub mod errors;
pub mod header;
pub mod keyx;
pub mod tokens;

pub use auth::{EntityAuthData, EntityAuthScheme, UserAuthData, UserAuthScheme};
pub use codes::{MAX_COUNTER, ResponseCode, next_counter};
pub use encoding::{EncoderFormat, decode};
pub use errors::{ProtocolError, Result};
pub use header::{ErrorData, HeaderData, HeaderEnvelope, PayloadData, PayloadEnvelope, WireMessage};
pub use keyx::{
    KeyExchangeScheme, KeyRequestData, KeyResponseData, KeyResponseParams, LadderMechanism,
    SymmetricKeyId,
};
pub use tokens::{
    MasterTokenData, ServiceTokenData, SessionData, TokenEnvelope, UserData, UserIdTokenData,
};
