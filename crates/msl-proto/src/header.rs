//! Message and error header wire structures.
//!
//! ```text
//! WireMessage
//! ├── header: HeaderEnvelope
//! │   ├── Message { entity_auth | master_token, headerdata, signature }
//! │   └── Error   { entity_auth, errordata, signature }
//! └── payloads: [PayloadEnvelope { payload, signature }]
//! ```
//!
//! `headerdata` is an encoded [`HeaderData`] encrypted under the header
//! crypto context; `errordata` is an encoded [`ErrorData`] in the clear.
//! Signatures cover the protected bytes exactly as transmitted.

use serde::{Deserialize, Serialize};

use crate::{
    auth::{EntityAuthData, UserAuthData},
    codes::ResponseCode,
    encoding::{self, EncoderFormat},
    errors::Result,
    keyx::{KeyRequestData, KeyResponseData},
    tokens::TokenEnvelope,
};

/// Complete message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message or error header
    pub header: HeaderEnvelope,
    /// Payload chunks, in order (always empty for error headers)
    pub payloads: Vec<PayloadEnvelope>,
}

impl WireMessage {
    /// Encode in `format`.
    ///
    /// # Errors
    ///
    /// - `CborEncode` / `JsonEncode` if serialization fails
    pub fn encode(&self, format: EncoderFormat) -> Result<Vec<u8>> {
        format.encode(self)
    }

    /// Decode from either encoding.
    ///
    /// # Errors
    ///
    /// - `Empty`, `CborDecode` or `JsonDecode` on malformed input
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        encoding::decode(bytes)
    }
}

/// Protected header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderEnvelope {
    /// Message header.
    Message {
        /// Sender entity authentication (when no master token is used)
        entity_auth: Option<EntityAuthData>,
        /// Sender master token
        master_token: Option<TokenEnvelope>,
        /// Encrypted [`HeaderData`]
        headerdata: Vec<u8>,
        /// Signature over `headerdata`
        signature: Vec<u8>,
    },
    /// Error header.
    Error {
        /// Sender entity authentication
        entity_auth: EntityAuthData,
        /// Encoded [`ErrorData`]
        errordata: Vec<u8>,
        /// Signature over `errordata`
        signature: Vec<u8>,
    },
}

/// Decrypted message header fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderData {
    /// Sender identity (informational)
    pub sender: Option<String>,
    /// Seconds since epoch when the header was built
    pub timestamp: u64,
    /// Message id
    pub message_id: u64,
    /// Non-replayable id, tracked by the responder
    pub non_replayable_id: Option<u64>,
    /// Whether the sender allows token renewal
    pub renewable: bool,
    /// Whether this is a handshake message
    pub handshake: bool,
    /// Key exchange offers in preference order
    pub key_request_data: Vec<KeyRequestData>,
    /// Key exchange result
    pub key_response_data: Option<KeyResponseData>,
    /// User credentials
    pub user_auth_data: Option<UserAuthData>,
    /// User id token
    pub user_id_token: Option<TokenEnvelope>,
    /// Service tokens
    pub service_tokens: Vec<TokenEnvelope>,
}

/// Error header fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Intended recipient (informational)
    pub recipient: Option<String>,
    /// Seconds since epoch when the header was built
    pub timestamp: u64,
    /// Id of the message being answered
    pub message_id: u64,
    /// How the recipient should recover
    pub error_code: ResponseCode,
    /// Implementation-specific error code
    pub internal_code: Option<i32>,
    /// Developer-facing message
    pub error_message: Option<String>,
    /// Localized user-facing message
    pub user_message: Option<String>,
}

/// Protected payload chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    /// Encrypted [`PayloadData`]
    pub payload: Vec<u8>,
    /// Signature over `payload`
    pub signature: Vec<u8>,
}

/// Decrypted payload chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadData {
    /// Chunk sequence number, starting at 1
    pub sequence_number: u64,
    /// Id of the owning message
    pub message_id: u64,
    /// Whether this is the final chunk
    pub end_of_message: bool,
    /// Application data
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_message() -> WireMessage {
        WireMessage {
            header: HeaderEnvelope::Error {
                entity_auth: EntityAuthData::Signed { identity: "server".to_string() },
                errordata: vec![1, 2, 3],
                signature: vec![4, 5],
            },
            payloads: vec![],
        }
    }

    #[test]
    fn message_decodes_from_either_format() {
        let message = error_message();
        for format in [EncoderFormat::Cbor, EncoderFormat::Json] {
            let bytes = message.encode(format).unwrap();
            assert_eq!(WireMessage::decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn error_code_travels_as_number() {
        let data = ErrorData {
            recipient: None,
            timestamp: 1,
            message_id: 2,
            error_code: ResponseCode::Replayed,
            internal_code: None,
            error_message: None,
            user_message: None,
        };
        let json = String::from_utf8(EncoderFormat::Json.encode(&data).unwrap()).unwrap();
        assert!(json.contains("\"error_code\":9"), "{json}");
    }
}
