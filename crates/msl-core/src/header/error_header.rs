//! Error headers.

use msl_crypto::CryptoContext;
use msl_proto::{EncoderFormat, EntityAuthData, ErrorData, HeaderEnvelope, ResponseCode, WireMessage};

use crate::{env::Environment, error::MslError};

/// Signed error report sent in place of a message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorHeader {
    /// Entity authentication data of the sender
    pub entity_auth: EntityAuthData,
    /// Intended recipient
    pub recipient: Option<String>,
    /// Seconds since the epoch at the sender
    pub timestamp: u64,
    /// Message id (the failed request's id plus one)
    pub message_id: u64,
    /// Response code
    pub error_code: ResponseCode,
    /// Sender-specific code
    pub internal_code: Option<i32>,
    /// Developer-facing message
    pub error_message: Option<String>,
    /// User-facing message
    pub user_message: Option<String>,
}

impl ErrorHeader {
    /// Error header reporting `error`.
    pub fn from_error(
        entity_auth: EntityAuthData,
        recipient: Option<String>,
        message_id: u64,
        error: &MslError,
        env: &dyn Environment,
    ) -> Self {
        Self {
            entity_auth,
            recipient,
            timestamp: env.now_secs(),
            message_id,
            error_code: error.response_code(),
            internal_code: None,
            error_message: Some(error.detail().to_string()),
            user_message: None,
        }
    }

    /// Sign and encode with the sender's entity context.
    pub fn encode(&self, ctx: &dyn CryptoContext, format: EncoderFormat) -> Result<Vec<u8>, MslError> {
        let data = ErrorData {
            recipient: self.recipient.clone(),
            timestamp: self.timestamp,
            message_id: self.message_id,
            error_code: self.error_code,
            internal_code: self.internal_code,
            error_message: self.error_message.clone(),
            user_message: self.user_message.clone(),
        };
        let errordata = format.encode(&data)?;
        let signature = ctx.sign(&errordata)?;

        let message = WireMessage {
            header: HeaderEnvelope::Error { entity_auth: self.entity_auth.clone(), errordata, signature },
            payloads: Vec::new(),
        };
        Ok(message.encode(format)?)
    }

    /// Verify and decode wire error data.
    pub(crate) fn from_wire(
        entity_auth: EntityAuthData,
        errordata: &[u8],
        signature: &[u8],
        ctx: &dyn CryptoContext,
    ) -> Result<Self, MslError> {
        if !ctx.verify(errordata, signature) {
            return Err(MslError::crypto("error header signature").with_entity(entity_auth.identity()));
        }
        let data: ErrorData = msl_proto::decode(errordata)?;
        Ok(Self {
            entity_auth,
            recipient: data.recipient,
            timestamp: data.timestamp,
            message_id: data.message_id,
            error_code: data.error_code,
            internal_code: data.internal_code,
            error_message: data.error_message,
            user_message: data.user_message,
        })
    }
}
