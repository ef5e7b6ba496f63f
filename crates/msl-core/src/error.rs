//! Error type for the message security layer.
//!
//! A single [`MslError`] carries an [`ErrorKind`], a human readable detail,
//! and an [`ErrorContext`] with the identities and token numbers involved.
//! The kind decides recovery: the orchestrator retries renewable failures
//! once, the responder maps every failure to a wire [`ResponseCode`].

use std::fmt;

use msl_crypto::CryptoError;
use msl_proto::{ProtocolError, ResponseCode};
use thiserror::Error;

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed wire structure. Never retried.
    Encoding,
    /// Signature or decryption failure. Escalates to full re-authentication
    /// when it happens during renewal.
    Crypto,
    /// Token or wrap data expired.
    Expired,
    /// Non-replayable message id already seen.
    Replay,
    /// Structurally valid message that violates protocol rules.
    Message,
    /// No mutually supported key exchange scheme.
    UnsupportedScheme,
    /// Key exchange could not be completed.
    KeyExchange,
    /// Entity authentication failed.
    EntityAuth,
    /// User authentication failed.
    UserAuth,
    /// Transport failed to deliver a message.
    Transport,
    /// Local invariant violation or misconfiguration.
    Internal,
}

impl ErrorKind {
    /// Response code sent to the peer for this kind.
    pub fn response_code(self) -> ResponseCode {
        match self {
            Self::Encoding
            | Self::Crypto
            | Self::Message
            | Self::UnsupportedScheme
            | Self::Internal => ResponseCode::Fail,
            Self::Expired => ResponseCode::Expired,
            Self::Replay => ResponseCode::Replayed,
            Self::KeyExchange => ResponseCode::KeyxRequired,
            Self::EntityAuth => ResponseCode::EntityDataReauth,
            Self::UserAuth => ResponseCode::UserDataReauth,
            Self::Transport => ResponseCode::TransientFailure,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Encoding => "encoding error",
            Self::Crypto => "crypto error",
            Self::Expired => "expired",
            Self::Replay => "replayed message",
            Self::Message => "message error",
            Self::UnsupportedScheme => "unsupported scheme",
            Self::KeyExchange => "key exchange error",
            Self::EntityAuth => "entity authentication error",
            Self::UserAuth => "user authentication error",
            Self::Transport => "transport error",
            Self::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Identities and token numbers attached to an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Entity identity
    pub entity: Option<String>,
    /// User identity
    pub user: Option<String>,
    /// Master token (serial number, sequence number)
    pub master_token: Option<(u64, u64)>,
    /// User id token serial number
    pub user_id_token: Option<u64>,
    /// Message id
    pub message_id: Option<u64>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(entity) = &self.entity {
            write!(f, " entity={entity}")?;
        }
        if let Some(user) = &self.user {
            write!(f, " user={user}")?;
        }
        if let Some((serial, sequence)) = self.master_token {
            write!(f, " master_token={serial}:{sequence}")?;
        }
        if let Some(serial) = self.user_id_token {
            write!(f, " user_id_token={serial}")?;
        }
        if let Some(id) = self.message_id {
            write!(f, " message_id={id}")?;
        }
        Ok(())
    }
}

/// Message security layer error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}{context}")]
pub struct MslError {
    kind: ErrorKind,
    detail: String,
    context: ErrorContext,
    response_code: Option<ResponseCode>,
}

impl MslError {
    /// Create an error of `kind`.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into(), context: ErrorContext::default(), response_code: None }
    }

    /// Malformed wire structure.
    pub fn encoding(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Encoding, detail)
    }

    /// Signature or decryption failure.
    pub fn crypto(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Crypto, detail)
    }

    /// Expired token or wrap data.
    pub fn expired(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expired, detail)
    }

    /// Replayed message.
    pub fn replay(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Replay, detail)
    }

    /// Protocol rule violation.
    pub fn message(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Message, detail)
    }

    /// No mutually supported scheme.
    pub fn unsupported_scheme(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedScheme, detail)
    }

    /// Key exchange failure.
    pub fn key_exchange(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::KeyExchange, detail)
    }

    /// Entity authentication failure.
    pub fn entity_auth(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::EntityAuth, detail)
    }

    /// User authentication failure.
    pub fn user_auth(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::UserAuth, detail)
    }

    /// Transport failure.
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, detail)
    }

    /// Local invariant violation.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    /// Attach the entity identity.
    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.context.entity = Some(entity.into());
        self
    }

    /// Attach the user identity.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.context.user = Some(user.into());
        self
    }

    /// Attach master token numbers.
    #[must_use]
    pub fn with_master_token(mut self, serial_number: u64, sequence_number: u64) -> Self {
        self.context.master_token = Some((serial_number, sequence_number));
        self
    }

    /// Attach a user id token serial number.
    #[must_use]
    pub fn with_user_id_token(mut self, serial_number: u64) -> Self {
        self.context.user_id_token = Some(serial_number);
        self
    }

    /// Attach the message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.context.message_id = Some(message_id);
        self
    }

    /// Override the response code sent to the peer.
    #[must_use]
    pub fn with_response_code(mut self, code: ResponseCode) -> Self {
        self.response_code = Some(code);
        self
    }

    /// Failure category.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human readable detail.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Attached identities and token numbers.
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Response code for the wire: the override if set, else the kind's.
    pub fn response_code(&self) -> ResponseCode {
        self.response_code.unwrap_or_else(|| self.kind.response_code())
    }

    /// Returns true if no amount of renewal or re-authentication can
    /// repair this failure.
    pub fn is_fatal(&self) -> bool {
        !self.response_code().is_renewable()
    }
}

impl From<CryptoError> for MslError {
    fn from(err: CryptoError) -> Self {
        Self::crypto(err.to_string())
    }
}

impl From<ProtocolError> for MslError {
    fn from(err: ProtocolError) -> Self {
        Self::encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_response_codes() {
        assert_eq!(MslError::replay("seen").response_code(), ResponseCode::Replayed);
        assert_eq!(MslError::expired("old").response_code(), ResponseCode::Expired);
        assert_eq!(MslError::user_auth("bad").response_code(), ResponseCode::UserDataReauth);
        assert_eq!(MslError::encoding("bad").response_code(), ResponseCode::Fail);
    }

    #[test]
    fn override_wins() {
        let err = MslError::crypto("master token untrusted").with_response_code(ResponseCode::EntityReauth);
        assert_eq!(err.response_code(), ResponseCode::EntityReauth);
        assert_eq!(err.kind(), ErrorKind::Crypto);
        assert!(!err.is_fatal());
    }

    #[test]
    fn encoding_and_replay_are_fatal() {
        assert!(MslError::encoding("x").is_fatal());
        assert!(MslError::replay("x").is_fatal());
        assert!(MslError::message("x").is_fatal());
        assert!(!MslError::expired("x").is_fatal());
    }

    #[test]
    fn display_includes_context() {
        let err = MslError::expired("master token expired")
            .with_entity("device-1")
            .with_master_token(7, 3)
            .with_message_id(42);

        assert_eq!(
            err.to_string(),
            "expired: master token expired entity=device-1 master_token=7:3 message_id=42"
        );
    }

    #[test]
    fn lower_layer_errors_convert() {
        let crypto: MslError = CryptoError::DecryptionFailed { reason: "tag".to_string() }.into();
        assert_eq!(crypto.kind(), ErrorKind::Crypto);

        let proto: MslError = ProtocolError::Empty.into();
        assert_eq!(proto.kind(), ErrorKind::Encoding);
    }
}
