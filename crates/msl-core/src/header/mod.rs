//! Message header protocol.
//!
//! A message is a header followed by payload chunks:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ master token | entity auth data    (clear)   │
//! │ headerdata   = encrypt(HeaderData) (header)  │
//! │ signature    = sign(headerdata)    (header)  │
//! ├──────────────────────────────────────────────┤
//! │ payload 1..n = encrypt + sign      (message) │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The header context is the session context of the carried master token,
//! or the entity authentication context when the sender has no master
//! token. The message context protecting payloads is the key exchange
//! session when the header carries key response data, and the header
//! context otherwise.
//!
//! Error headers replace the message header on failure. They are signed by
//! the sender's entity context, never encrypted, and carry no payload.

mod error_header;
mod payload;
pub mod receive;
mod replay;

pub use error_header::ErrorHeader;
use msl_crypto::CryptoContext;
use msl_proto::{
    EntityAuthData, HeaderData, HeaderEnvelope, KeyRequestData, KeyResponseData, MAX_COUNTER, UserAuthData,
    WireMessage,
};
pub use receive::{
    IssuerSessions, ParsedMessage, ReceiveContext, ReceivedMessage, ResponseKeyExchange, SessionResolver,
    parse_message,
};
pub use replay::{ReplayGuard, ReplayWindow, ReplayWindows};

use crate::{
    config::MslConfig,
    env::Environment,
    error::MslError,
    tokens::{MasterToken, ServiceToken, UserIdToken},
};

/// How the sender identifies itself in a message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAuth {
    /// Entity authentication data (no master token yet)
    EntityAuth(EntityAuthData),
    /// Master token issued by the responder
    MasterToken(MasterToken),
}

/// Crypto contexts protecting an outgoing message.
#[derive(Clone, Copy)]
pub struct MessageContexts<'a> {
    /// Protects the header data
    pub header: &'a dyn CryptoContext,
    /// Protects the payload chunks
    pub payload: &'a dyn CryptoContext,
}

impl<'a> MessageContexts<'a> {
    /// Header and payload protected by the same context.
    pub fn single(ctx: &'a dyn CryptoContext) -> Self {
        Self { header: ctx, payload: ctx }
    }
}

/// Outgoing message header.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    /// Sender identification
    pub auth: HeaderAuth,
    /// Sender identity, if disclosed
    pub sender: Option<String>,
    /// Message id (53-bit)
    pub message_id: u64,
    /// Non-replayable id (requires a master token)
    pub non_replayable_id: Option<u64>,
    /// Sender permits key exchange and token renewal in the response
    pub renewable: bool,
    /// Message exists only to perform a handshake
    pub handshake: bool,
    /// Key exchange requests in preference order
    pub key_request_data: Vec<KeyRequestData>,
    /// Key exchange response
    pub key_response_data: Option<KeyResponseData>,
    /// User authentication data
    pub user_auth_data: Option<UserAuthData>,
    /// User id token
    pub user_id_token: Option<UserIdToken>,
    /// Service tokens
    pub service_tokens: Vec<ServiceToken>,
}

impl MessageHeader {
    /// Empty header with `auth` and `message_id`.
    pub fn new(auth: HeaderAuth, message_id: u64) -> Self {
        Self {
            auth,
            sender: None,
            message_id,
            non_replayable_id: None,
            renewable: false,
            handshake: false,
            key_request_data: Vec::new(),
            key_response_data: None,
            user_auth_data: None,
            user_id_token: None,
            service_tokens: Vec::new(),
        }
    }

    /// Master token carried in the header.
    pub fn master_token(&self) -> Option<&MasterToken> {
        match &self.auth {
            HeaderAuth::MasterToken(mt) => Some(mt),
            HeaderAuth::EntityAuth(_) => None,
        }
    }

    /// Check ids and token bindings before encoding.
    ///
    /// # Errors
    ///
    /// - `Encoding` if an id is outside the 53-bit counter space
    /// - `Message` if a token binding does not match the header
    pub fn validate(&self) -> Result<(), MslError> {
        if self.message_id > MAX_COUNTER {
            return Err(MslError::encoding(format!("message id {} out of range", self.message_id)));
        }
        if let Some(id) = self.non_replayable_id {
            if id > MAX_COUNTER {
                return Err(MslError::encoding(format!("non-replayable id {id} out of range")));
            }
            if self.master_token().is_none() {
                return Err(MslError::message("non-replayable message without a master token")
                    .with_message_id(self.message_id));
            }
        }

        let response_master_token = match &self.key_response_data {
            Some(response) => Some(MasterToken::parse(response.master_token.clone(), None)?),
            None => None,
        };
        let binding = response_master_token.as_ref().or(self.master_token());

        if let Some(uit) = &self.user_id_token
            && !binding.is_some_and(|mt| uit.is_bound_to(mt))
        {
            return Err(MslError::message("user id token not bound to the header master token")
                .with_user_id_token(uit.serial_number())
                .with_message_id(self.message_id));
        }
        for token in &self.service_tokens {
            let mt_ok = token.mt_serial_number().is_none_or(|s| binding.map(MasterToken::serial_number) == Some(s));
            let uit_ok = token
                .uit_serial_number()
                .is_none_or(|s| self.user_id_token.as_ref().map(UserIdToken::serial_number) == Some(s));
            if !mt_ok || !uit_ok {
                return Err(MslError::message(format!(
                    "service token {} bound to tokens not in the header",
                    token.name()
                ))
                .with_message_id(self.message_id));
            }
        }
        Ok(())
    }

    /// Protect and encode this header and `payload` as one message.
    ///
    /// The payload is split into chunks of at most
    /// `config.payload_chunk_size` bytes; an empty payload is sent as one
    /// empty end-of-message chunk.
    ///
    /// # Errors
    ///
    /// - `Encoding` or `Message` if [`validate`](Self::validate) fails
    /// - `Crypto` if a context cannot encrypt or sign
    pub fn encode(
        &self,
        contexts: MessageContexts<'_>,
        payload: &[u8],
        env: &dyn Environment,
        config: &MslConfig,
    ) -> Result<Vec<u8>, MslError> {
        self.validate()?;
        let format = config.encoding;

        let data = HeaderData {
            sender: self.sender.clone(),
            timestamp: env.now_secs(),
            message_id: self.message_id,
            non_replayable_id: self.non_replayable_id,
            renewable: self.renewable,
            handshake: self.handshake,
            key_request_data: self.key_request_data.clone(),
            key_response_data: self.key_response_data.clone(),
            user_auth_data: self.user_auth_data.clone(),
            user_id_token: self.user_id_token.as_ref().map(|t| t.envelope().clone()),
            service_tokens: self.service_tokens.iter().map(|t| t.envelope().clone()).collect(),
        };
        let plain = format.encode(&data)?;
        let headerdata = contexts.header.encrypt(&plain, &env.entropy())?;
        let signature = contexts.header.sign(&headerdata)?;

        let (entity_auth, master_token) = match &self.auth {
            HeaderAuth::EntityAuth(data) => (Some(data.clone()), None),
            HeaderAuth::MasterToken(mt) => (None, Some(mt.envelope().clone())),
        };

        let payloads = payload::encode_chunks(
            self.message_id,
            payload,
            contexts.payload,
            env,
            format,
            config.payload_chunk_size,
        )?;

        let message = WireMessage {
            header: HeaderEnvelope::Message { entity_auth, master_token, headerdata, signature },
            payloads,
        };
        Ok(message.encode(format)?)
    }
}

#[cfg(test)]
mod tests {
    use msl_crypto::{SessionKeys, SymmetricCryptoContext};
    use msl_proto::EncoderFormat;

    use super::*;
    use crate::{
        auth::MslUser,
        env::FixedEnv,
        error::ErrorKind,
        tokens::{MasterTokenFields, UserIdTokenFields},
    };

    const NOW: u64 = 1_700_000_000;

    fn issuer() -> SymmetricCryptoContext {
        SymmetricCryptoContext::new("issuer", [1; 32], [2; 32])
    }

    fn master_token(serial_number: u64) -> MasterToken {
        let env = FixedEnv::new(NOW, 1);
        let keys = SessionKeys::new([3; 32], [4; 32]);
        let fields = MasterTokenFields {
            renewal_window: NOW + 100,
            expiration: NOW + 200,
            sequence_number: 1,
            serial_number,
            identity: "device-1",
            keys: &keys,
        };
        MasterToken::create(fields, &issuer(), &env, EncoderFormat::Cbor).unwrap()
    }

    fn user_id_token(mt: &MasterToken) -> UserIdToken {
        let env = FixedEnv::new(NOW, 2);
        let user = MslUser::new("kirito");
        let fields = UserIdTokenFields { renewal_window: NOW + 10, expiration: NOW + 20, serial_number: 3, user: &user };
        UserIdToken::create(fields, mt, &issuer(), &env, EncoderFormat::Cbor).unwrap()
    }

    #[test]
    fn non_replayable_requires_master_token() {
        let mut header =
            MessageHeader::new(HeaderAuth::EntityAuth(EntityAuthData::Psk { identity: "device-1".to_string() }), 1);
        header.non_replayable_id = Some(1);

        assert_eq!(header.validate().unwrap_err().kind(), ErrorKind::Message);
    }

    #[test]
    fn user_id_token_must_bind_header_master_token() {
        let mut header = MessageHeader::new(HeaderAuth::MasterToken(master_token(2)), 1);
        header.user_id_token = Some(user_id_token(&master_token(1)));
        assert_eq!(header.validate().unwrap_err().kind(), ErrorKind::Message);

        header.auth = HeaderAuth::MasterToken(master_token(1));
        assert!(header.validate().is_ok());
    }

    #[test]
    fn message_id_outside_counter_space() {
        let header = MessageHeader::new(HeaderAuth::MasterToken(master_token(1)), MAX_COUNTER + 1);
        assert_eq!(header.validate().unwrap_err().kind(), ErrorKind::Encoding);
    }
}
