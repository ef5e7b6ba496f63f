//! Message validation.
//!
//! [`parse_message`] turns received bytes into a [`ReceivedMessage`]:
//!
//! ```text
//! decode ─► header context ─► verify + decrypt ─► bindings ─► key response
//!                                                                   │
//!             replay ◄── payload ◄── service tokens ◄── user id token
//! ```
//!
//! Both endpoints run the same pipeline. What differs is supplied through
//! [`ReceiveContext`]: the responder holds the issuer context and verifies
//! tokens, the requester resolves sessions from its store and completes a
//! pending key exchange.

use std::{fmt, sync::Arc};

use msl_crypto::CryptoContext;
use msl_proto::{
    HeaderData, HeaderEnvelope, KeyRequestData, KeyResponseData, MAX_COUNTER, ResponseCode, ServiceTokenData,
    UserAuthData, WireMessage,
};

use super::{ErrorHeader, HeaderAuth, ReplayGuard, payload};
use crate::{
    auth::EntityAuthRegistry,
    error::MslError,
    keyx::{KeyExchangeRegistry, NegotiatedSession, PendingKeyExchange, RequesterContext},
    tokens::{MasterToken, ServiceToken, UserIdToken},
};

/// Finds the session context protecting headers sent with a master token.
pub trait SessionResolver: Send + Sync {
    /// Session context for `master_token`.
    ///
    /// # Errors
    ///
    /// - `Crypto` if no context is known for the token
    fn resolve(&self, master_token: &MasterToken) -> Result<Arc<dyn CryptoContext>, MslError>;
}

/// Resolves sessions from the master token itself.
///
/// Only the issuer can decrypt its master tokens, so this is the responder's
/// resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct IssuerSessions;

impl SessionResolver for IssuerSessions {
    fn resolve(&self, master_token: &MasterToken) -> Result<Arc<dyn CryptoContext>, MslError> {
        match master_token.session_crypto_context() {
            Some(ctx) => Ok(Arc::new(ctx)),
            None => Err(MslError::crypto("master token not issued by this entity")
                .with_master_token(master_token.serial_number(), master_token.sequence_number())
                .with_response_code(ResponseCode::EntityDataReauth)),
        }
    }
}

/// Requester state needed to accept a key response.
#[derive(Debug)]
pub struct ResponseKeyExchange<'a> {
    /// Negotiation awaiting this response
    pub pending: &'a mut PendingKeyExchange,
    /// Schemes able to establish the session
    pub registry: &'a KeyExchangeRegistry,
    /// Secrets offered with the request
    pub requester: RequesterContext<'a>,
}

/// What a receiver knows when validating a message.
pub struct ReceiveContext<'a> {
    entity_auth: &'a EntityAuthRegistry,
    sessions: &'a dyn SessionResolver,
    token_context: Option<&'a dyn CryptoContext>,
    service_token_context: Option<&'a dyn CryptoContext>,
    replay: Option<&'a dyn ReplayGuard>,
    key_exchange: Option<ResponseKeyExchange<'a>>,
    expected_message_id: Option<u64>,
}

impl<'a> ReceiveContext<'a> {
    /// Receiver authenticating entities with `entity_auth` and resolving
    /// master token sessions with `sessions`.
    pub fn new(entity_auth: &'a EntityAuthRegistry, sessions: &'a dyn SessionResolver) -> Self {
        Self {
            entity_auth,
            sessions,
            token_context: None,
            service_token_context: None,
            replay: None,
            key_exchange: None,
            expected_message_id: None,
        }
    }

    /// Verify and decrypt master and user id tokens with the issuer context.
    #[must_use]
    pub fn with_token_context(mut self, ctx: &'a dyn CryptoContext) -> Self {
        self.token_context = Some(ctx);
        self
    }

    /// Verify unbound service tokens with `ctx`.
    #[must_use]
    pub fn with_service_token_context(mut self, ctx: &'a dyn CryptoContext) -> Self {
        self.service_token_context = Some(ctx);
        self
    }

    /// Track non-replayable ids with `guard`.
    #[must_use]
    pub fn with_replay_guard(mut self, guard: &'a dyn ReplayGuard) -> Self {
        self.replay = Some(guard);
        self
    }

    /// Complete `key_exchange` if the message carries a key response.
    #[must_use]
    pub fn with_key_exchange(mut self, key_exchange: ResponseKeyExchange<'a>) -> Self {
        self.key_exchange = Some(key_exchange);
        self
    }

    /// Require the message to answer a request with id `request_id`.
    #[must_use]
    pub fn expecting_response_to(mut self, request_id: u64) -> Self {
        self.expected_message_id = Some(msl_proto::next_counter(request_id));
        self
    }

    fn check_message_id(&self, message_id: u64) -> Result<(), MslError> {
        match self.expected_message_id {
            Some(expected) if expected != message_id => Err(MslError::message(format!(
                "response id {message_id} does not answer request (expected {expected})"
            ))
            .with_message_id(message_id)),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for ReceiveContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveContext")
            .field("token_context", &self.token_context.is_some())
            .field("service_token_context", &self.service_token_context.is_some())
            .field("replay", &self.replay.is_some())
            .field("key_exchange", &self.key_exchange.is_some())
            .field("expected_message_id", &self.expected_message_id)
            .finish_non_exhaustive()
    }
}

/// Validated incoming message or error.
#[derive(Debug)]
pub enum ReceivedMessage {
    /// Message header and payload
    Message(Box<ParsedMessage>),
    /// Error header
    Error(ErrorHeader),
}

/// Validated message header with its reassembled payload.
pub struct ParsedMessage {
    /// Sender identification
    pub auth: HeaderAuth,
    /// Context that protected the header
    pub header_context: Arc<dyn CryptoContext>,
    /// Sender identity, if disclosed
    pub sender: Option<String>,
    /// Sender timestamp
    pub timestamp: u64,
    /// Message id
    pub message_id: u64,
    /// Non-replayable id
    pub non_replayable_id: Option<u64>,
    /// Sender permits renewal in the response
    pub renewable: bool,
    /// Handshake message
    pub handshake: bool,
    /// Key exchange requests in preference order
    pub key_request_data: Vec<KeyRequestData>,
    /// Key exchange response
    pub key_response_data: Option<KeyResponseData>,
    /// Session established from `key_response_data`
    pub negotiated: Option<NegotiatedSession>,
    /// User authentication data
    pub user_auth_data: Option<UserAuthData>,
    /// User id token
    pub user_id_token: Option<UserIdToken>,
    /// Service tokens
    pub service_tokens: Vec<ServiceToken>,
    /// Reassembled payload
    pub payload: Vec<u8>,
}

impl ParsedMessage {
    /// Master token carried in the header.
    pub fn master_token(&self) -> Option<&MasterToken> {
        match &self.auth {
            HeaderAuth::MasterToken(mt) => Some(mt),
            HeaderAuth::EntityAuth(_) => None,
        }
    }

    /// Master token the user id and service tokens are bound to: the
    /// negotiated one when the message carried a key response.
    pub fn binding_master_token(&self) -> Option<&MasterToken> {
        self.negotiated.as_ref().map(|n| &n.master_token).or_else(|| self.master_token())
    }

    /// Identity claimed by the sender's entity authentication data.
    pub fn entity_identity(&self) -> Option<&str> {
        match &self.auth {
            HeaderAuth::EntityAuth(data) => Some(data.identity()),
            HeaderAuth::MasterToken(mt) => mt.identity(),
        }
    }
}

impl fmt::Debug for ParsedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedMessage")
            .field("auth", &self.auth)
            .field("message_id", &self.message_id)
            .field("non_replayable_id", &self.non_replayable_id)
            .field("renewable", &self.renewable)
            .field("handshake", &self.handshake)
            .field("key_request_data", &self.key_request_data.len())
            .field("negotiated", &self.negotiated.is_some())
            .field("user_id_token", &self.user_id_token.as_ref().map(UserIdToken::serial_number))
            .field("service_tokens", &self.service_tokens.len())
            .field("payload", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Decode and validate a received message.
///
/// # Errors
///
/// - `Encoding` on malformed bytes or ids outside the counter space
/// - `Crypto` on signature or decryption failures
/// - `EntityAuth` / `UnsupportedScheme` if the sender cannot be
///   authenticated
/// - `Message` on binding violations, an unexpected message id or a key
///   response nobody asked for; for an authentic error header answering
///   another request, the error carries that header's response code
/// - `Replay` if the replay guard rejects the non-replayable id
/// - the key exchange scheme's error if the session cannot be established
pub fn parse_message(bytes: &[u8], mut ctx: ReceiveContext<'_>) -> Result<ReceivedMessage, MslError> {
    let message = WireMessage::decode(bytes)?;

    let (auth, master_token_envelope, headerdata, signature) = match message.header {
        HeaderEnvelope::Error { entity_auth, errordata, signature } => {
            let entity_context = ctx.entity_auth.crypto_context(&entity_auth)?;
            let header = ErrorHeader::from_wire(entity_auth, &errordata, &signature, entity_context.as_ref())?;
            ctx.check_message_id(header.message_id).map_err(|e| e.with_response_code(header.error_code))?;
            return Ok(ReceivedMessage::Error(header));
        },
        HeaderEnvelope::Message { entity_auth, master_token, headerdata, signature } => {
            (entity_auth, master_token, headerdata, signature)
        },
    };

    let (auth, header_context) = match (master_token_envelope, auth) {
        (Some(envelope), _) => {
            let master_token = MasterToken::parse(envelope, ctx.token_context)?;
            let header_context = ctx.sessions.resolve(&master_token)?;
            (HeaderAuth::MasterToken(master_token), header_context)
        },
        (None, Some(entity_auth)) => {
            let header_context = ctx.entity_auth.crypto_context(&entity_auth)?;
            (HeaderAuth::EntityAuth(entity_auth), header_context)
        },
        (None, None) => return Err(MslError::message("message header without master token or entity auth data")),
    };

    if !header_context.verify(&headerdata, &signature) {
        return Err(MslError::crypto("message header signature"));
    }
    let plain = header_context.decrypt(&headerdata).map_err(|e| MslError::crypto(format!("message header: {e}")))?;
    let data: HeaderData = msl_proto::decode(&plain)?;
    let message_id = data.message_id;

    if message_id > MAX_COUNTER {
        return Err(MslError::encoding(format!("message id {message_id} out of range")));
    }
    ctx.check_message_id(message_id)?;

    let header_master_token = match &auth {
        HeaderAuth::MasterToken(mt) => Some(mt),
        HeaderAuth::EntityAuth(_) => None,
    };

    let non_replayable = match data.non_replayable_id {
        Some(id) if id > MAX_COUNTER => {
            return Err(MslError::encoding(format!("non-replayable id {id} out of range")).with_message_id(message_id));
        },
        Some(id) => match header_master_token {
            Some(master_token) => Some((master_token, id)),
            None => {
                return Err(
                    MslError::message("non-replayable message without a master token").with_message_id(message_id)
                );
            },
        },
        None => None,
    };

    let negotiated = match &data.key_response_data {
        Some(response) => {
            let Some(kx) = ctx.key_exchange.take() else {
                return Err(MslError::message("key response data without a pending key exchange")
                    .with_message_id(message_id));
            };
            Some(kx.pending.establish(kx.registry, &kx.requester, response).map_err(|e| e.with_message_id(message_id))?)
        },
        None => None,
    };

    let binding_master_token = negotiated.as_ref().map(|n| &n.master_token).or(header_master_token);
    let binding_context: Option<&dyn CryptoContext> = match (&negotiated, header_master_token) {
        (Some(session), _) => Some(&session.crypto_context),
        (None, Some(_)) => Some(header_context.as_ref()),
        (None, None) => None,
    };

    let user_id_token = match data.user_id_token {
        Some(envelope) => Some(
            UserIdToken::parse(envelope, binding_master_token, ctx.token_context)
                .map_err(|e| e.with_message_id(message_id))?,
        ),
        None => None,
    };

    let mut service_tokens = Vec::with_capacity(data.service_tokens.len());
    for envelope in data.service_tokens {
        let peek: ServiceTokenData = msl_proto::decode(&envelope.tokendata)?;
        let token_context = if peek.mt_serial_number.is_some() { binding_context } else { ctx.service_token_context };
        let token =
            ServiceToken::parse(envelope, binding_master_token, user_id_token.as_ref(), token_context)
                .map_err(|e| e.with_message_id(message_id))?;
        service_tokens.push(token);
    }

    let payload_context: &dyn CryptoContext = match &negotiated {
        Some(session) => &session.crypto_context,
        None => header_context.as_ref(),
    };
    let payload = payload::decode_chunks(message_id, &message.payloads, payload_context)?;

    // Only a fully validated message consumes its id.
    if let (Some((master_token, id)), Some(guard)) = (non_replayable, ctx.replay) {
        guard.accept(master_token, id).map_err(|e| e.with_message_id(message_id))?;
    }

    tracing::trace!(
        message_id,
        master_token = header_master_token.map(MasterToken::serial_number),
        negotiated = negotiated.is_some(),
        chunks = message.payloads.len(),
        "message validated"
    );

    Ok(ReceivedMessage::Message(Box::new(ParsedMessage {
        auth,
        header_context,
        sender: data.sender,
        timestamp: data.timestamp,
        message_id,
        non_replayable_id: data.non_replayable_id,
        renewable: data.renewable,
        handshake: data.handshake,
        key_request_data: data.key_request_data,
        key_response_data: data.key_response_data,
        negotiated,
        user_auth_data: data.user_auth_data,
        user_id_token,
        service_tokens,
        payload,
    })))
}

#[cfg(test)]
mod tests {
    use msl_crypto::{SessionKeys, SymmetricCryptoContext};
    use msl_proto::{EncoderFormat, EntityAuthData};

    use super::*;
    use crate::{
        auth::{MslUser, PskEntityAuth},
        config::MslConfig,
        env::FixedEnv,
        error::ErrorKind,
        header::{MessageContexts, MessageHeader, ReplayWindows},
        tokens::{MasterTokenFields, ServiceTokenFields, UserIdTokenFields},
    };

    const NOW: u64 = 1_700_000_000;

    fn issuer() -> SymmetricCryptoContext {
        SymmetricCryptoContext::new("issuer", [1; 32], [2; 32])
    }

    fn psk() -> SymmetricCryptoContext {
        SymmetricCryptoContext::new("device-1", [5; 32], [6; 32])
    }

    fn registry() -> EntityAuthRegistry {
        EntityAuthRegistry::new().with(PskEntityAuth::new().with_entity("device-1", psk()))
    }

    fn entity_auth() -> HeaderAuth {
        HeaderAuth::EntityAuth(EntityAuthData::Psk { identity: "device-1".to_string() })
    }

    fn master_token(env: &FixedEnv) -> MasterToken {
        let keys = SessionKeys::new([3; 32], [4; 32]);
        let fields = MasterTokenFields {
            renewal_window: NOW + 100,
            expiration: NOW + 200,
            sequence_number: 1,
            serial_number: 42,
            identity: "device-1",
            keys: &keys,
        };
        MasterToken::create(fields, &issuer(), env, EncoderFormat::Cbor).unwrap()
    }

    fn unwrap_message(received: ReceivedMessage) -> ParsedMessage {
        match received {
            ReceivedMessage::Message(message) => *message,
            ReceivedMessage::Error(header) => panic!("unexpected error header: {header:?}"),
        }
    }

    #[test]
    fn entity_authenticated_roundtrip() {
        let env = FixedEnv::new(NOW, 1);
        let config = MslConfig::default();
        let mut header = MessageHeader::new(entity_auth(), 7);
        header.renewable = true;
        let bytes = header.encode(MessageContexts::single(&psk()), b"hello", &env, &config).unwrap();

        let registry = registry();
        let message = unwrap_message(parse_message(&bytes, ReceiveContext::new(&registry, &IssuerSessions)).unwrap());

        assert_eq!(message.payload, b"hello");
        assert_eq!(message.message_id, 7);
        assert_eq!(message.timestamp, NOW);
        assert!(message.renewable);
        assert_eq!(message.entity_identity(), Some("device-1"));
        assert!(message.master_token().is_none());
    }

    #[test]
    fn master_token_roundtrip_carries_tokens() {
        let env = FixedEnv::new(NOW, 1);
        let config = MslConfig::default();
        let mt = master_token(&env);
        let session = mt.session_crypto_context().unwrap();
        let user = MslUser::new("kirito");
        let uit = UserIdToken::create(
            UserIdTokenFields { renewal_window: NOW + 10, expiration: NOW + 20, serial_number: 9, user: &user },
            &mt,
            &issuer(),
            &env,
            EncoderFormat::Cbor,
        )
        .unwrap();
        let bound = ServiceToken::create(
            ServiceTokenFields {
                name: "profile",
                data: b"secret",
                master_token: Some(&mt),
                user_id_token: Some(&uit),
                encrypted: true,
            },
            &session,
            &env,
            EncoderFormat::Cbor,
        )
        .unwrap();

        let mut header = MessageHeader::new(HeaderAuth::MasterToken(mt.clone()), 11);
        header.user_id_token = Some(uit);
        header.service_tokens = vec![bound];
        let bytes = header.encode(MessageContexts::single(&session), &[], &env, &config).unwrap();

        let registry = registry();
        let issuer = issuer();
        let receive = ReceiveContext::new(&registry, &IssuerSessions).with_token_context(&issuer);
        let message = unwrap_message(parse_message(&bytes, receive).unwrap());

        assert_eq!(message.master_token(), Some(&mt));
        let uit = message.user_id_token.as_ref().unwrap();
        assert!(uit.is_verified());
        assert_eq!(uit.user(), Some(&user));
        assert_eq!(message.service_tokens[0].data(), Some(&b"secret"[..]));
        assert!(message.payload.is_empty());
    }

    #[test]
    fn repeated_non_replayable_id_rejected() {
        let env = FixedEnv::new(NOW, 1);
        let config = MslConfig::default();
        let mt = master_token(&env);
        let session = mt.session_crypto_context().unwrap();
        let mut header = MessageHeader::new(HeaderAuth::MasterToken(mt), 11);
        header.non_replayable_id = Some(1);
        let bytes = header.encode(MessageContexts::single(&session), b"pay", &env, &config).unwrap();

        let registry = registry();
        let issuer = issuer();
        let windows = ReplayWindows::new(config.replay_window);
        let receive = || {
            ReceiveContext::new(&registry, &IssuerSessions).with_token_context(&issuer).with_replay_guard(&windows)
        };

        assert!(parse_message(&bytes, receive()).is_ok());
        assert_eq!(parse_message(&bytes, receive()).err().map(|e| e.kind()), Some(ErrorKind::Replay));
    }

    #[test]
    fn tampered_payload_does_not_consume_non_replayable_id() {
        let env = FixedEnv::new(NOW, 1);
        let config = MslConfig::default();
        let mt = master_token(&env);
        let session = mt.session_crypto_context().unwrap();
        let mut header = MessageHeader::new(HeaderAuth::MasterToken(mt), 11);
        header.non_replayable_id = Some(1);
        let genuine = header.encode(MessageContexts::single(&session), b"pay", &env, &config).unwrap();

        let mut message = WireMessage::decode(&genuine).unwrap();
        let last = message.payloads[0].payload.len() - 1;
        message.payloads[0].payload[last] ^= 0x01;
        let tampered = message.encode(EncoderFormat::Cbor).unwrap();

        let registry = registry();
        let issuer = issuer();
        let windows = ReplayWindows::new(config.replay_window);
        let receive = || {
            ReceiveContext::new(&registry, &IssuerSessions).with_token_context(&issuer).with_replay_guard(&windows)
        };

        assert_eq!(parse_message(&tampered, receive()).err().map(|e| e.kind()), Some(ErrorKind::Crypto));
        let accepted = unwrap_message(parse_message(&genuine, receive()).unwrap());
        assert_eq!(accepted.payload, b"pay");
        assert_eq!(parse_message(&genuine, receive()).err().map(|e| e.kind()), Some(ErrorKind::Replay));
    }

    #[test]
    fn untrusted_master_token_is_crypto_error() {
        let env = FixedEnv::new(NOW, 1);
        let mt = master_token(&env);
        let session = mt.session_crypto_context().unwrap();
        let header = MessageHeader::new(HeaderAuth::MasterToken(mt), 11);
        let bytes = header.encode(MessageContexts::single(&session), b"", &env, &MslConfig::default()).unwrap();

        let registry = registry();
        let err = parse_message(&bytes, ReceiveContext::new(&registry, &IssuerSessions)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
        assert_eq!(err.response_code(), ResponseCode::EntityDataReauth);
    }

    #[test]
    fn error_header_for_another_request_keeps_its_code() {
        let env = FixedEnv::new(NOW, 1);
        let error = MslError::crypto("master token not issued by this entity")
            .with_response_code(ResponseCode::EntityDataReauth);
        let data = EntityAuthData::Psk { identity: "device-1".to_string() };
        let bytes = ErrorHeader::from_error(data, None, 99, &error, &env).encode(&psk(), EncoderFormat::Cbor).unwrap();

        let registry = registry();
        let receive = ReceiveContext::new(&registry, &IssuerSessions).expecting_response_to(7);
        let err = parse_message(&bytes, receive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Message);
        assert_eq!(err.response_code(), ResponseCode::EntityDataReauth);
    }

    #[test]
    fn tampered_header_is_crypto_error() {
        let env = FixedEnv::new(NOW, 1);
        let header = MessageHeader::new(entity_auth(), 7);
        let bytes = header.encode(MessageContexts::single(&psk()), b"x", &env, &MslConfig::default()).unwrap();
        let mut message = WireMessage::decode(&bytes).unwrap();
        if let HeaderEnvelope::Message { headerdata, .. } = &mut message.header {
            headerdata[0] ^= 0xff;
        }
        let bytes = message.encode(EncoderFormat::Cbor).unwrap();

        let registry = registry();
        let result = parse_message(&bytes, ReceiveContext::new(&registry, &IssuerSessions));
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Crypto));
    }

    #[test]
    fn header_without_sender_is_message_error() {
        let message = WireMessage {
            header: HeaderEnvelope::Message {
                entity_auth: None,
                master_token: None,
                headerdata: vec![1],
                signature: vec![2],
            },
            payloads: Vec::new(),
        };
        let bytes = message.encode(EncoderFormat::Json).unwrap();

        let registry = registry();
        let result = parse_message(&bytes, ReceiveContext::new(&registry, &IssuerSessions));
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Message));
    }

    #[test]
    fn unexpected_response_id_is_message_error() {
        let env = FixedEnv::new(NOW, 1);
        let header = MessageHeader::new(entity_auth(), 7);
        let bytes = header.encode(MessageContexts::single(&psk()), b"x", &env, &MslConfig::default()).unwrap();

        let registry = registry();
        let answers = ReceiveContext::new(&registry, &IssuerSessions).expecting_response_to(6);
        assert!(parse_message(&bytes, answers).is_ok());

        let other = ReceiveContext::new(&registry, &IssuerSessions).expecting_response_to(7);
        assert_eq!(parse_message(&bytes, other).err().map(|e| e.kind()), Some(ErrorKind::Message));
    }

    #[test]
    fn error_header_roundtrip() {
        let env = FixedEnv::new(NOW, 1);
        let error = MslError::expired("master token expired");
        let data = EntityAuthData::Psk { identity: "device-1".to_string() };
        let header = ErrorHeader::from_error(data, None, 8, &error, &env);
        let bytes = header.encode(&psk(), EncoderFormat::Json).unwrap();

        let registry = registry();
        let received = parse_message(&bytes, ReceiveContext::new(&registry, &IssuerSessions)).unwrap();
        let ReceivedMessage::Error(parsed) = received else {
            panic!("expected an error header");
        };
        assert_eq!(parsed, header);
        assert_eq!(parsed.error_code, ResponseCode::Expired);
    }

    #[test]
    fn forged_error_header_is_crypto_error() {
        let env = FixedEnv::new(NOW, 1);
        let error = MslError::replay("seen");
        let data = EntityAuthData::Psk { identity: "device-1".to_string() };
        let header = ErrorHeader::from_error(data, None, 8, &error, &env);
        let forger = SymmetricCryptoContext::new("device-1", [7; 32], [8; 32]);
        let bytes = header.encode(&forger, EncoderFormat::Cbor).unwrap();

        let registry = registry();
        let result = parse_message(&bytes, ReceiveContext::new(&registry, &IssuerSessions));
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Crypto));
    }
}
