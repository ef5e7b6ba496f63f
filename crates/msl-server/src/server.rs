//! Request validation and response construction.
//!
//! ```text
//! bytes ─► receive ─► Request ─► handler ─► Reply ─► respond ─► bytes
//!             │                     │                   │
//!             └─────────────────────┴───────────────────┴──► error header
//! ```
//!
//! [`MslServer::receive`] runs the shared validation pipeline and then the
//! responder's own policy: revocation and sequence checks, expiration and
//! user authentication. [`MslServer::respond`] decides key exchange and user
//! id token renewal, re-issues the request's service tokens and adds the
//! reply's. [`MslServer::handle`] turns every failure along the way into a
//! signed error header.

use std::{fmt, sync::Arc};

use msl_core::{
    EntityAuthRegistry, Environment, ErrorKind, HeaderAuth, KeyExchangeData, KeyExchangeRegistry, KeyExchangeTarget,
    MasterToken, MessageContexts, MessageHeader, MslConfig, MslError, MslUser, ParsedMessage, ReceiveContext,
    ReceivedMessage, ResponderContext, ServiceToken, SystemEnv, TokenFactory, UserAuthRegistry, UserIdToken,
    header::{ErrorHeader, IssuerSessions},
    keyx::{AsymmetricWrappedFactory, DiffieHellmanFactory, SymmetricWrappedFactory},
    parse_message,
    tokens::ServiceTokenFields,
};
use msl_crypto::{AsymmetricCryptoContext, CryptoContext, SymmetricCryptoContext};
use msl_proto::{EntityAuthData, ResponseCode, next_counter};

use crate::{error::ServerError, token_factory::ServerTokenFactory};

/// Application callback answering a validated request.
pub type Handler = Arc<dyn Fn(&Request) -> Result<Reply, MslError> + Send + Sync>;

/// Wrap `f` as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Request) -> Result<Reply, MslError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a reply service token is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenBinding {
    /// Bound to nothing; protected by the server's service token context
    #[default]
    Unbound,
    /// Bound to the response master token
    MasterToken,
    /// Bound to the response master token and user id token
    UserIdToken,
}

/// Service token to add to a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyServiceToken {
    /// Token name; replaces a request token of the same name
    pub name: String,
    /// Application data; empty deletes the token on the requester
    pub data: Vec<u8>,
    /// Tokens the service token is bound to
    pub binding: TokenBinding,
    /// Encrypt `data`
    pub encrypted: bool,
}

/// Application response to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Response payload
    pub payload: Vec<u8>,
    /// Service tokens to set on the requester
    pub service_tokens: Vec<ReplyServiceToken>,
}

impl Reply {
    /// Reply carrying `payload`.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self { payload: payload.into(), service_tokens: Vec::new() }
    }

    /// Add an encrypted service token.
    #[must_use]
    pub fn with_service_token(
        mut self,
        name: impl Into<String>,
        data: impl Into<Vec<u8>>,
        binding: TokenBinding,
    ) -> Self {
        self.service_tokens.push(ReplyServiceToken {
            name: name.into(),
            data: data.into(),
            binding,
            encrypted: true,
        });
        self
    }
}

/// How the requesting user was established.
#[derive(Debug, Clone, PartialEq, Eq)]
enum UserSource {
    /// Verified user id token presented with the request
    UserIdToken,
    /// User authentication data accepted
    Authenticated,
}

/// Validated request.
pub struct Request {
    message: Box<ParsedMessage>,
    user: Option<(MslUser, UserSource)>,
}

impl Request {
    /// Validated message.
    pub fn message(&self) -> &ParsedMessage {
        &self.message
    }

    /// Request payload.
    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    /// Request message id.
    pub fn message_id(&self) -> u64 {
        self.message.message_id
    }

    /// Authenticated entity identity.
    pub fn entity_identity(&self) -> Option<&str> {
        self.message.entity_identity()
    }

    /// Authenticated user, if any.
    pub fn user(&self) -> Option<&MslUser> {
        self.user.as_ref().map(|(user, _)| user)
    }

    fn annotate(&self, error: MslError) -> MslError {
        let error = error.with_message_id(self.message.message_id);
        match self.entity_identity() {
            Some(entity) if error.context().entity.is_none() => error.with_entity(entity),
            _ => error,
        }
    }

    /// Service token named `name` sent with the request.
    pub fn service_token(&self, name: &str) -> Option<&ServiceToken> {
        self.message.service_tokens.iter().find(|t| t.name() == name)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").field("message", &self.message).field("user", &self.user()).finish()
    }
}

/// Message security layer responder.
pub struct MslServer {
    identity: String,
    config: MslConfig,
    env: Arc<dyn Environment>,
    tokens: ServerTokenFactory,
    entity_auth: EntityAuthRegistry,
    user_auth: UserAuthRegistry,
    key_exchange: KeyExchangeRegistry,
    signer: AsymmetricCryptoContext,
    service_token_context: SymmetricCryptoContext,
}

impl MslServer {
    /// Start building a server named `identity`.
    ///
    /// `signer` signs error headers and entity-authenticated responses.
    /// `issuer` protects issued master and user id tokens.
    pub fn builder(
        identity: impl Into<String>,
        signer: AsymmetricCryptoContext,
        issuer: SymmetricCryptoContext,
    ) -> MslServerBuilder {
        MslServerBuilder::new(identity.into(), signer, issuer)
    }

    /// Server identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Protocol policy.
    pub fn config(&self) -> &MslConfig {
        &self.config
    }

    /// Token issuance state.
    pub fn tokens(&self) -> &ServerTokenFactory {
        &self.tokens
    }

    /// Validate `bytes` as a request.
    ///
    /// # Errors
    ///
    /// - any [`parse_message`] error, including `Replay` for a repeated
    ///   non-replayable id
    /// - `Message` if the bytes carry an error header
    /// - `EntityAuth` if the master token is revoked, unknown, or expired
    ///   beyond the renewal grace (answered with `EntityReauth`)
    /// - `KeyExchange` if the master token is too far behind the newest
    /// - `Expired` if the master token expired and the request cannot renew
    ///   it
    /// - `UserAuth` if the user id token was not issued here or the user
    ///   credentials are rejected
    pub fn receive(&self, bytes: &[u8]) -> Result<Request, MslError> {
        let receive = ReceiveContext::new(&self.entity_auth, &IssuerSessions)
            .with_token_context(self.tokens.issuer_context())
            .with_service_token_context(&self.service_token_context)
            .with_replay_guard(&self.tokens);

        let message = match parse_message(bytes, receive)? {
            ReceivedMessage::Message(message) => message,
            ReceivedMessage::Error(header) => {
                return Err(MslError::message("error header received as a request")
                    .with_entity(header.entity_auth.identity()));
            },
        };

        let message_id = message.message_id;
        let entity = message.entity_identity().unwrap_or_default().to_string();
        if let Some(master_token) = message.master_token() {
            self.check_master_token(&message, master_token)
                .map_err(|e| e.with_entity(entity.clone()).with_message_id(message_id))?;
        }
        let user = self.authenticate_user(&message).map_err(|e| e.with_entity(entity).with_message_id(message_id))?;

        tracing::debug!(
            message_id,
            entity = message.entity_identity(),
            serial = message.master_token().map(MasterToken::serial_number),
            user = user.as_ref().map(|(user, _)| user.identity()),
            "request accepted"
        );
        Ok(Request { message, user })
    }

    fn check_master_token(&self, message: &ParsedMessage, master_token: &MasterToken) -> Result<(), MslError> {
        let env = self.env.as_ref();
        if let Err(error) = self.tokens.check_master_token(env, master_token) {
            let renewing = message.renewable && !message.key_request_data.is_empty();
            if error.kind() != ErrorKind::KeyExchange || !renewing {
                return Err(error);
            }
        }

        let now = env.now_secs();
        if !master_token.is_expired(now) {
            return Ok(());
        }
        let (serial, sequence) = (master_token.serial_number(), master_token.sequence_number());
        if master_token.is_past_grace(now, self.config.renewal_grace_secs) {
            return Err(MslError::entity_auth(format!(
                "master token expired at {} beyond the renewal grace",
                master_token.expiration()
            ))
            .with_master_token(serial, sequence)
            .with_response_code(ResponseCode::EntityReauth));
        }
        if !message.renewable || message.key_request_data.is_empty() {
            return Err(MslError::expired(format!(
                "master token expired at {} and the request cannot renew it",
                master_token.expiration()
            ))
            .with_master_token(serial, sequence));
        }
        Ok(())
    }

    fn authenticate_user(&self, message: &ParsedMessage) -> Result<Option<(MslUser, UserSource)>, MslError> {
        if let Some(uit) = &message.user_id_token {
            return match uit.user() {
                Some(user) if uit.is_verified() => Ok(Some((user.clone(), UserSource::UserIdToken))),
                _ => Err(MslError::user_auth("user id token not issued by this server")
                    .with_user_id_token(uit.serial_number())
                    .with_response_code(ResponseCode::UserReauth)),
            };
        }
        match &message.user_auth_data {
            Some(data) => {
                let user = self.user_auth.authenticate(data, message.master_token())?;
                Ok(Some((user, UserSource::Authenticated)))
            },
            None => Ok(None),
        }
    }

    /// Build the response to `request` carrying `reply`.
    ///
    /// # Errors
    ///
    /// - `UnsupportedScheme` if key exchange is due and no offered scheme is
    ///   supported
    /// - `Message` if a reply service token names a binding the response
    ///   does not carry
    /// - `Crypto` if a context cannot protect the response
    pub fn respond(&self, request: &Request, reply: Reply) -> Result<Vec<u8>, MslError> {
        self.build_response(request, reply).map_err(|e| request.annotate(e))
    }

    fn build_response(&self, request: &Request, reply: Reply) -> Result<Vec<u8>, MslError> {
        let env = self.env.as_ref();
        let message = request.message.as_ref();
        let request_master_token = message.master_token();

        let exchange = if self.key_exchange_due(message, env.now_secs()) {
            Some(self.exchange_keys(message)?)
        } else {
            None
        };

        let binding_master_token = exchange.as_ref().map(|e| &e.master_token).or(request_master_token);
        let binding_context: Option<&dyn CryptoContext> = match (&exchange, request_master_token) {
            (Some(exchange), _) => Some(&exchange.crypto_context),
            (None, Some(_)) => Some(message.header_context.as_ref()),
            (None, None) => None,
        };

        let user_id_token = match (binding_master_token, &request.user) {
            (Some(master_token), Some((user, source))) => {
                Some(self.response_user_id_token(message, user, source, master_token)?)
            },
            _ => None,
        };

        let bindings = ResponseBindings {
            master_token: binding_master_token,
            user_id_token: user_id_token.as_ref(),
            context: binding_context,
        };
        let service_tokens = self.response_service_tokens(message, &reply, &bindings)?;

        let header_context: &dyn CryptoContext = match request_master_token {
            Some(_) => message.header_context.as_ref(),
            None => &self.signer,
        };
        let auth = match request_master_token {
            Some(master_token) => HeaderAuth::MasterToken(master_token.clone()),
            None => HeaderAuth::EntityAuth(self.entity_auth_data()),
        };
        let payload_context: &dyn CryptoContext = match &exchange {
            Some(exchange) => &exchange.crypto_context,
            None => header_context,
        };

        let mut header = MessageHeader::new(auth, next_counter(message.message_id));
        header.sender = Some(self.identity.clone());
        header.key_response_data = exchange.as_ref().map(|e| e.response.clone());
        header.user_id_token = user_id_token;
        header.service_tokens = service_tokens;

        let bytes = header.encode(
            MessageContexts { header: header_context, payload: payload_context },
            &reply.payload,
            env,
            &self.config,
        )?;

        tracing::debug!(
            message_id = header.message_id,
            key_exchange = exchange.is_some(),
            serial = binding_master_token.map(MasterToken::serial_number),
            service_tokens = header.service_tokens.len(),
            "response built"
        );
        Ok(bytes)
    }

    /// Key exchange answers a bootstrap, a renewable request whose master
    /// token entered its renewal window, or an expired master token.
    fn key_exchange_due(&self, message: &ParsedMessage, now: u64) -> bool {
        if message.key_request_data.is_empty() {
            return false;
        }
        match message.master_token() {
            None => true,
            Some(master_token) => {
                master_token.is_expired(now)
                    || (message.renewable && master_token.is_renewable(now))
                    || self.tokens.is_superseded(master_token)
            },
        }
    }

    fn exchange_keys(&self, message: &ParsedMessage) -> Result<KeyExchangeData, MslError> {
        let header_context = Some(message.header_context.as_ref());
        let (target, entity_context, session_context) = match &message.auth {
            HeaderAuth::MasterToken(master_token) => (KeyExchangeTarget::Renew { master_token }, None, header_context),
            HeaderAuth::EntityAuth(data) => (KeyExchangeTarget::Issue { identity: data.identity() }, header_context, None),
        };
        let ctx = ResponderContext {
            env: self.env.as_ref(),
            tokens: &self.tokens,
            entity_context,
            session_context,
            format: self.config.encoding,
        };
        self.key_exchange.respond(&ctx, &message.key_request_data, target)
    }

    /// Expired user id tokens are always renewed; those in their renewal
    /// window only for renewable requests. A token bound to a replaced
    /// master token is re-bound.
    fn response_user_id_token(
        &self,
        message: &ParsedMessage,
        user: &MslUser,
        source: &UserSource,
        master_token: &MasterToken,
    ) -> Result<UserIdToken, MslError> {
        let env = self.env.as_ref();
        let now = env.now_secs();
        match (&message.user_id_token, source) {
            (Some(uit), UserSource::UserIdToken) => {
                let renew = uit.is_expired(now) || (message.renewable && uit.is_renewable(now));
                if renew || !uit.is_bound_to(master_token) {
                    self.tokens.renew_user_id_token(env, uit, master_token)
                } else {
                    Ok(uit.clone())
                }
            },
            _ => self.tokens.create_user_id_token(env, user, master_token),
        }
    }

    /// Request service tokens re-issued under the response bindings, then
    /// the reply's tokens. A reply token replaces a request token of the
    /// same name.
    fn response_service_tokens(
        &self,
        message: &ParsedMessage,
        reply: &Reply,
        bindings: &ResponseBindings<'_>,
    ) -> Result<Vec<ServiceToken>, MslError> {
        let mut tokens = Vec::with_capacity(message.service_tokens.len() + reply.service_tokens.len());

        for token in &message.service_tokens {
            if token.is_deleted() || reply.service_tokens.iter().any(|r| r.name == token.name()) {
                continue;
            }
            let Some(data) = token.data().filter(|_| token.is_verified()) else {
                tracing::debug!(name = token.name(), "unverified service token not echoed");
                continue;
            };
            let binding = if token.uit_serial_number().is_some() {
                TokenBinding::UserIdToken
            } else if token.mt_serial_number().is_some() {
                TokenBinding::MasterToken
            } else {
                TokenBinding::Unbound
            };
            if binding == TokenBinding::UserIdToken && bindings.user_id_token.is_none() {
                continue;
            }
            tokens.push(self.service_token(token.name(), data, binding, token.is_encrypted(), bindings)?);
        }

        for token in &reply.service_tokens {
            tokens.push(self.service_token(&token.name, &token.data, token.binding, token.encrypted, bindings)?);
        }
        Ok(tokens)
    }

    fn service_token(
        &self,
        name: &str,
        data: &[u8],
        binding: TokenBinding,
        encrypted: bool,
        bindings: &ResponseBindings<'_>,
    ) -> Result<ServiceToken, MslError> {
        let unavailable = |what: &str| {
            MslError::message(format!("service token {name} bound to a {what} the response does not carry"))
        };
        let (master_token, user_id_token) = match binding {
            TokenBinding::Unbound => (None, None),
            TokenBinding::MasterToken => (Some(bindings.master_token.ok_or_else(|| unavailable("master token"))?), None),
            TokenBinding::UserIdToken => (
                Some(bindings.master_token.ok_or_else(|| unavailable("master token"))?),
                Some(bindings.user_id_token.ok_or_else(|| unavailable("user id token"))?),
            ),
        };
        let ctx: &dyn CryptoContext = match (binding, bindings.context) {
            (TokenBinding::Unbound, _) => &self.service_token_context,
            (_, Some(ctx)) => ctx,
            (_, None) => return Err(unavailable("session")),
        };
        let fields = ServiceTokenFields { name, data, master_token, user_id_token, encrypted };
        ServiceToken::create(fields, ctx, self.env.as_ref(), self.config.encoding)
    }

    fn entity_auth_data(&self) -> EntityAuthData {
        EntityAuthData::Signed { identity: self.identity.clone() }
    }

    /// Signed error header reporting `error`.
    ///
    /// Answers the request id recorded in the error context, or a random id
    /// when the request could not be read that far.
    ///
    /// # Errors
    ///
    /// - `Crypto` if the signer cannot sign
    pub fn error_response(&self, error: &MslError) -> Result<Vec<u8>, MslError> {
        let env = self.env.as_ref();
        let message_id = match error.context().message_id {
            Some(request_id) => next_counter(request_id),
            None => env.random_counter(),
        };
        let header =
            ErrorHeader::from_error(self.entity_auth_data(), error.context().entity.clone(), message_id, error, env);
        header.encode(&self.signer, self.config.encoding)
    }

    /// Validate `bytes`, answer it with `handler` and build the response.
    ///
    /// Every protocol or application failure becomes a signed error header.
    ///
    /// # Errors
    ///
    /// - `Protocol` if even the error header cannot be built
    pub fn handle<H>(&self, bytes: &[u8], handler: H) -> Result<Vec<u8>, ServerError>
    where
        H: FnOnce(&Request) -> Result<Reply, MslError>,
    {
        let outcome = self.receive(bytes).and_then(|request| {
            let reply = handler(&request).map_err(|e| request.annotate(e))?;
            self.respond(&request, reply)
        });

        match outcome {
            Ok(response) => Ok(response),
            Err(error) => {
                let code = error.response_code();
                if error.is_fatal() {
                    tracing::warn!(
                        kind = ?error.kind(),
                        code = ?code,
                        message_id = error.context().message_id,
                        entity = error.context().entity.as_deref(),
                        "request failed: {}",
                        error.detail()
                    );
                } else {
                    tracing::debug!(kind = ?error.kind(), code = ?code, "request needs renewal: {}", error.detail());
                }
                Ok(self.error_response(&error)?)
            },
        }
    }
}

impl fmt::Debug for MslServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MslServer")
            .field("identity", &self.identity)
            .field("tokens", &self.tokens)
            .field("entity_auth", &self.entity_auth)
            .field("user_auth", &self.user_auth)
            .field("key_exchange", &self.key_exchange)
            .finish_non_exhaustive()
    }
}

/// Tokens and context a response's service tokens may bind to.
struct ResponseBindings<'a> {
    master_token: Option<&'a MasterToken>,
    user_id_token: Option<&'a UserIdToken>,
    context: Option<&'a dyn CryptoContext>,
}

/// Builder for [`MslServer`].
pub struct MslServerBuilder {
    identity: String,
    signer: AsymmetricCryptoContext,
    issuer: SymmetricCryptoContext,
    config: MslConfig,
    env: Arc<dyn Environment>,
    entity_auth: EntityAuthRegistry,
    user_auth: UserAuthRegistry,
    key_exchange: KeyExchangeRegistry,
    service_token_context: Option<SymmetricCryptoContext>,
}

impl MslServerBuilder {
    fn new(identity: String, signer: AsymmetricCryptoContext, issuer: SymmetricCryptoContext) -> Self {
        let key_exchange = KeyExchangeRegistry::new()
            .with(SymmetricWrappedFactory)
            .with(AsymmetricWrappedFactory)
            .with(DiffieHellmanFactory::new());
        Self {
            identity,
            signer,
            issuer,
            config: MslConfig::default(),
            env: Arc::new(SystemEnv::new()),
            entity_auth: EntityAuthRegistry::new(),
            user_auth: UserAuthRegistry::new(),
            key_exchange,
            service_token_context: None,
        }
    }

    /// Protocol policy.
    #[must_use]
    pub fn config(mut self, config: MslConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock and entropy.
    #[must_use]
    pub fn env(mut self, env: Arc<dyn Environment>) -> Self {
        self.env = env;
        self
    }

    /// Entity authentication schemes accepted from requesters.
    #[must_use]
    pub fn entity_auth(mut self, registry: EntityAuthRegistry) -> Self {
        self.entity_auth = registry;
        self
    }

    /// User authentication schemes accepted from requesters.
    #[must_use]
    pub fn user_auth(mut self, registry: UserAuthRegistry) -> Self {
        self.user_auth = registry;
        self
    }

    /// Key exchange schemes, replacing the symmetric, asymmetric and
    /// Diffie-Hellman defaults.
    #[must_use]
    pub fn key_exchange(mut self, registry: KeyExchangeRegistry) -> Self {
        self.key_exchange = registry;
        self
    }

    /// Context protecting unbound service tokens. Defaults to the issuer
    /// keys.
    #[must_use]
    pub fn service_token_context(mut self, ctx: SymmetricCryptoContext) -> Self {
        self.service_token_context = Some(ctx);
        self
    }

    /// Validate the configuration and build the server.
    ///
    /// # Errors
    ///
    /// - `Config` if the policy is inconsistent or `signer` cannot sign
    pub fn build(self) -> Result<MslServer, ServerError> {
        self.config.validate().map_err(|e| ServerError::Config(e.detail().to_string()))?;
        if self.signer.sign(self.identity.as_bytes()).is_err() {
            return Err(ServerError::Config(format!("signer for {} has no signing key", self.identity)));
        }

        let service_token_context = self.service_token_context.unwrap_or_else(|| self.issuer.clone());
        Ok(MslServer {
            identity: self.identity,
            tokens: ServerTokenFactory::new(self.issuer, self.config.clone()),
            config: self.config,
            env: self.env,
            entity_auth: self.entity_auth,
            user_auth: self.user_auth,
            key_exchange: self.key_exchange,
            signer: self.signer,
            service_token_context,
        })
    }
}

impl fmt::Debug for MslServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MslServerBuilder").field("identity", &self.identity).finish_non_exhaustive()
    }
}
