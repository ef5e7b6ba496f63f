//! Requester trust orchestration.
//!
//! Every [`MslClient::send`] runs the same pipeline:
//!
//! ```text
//! store snapshot ─► renewal decision ─► header build ─► transport
//!                                                          │
//!        payload ◄─ store merge ◄─ response validation ◄───┘
//! ```
//!
//! A renewable error response triggers one recovery cycle (re-authenticate
//! the entity, renew keys, or re-authenticate the user) and one resend.
//! Nothing is written to the store until a response has been validated, and
//! the merge runs without an intervening await, so dropping a `send` future
//! leaves the store as it was.

use std::{fmt, sync::Arc};

use msl_core::{
    EntityAuthRegistry, Environment, ErrorHeader, ErrorKind, HeaderAuth, MasterToken, MessageContexts,
    MessageHeader, MslConfig, MslError, MslUser, ParsedMessage, PendingKeyExchange, ReceiveContext,
    ReceivedMessage, RequesterContext, ServiceToken, StoreSessions, StoreUpdate, SystemEnv, TokenStore, UserIdToken,
    header::ResponseKeyExchange,
    keyx::{AsymmetricWrappedFactory, DiffieHellmanFactory, KeyExchangeRegistry, SymmetricWrappedFactory},
    parse_message, renewal,
};
use msl_crypto::CryptoContext;
use msl_proto::{EntityAuthData, ResponseCode, UserAuthData};
use tokio::sync::Mutex;

use crate::{transport::Transport, user::UserAuthProvider};

/// Application request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Application payload
    pub payload: Vec<u8>,
    /// User to send the request as
    pub user: Option<MslUser>,
    /// Protect the request against replay. Requires a master token, so a
    /// request that bootstraps one is sent replayable.
    pub non_replayable: bool,
}

impl Request {
    /// Request carrying `payload`.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self { payload: payload.into(), ..Self::default() }
    }

    /// Send as `user`.
    #[must_use]
    pub fn as_user(mut self, user: MslUser) -> Self {
        self.user = Some(user);
        self
    }

    /// Mark the request non-replayable.
    #[must_use]
    pub fn non_replayable(mut self) -> Self {
        self.non_replayable = true;
        self
    }
}

/// Validated application response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Application payload
    pub payload: Vec<u8>,
    /// Response message id
    pub message_id: u64,
    /// User id token the responder issued or confirmed
    pub user_id_token: Option<UserIdToken>,
    /// Service tokens the responder set
    pub service_tokens: Vec<ServiceToken>,
    /// Whether the response carried a new master token
    pub renewed: bool,
}

/// What to repair before resending after an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Discard the master token and authenticate the entity again
    Reauthenticate,
    /// Renew the master token through key exchange
    KeyExchange,
    /// Discard the user id token and authenticate the user again
    UserReauthenticate,
}

impl Recovery {
    fn for_code(code: ResponseCode) -> Option<Self> {
        match code {
            ResponseCode::EntityReauth | ResponseCode::EntityDataReauth => Some(Self::Reauthenticate),
            ResponseCode::KeyxRequired | ResponseCode::Expired => Some(Self::KeyExchange),
            ResponseCode::UserReauth | ResponseCode::UserDataReauth => Some(Self::UserReauthenticate),
            ResponseCode::Fail | ResponseCode::TransientFailure | ResponseCode::Replayed => None,
        }
    }
}

/// Error response to one attempt.
struct Failure {
    code: ResponseCode,
    error: MslError,
    /// Master token the failed request was sent with
    sent_with: Option<MasterToken>,
}

enum Attempt {
    Response(Response),
    Failure(Failure),
}

/// Recovery to run before resending, and the master token the failed
/// request carried.
struct Retry {
    recovery: Recovery,
    failed: Option<MasterToken>,
}

/// Whether `current` replaced `basis` after `basis` was read: another
/// serial number, a later renewal, or a token installed or removed.
fn replaced(basis: Option<&MasterToken>, current: Option<&MasterToken>) -> bool {
    match (basis, current) {
        (Some(basis), Some(current)) => {
            current.serial_number() != basis.serial_number() || current.is_newer_than(basis)
        },
        (None, None) => false,
        _ => true,
    }
}

/// Error reported by the responder, as a local error.
fn header_error(header: &ErrorHeader) -> MslError {
    let detail = header.error_message.clone().unwrap_or_else(|| format!("responder reported {:?}", header.error_code));
    let error = match header.error_code {
        ResponseCode::EntityReauth | ResponseCode::EntityDataReauth => MslError::entity_auth(detail),
        ResponseCode::UserReauth | ResponseCode::UserDataReauth => MslError::user_auth(detail),
        ResponseCode::KeyxRequired => MslError::key_exchange(detail),
        ResponseCode::Expired => MslError::expired(detail),
        ResponseCode::Replayed => MslError::replay(detail),
        ResponseCode::TransientFailure => MslError::transport(detail),
        ResponseCode::Fail => MslError::message(detail),
    };
    error.with_response_code(header.error_code).with_message_id(header.message_id)
}

/// Message security layer requester.
///
/// Cheap to share behind an `Arc`; concurrent sends share the token store
/// and at most one of them runs a key exchange at a time.
pub struct MslClient {
    identity: String,
    entity_auth_data: EntityAuthData,
    entity_context: Arc<dyn CryptoContext>,
    server_auth: EntityAuthRegistry,
    key_exchange: KeyExchangeRegistry,
    user_auth: Option<Arc<dyn UserAuthProvider>>,
    transport: Arc<dyn Transport>,
    store: Arc<TokenStore>,
    config: MslConfig,
    env: Arc<dyn Environment>,
    renewal: Mutex<()>,
}

impl MslClient {
    /// Start building a client that authenticates with `entity_auth_data`
    /// protected by `entity_context`.
    pub fn builder(
        entity_auth_data: EntityAuthData,
        entity_context: impl CryptoContext + 'static,
        transport: impl Transport + 'static,
    ) -> MslClientBuilder {
        MslClientBuilder {
            entity_auth_data,
            entity_context: Arc::new(entity_context),
            transport: Arc::new(transport),
            server_auth: EntityAuthRegistry::new(),
            key_exchange: KeyExchangeRegistry::new()
                .with(SymmetricWrappedFactory)
                .with(AsymmetricWrappedFactory)
                .with(DiffieHellmanFactory::new()),
            user_auth: None,
            store: None,
            config: MslConfig::default(),
            env: Arc::new(SystemEnv::new()),
        }
    }

    /// Local entity identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Token store holding this client's tokens.
    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Current master token.
    pub fn master_token(&self) -> Option<MasterToken> {
        self.store.get_master_token(&self.identity)
    }

    /// Send `request` and return the validated response.
    ///
    /// # Errors
    ///
    /// - any [`MslError`] raised locally while building or validating
    /// - the responder's error, mapped to a kind, when its response code is
    ///   not renewable or the recovery attempt failed as well
    pub async fn send(&self, request: Request) -> Result<Response, MslError> {
        let mut retry: Option<Retry> = None;
        loop {
            let failure = match self.attempt(&request, retry.as_ref()).await? {
                Attempt::Response(response) => return Ok(response),
                Attempt::Failure(failure) => failure,
            };

            match (&retry, Recovery::for_code(failure.code)) {
                (None, Some(recovery)) => {
                    tracing::info!(
                        entity = %self.identity,
                        code = ?failure.code,
                        ?recovery,
                        serial = failure.sent_with.as_ref().map(MasterToken::serial_number),
                        "recovering from error response"
                    );
                    retry = Some(Retry { recovery, failed: failure.sent_with });
                },
                _ => {
                    let error = failure.error.with_entity(self.identity.clone());
                    tracing::warn!(entity = %self.identity, code = ?failure.code, "request failed: {}", error);
                    return Err(error);
                },
            }
        }
    }

    /// Stored master token and whether a key exchange should accompany the
    /// next request. A token past its grace period is treated as absent.
    fn plan(&self, master_token: Option<MasterToken>) -> Result<(Option<MasterToken>, bool), MslError> {
        let Some(master_token) = master_token else {
            return Ok((None, true));
        };
        match renewal::decide(&master_token, self.env.now_secs(), &self.config) {
            Ok(decision) => Ok((Some(master_token), decision.should_renew(&self.config))),
            Err(error) if error.kind() == ErrorKind::Expired => {
                tracing::info!(
                    entity = %self.identity,
                    serial = master_token.serial_number(),
                    sequence = master_token.sequence_number(),
                    "master token expired beyond grace, authenticating again"
                );
                Ok((None, true))
            },
            Err(error) => Err(error),
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn attempt(&self, request: &Request, retry: Option<&Retry>) -> Result<Attempt, MslError> {
        let entity = self.identity.as_str();
        let recovery = retry.map(|r| r.recovery);
        // Entity and key recovery repair the token the failed request
        // carried, which a concurrent recovery may already have replaced.
        let basis = match retry {
            Some(Retry { recovery: Recovery::Reauthenticate | Recovery::KeyExchange, failed }) => failed.clone(),
            _ => self.store.get_master_token(entity),
        };
        let (mut master_token, mut key_exchange) = match recovery {
            Some(Recovery::Reauthenticate) => (None, true),
            Some(Recovery::KeyExchange) if basis.is_some() => (basis.clone(), true),
            _ => self.plan(basis.clone())?,
        };

        // Single flight: wait for any running key exchange, then adopt its
        // master token instead of negotiating again.
        let _renewal = if key_exchange {
            let guard = self.renewal.lock().await;
            let current = self.store.get_master_token(entity);
            if replaced(basis.as_ref(), current.as_ref()) {
                match self.plan(current)? {
                    (Some(current), false) => {
                        tracing::debug!(
                            entity,
                            serial = current.serial_number(),
                            sequence = current.sequence_number(),
                            "using master token from concurrent key exchange"
                        );
                        master_token = Some(current);
                        key_exchange = false;
                        None
                    },
                    (current, _) => {
                        master_token = current;
                        Some(guard)
                    },
                }
            } else {
                Some(guard)
            }
        } else {
            None
        };

        let session = match &master_token {
            Some(mt) => Some(self.store.get_crypto_context(entity, mt).ok_or_else(|| {
                MslError::crypto("no session context for the current master token")
                    .with_entity(entity)
                    .with_master_token(mt.serial_number(), mt.sequence_number())
            })?),
            None => None,
        };
        let session_context = session.as_deref().map(|s| s as &dyn CryptoContext);
        let requester = RequesterContext {
            identity: entity,
            entity_context: Some(self.entity_context.as_ref()),
            session_context,
            master_token: master_token.as_ref(),
        };

        let (user_id_token, user_auth_data) = self.user_tokens(request, recovery, master_token.as_ref()).await?;

        let message_id = self.env.random_counter();
        let auth = match &master_token {
            Some(mt) => HeaderAuth::MasterToken(mt.clone()),
            None => HeaderAuth::EntityAuth(self.entity_auth_data.clone()),
        };
        let mut header = MessageHeader::new(auth, message_id);
        header.renewable = key_exchange || self.config.proactive_renewal;
        if request.non_replayable
            && let Some(mt) = &master_token
        {
            header.non_replayable_id = Some(self.store.next_non_replayable_id(entity, mt));
        }
        header.service_tokens = self.store.get_service_tokens(entity, master_token.as_ref(), user_id_token.as_ref())?;
        header.user_id_token = user_id_token;
        header.user_auth_data = user_auth_data;

        let mut pending = if key_exchange {
            let requests = self.key_exchange.requests(self.env.as_ref(), &requester, &self.config.key_exchange_schemes)?;
            let pending = PendingKeyExchange::new(requests);
            header.key_request_data = pending.request_data();
            Some(pending)
        } else {
            None
        };

        let header_context: &dyn CryptoContext = session_context.unwrap_or(self.entity_context.as_ref());
        let bytes =
            header.encode(MessageContexts::single(header_context), &request.payload, self.env.as_ref(), &self.config)?;

        tracing::debug!(
            entity,
            message_id,
            key_exchange,
            serial = master_token.as_ref().map(MasterToken::serial_number),
            "sending request"
        );
        let response = self
            .transport
            .exchange(bytes)
            .await
            .map_err(|e| MslError::transport(e.to_string()).with_entity(entity).with_message_id(message_id))?;

        let sessions = StoreSessions::new(&self.store, entity);
        let mut receive = ReceiveContext::new(&self.server_auth, &sessions).expecting_response_to(message_id);
        if let Some(pending) = pending.as_mut() {
            receive = receive.with_key_exchange(ResponseKeyExchange { pending, registry: &self.key_exchange, requester });
        }
        let message = match parse_message(&response, receive) {
            Ok(ReceivedMessage::Message(message)) => message,
            Ok(ReceivedMessage::Error(header)) => {
                return Ok(Attempt::Failure(Failure {
                    code: header.error_code,
                    error: header_error(&header),
                    sent_with: master_token,
                }));
            },
            // A responder that cannot read the master token cannot read the
            // message id either, so its signed demand for entity
            // re-authentication answers no particular request.
            Err(error)
                if error.kind() == ErrorKind::Message
                    && master_token.is_some()
                    && matches!(error.response_code(), ResponseCode::EntityReauth | ResponseCode::EntityDataReauth) =>
            {
                tracing::warn!(
                    entity,
                    serial = master_token.as_ref().map(MasterToken::serial_number),
                    "responder cannot read the master token"
                );
                return Ok(Attempt::Failure(Failure {
                    code: error.response_code(),
                    error: error.with_entity(entity),
                    sent_with: master_token,
                }));
            },
            Err(error) => {
                if error.kind() == ErrorKind::Crypto
                    && key_exchange
                    && let Some(mt) = &master_token
                {
                    tracing::warn!(
                        entity,
                        serial = mt.serial_number(),
                        sequence = mt.sequence_number(),
                        "renewal failed cryptographically, discarding master token"
                    );
                    self.store.remove_master_token(entity, mt);
                }
                return Err(error.with_entity(entity));
            },
        };

        self.merge(request, *message)
    }

    /// User id token to send for the request's user, or authentication
    /// data when there is no usable token.
    async fn user_tokens(
        &self,
        request: &Request,
        recovery: Option<Recovery>,
        master_token: Option<&MasterToken>,
    ) -> Result<(Option<UserIdToken>, Option<UserAuthData>), MslError> {
        let Some(user) = &request.user else {
            return Ok((None, None));
        };
        let stored = match (recovery, master_token) {
            (Some(Recovery::UserReauthenticate), _) | (_, None) => None,
            (_, Some(mt)) => self.store.get_user_id_token(&self.identity, user).filter(|uit| uit.is_bound_to(mt)),
        };
        if let Some(user_id_token) = stored {
            return Ok((Some(user_id_token), None));
        }

        let Some(provider) = &self.user_auth else {
            return Err(MslError::user_auth("no user authentication provider")
                .with_entity(self.identity.clone())
                .with_user(user.identity()));
        };
        Ok((None, Some(provider.credentials(user).await?)))
    }

    fn merge(&self, request: &Request, message: ParsedMessage) -> Result<Attempt, MslError> {
        let renewed = message.negotiated.is_some();
        let user_id_token = match (&request.user, &message.user_id_token) {
            (Some(user), Some(uit)) => Some((user.clone(), uit.clone())),
            _ => None,
        };

        self.store.merge(&self.identity, StoreUpdate {
            master_token: message.negotiated.map(|n| (n.master_token, n.crypto_context)),
            user_id_token,
            service_tokens: message.service_tokens.clone(),
        })?;

        if renewed {
            tracing::debug!(entity = %self.identity, message_id = message.message_id, "installed negotiated master token");
        }
        Ok(Attempt::Response(Response {
            payload: message.payload,
            message_id: message.message_id,
            user_id_token: message.user_id_token,
            service_tokens: message.service_tokens,
            renewed,
        }))
    }
}

impl fmt::Debug for MslClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MslClient")
            .field("identity", &self.identity)
            .field("server_auth", &self.server_auth)
            .field("key_exchange", &self.key_exchange)
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`MslClient`].
pub struct MslClientBuilder {
    entity_auth_data: EntityAuthData,
    entity_context: Arc<dyn CryptoContext>,
    transport: Arc<dyn Transport>,
    server_auth: EntityAuthRegistry,
    key_exchange: KeyExchangeRegistry,
    user_auth: Option<Arc<dyn UserAuthProvider>>,
    store: Option<Arc<TokenStore>>,
    config: MslConfig,
    env: Arc<dyn Environment>,
}

impl MslClientBuilder {
    /// Registry verifying the responder's entity-authenticated messages.
    #[must_use]
    pub fn server_auth(mut self, registry: EntityAuthRegistry) -> Self {
        self.server_auth = registry;
        self
    }

    /// Key exchange schemes; defaults to symmetric wrapped, asymmetric
    /// wrapped and Diffie-Hellman.
    #[must_use]
    pub fn key_exchange(mut self, registry: KeyExchangeRegistry) -> Self {
        self.key_exchange = registry;
        self
    }

    /// Source of user credentials.
    #[must_use]
    pub fn user_auth(mut self, provider: impl UserAuthProvider + 'static) -> Self {
        self.user_auth = Some(Arc::new(provider));
        self
    }

    /// Share or restore a token store; a fresh one is created otherwise.
    #[must_use]
    pub fn store(mut self, store: Arc<TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Protocol policy.
    #[must_use]
    pub fn config(mut self, config: MslConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock and entropy source.
    #[must_use]
    pub fn env(mut self, env: Arc<dyn Environment>) -> Self {
        self.env = env;
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// - `Internal` if the policy is inconsistent
    /// - `UnsupportedScheme` if a preferred key exchange scheme has no
    ///   registered factory
    pub fn build(self) -> Result<MslClient, MslError> {
        self.config.validate()?;
        if let Some(scheme) = self.config.key_exchange_schemes.iter().find(|s| self.key_exchange.get(**s).is_none()) {
            return Err(MslError::unsupported_scheme(format!("no factory for preferred scheme {scheme:?}")));
        }

        let store = self.store.unwrap_or_else(|| Arc::new(TokenStore::new(&self.config)));
        Ok(MslClient {
            identity: self.entity_auth_data.identity().to_string(),
            entity_auth_data: self.entity_auth_data,
            entity_context: self.entity_context,
            server_auth: self.server_auth,
            key_exchange: self.key_exchange,
            user_auth: self.user_auth,
            transport: self.transport,
            store,
            config: self.config,
            env: self.env,
            renewal: Mutex::new(()),
        })
    }
}

impl fmt::Debug for MslClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MslClientBuilder")
            .field("identity", &self.entity_auth_data.identity())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
