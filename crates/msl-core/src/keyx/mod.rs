//! Key exchange engine.
//!
//! Derives fresh session keys for a new master token (issue) or a renewed
//! one (renew). Schemes are pluggable [`KeyExchangeFactory`] trait objects
//! dispatched by [`KeyExchangeScheme`] through a [`KeyExchangeRegistry`].
//!
//! # State Machine
//!
//! ```text
//! ┌───────────┐  response   ┌───────────┐  establish   ┌─────────────┐
//! │ Requested │────────────>│ Responded │─────────────>│ Established │
//! └───────────┘             └───────────┘              └─────────────┘
//!       │                         │
//!       │ error / no response     │ establish failed
//!       ↓                         ↓
//!   ┌────────┐               ┌────────┐
//!   │ Failed │               │ Failed │
//!   └────────┘               └────────┘
//! ```
//!
//! # Negotiation
//!
//! The requester offers key request data in preference order. The responder
//! answers the first scheme it supports and fails with `UnsupportedScheme`
//! when it supports none. It never answers with a scheme that was not
//! offered.

mod asymmetric;
mod dh;
mod ladder;
mod symmetric;

use std::{collections::BTreeMap, fmt, sync::Arc};

pub use asymmetric::AsymmetricWrappedFactory;
pub use dh::{DiffieHellmanFactory, X25519_PARAMETERS_ID};
pub use ladder::{InMemoryWrapRepository, WrapCryptoContextRepository, WrapLadderFactory};
use msl_crypto::{CryptoContext, KEY_SIZE, SessionCryptoContext, SessionKeys, X25519KeyPair};
use msl_proto::{EncoderFormat, KeyExchangeScheme, KeyRequestData, KeyResponseData};
pub use symmetric::SymmetricWrappedFactory;

use crate::{env::Environment, error::MslError, factory::TokenFactory, tokens::MasterToken};

/// Lifecycle of one negotiation on the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeState {
    /// Request data sent, waiting for the response
    Requested,
    /// Response received, not yet established
    Responded,
    /// Session keys recovered and installed
    Established,
    /// Negotiation abandoned
    Failed,
}

/// Key request data together with the requester's local secret.
#[derive(Debug, Clone)]
pub struct KeyRequest {
    data: KeyRequestData,
    secret: Option<X25519KeyPair>,
}

impl KeyRequest {
    /// Request without local secret state.
    pub fn new(data: KeyRequestData) -> Self {
        Self { data, secret: None }
    }

    /// Request whose response is opened with `secret`.
    pub fn with_secret(data: KeyRequestData, secret: X25519KeyPair) -> Self {
        Self { data, secret: Some(secret) }
    }

    /// Wire data.
    pub fn data(&self) -> &KeyRequestData {
        &self.data
    }

    /// Scheme of this request.
    pub fn scheme(&self) -> KeyExchangeScheme {
        self.data.scheme()
    }

    pub(crate) fn secret(&self) -> Option<&X25519KeyPair> {
        self.secret.as_ref()
    }
}

/// Requester state for one negotiation.
#[derive(Debug)]
pub struct PendingKeyExchange {
    requests: Vec<KeyRequest>,
    state: KeyExchangeState,
}

impl PendingKeyExchange {
    /// Start a negotiation with `requests` in preference order.
    pub fn new(requests: Vec<KeyRequest>) -> Self {
        Self { requests, state: KeyExchangeState::Requested }
    }

    /// Current state.
    pub fn state(&self) -> KeyExchangeState {
        self.state
    }

    /// Requests in preference order.
    pub fn requests(&self) -> &[KeyRequest] {
        &self.requests
    }

    /// Wire data of all requests.
    pub fn request_data(&self) -> Vec<KeyRequestData> {
        self.requests.iter().map(|r| r.data.clone()).collect()
    }

    /// Abandon the negotiation.
    pub fn fail(&mut self) {
        self.state = KeyExchangeState::Failed;
    }

    fn transition(&mut self, from: KeyExchangeState, to: KeyExchangeState) -> Result<(), MslError> {
        if self.state != from {
            return Err(MslError::internal(format!(
                "key exchange transition {:?} -> {to:?} from state {:?}",
                from, self.state
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Recover the negotiated session from `response`.
    ///
    /// # Errors
    ///
    /// - `Internal` if the negotiation is not in `Requested`
    /// - `Message` if the response answers a scheme that was not offered
    /// - the scheme's error if establishing fails; the negotiation is then
    ///   `Failed`
    pub fn establish(
        &mut self,
        registry: &KeyExchangeRegistry,
        ctx: &RequesterContext<'_>,
        response: &KeyResponseData,
    ) -> Result<NegotiatedSession, MslError> {
        self.transition(KeyExchangeState::Requested, KeyExchangeState::Responded)?;

        let scheme = response.scheme();
        let Some(request) = self.requests.iter().find(|r| r.scheme() == scheme) else {
            self.fail();
            return Err(MslError::message(format!("key response for {scheme:?} which was not requested")));
        };
        let Some(factory) = registry.get(scheme) else {
            self.fail();
            return Err(MslError::unsupported_scheme(format!("no factory for {scheme:?}")));
        };

        match factory.establish(ctx, request, response) {
            Ok(session) => {
                self.transition(KeyExchangeState::Responded, KeyExchangeState::Established)?;
                tracing::debug!(
                    scheme = ?scheme,
                    serial = session.master_token.serial_number(),
                    sequence = session.master_token.sequence_number(),
                    "key exchange established"
                );
                Ok(session)
            },
            Err(e) => {
                self.fail();
                Err(e)
            },
        }
    }
}

/// What the requester brings to a negotiation.
#[derive(Clone, Copy)]
pub struct RequesterContext<'a> {
    /// Local entity identity
    pub identity: &'a str,
    /// Entity authentication context (pre-shared key for symmetric schemes)
    pub entity_context: Option<&'a dyn CryptoContext>,
    /// Current session context, when renewing
    pub session_context: Option<&'a dyn CryptoContext>,
    /// Current master token, when renewing
    pub master_token: Option<&'a MasterToken>,
}

impl fmt::Debug for RequesterContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequesterContext")
            .field("identity", &self.identity)
            .field("entity_context", &self.entity_context.is_some())
            .field("session_context", &self.session_context.is_some())
            .field("master_token", &self.master_token.map(MasterToken::serial_number))
            .finish()
    }
}

/// What the responder brings to a negotiation.
#[derive(Clone, Copy)]
pub struct ResponderContext<'a> {
    /// Clock and entropy
    pub env: &'a dyn Environment,
    /// Token issuance
    pub tokens: &'a dyn TokenFactory,
    /// Context of the requesting entity's authentication data, if the
    /// request was entity authenticated
    pub entity_context: Option<&'a dyn CryptoContext>,
    /// Session context of the request's master token, if it carried one
    pub session_context: Option<&'a dyn CryptoContext>,
    /// Encoding of token and scheme data
    pub format: EncoderFormat,
}

impl fmt::Debug for ResponderContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponderContext")
            .field("entity_context", &self.entity_context.is_some())
            .field("session_context", &self.session_context.is_some())
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Master token the responder issues keys for.
#[derive(Debug, Clone, Copy)]
pub enum KeyExchangeTarget<'a> {
    /// New master token for an entity
    Issue {
        /// Authenticated entity identity
        identity: &'a str,
    },
    /// Renewal of an existing master token
    Renew {
        /// Verified and decrypted current master token
        master_token: &'a MasterToken,
    },
}

/// Responder result: the response to send and the session it establishes.
#[derive(Debug)]
pub struct KeyExchangeData {
    /// Key response data for the response header
    pub response: KeyResponseData,
    /// New or renewed master token
    pub master_token: MasterToken,
    /// Session context of `master_token`
    pub crypto_context: SessionCryptoContext,
}

/// Requester result: the new master token and its session context.
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    /// New or renewed master token (unverified on the requester)
    pub master_token: MasterToken,
    /// Session context recovered from the response
    pub crypto_context: SessionCryptoContext,
}

/// One key exchange scheme, both sides.
pub trait KeyExchangeFactory: Send + Sync {
    /// Scheme handled by this factory.
    fn scheme(&self) -> KeyExchangeScheme;

    /// Build request data for this scheme.
    fn request(&self, env: &dyn Environment, ctx: &RequesterContext<'_>) -> Result<KeyRequest, MslError>;

    /// Answer `request`, issuing or renewing the target master token.
    fn respond(
        &self,
        ctx: &ResponderContext<'_>,
        request: &KeyRequestData,
        target: KeyExchangeTarget<'_>,
    ) -> Result<KeyExchangeData, MslError>;

    /// Recover the session from `response` on the requester.
    fn establish(
        &self,
        ctx: &RequesterContext<'_>,
        request: &KeyRequest,
        response: &KeyResponseData,
    ) -> Result<NegotiatedSession, MslError>;
}

/// Key exchange factories keyed by scheme.
#[derive(Clone, Default)]
pub struct KeyExchangeRegistry {
    factories: BTreeMap<KeyExchangeScheme, Arc<dyn KeyExchangeFactory>>,
}

impl KeyExchangeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory`, replacing any factory for the same scheme.
    #[must_use]
    pub fn with(mut self, factory: impl KeyExchangeFactory + 'static) -> Self {
        self.register(Arc::new(factory));
        self
    }

    /// Register `factory`, replacing any factory for the same scheme.
    pub fn register(&mut self, factory: Arc<dyn KeyExchangeFactory>) {
        self.factories.insert(factory.scheme(), factory);
    }

    /// Factory for `scheme`.
    pub fn get(&self, scheme: KeyExchangeScheme) -> Option<&Arc<dyn KeyExchangeFactory>> {
        self.factories.get(&scheme)
    }

    /// Registered schemes.
    pub fn schemes(&self) -> impl Iterator<Item = KeyExchangeScheme> + '_ {
        self.factories.keys().copied()
    }

    /// Build one request per scheme in `preferences`, in order.
    ///
    /// # Errors
    ///
    /// - `UnsupportedScheme` if a preferred scheme has no factory
    pub fn requests(
        &self,
        env: &dyn Environment,
        ctx: &RequesterContext<'_>,
        preferences: &[KeyExchangeScheme],
    ) -> Result<Vec<KeyRequest>, MslError> {
        preferences
            .iter()
            .map(|scheme| match self.get(*scheme) {
                Some(factory) => factory.request(env, ctx),
                None => Err(MslError::unsupported_scheme(format!("no factory for {scheme:?}"))),
            })
            .collect()
    }

    /// First offered request with a registered factory.
    ///
    /// # Errors
    ///
    /// - `UnsupportedScheme` if none of `requests` is supported
    pub fn select<'r>(
        &self,
        requests: &'r [KeyRequestData],
    ) -> Result<(&Arc<dyn KeyExchangeFactory>, &'r KeyRequestData), MslError> {
        requests
            .iter()
            .find_map(|request| self.get(request.scheme()).map(|factory| (factory, request)))
            .ok_or_else(|| {
                let offered: Vec<_> = requests.iter().map(KeyRequestData::scheme).collect();
                MslError::unsupported_scheme(format!("no supported scheme in {offered:?}"))
            })
    }

    /// Answer the first supported request.
    ///
    /// # Errors
    ///
    /// - `UnsupportedScheme` if none of `requests` is supported
    /// - the scheme's error if responding fails
    pub fn respond(
        &self,
        ctx: &ResponderContext<'_>,
        requests: &[KeyRequestData],
        target: KeyExchangeTarget<'_>,
    ) -> Result<KeyExchangeData, MslError> {
        let (factory, request) = self.select(requests)?;
        let data = factory.respond(ctx, request, target)?;
        tracing::debug!(
            scheme = ?factory.scheme(),
            serial = data.master_token.serial_number(),
            sequence = data.master_token.sequence_number(),
            "key exchange response issued"
        );
        Ok(data)
    }
}

impl fmt::Debug for KeyExchangeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchangeRegistry").field("schemes", &self.factories.keys()).finish()
    }
}

/// Draw fresh session keys.
pub(crate) fn fresh_session_keys(env: &dyn Environment) -> SessionKeys {
    let mut encryption = [0u8; KEY_SIZE];
    let mut hmac = [0u8; KEY_SIZE];
    env.random_bytes(&mut encryption);
    env.random_bytes(&mut hmac);
    SessionKeys::new(encryption, hmac)
}

/// Issue or renew the target master token under `keys` and build its
/// session context.
pub(crate) fn issue_master_token(
    ctx: &ResponderContext<'_>,
    target: KeyExchangeTarget<'_>,
    keys: &SessionKeys,
) -> Result<(MasterToken, SessionCryptoContext), MslError> {
    let (master_token, identity) = match target {
        KeyExchangeTarget::Issue { identity } => {
            (ctx.tokens.create_master_token(ctx.env, identity, keys)?, identity)
        },
        KeyExchangeTarget::Renew { master_token } => {
            let Some(identity) = master_token.identity() else {
                return Err(MslError::key_exchange("renewing an undecrypted master token")
                    .with_master_token(master_token.serial_number(), master_token.sequence_number()));
            };
            (ctx.tokens.renew_master_token(ctx.env, master_token, keys)?, identity)
        },
    };
    let crypto_context = SessionCryptoContext::new(identity, master_token.sequence_number(), keys.clone());
    Ok((master_token, crypto_context))
}

/// Parse the response master token on the requester and pair it with the
/// recovered session keys.
pub(crate) fn negotiated_session(
    ctx: &RequesterContext<'_>,
    response: &KeyResponseData,
    keys: SessionKeys,
) -> Result<NegotiatedSession, MslError> {
    let master_token = MasterToken::parse(response.master_token.clone(), None)?;
    let crypto_context = SessionCryptoContext::new(ctx.identity, master_token.sequence_number(), keys);
    Ok(NegotiatedSession { master_token, crypto_context })
}

/// Session keys from two unwrapped or decrypted key slices.
pub(crate) fn keys_from_slices(encryption: &[u8], hmac: &[u8]) -> Result<SessionKeys, MslError> {
    SessionKeys::from_slices(encryption, hmac)
        .map_err(|e| MslError::key_exchange(format!("recovered session keys: {e}")))
}


#[cfg(test)]
mod tests {
    use super::{test_support::*, *};
    use crate::{env::FixedEnv, error::ErrorKind};

    #[test]
    fn select_takes_first_supported_preference() {
        let registry = KeyExchangeRegistry::new().with(DiffieHellmanFactory::new()).with(SymmetricWrappedFactory);
        let requests = vec![
            KeyRequestData::AsymmetricWrapped { key_pair_id: "k".to_string(), public_key: vec![0; 32] },
            KeyRequestData::SymmetricWrapped { key_id: msl_proto::SymmetricKeyId::Psk },
            KeyRequestData::DiffieHellman { parameters_id: "x25519".to_string(), public_key: vec![0; 32] },
        ];

        let Ok((factory, request)) = registry.select(&requests) else { panic!("no scheme selected") };
        assert_eq!(factory.scheme(), KeyExchangeScheme::SymmetricWrapped);
        assert_eq!(request.scheme(), KeyExchangeScheme::SymmetricWrapped);
    }

    #[test]
    fn no_common_scheme_is_unsupported() {
        let registry = KeyExchangeRegistry::new().with(SymmetricWrappedFactory);
        let requests =
            vec![KeyRequestData::DiffieHellman { parameters_id: "x25519".to_string(), public_key: vec![0; 32] }];

        let err = registry.select(&requests).err().map(|e| e.kind());
        assert_eq!(err, Some(ErrorKind::UnsupportedScheme));
    }

    #[test]
    fn requests_follow_preference_order() {
        let env = FixedEnv::new(1_000, 1);
        let psk = psk();
        let registry = KeyExchangeRegistry::new().with(DiffieHellmanFactory::new()).with(SymmetricWrappedFactory);
        let requests = registry
            .requests(
                &env,
                &requester(Some(&psk)),
                &[KeyExchangeScheme::DiffieHellman, KeyExchangeScheme::SymmetricWrapped],
            )
            .unwrap();

        let schemes: Vec<_> = requests.iter().map(KeyRequest::scheme).collect();
        assert_eq!(schemes, vec![KeyExchangeScheme::DiffieHellman, KeyExchangeScheme::SymmetricWrapped]);
    }

    #[test]
    fn unregistered_preference_is_unsupported() {
        let env = FixedEnv::new(1_000, 1);
        let registry = KeyExchangeRegistry::new().with(SymmetricWrappedFactory);
        let result = registry.requests(&env, &requester(None), &[KeyExchangeScheme::WrapLadder]);

        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::UnsupportedScheme));
    }

    #[test]
    fn pending_exchange_reaches_established() {
        let env = FixedEnv::new(1_000, 1);
        let tokens = TestTokens::default();
        let psk = psk();
        let registry = KeyExchangeRegistry::new().with(SymmetricWrappedFactory);

        let requester_ctx = requester(Some(&psk));
        let requests = registry.requests(&env, &requester_ctx, &[KeyExchangeScheme::SymmetricWrapped]).unwrap();
        let mut pending = PendingKeyExchange::new(requests);

        let responder_ctx = responder(&env, &tokens, Some(&psk), None);
        let data = registry
            .respond(&responder_ctx, &pending.request_data(), KeyExchangeTarget::Issue { identity: "device-1" })
            .unwrap();

        let session = pending.establish(&registry, &requester_ctx, &data.response).unwrap();
        assert_eq!(pending.state(), KeyExchangeState::Established);
        assert_eq!(session.crypto_context.keys(), data.crypto_context.keys());
        assert_eq!(session.master_token, data.master_token);
        assert!(!session.master_token.is_verified());

        let again = pending.establish(&registry, &requester_ctx, &data.response);
        assert_eq!(again.err().map(|e| e.kind()), Some(ErrorKind::Internal));
    }

    #[test]
    fn response_for_unrequested_scheme_fails() {
        let env = FixedEnv::new(1_000, 1);
        let tokens = TestTokens::default();
        let psk = psk();
        let registry = KeyExchangeRegistry::new().with(SymmetricWrappedFactory).with(DiffieHellmanFactory::new());

        let requester_ctx = requester(Some(&psk));
        let dh_requests = registry.requests(&env, &requester_ctx, &[KeyExchangeScheme::DiffieHellman]).unwrap();
        let mut pending = PendingKeyExchange::new(
            registry.requests(&env, &requester_ctx, &[KeyExchangeScheme::SymmetricWrapped]).unwrap(),
        );

        let responder_ctx = responder(&env, &tokens, Some(&psk), None);
        let data = registry
            .respond(
                &responder_ctx,
                &[dh_requests[0].data().clone()],
                KeyExchangeTarget::Issue { identity: "device-1" },
            )
            .unwrap();

        let result = pending.establish(&registry, &requester_ctx, &data.response);
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Message));
        assert_eq!(pending.state(), KeyExchangeState::Failed);
    }
}
