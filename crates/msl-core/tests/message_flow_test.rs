//! Requester and responder exchanging messages through the core pipeline.
//!
//! The responder here is deliberately small: it authenticates the request,
//! answers key exchange requests and echoes the payload. It exercises the
//! same header, key exchange and store code paths as the server crate.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use msl_core::{
    EntityAuthRegistry, Environment, ErrorKind, FixedEnv, HeaderAuth, KeyExchangeRegistry, KeyExchangeTarget,
    MasterToken, MessageContexts, MessageHeader, MslConfig, MslError, MslUser, PendingKeyExchange,
    PskEntityAuth, ReceiveContext, ReceivedMessage, RequesterContext, ResponderContext, SignedEntityAuth,
    StoreSessions, StoreUpdate, TokenFactory, TokenStore, UserIdToken,
    header::{IssuerSessions, ReplayWindows, ResponseKeyExchange},
    keyx::SymmetricWrappedFactory,
    parse_message, renewal,
    tokens::MasterTokenFields,
};
use msl_crypto::{AsymmetricCryptoContext, AsymmetricMode, CryptoContext, SessionKeys, SymmetricCryptoContext};
use msl_proto::{EncoderFormat, EntityAuthData, KeyExchangeScheme, next_counter};

const NOW: u64 = 1_700_000_000;
const DEVICE: &str = "device-1";
const SERVER: &str = "server";

fn psk() -> SymmetricCryptoContext {
    SymmetricCryptoContext::new(DEVICE, [7; 32], [8; 32]).with_wrap_key([9; 32])
}

fn server_signer() -> AsymmetricCryptoContext {
    AsymmetricCryptoContext::new(SERVER, AsymmetricMode::SignVerify).with_signing_key([11; 32])
}

fn server_verifier() -> AsymmetricCryptoContext {
    let public = server_signer().verifying_key_bytes().unwrap();
    AsymmetricCryptoContext::new(SERVER, AsymmetricMode::SignVerify).with_verifying_key(&public).unwrap()
}

/// Issues master tokens renewable after 10 seconds and expiring after 20.
struct Issuer {
    ctx: SymmetricCryptoContext,
    next_serial: AtomicU64,
}

impl Issuer {
    fn new() -> Self {
        Self { ctx: SymmetricCryptoContext::new("issuer", [1; 32], [2; 32]), next_serial: AtomicU64::new(100) }
    }

    fn mint(
        &self,
        env: &dyn Environment,
        identity: &str,
        keys: &SessionKeys,
        serial_number: u64,
        sequence_number: u64,
    ) -> Result<MasterToken, MslError> {
        let now = env.now_secs();
        let fields = MasterTokenFields {
            renewal_window: now + 10,
            expiration: now + 20,
            sequence_number,
            serial_number,
            identity,
            keys,
        };
        MasterToken::create(fields, &self.ctx, env, EncoderFormat::Cbor)
    }
}

impl TokenFactory for Issuer {
    fn issuer_context(&self) -> &dyn CryptoContext {
        &self.ctx
    }

    fn create_master_token(
        &self,
        env: &dyn Environment,
        identity: &str,
        keys: &SessionKeys,
    ) -> Result<MasterToken, MslError> {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        self.mint(env, identity, keys, serial, 1)
    }

    fn renew_master_token(
        &self,
        env: &dyn Environment,
        master_token: &MasterToken,
        keys: &SessionKeys,
    ) -> Result<MasterToken, MslError> {
        let identity = master_token.identity().ok_or_else(|| MslError::entity_auth("undecrypted"))?;
        self.mint(env, identity, keys, master_token.serial_number(), next_counter(master_token.sequence_number()))
    }

    fn check_master_token(&self, _env: &dyn Environment, _master_token: &MasterToken) -> Result<(), MslError> {
        Ok(())
    }

    fn create_user_id_token(
        &self,
        _env: &dyn Environment,
        _user: &MslUser,
        _master_token: &MasterToken,
    ) -> Result<UserIdToken, MslError> {
        Err(MslError::internal("no users in this test"))
    }

    fn renew_user_id_token(
        &self,
        _env: &dyn Environment,
        _user_id_token: &UserIdToken,
        _master_token: &MasterToken,
    ) -> Result<UserIdToken, MslError> {
        Err(MslError::internal("no users in this test"))
    }
}

struct Responder {
    issuer: Issuer,
    entities: EntityAuthRegistry,
    keyx: KeyExchangeRegistry,
    replay: ReplayWindows,
    signer: AsymmetricCryptoContext,
}

impl Responder {
    fn new() -> Self {
        Self {
            issuer: Issuer::new(),
            entities: EntityAuthRegistry::new().with(PskEntityAuth::new().with_entity(DEVICE, psk())),
            keyx: KeyExchangeRegistry::new().with(SymmetricWrappedFactory),
            replay: ReplayWindows::new(64),
            signer: server_signer(),
        }
    }

    fn handle(&self, env: &FixedEnv, request: &[u8]) -> Result<Vec<u8>, MslError> {
        let receive = ReceiveContext::new(&self.entities, &IssuerSessions)
            .with_token_context(self.issuer.issuer_context())
            .with_replay_guard(&self.replay);
        let ReceivedMessage::Message(message) = parse_message(request, receive)? else {
            return Err(MslError::message("error header sent as request"));
        };

        let (target, entity_context, session_context) = match message.master_token() {
            Some(mt) => (KeyExchangeTarget::Renew { master_token: mt }, None, Some(message.header_context.as_ref())),
            None => (
                KeyExchangeTarget::Issue { identity: message.entity_identity().unwrap_or_default() },
                Some(message.header_context.as_ref()),
                None,
            ),
        };
        let exchange = if message.key_request_data.is_empty() {
            None
        } else {
            let ctx = ResponderContext {
                env,
                tokens: &self.issuer,
                entity_context,
                session_context,
                format: EncoderFormat::Cbor,
            };
            Some(self.keyx.respond(&ctx, &message.key_request_data, target)?)
        };

        let response_id = next_counter(message.message_id);
        let header_context: &dyn CryptoContext = match message.master_token() {
            Some(_) => message.header_context.as_ref(),
            None => &self.signer,
        };
        let auth = match message.master_token() {
            Some(mt) => HeaderAuth::MasterToken(mt.clone()),
            None => HeaderAuth::EntityAuth(EntityAuthData::Signed { identity: SERVER.to_string() }),
        };
        let mut header = MessageHeader::new(auth, response_id);
        let payload_context: &dyn CryptoContext = match &exchange {
            Some(data) => &data.crypto_context,
            None => header_context,
        };
        header.key_response_data = exchange.as_ref().map(|data| data.response.clone());

        let mut echo = b"echo: ".to_vec();
        echo.extend_from_slice(&message.payload);
        header.encode(
            MessageContexts { header: header_context, payload: payload_context },
            &echo,
            env,
            &MslConfig::default(),
        )
    }
}

struct Requester {
    store: TokenStore,
    entities: EntityAuthRegistry,
    keyx: KeyExchangeRegistry,
    psk: SymmetricCryptoContext,
}

impl Requester {
    fn new() -> Self {
        Self {
            store: TokenStore::new(&MslConfig::default()),
            entities: EntityAuthRegistry::new().with(SignedEntityAuth::new().with_entity(SERVER, server_verifier())),
            keyx: KeyExchangeRegistry::new().with(SymmetricWrappedFactory),
            psk: psk(),
        }
    }

    /// Send `payload`, renewing the master token when `renew` is set.
    fn send(&self, env: &FixedEnv, responder: &Responder, payload: &[u8], renew: bool) -> Result<Vec<u8>, MslError> {
        let config = MslConfig::default();
        let master_token = self.store.get_master_token(DEVICE);
        let session = master_token.as_ref().and_then(|mt| self.store.get_crypto_context(DEVICE, mt));
        let session_context = session.as_deref().map(|s| s as &dyn CryptoContext);
        let requester = RequesterContext {
            identity: DEVICE,
            entity_context: Some(&self.psk),
            session_context,
            master_token: master_token.as_ref(),
        };

        let request_id = env.random_counter();
        let mut header = match &master_token {
            Some(mt) => {
                let mut header = MessageHeader::new(HeaderAuth::MasterToken(mt.clone()), request_id);
                header.non_replayable_id = Some(self.store.next_non_replayable_id(DEVICE, mt));
                header
            },
            None => MessageHeader::new(
                HeaderAuth::EntityAuth(EntityAuthData::Psk { identity: DEVICE.to_string() }),
                request_id,
            ),
        };
        let mut pending = if master_token.is_none() || renew {
            let requests = self.keyx.requests(env, &requester, &[KeyExchangeScheme::SymmetricWrapped])?;
            header.renewable = true;
            let pending = PendingKeyExchange::new(requests);
            header.key_request_data = pending.request_data();
            Some(pending)
        } else {
            None
        };

        let header_context: &dyn CryptoContext = session_context.unwrap_or(&self.psk);
        let bytes = header.encode(MessageContexts::single(header_context), payload, env, &config)?;
        let response = responder.handle(env, &bytes)?;

        let sessions = StoreSessions::new(&self.store, DEVICE);
        let mut receive = ReceiveContext::new(&self.entities, &sessions).expecting_response_to(request_id);
        if let Some(pending) = pending.as_mut() {
            receive = receive.with_key_exchange(ResponseKeyExchange { pending, registry: &self.keyx, requester });
        }
        let ReceivedMessage::Message(message) = parse_message(&response, receive)? else {
            return Err(MslError::message("unexpected error header"));
        };

        if let Some(negotiated) = message.negotiated {
            self.store.merge(DEVICE, StoreUpdate {
                master_token: Some((negotiated.master_token, negotiated.crypto_context)),
                ..StoreUpdate::default()
            })?;
        }
        Ok(message.payload)
    }
}

#[test]
fn bootstrap_then_master_token_request() {
    let env = FixedEnv::new(NOW, 1);
    let responder = Responder::new();
    let requester = Requester::new();

    let reply = requester.send(&env, &responder, b"hello", false).unwrap();
    assert_eq!(reply, b"echo: hello");

    let mt = requester.store.get_master_token(DEVICE).unwrap();
    assert!(!mt.is_verified(), "requester cannot verify responder tokens");
    assert_eq!(mt.sequence_number(), 1);

    let reply = requester.send(&env, &responder, b"again", false).unwrap();
    assert_eq!(reply, b"echo: again");
}

#[test]
fn renewal_in_window_yields_newer_unexpired_token() {
    let env = FixedEnv::new(NOW, 2);
    let responder = Responder::new();
    let requester = Requester::new();
    requester.send(&env, &responder, b"bootstrap", false).unwrap();
    let first = requester.store.get_master_token(DEVICE).unwrap();

    env.advance(15);
    let decision = renewal::decide(&first, env.now_secs(), &MslConfig::default()).unwrap();
    assert!(decision.should_renew(&MslConfig::default()));

    requester.send(&env, &responder, b"renew", true).unwrap();
    let renewed = requester.store.get_master_token(DEVICE).unwrap();

    assert_eq!(renewed.serial_number(), first.serial_number());
    assert!(renewed.sequence_number() > first.sequence_number());
    assert!(!renewed.is_expired(env.now_secs()));
    assert!(requester.store.get_crypto_context(DEVICE, &first).is_some(), "superseded session kept");
}

#[test]
fn long_expired_token_is_not_renewed() {
    let env = FixedEnv::new(NOW - 30, 3);
    let responder = Responder::new();
    let requester = Requester::new();
    requester.send(&env, &responder, b"bootstrap", false).unwrap();
    let mt = requester.store.get_master_token(DEVICE).unwrap();
    assert_eq!((mt.renewal_window(), mt.expiration()), (NOW - 20, NOW - 10));

    env.set_now(NOW);
    let err = renewal::decide(&mt, env.now_secs(), &MslConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
}

#[test]
fn replayed_request_rejected() {
    let env = FixedEnv::new(NOW, 4);
    let responder = Responder::new();
    let requester = Requester::new();
    requester.send(&env, &responder, b"bootstrap", false).unwrap();

    let mt = requester.store.get_master_token(DEVICE).unwrap();
    let session = requester.store.get_crypto_context(DEVICE, &mt).unwrap();
    let mut header = MessageHeader::new(HeaderAuth::MasterToken(mt.clone()), 5);
    header.non_replayable_id = Some(requester.store.next_non_replayable_id(DEVICE, &mt));
    let bytes = header.encode(MessageContexts::single(session.as_ref()), b"pay", &env, &MslConfig::default()).unwrap();

    assert!(responder.handle(&env, &bytes).is_ok());
    assert_eq!(responder.handle(&env, &bytes).unwrap_err().kind(), ErrorKind::Replay);
}

#[test]
fn concurrent_readers_see_one_current_token() {
    let env = FixedEnv::new(NOW, 5);
    let responder = Responder::new();
    let requester = Arc::new(Requester::new());
    requester.send(&env, &responder, b"bootstrap", false).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let requester = Arc::clone(&requester);
            std::thread::spawn(move || requester.store.get_master_token(DEVICE).map(|mt| mt.serial_number()))
        })
        .collect();
    let serials: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(serials.windows(2).all(|w| w[0] == w[1]));
}
