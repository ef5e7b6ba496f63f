//! Wrap-ladder key exchange.
//!
//! Each exchange issues a new wrapping key, wrapped under the previous one
//! (the pre-shared key on first use), and session keys wrapped under the new
//! wrapping key. The responder keeps no per-entity state: it hands the
//! requester an opaque wrap data blob holding the wrapping key sealed under
//! the responder's private context, and the requester echoes it on the next
//! exchange.
//!
//! ```text
//! request:  mechanism = Psk | Wrap, wrapdata = previous blob
//! response: wrap_key  = previous_wrapper.wrap(new_wrap_key)
//!           wrapdata  = seal(new_wrap_key, expiration)
//!           keys      = new_wrapper.wrap(session keys)
//! ```

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use msl_crypto::{CryptoContext, KEY_SIZE, SymmetricCryptoContext, derive_subkey};
use msl_proto::{
    EncoderFormat, KeyExchangeScheme, KeyRequestData, KeyResponseData, KeyResponseParams, LadderMechanism,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::{
    KeyExchangeData, KeyExchangeFactory, KeyExchangeTarget, KeyRequest, NegotiatedSession, RequesterContext,
    ResponderContext, fresh_session_keys, issue_master_token, keys_from_slices, negotiated_session,
};
use crate::{env::Environment, error::MslError};

/// Requester storage of wrapping contexts, keyed by the wrap data that
/// names them at the responder.
pub trait WrapCryptoContextRepository: Send + Sync {
    /// Store the wrapping context for `wrapdata`; it becomes the latest.
    fn add(&self, wrapdata: Vec<u8>, context: Arc<dyn CryptoContext>);

    /// Wrapping context for `wrapdata`.
    fn get(&self, wrapdata: &[u8]) -> Option<Arc<dyn CryptoContext>>;

    /// Forget `wrapdata`.
    fn remove(&self, wrapdata: &[u8]);

    /// Most recently added wrap data and its context.
    fn latest(&self) -> Option<(Vec<u8>, Arc<dyn CryptoContext>)>;
}

/// In-memory [`WrapCryptoContextRepository`].
#[derive(Default)]
pub struct InMemoryWrapRepository {
    entries: Mutex<Vec<(Vec<u8>, Arc<dyn CryptoContext>)>>,
}

impl InMemoryWrapRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored wrapping contexts.
    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("Mutex poisoned").len()
    }

    /// Whether the repository is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for InMemoryWrapRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryWrapRepository").field("len", &self.len()).finish()
    }
}

impl WrapCryptoContextRepository for InMemoryWrapRepository {
    #[allow(clippy::expect_used)]
    fn add(&self, wrapdata: Vec<u8>, context: Arc<dyn CryptoContext>) {
        let mut entries = self.entries.lock().expect("Mutex poisoned");
        entries.retain(|(existing, _)| *existing != wrapdata);
        entries.push((wrapdata, context));
    }

    #[allow(clippy::expect_used)]
    fn get(&self, wrapdata: &[u8]) -> Option<Arc<dyn CryptoContext>> {
        let entries = self.entries.lock().expect("Mutex poisoned");
        entries.iter().find(|(existing, _)| existing == wrapdata).map(|(_, ctx)| ctx.clone())
    }

    #[allow(clippy::expect_used)]
    fn remove(&self, wrapdata: &[u8]) {
        self.entries.lock().expect("Mutex poisoned").retain(|(existing, _)| existing != wrapdata);
    }

    #[allow(clippy::expect_used)]
    fn latest(&self) -> Option<(Vec<u8>, Arc<dyn CryptoContext>)> {
        self.entries.lock().expect("Mutex poisoned").last().cloned()
    }
}

/// Wrap data plaintext, sealed under the responder's wrap data context.
#[derive(Serialize, Deserialize)]
struct WrapData {
    wrap_key: Vec<u8>,
    expiration: u64,
}

impl Drop for WrapData {
    fn drop(&mut self) {
        self.wrap_key.zeroize();
    }
}

/// Symmetric context around a ladder wrapping key.
fn wrapping_context(wrap_key: [u8; KEY_SIZE]) -> SymmetricCryptoContext {
    SymmetricCryptoContext::new(
        "wrap ladder",
        derive_subkey(&wrap_key, b"msl ladder encryption"),
        derive_subkey(&wrap_key, b"msl ladder hmac"),
    )
    .with_wrap_key(wrap_key)
}

fn to_wrap_key(bytes: &[u8]) -> Result<[u8; KEY_SIZE], MslError> {
    bytes
        .try_into()
        .map_err(|_| MslError::key_exchange(format!("wrap key is {} bytes, expected {KEY_SIZE}", bytes.len())))
}

/// Wrap-ladder scheme.
///
/// A requester needs a repository; a responder needs the private wrap data
/// context. One process may configure both.
#[derive(Clone, Default)]
pub struct WrapLadderFactory {
    repository: Option<Arc<dyn WrapCryptoContextRepository>>,
    wrapdata_context: Option<Arc<dyn CryptoContext>>,
    wrapdata_lifetime_secs: u64,
}

impl WrapLadderFactory {
    /// Requester side, storing wrapping contexts in `repository`.
    pub fn requester(repository: Arc<dyn WrapCryptoContextRepository>) -> Self {
        Self { repository: Some(repository), ..Self::default() }
    }

    /// Responder side, sealing wrap data under `wrapdata_context`.
    pub fn responder(wrapdata_context: Arc<dyn CryptoContext>, wrapdata_lifetime_secs: u64) -> Self {
        Self { wrapdata_context: Some(wrapdata_context), wrapdata_lifetime_secs, ..Self::default() }
    }

    fn repository(&self) -> Result<&dyn WrapCryptoContextRepository, MslError> {
        self.repository
            .as_deref()
            .ok_or_else(|| MslError::internal("wrap ladder requester without a repository"))
    }

    fn wrapdata_context(&self) -> Result<&dyn CryptoContext, MslError> {
        self.wrapdata_context
            .as_deref()
            .ok_or_else(|| MslError::internal("wrap ladder responder without a wrap data context"))
    }

    fn open_wrapdata(&self, env: &dyn Environment, wrapdata: &[u8]) -> Result<[u8; KEY_SIZE], MslError> {
        let plain = self
            .wrapdata_context()?
            .decrypt(wrapdata)
            .map_err(|e| MslError::crypto(format!("wrap data: {e}")))?;
        let data: WrapData = msl_proto::decode(&plain)?;

        let now = env.now_secs();
        if now >= data.expiration {
            return Err(MslError::expired(format!("wrap data expired at {} (now {now})", data.expiration)));
        }
        to_wrap_key(&data.wrap_key)
    }

    fn seal_wrapdata(
        &self,
        env: &dyn Environment,
        format: EncoderFormat,
        wrap_key: &[u8; KEY_SIZE],
    ) -> Result<Vec<u8>, MslError> {
        let data = WrapData {
            wrap_key: wrap_key.to_vec(),
            expiration: env.now_secs().saturating_add(self.wrapdata_lifetime_secs),
        };
        let plain = format.encode(&data)?;
        Ok(self.wrapdata_context()?.encrypt(&plain, &env.entropy())?)
    }
}

impl fmt::Debug for WrapLadderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapLadderFactory")
            .field("requester", &self.repository.is_some())
            .field("responder", &self.wrapdata_context.is_some())
            .field("wrapdata_lifetime_secs", &self.wrapdata_lifetime_secs)
            .finish()
    }
}

impl KeyExchangeFactory for WrapLadderFactory {
    fn scheme(&self) -> KeyExchangeScheme {
        KeyExchangeScheme::WrapLadder
    }

    fn request(&self, _env: &dyn Environment, ctx: &RequesterContext<'_>) -> Result<KeyRequest, MslError> {
        let data = match self.repository()?.latest() {
            Some((wrapdata, _)) => KeyRequestData::WrapLadder { mechanism: LadderMechanism::Wrap, wrapdata: Some(wrapdata) },
            None if ctx.entity_context.is_some() => {
                KeyRequestData::WrapLadder { mechanism: LadderMechanism::Psk, wrapdata: None }
            },
            None => return Err(MslError::key_exchange("wrap ladder needs wrap data or a pre-shared key")),
        };
        Ok(KeyRequest::new(data))
    }

    fn respond(
        &self,
        ctx: &ResponderContext<'_>,
        request: &KeyRequestData,
        target: KeyExchangeTarget<'_>,
    ) -> Result<KeyExchangeData, MslError> {
        let KeyRequestData::WrapLadder { mechanism, wrapdata } = request else {
            return Err(MslError::internal(format!("wrap ladder factory given {:?} request", request.scheme())));
        };

        let ladder_context;
        let previous: &dyn CryptoContext = match (mechanism, wrapdata) {
            (LadderMechanism::Psk, _) => ctx
                .entity_context
                .ok_or_else(|| MslError::key_exchange("wrap ladder psk mechanism without entity context"))?,
            (LadderMechanism::Wrap, Some(wrapdata)) => {
                ladder_context = wrapping_context(self.open_wrapdata(ctx.env, wrapdata)?);
                &ladder_context
            },
            (LadderMechanism::Wrap, None) => {
                return Err(MslError::message("wrap ladder wrap mechanism without wrap data"));
            },
        };

        let mut new_wrap_key = [0u8; KEY_SIZE];
        ctx.env.random_bytes(&mut new_wrap_key);
        let next = wrapping_context(new_wrap_key);
        let sealed = self.seal_wrapdata(ctx.env, ctx.format, &new_wrap_key);
        let wrapped_key = previous.wrap(&new_wrap_key);
        new_wrap_key.zeroize();

        let keys = fresh_session_keys(ctx.env);
        let (master_token, crypto_context) = issue_master_token(ctx, target, &keys)?;

        let params = KeyResponseParams::WrapLadder {
            wrap_key: wrapped_key?,
            wrapdata: sealed?,
            encryption_key: next.wrap(keys.encryption_key())?,
            hmac_key: next.wrap(keys.hmac_key())?,
        };

        Ok(KeyExchangeData {
            response: KeyResponseData { master_token: master_token.envelope().clone(), params },
            master_token,
            crypto_context,
        })
    }

    fn establish(
        &self,
        ctx: &RequesterContext<'_>,
        request: &KeyRequest,
        response: &KeyResponseData,
    ) -> Result<NegotiatedSession, MslError> {
        let (
            KeyRequestData::WrapLadder { mechanism, wrapdata: previous_wrapdata },
            KeyResponseParams::WrapLadder { wrap_key, wrapdata, encryption_key, hmac_key },
        ) = (request.data(), &response.params)
        else {
            return Err(MslError::internal("wrap ladder factory given mismatched request and response"));
        };
        let repository = self.repository()?;

        let new_wrap_key = match (mechanism, previous_wrapdata) {
            (LadderMechanism::Psk, _) => match ctx.entity_context {
                Some(psk) => psk.unwrap(wrap_key)?,
                None => return Err(MslError::key_exchange("wrap ladder psk mechanism without entity context")),
            },
            (LadderMechanism::Wrap, Some(previous)) => match repository.get(previous) {
                Some(wrapper) => wrapper.unwrap(wrap_key)?,
                None => return Err(MslError::key_exchange("no wrapping context for the echoed wrap data")),
            },
            (LadderMechanism::Wrap, None) => {
                return Err(MslError::internal("wrap ladder wrap request without wrap data"));
            },
        };

        let mut new_wrap_key = to_wrap_key(&new_wrap_key)?;
        let next = wrapping_context(new_wrap_key);
        new_wrap_key.zeroize();

        let keys = keys_from_slices(&next.unwrap(encryption_key)?, &next.unwrap(hmac_key)?)?;
        let session = negotiated_session(ctx, response, keys)?;

        if let Some(previous) = previous_wrapdata {
            repository.remove(previous);
        }
        repository.add(wrapdata.clone(), Arc::new(next));
        Ok(session)
    }
}
