//! Asymmetric wrapped key exchange.
//!
//! The requester generates an ephemeral X25519 key pair per request. The
//! responder seals the session keys to its public key; only the holder of
//! the ephemeral secret can open them.

use msl_crypto::{AsymmetricCryptoContext, AsymmetricMode, CryptoContext, X25519KeyPair};
use msl_proto::{KeyExchangeScheme, KeyRequestData, KeyResponseData, KeyResponseParams};

use super::{
    KeyExchangeData, KeyExchangeFactory, KeyExchangeTarget, KeyRequest, NegotiatedSession, RequesterContext,
    ResponderContext, fresh_session_keys, issue_master_token, keys_from_slices, negotiated_session,
};
use crate::{env::Environment, error::MslError};

/// Asymmetric wrapped scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsymmetricWrappedFactory;

impl KeyExchangeFactory for AsymmetricWrappedFactory {
    fn scheme(&self) -> KeyExchangeScheme {
        KeyExchangeScheme::AsymmetricWrapped
    }

    fn request(&self, env: &dyn Environment, _ctx: &RequesterContext<'_>) -> Result<KeyRequest, MslError> {
        let key_pair = X25519KeyPair::from_entropy(&env.entropy());
        let key_pair_id = format!("ephemeral-{:013x}", env.random_counter());
        let data = KeyRequestData::AsymmetricWrapped { key_pair_id, public_key: key_pair.public_key().to_vec() };
        Ok(KeyRequest::with_secret(data, key_pair))
    }

    fn respond(
        &self,
        ctx: &ResponderContext<'_>,
        request: &KeyRequestData,
        target: KeyExchangeTarget<'_>,
    ) -> Result<KeyExchangeData, MslError> {
        let KeyRequestData::AsymmetricWrapped { key_pair_id, public_key } = request else {
            return Err(MslError::internal(format!("asymmetric factory given {:?} request", request.scheme())));
        };
        let Ok(public_key) = <[u8; 32]>::try_from(public_key.as_slice()) else {
            return Err(MslError::key_exchange(format!(
                "ephemeral public key is {} bytes, expected 32",
                public_key.len()
            )));
        };
        let sealer = AsymmetricCryptoContext::new(key_pair_id.clone(), AsymmetricMode::EncryptDecrypt)
            .with_encryption_public_key(public_key);

        let keys = fresh_session_keys(ctx.env);
        let (master_token, crypto_context) = issue_master_token(ctx, target, &keys)?;

        let params = KeyResponseParams::AsymmetricWrapped {
            key_pair_id: key_pair_id.clone(),
            encryption_key: sealer.encrypt(keys.encryption_key(), &ctx.env.entropy())?,
            hmac_key: sealer.encrypt(keys.hmac_key(), &ctx.env.entropy())?,
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
            KeyRequestData::AsymmetricWrapped { key_pair_id: requested, .. },
            KeyResponseParams::AsymmetricWrapped { key_pair_id, encryption_key, hmac_key },
        ) = (request.data(), &response.params)
        else {
            return Err(MslError::internal("asymmetric factory given mismatched request and response"));
        };
        if requested != key_pair_id {
            return Err(MslError::message(format!("response for key pair {key_pair_id}, requested {requested}")));
        }
        let Some(secret) = request.secret() else {
            return Err(MslError::internal("asymmetric request without its ephemeral secret"));
        };

        let opener = AsymmetricCryptoContext::new(key_pair_id.clone(), AsymmetricMode::EncryptDecrypt)
            .with_encryption_secret(secret.secret_bytes());
        let keys = keys_from_slices(&opener.decrypt(encryption_key)?, &opener.decrypt(hmac_key)?)?;
        negotiated_session(ctx, response, keys)
    }
}
