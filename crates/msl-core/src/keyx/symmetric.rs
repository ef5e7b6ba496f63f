//! Symmetric wrapped key exchange.
//!
//! Fresh session keys wrapped under the entity's pre-shared key or under the
//! current session context.

use msl_crypto::CryptoContext;
use msl_proto::{KeyExchangeScheme, KeyRequestData, KeyResponseData, KeyResponseParams, SymmetricKeyId};

use super::{
    KeyExchangeData, KeyExchangeFactory, KeyExchangeTarget, KeyRequest, NegotiatedSession, RequesterContext,
    ResponderContext, fresh_session_keys, issue_master_token, keys_from_slices, negotiated_session,
};
use crate::{env::Environment, error::MslError};

/// Symmetric wrapped scheme.
///
/// The requester asks for session wrapping when it holds a session, and for
/// pre-shared key wrapping otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymmetricWrappedFactory;

fn wrapping_context<'a>(
    key_id: SymmetricKeyId,
    entity_context: Option<&'a dyn CryptoContext>,
    session_context: Option<&'a dyn CryptoContext>,
) -> Result<&'a dyn CryptoContext, MslError> {
    let ctx = match key_id {
        SymmetricKeyId::Psk => entity_context,
        SymmetricKeyId::Session => session_context,
    };
    ctx.ok_or_else(|| MslError::key_exchange(format!("no {key_id:?} context to wrap session keys")))
}

impl KeyExchangeFactory for SymmetricWrappedFactory {
    fn scheme(&self) -> KeyExchangeScheme {
        KeyExchangeScheme::SymmetricWrapped
    }

    fn request(&self, _env: &dyn Environment, ctx: &RequesterContext<'_>) -> Result<KeyRequest, MslError> {
        let key_id = if ctx.session_context.is_some() && ctx.master_token.is_some() {
            SymmetricKeyId::Session
        } else if ctx.entity_context.is_some() {
            SymmetricKeyId::Psk
        } else {
            return Err(MslError::key_exchange("symmetric wrapped exchange needs a pre-shared key or session"));
        };
        Ok(KeyRequest::new(KeyRequestData::SymmetricWrapped { key_id }))
    }

    fn respond(
        &self,
        ctx: &ResponderContext<'_>,
        request: &KeyRequestData,
        target: KeyExchangeTarget<'_>,
    ) -> Result<KeyExchangeData, MslError> {
        let KeyRequestData::SymmetricWrapped { key_id } = request else {
            return Err(MslError::internal(format!("symmetric factory given {:?} request", request.scheme())));
        };
        let wrapper = wrapping_context(*key_id, ctx.entity_context, ctx.session_context)?;

        let keys = fresh_session_keys(ctx.env);
        let (master_token, crypto_context) = issue_master_token(ctx, target, &keys)?;

        let params = KeyResponseParams::SymmetricWrapped {
            key_id: *key_id,
            encryption_key: wrapper.wrap(keys.encryption_key())?,
            hmac_key: wrapper.wrap(keys.hmac_key())?,
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
            KeyRequestData::SymmetricWrapped { key_id: requested },
            KeyResponseParams::SymmetricWrapped { key_id, encryption_key, hmac_key },
        ) = (request.data(), &response.params)
        else {
            return Err(MslError::internal("symmetric factory given mismatched request and response"));
        };
        if requested != key_id {
            return Err(MslError::message(format!("requested {requested:?} wrapping, response used {key_id:?}")));
        }

        let unwrapper = wrapping_context(*key_id, ctx.entity_context, ctx.session_context)?;
        let keys = keys_from_slices(&unwrapper.unwrap(encryption_key)?, &unwrapper.unwrap(hmac_key)?)?;
        negotiated_session(ctx, response, keys)
    }
}
