//! X25519 Diffie-Hellman key exchange.
//!
//! Both sides contribute an ephemeral key pair. Session keys come from HKDF
//! over the shared secret with both public keys (requester first) as
//! context, so no key material crosses the wire.

use msl_crypto::X25519KeyPair;
use msl_proto::{KeyExchangeScheme, KeyRequestData, KeyResponseData, KeyResponseParams};

use super::{
    KeyExchangeData, KeyExchangeFactory, KeyExchangeTarget, KeyRequest, NegotiatedSession, RequesterContext,
    ResponderContext, issue_master_token, negotiated_session,
};
use crate::{env::Environment, error::MslError};

/// Parameters id of the X25519 group.
pub const X25519_PARAMETERS_ID: &str = "x25519";

const SESSION_LABEL: &[u8] = b"msl diffie-hellman session";

/// Diffie-Hellman scheme over X25519.
#[derive(Debug, Clone)]
pub struct DiffieHellmanFactory {
    parameters_id: String,
}

impl DiffieHellmanFactory {
    /// Factory for the X25519 group.
    pub fn new() -> Self {
        Self { parameters_id: X25519_PARAMETERS_ID.to_string() }
    }
}

impl Default for DiffieHellmanFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn agreement_context(requester_public: &[u8], responder_public: &[u8]) -> Vec<u8> {
    let mut context = Vec::with_capacity(requester_public.len() + responder_public.len());
    context.extend_from_slice(requester_public);
    context.extend_from_slice(responder_public);
    context
}

impl KeyExchangeFactory for DiffieHellmanFactory {
    fn scheme(&self) -> KeyExchangeScheme {
        KeyExchangeScheme::DiffieHellman
    }

    fn request(&self, env: &dyn Environment, _ctx: &RequesterContext<'_>) -> Result<KeyRequest, MslError> {
        let key_pair = X25519KeyPair::from_entropy(&env.entropy());
        let data = KeyRequestData::DiffieHellman {
            parameters_id: self.parameters_id.clone(),
            public_key: key_pair.public_key().to_vec(),
        };
        Ok(KeyRequest::with_secret(data, key_pair))
    }

    fn respond(
        &self,
        ctx: &ResponderContext<'_>,
        request: &KeyRequestData,
        target: KeyExchangeTarget<'_>,
    ) -> Result<KeyExchangeData, MslError> {
        let KeyRequestData::DiffieHellman { parameters_id, public_key } = request else {
            return Err(MslError::internal(format!("diffie-hellman factory given {:?} request", request.scheme())));
        };
        if *parameters_id != self.parameters_id {
            return Err(MslError::key_exchange(format!("unknown diffie-hellman parameters {parameters_id}")));
        }

        let key_pair = X25519KeyPair::from_entropy(&ctx.env.entropy());
        let responder_public = key_pair.public_key();
        let keys = key_pair.agree(public_key, SESSION_LABEL, &agreement_context(public_key, &responder_public))?;
        let (master_token, crypto_context) = issue_master_token(ctx, target, &keys)?;

        let params = KeyResponseParams::DiffieHellman {
            parameters_id: parameters_id.clone(),
            public_key: responder_public.to_vec(),
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
        let KeyResponseParams::DiffieHellman { parameters_id, public_key: responder_public } = &response.params
        else {
            return Err(MslError::internal("diffie-hellman factory given mismatched response"));
        };
        if *parameters_id != self.parameters_id {
            return Err(MslError::message(format!("response uses diffie-hellman parameters {parameters_id}")));
        }
        let Some(key_pair) = request.secret() else {
            return Err(MslError::internal("diffie-hellman request without its private key"));
        };

        let requester_public = key_pair.public_key();
        let keys = key_pair.agree(
            responder_public,
            SESSION_LABEL,
            &agreement_context(&requester_public, responder_public),
        )?;
        negotiated_session(ctx, response, keys)
    }
}
