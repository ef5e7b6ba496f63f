//! Service tokens.

use msl_crypto::CryptoContext;
use msl_proto::{EncoderFormat, ServiceTokenData, TokenEnvelope};

use super::{MasterToken, UserIdToken};
use crate::{env::Environment, error::MslError};

/// Uniqueness scope of a service token.
///
/// A store holds at most one token per scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceTokenScope {
    /// Token name
    pub name: String,
    /// Bound master token serial number
    pub mt_serial_number: Option<u64>,
    /// Bound user id token serial number
    pub uit_serial_number: Option<u64>,
}

/// Fields of a service token being created.
#[derive(Debug, Clone, Copy)]
pub struct ServiceTokenFields<'a> {
    /// Token name
    pub name: &'a str,
    /// Application data; empty marks deletion
    pub data: &'a [u8],
    /// Master token to bind to
    pub master_token: Option<&'a MasterToken>,
    /// User id token to bind to (requires `master_token`)
    pub user_id_token: Option<&'a UserIdToken>,
    /// Encrypt `data`
    pub encrypted: bool,
}

/// Application data capsule, optionally bound to a master token and user
/// id token.
#[derive(Debug, Clone)]
pub struct ServiceToken {
    envelope: TokenEnvelope,
    scope: ServiceTokenScope,
    encrypted: bool,
    deleted: bool,
    data: Option<Vec<u8>>,
    verified: bool,
}

impl ServiceToken {
    /// Create a service token protected by `ctx`.
    ///
    /// Empty data is never encrypted so the deletion marker stays readable
    /// by every receiver.
    ///
    /// # Errors
    ///
    /// - `Message` if bound to a user id token without a master token, or
    ///   the user id token is not bound to the master token
    /// - `Crypto` if `ctx` cannot encrypt or sign
    pub fn create(
        fields: ServiceTokenFields<'_>,
        ctx: &dyn CryptoContext,
        env: &dyn Environment,
        format: EncoderFormat,
    ) -> Result<Self, MslError> {
        if let Some(uit) = fields.user_id_token {
            let Some(mt) = fields.master_token else {
                return Err(MslError::message(format!(
                    "service token {} bound to a user id token without a master token",
                    fields.name
                )));
            };
            if !uit.is_bound_to(mt) {
                return Err(MslError::message(format!(
                    "service token {} binds a user id token of another master token",
                    fields.name
                )));
            }
        }

        let encrypt = fields.encrypted && !fields.data.is_empty();
        let service_data =
            if encrypt { ctx.encrypt(fields.data, &env.entropy())? } else { fields.data.to_vec() };

        let data = ServiceTokenData {
            name: fields.name.to_string(),
            mt_serial_number: fields.master_token.map(MasterToken::serial_number),
            uit_serial_number: fields.user_id_token.map(UserIdToken::serial_number),
            encrypted: fields.encrypted,
            service_data,
        };
        data.validate()?;

        let tokendata = format.encode(&data)?;
        let signature = ctx.sign(&tokendata)?;

        Ok(Self {
            envelope: TokenEnvelope { tokendata, signature },
            scope: ServiceTokenScope {
                name: data.name,
                mt_serial_number: data.mt_serial_number,
                uit_serial_number: data.uit_serial_number,
            },
            encrypted: fields.encrypted,
            deleted: fields.data.is_empty(),
            data: Some(fields.data.to_vec()),
            verified: true,
        })
    }

    /// Parse a service token received alongside `master_token` and
    /// `user_id_token`.
    ///
    /// Without `ctx`, or if the signature does not verify, the token is kept
    /// as unverified; encrypted data then stays unavailable.
    ///
    /// # Errors
    ///
    /// - `Message` if a binding does not match the accompanying tokens
    /// - `Encoding` on malformed token data
    /// - `Crypto` if the signature verified but the data did not decrypt
    pub fn parse(
        envelope: TokenEnvelope,
        master_token: Option<&MasterToken>,
        user_id_token: Option<&UserIdToken>,
        ctx: Option<&dyn CryptoContext>,
    ) -> Result<Self, MslError> {
        let data: ServiceTokenData = msl_proto::decode(&envelope.tokendata)?;
        data.validate()?;

        if let Some(serial) = data.mt_serial_number
            && master_token.map(MasterToken::serial_number) != Some(serial)
        {
            return Err(MslError::message(format!(
                "service token {} bound to master token {serial} not present",
                data.name
            )));
        }
        if let Some(serial) = data.uit_serial_number
            && user_id_token.map(UserIdToken::serial_number) != Some(serial)
        {
            return Err(MslError::message(format!(
                "service token {} bound to user id token {serial} not present",
                data.name
            )));
        }

        let verified = ctx.is_some_and(|c| c.verify(&envelope.tokendata, &envelope.signature));
        let deleted = data.service_data.is_empty();
        let plaintext = match ctx {
            _ if deleted => Some(Vec::new()),
            Some(c) if verified && data.encrypted => Some(c.decrypt(&data.service_data).map_err(
                |e| MslError::crypto(format!("service token {} data: {e}", data.name)),
            )?),
            _ if !data.encrypted => Some(data.service_data),
            _ => None,
        };

        Ok(Self {
            envelope,
            scope: ServiceTokenScope {
                name: data.name,
                mt_serial_number: data.mt_serial_number,
                uit_serial_number: data.uit_serial_number,
            },
            encrypted: data.encrypted,
            deleted,
            data: plaintext,
            verified,
        })
    }

    /// Wire envelope.
    pub fn envelope(&self) -> &TokenEnvelope {
        &self.envelope
    }

    /// Token name.
    pub fn name(&self) -> &str {
        &self.scope.name
    }

    /// Uniqueness scope.
    pub fn scope(&self) -> &ServiceTokenScope {
        &self.scope
    }

    /// Plaintext data, if available.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Whether this token is a deletion marker.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether the data was encrypted on the wire.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Whether the signature was verified.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Whether the plaintext is available.
    pub fn is_decrypted(&self) -> bool {
        self.data.is_some()
    }

    /// Serial number of the bound master token.
    pub fn mt_serial_number(&self) -> Option<u64> {
        self.scope.mt_serial_number
    }

    /// Serial number of the bound user id token.
    pub fn uit_serial_number(&self) -> Option<u64> {
        self.scope.uit_serial_number
    }

    /// Bound to neither a master token nor a user id token.
    pub fn is_unbound(&self) -> bool {
        self.scope.mt_serial_number.is_none() && self.scope.uit_serial_number.is_none()
    }

    /// Whether this token is bound to `master_token`.
    pub fn is_bound_to_master_token(&self, master_token: &MasterToken) -> bool {
        self.scope.mt_serial_number == Some(master_token.serial_number())
    }

    /// Whether this token is bound to `user_id_token`.
    pub fn is_bound_to_user_id_token(&self, user_id_token: &UserIdToken) -> bool {
        self.scope.uit_serial_number == Some(user_id_token.serial_number())
    }
}

impl PartialEq for ServiceToken {
    fn eq(&self, other: &Self) -> bool {
        self.scope == other.scope && self.data == other.data
    }
}

impl Eq for ServiceToken {}
