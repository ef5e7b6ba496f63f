//! User id tokens.

use std::hash::{Hash, Hasher};

use msl_crypto::CryptoContext;
use msl_proto::{EncoderFormat, TokenEnvelope, UserData, UserIdTokenData};

use super::MasterToken;
use crate::{auth::MslUser, env::Environment, error::MslError};

/// Fields of a user id token being issued.
#[derive(Debug, Clone, Copy)]
pub struct UserIdTokenFields<'a> {
    /// Renewal window start (seconds since epoch)
    pub renewal_window: u64,
    /// Expiration (seconds since epoch)
    pub expiration: u64,
    /// Token serial number
    pub serial_number: u64,
    /// Authenticated user
    pub user: &'a MslUser,
}

/// Token asserting a user identity, bound to a master token serial number.
#[derive(Debug, Clone)]
pub struct UserIdToken {
    envelope: TokenEnvelope,
    renewal_window: u64,
    expiration: u64,
    mt_serial_number: u64,
    serial_number: u64,
    user: Option<MslUser>,
    verified: bool,
}

impl UserIdToken {
    /// Issue a user id token bound to `master_token`.
    ///
    /// # Errors
    ///
    /// - `Encoding` if the fields violate token invariants
    /// - `Crypto` if the issuer context cannot encrypt or sign
    pub fn create(
        fields: UserIdTokenFields<'_>,
        master_token: &MasterToken,
        issuer: &dyn CryptoContext,
        env: &dyn Environment,
        format: EncoderFormat,
    ) -> Result<Self, MslError> {
        let user_plain = format.encode(&UserData { identity: fields.user.identity().to_string() })?;
        let user_data = issuer.encrypt(&user_plain, &env.entropy())?;

        let data = UserIdTokenData {
            renewal_window: fields.renewal_window,
            expiration: fields.expiration,
            mt_serial_number: master_token.serial_number(),
            serial_number: fields.serial_number,
            user_data,
        };
        data.validate()?;

        let tokendata = format.encode(&data)?;
        let signature = issuer.sign(&tokendata)?;

        Ok(Self {
            envelope: TokenEnvelope { tokendata, signature },
            renewal_window: data.renewal_window,
            expiration: data.expiration,
            mt_serial_number: data.mt_serial_number,
            serial_number: data.serial_number,
            user: Some(fields.user.clone()),
            verified: true,
        })
    }

    /// Parse a user id token that must be bound to `master_token`.
    ///
    /// # Errors
    ///
    /// - `Message` if `master_token` is absent or has another serial number
    /// - `Encoding` on malformed token data
    /// - `Crypto` if the signature verified but the user data did not decrypt
    pub fn parse(
        envelope: TokenEnvelope,
        master_token: Option<&MasterToken>,
        issuer: Option<&dyn CryptoContext>,
    ) -> Result<Self, MslError> {
        let data: UserIdTokenData = msl_proto::decode(&envelope.tokendata)?;
        data.validate()?;

        let Some(master_token) = master_token else {
            return Err(MslError::message("user id token without a master token")
                .with_user_id_token(data.serial_number));
        };
        if data.mt_serial_number != master_token.serial_number() {
            return Err(MslError::message(format!(
                "user id token bound to master token {} not {}",
                data.mt_serial_number,
                master_token.serial_number()
            ))
            .with_user_id_token(data.serial_number)
            .with_master_token(master_token.serial_number(), master_token.sequence_number()));
        }

        let verified = issuer.is_some_and(|ctx| ctx.verify(&envelope.tokendata, &envelope.signature));
        let user = match issuer {
            Some(ctx) if verified => {
                let plain = ctx.decrypt(&data.user_data).map_err(|e| {
                    MslError::crypto(format!("user id token user data: {e}"))
                        .with_user_id_token(data.serial_number)
                })?;
                let user: UserData = msl_proto::decode(&plain)?;
                Some(MslUser::new(user.identity))
            },
            _ => None,
        };

        Ok(Self {
            envelope,
            renewal_window: data.renewal_window,
            expiration: data.expiration,
            mt_serial_number: data.mt_serial_number,
            serial_number: data.serial_number,
            user,
            verified,
        })
    }

    /// Wire envelope.
    pub fn envelope(&self) -> &TokenEnvelope {
        &self.envelope
    }

    /// Serial number.
    #[must_use]
    pub fn serial_number(&self) -> u64 {
        self.serial_number
    }

    /// Serial number of the bound master token.
    #[must_use]
    pub fn mt_serial_number(&self) -> u64 {
        self.mt_serial_number
    }

    /// Renewal window start.
    #[must_use]
    pub fn renewal_window(&self) -> u64 {
        self.renewal_window
    }

    /// Expiration.
    #[must_use]
    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    /// User, if decrypted.
    pub fn user(&self) -> Option<&MslUser> {
        self.user.as_ref()
    }

    /// Whether the signature was verified with the issuer's context.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Whether the user data was decrypted.
    pub fn is_decrypted(&self) -> bool {
        self.user.is_some()
    }

    /// Whether this token is bound to `master_token`.
    pub fn is_bound_to(&self, master_token: &MasterToken) -> bool {
        self.mt_serial_number == master_token.serial_number()
    }

    /// `now >= expiration`
    pub fn is_expired(&self, now: u64) -> bool {
        super::is_expired(self.expiration, now)
    }

    /// `now >= renewal_window`; stays true once expired.
    pub fn is_renewable(&self, now: u64) -> bool {
        super::is_renewable(self.renewal_window, now)
    }
}

impl PartialEq for UserIdToken {
    fn eq(&self, other: &Self) -> bool {
        self.serial_number == other.serial_number && self.mt_serial_number == other.mt_serial_number
    }
}

impl Eq for UserIdToken {}

impl Hash for UserIdToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serial_number.hash(state);
        self.mt_serial_number.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use msl_crypto::{SessionKeys, SymmetricCryptoContext};

    use super::*;
    use crate::{env::FixedEnv, error::ErrorKind, tokens::MasterTokenFields};

    const NOW: u64 = 1_700_000_000;

    fn issuer() -> SymmetricCryptoContext {
        SymmetricCryptoContext::new("issuer", [1; 32], [2; 32])
    }

    fn master_token(serial_number: u64) -> MasterToken {
        let env = FixedEnv::new(NOW, 1);
        let keys = SessionKeys::new([3; 32], [4; 32]);
        let fields = MasterTokenFields {
            renewal_window: NOW + 100,
            expiration: NOW + 200,
            sequence_number: 1,
            serial_number,
            identity: "device-1",
            keys: &keys,
        };
        MasterToken::create(fields, &issuer(), &env, EncoderFormat::Cbor).unwrap()
    }

    fn user_id_token(mt: &MasterToken) -> UserIdToken {
        let env = FixedEnv::new(NOW, 2);
        let user = MslUser::new("kirito");
        let fields =
            UserIdTokenFields { renewal_window: NOW + 10, expiration: NOW + 20, serial_number: 9, user: &user };
        UserIdToken::create(fields, mt, &issuer(), &env, EncoderFormat::Cbor).unwrap()
    }

    #[test]
    fn bound_to_serial_number() {
        let mt = master_token(1);
        let other_serial = master_token(2);
        let uit = user_id_token(&mt);

        assert!(uit.is_bound_to(&mt));
        assert!(!uit.is_bound_to(&other_serial));
    }

    #[test]
    fn issuer_parse_recovers_user() {
        let mt = master_token(1);
        let uit = user_id_token(&mt);
        let parsed = UserIdToken::parse(uit.envelope().clone(), Some(&mt), Some(&issuer())).unwrap();

        assert!(parsed.is_verified());
        assert_eq!(parsed.user().map(MslUser::identity), Some("kirito"));
    }

    #[test]
    fn client_parse_is_unverified() {
        let mt = master_token(1);
        let uit = user_id_token(&mt);
        let parsed = UserIdToken::parse(uit.envelope().clone(), Some(&mt), None).unwrap();

        assert!(!parsed.is_verified());
        assert!(!parsed.is_decrypted());
        assert_eq!(parsed.serial_number(), 9);
        assert_eq!(parsed.mt_serial_number(), 1);
    }

    #[test]
    fn parse_with_unbound_master_token_is_message_error() {
        let uit = user_id_token(&master_token(1));
        let result = UserIdToken::parse(uit.envelope().clone(), Some(&master_token(2)), None);

        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Message));
    }

    #[test]
    fn parse_without_master_token_is_message_error() {
        let uit = user_id_token(&master_token(1));
        let result = UserIdToken::parse(uit.envelope().clone(), None, None);

        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Message));
    }

    #[test]
    fn lifecycle() {
        let uit = user_id_token(&master_token(1));
        assert!(!uit.is_renewable(NOW));
        assert!(uit.is_renewable(NOW + 10));
        assert!(!uit.is_expired(NOW + 19));
        assert!(uit.is_expired(NOW + 20));
    }
}
