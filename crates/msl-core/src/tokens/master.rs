//! Master tokens.

use std::hash::{Hash, Hasher};

use msl_crypto::{CryptoContext, SessionCryptoContext, SessionKeys};
use msl_proto::{EncoderFormat, MAX_COUNTER, MasterTokenData, SessionData, TokenEnvelope};

use super::SEQUENCE_WRAP_WINDOW;
use crate::{env::Environment, error::MslError};

/// Fields of a master token being issued.
#[derive(Debug, Clone, Copy)]
pub struct MasterTokenFields<'a> {
    /// Renewal window start (seconds since epoch)
    pub renewal_window: u64,
    /// Expiration (seconds since epoch)
    pub expiration: u64,
    /// Renewal counter
    pub sequence_number: u64,
    /// Stable serial number
    pub serial_number: u64,
    /// Entity identity
    pub identity: &'a str,
    /// Session keys
    pub keys: &'a SessionKeys,
}

#[derive(Debug, Clone)]
struct Session {
    identity: String,
    keys: SessionKeys,
}

/// Token asserting an entity identity and carrying its session keys.
///
/// Equality and hashing use (serial number, sequence number) only.
///
/// # Invariants
///
/// - `renewal_window < expiration`
/// - a decrypted token is always verified
#[derive(Debug, Clone)]
pub struct MasterToken {
    envelope: TokenEnvelope,
    renewal_window: u64,
    expiration: u64,
    sequence_number: u64,
    serial_number: u64,
    session: Option<Session>,
    verified: bool,
}

impl MasterToken {
    /// Issue a master token protected by the issuer's context.
    ///
    /// # Errors
    ///
    /// - `Encoding` if the fields violate token invariants
    /// - `Crypto` if the issuer context cannot encrypt or sign
    pub fn create(
        fields: MasterTokenFields<'_>,
        issuer: &dyn CryptoContext,
        env: &dyn Environment,
        format: EncoderFormat,
    ) -> Result<Self, MslError> {
        let session = SessionData {
            identity: fields.identity.to_string(),
            encryption_key: fields.keys.encryption_key().to_vec(),
            hmac_key: fields.keys.hmac_key().to_vec(),
        };
        let session_plain = format.encode(&session)?;
        let session_data = issuer.encrypt(&session_plain, &env.entropy())?;

        let data = MasterTokenData {
            renewal_window: fields.renewal_window,
            expiration: fields.expiration,
            sequence_number: fields.sequence_number,
            serial_number: fields.serial_number,
            session_data,
        };
        data.validate()?;

        let tokendata = format.encode(&data)?;
        let signature = issuer.sign(&tokendata)?;

        Ok(Self {
            envelope: TokenEnvelope { tokendata, signature },
            renewal_window: data.renewal_window,
            expiration: data.expiration,
            sequence_number: data.sequence_number,
            serial_number: data.serial_number,
            session: Some(Session { identity: fields.identity.to_string(), keys: fields.keys.clone() }),
            verified: true,
        })
    }

    /// Parse a master token.
    ///
    /// With the issuer's context the signature is checked and the session
    /// data decrypted. Without it (or if the signature does not verify) the
    /// token is returned unverified and undecrypted.
    ///
    /// # Errors
    ///
    /// - `Encoding` on malformed token data or invariant violations
    /// - `Crypto` if the signature verified but the session data did not
    ///   decrypt
    pub fn parse(envelope: TokenEnvelope, issuer: Option<&dyn CryptoContext>) -> Result<Self, MslError> {
        let data: MasterTokenData = msl_proto::decode(&envelope.tokendata)?;
        data.validate()?;

        let verified = issuer.is_some_and(|ctx| ctx.verify(&envelope.tokendata, &envelope.signature));
        let session = match issuer {
            Some(ctx) if verified => {
                let plain = ctx.decrypt(&data.session_data).map_err(|e| {
                    MslError::crypto(format!("master token session data: {e}"))
                        .with_master_token(data.serial_number, data.sequence_number)
                })?;
                let session: SessionData = msl_proto::decode(&plain)?;
                let keys = SessionKeys::from_slices(&session.encryption_key, &session.hmac_key)?;
                Some(Session { identity: session.identity, keys })
            },
            _ => None,
        };

        Ok(Self {
            envelope,
            renewal_window: data.renewal_window,
            expiration: data.expiration,
            sequence_number: data.sequence_number,
            serial_number: data.serial_number,
            session,
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

    /// Sequence number.
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
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

    /// Entity identity, if decrypted.
    pub fn identity(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.identity.as_str())
    }

    /// Session keys, if decrypted.
    pub fn session_keys(&self) -> Option<&SessionKeys> {
        self.session.as_ref().map(|s| &s.keys)
    }

    /// Whether the signature was verified with the issuer's context.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Whether the session data was decrypted.
    pub fn is_decrypted(&self) -> bool {
        self.session.is_some()
    }

    /// `now >= expiration`
    pub fn is_expired(&self, now: u64) -> bool {
        super::is_expired(self.expiration, now)
    }

    /// `now >= renewal_window`; stays true once expired.
    pub fn is_renewable(&self, now: u64) -> bool {
        super::is_renewable(self.renewal_window, now)
    }

    /// `now >= expiration + grace_secs`
    pub fn is_past_grace(&self, now: u64, grace_secs: u64) -> bool {
        super::is_past_grace(self.expiration, now, grace_secs)
    }

    /// Whether this token supersedes `other`.
    ///
    /// Sequence numbers are compared with wraparound: a much smaller sequence
    /// number is newer if the gap is within the wrap window of the counter
    /// space. Equal sequence numbers fall back to expiration.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        let (this, that) = (self.sequence_number, other.sequence_number);
        if this == that {
            return self.expiration > other.expiration;
        }
        if this > that {
            that + MAX_COUNTER >= this + SEQUENCE_WRAP_WINDOW
        } else {
            this + MAX_COUNTER < that + SEQUENCE_WRAP_WINDOW
        }
    }

    /// Session crypto context, if the session data was decrypted.
    pub fn session_crypto_context(&self) -> Option<SessionCryptoContext> {
        self.session
            .as_ref()
            .map(|s| SessionCryptoContext::new(&s.identity, self.sequence_number, s.keys.clone()))
    }
}

impl PartialEq for MasterToken {
    fn eq(&self, other: &Self) -> bool {
        self.serial_number == other.serial_number && self.sequence_number == other.sequence_number
    }
}

impl Eq for MasterToken {}

impl Hash for MasterToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serial_number.hash(state);
        self.sequence_number.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use msl_crypto::SymmetricCryptoContext;

    use super::*;
    use crate::env::FixedEnv;

    const NOW: u64 = 1_700_000_000;

    fn issuer() -> SymmetricCryptoContext {
        SymmetricCryptoContext::new("issuer", [1; 32], [2; 32])
    }

    fn keys() -> SessionKeys {
        SessionKeys::new([3; 32], [4; 32])
    }

    fn token(sequence_number: u64, renewal_window: u64, expiration: u64) -> MasterToken {
        let env = FixedEnv::new(NOW, 1);
        let keys = keys();
        let fields = MasterTokenFields {
            renewal_window,
            expiration,
            sequence_number,
            serial_number: 42,
            identity: "device-1",
            keys: &keys,
        };
        MasterToken::create(fields, &issuer(), &env, EncoderFormat::Cbor).unwrap()
    }

    #[test]
    fn issuer_parse_is_verified_and_decrypted() {
        let created = token(1, NOW + 10, NOW + 20);
        let parsed = MasterToken::parse(created.envelope().clone(), Some(&issuer())).unwrap();

        assert!(parsed.is_verified());
        assert!(parsed.is_decrypted());
        assert_eq!(parsed.identity(), Some("device-1"));
        assert_eq!(parsed.session_keys(), Some(&keys()));
        assert_eq!(parsed, created);
    }

    #[test]
    fn parse_without_issuer_is_untrusted_hint() {
        let created = token(1, NOW + 10, NOW + 20);
        let parsed = MasterToken::parse(created.envelope().clone(), None).unwrap();

        assert!(!parsed.is_verified());
        assert!(!parsed.is_decrypted());
        assert_eq!(parsed.identity(), None);
        assert_eq!(parsed.renewal_window(), NOW + 10);
        assert_eq!(parsed.expiration(), NOW + 20);
        assert!(parsed.session_crypto_context().is_none());
    }

    #[test]
    fn foreign_issuer_yields_unverified_token() {
        let created = token(1, NOW + 10, NOW + 20);
        let other = SymmetricCryptoContext::new("issuer", [9; 32], [9; 32]);
        let parsed = MasterToken::parse(created.envelope().clone(), Some(&other)).unwrap();

        assert!(!parsed.is_verified());
        assert!(!parsed.is_decrypted());
    }

    #[test]
    fn tampered_tokendata_is_encoding_error_or_unverified() {
        let created = token(1, NOW + 10, NOW + 20);
        let mut envelope = created.envelope().clone();
        envelope.tokendata.truncate(envelope.tokendata.len() / 2);

        let result = MasterToken::parse(envelope, Some(&issuer()));
        assert_eq!(result.err().map(|e| e.kind()), Some(crate::error::ErrorKind::Encoding));
    }

    #[test]
    fn create_rejects_inverted_window() {
        let env = FixedEnv::new(NOW, 1);
        let keys = keys();
        let fields = MasterTokenFields {
            renewal_window: NOW + 20,
            expiration: NOW + 10,
            sequence_number: 1,
            serial_number: 42,
            identity: "device-1",
            keys: &keys,
        };
        let result = MasterToken::create(fields, &issuer(), &env, EncoderFormat::Cbor);
        assert_eq!(result.err().map(|e| e.kind()), Some(crate::error::ErrorKind::Encoding));
    }

    #[test]
    fn lifecycle_predicates() {
        let token = token(1, NOW + 10, NOW + 20);

        assert!(!token.is_renewable(NOW));
        assert!(token.is_renewable(NOW + 15));
        assert!(!token.is_expired(NOW + 15));
        assert!(token.is_expired(NOW + 20));
        assert!(token.is_renewable(NOW + 30));
        assert!(token.is_past_grace(NOW + 25, 5));
    }

    #[test]
    fn newer_by_sequence_and_expiration() {
        let old = token(5, NOW + 10, NOW + 20);
        let new = token(6, NOW + 10, NOW + 20);
        let longer = token(5, NOW + 10, NOW + 30);

        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(longer.is_newer_than(&old));
        assert!(!old.is_newer_than(&old));
    }

    #[test]
    fn newer_across_wraparound() {
        let before_wrap = token(MAX_COUNTER, NOW + 10, NOW + 20);
        let after_wrap = token(0, NOW + 10, NOW + 20);

        assert!(after_wrap.is_newer_than(&before_wrap));
        assert!(!before_wrap.is_newer_than(&after_wrap));
    }

    #[test]
    fn session_context_key_id() {
        let ctx = token(3, NOW + 10, NOW + 20).session_crypto_context().unwrap();
        assert_eq!(ctx.key_id(), "device-1_3");
    }
}
