//! Protocol policy configuration.
//!
//! Every policy constant is a field of [`MslConfig`] with a documented
//! default. The struct deserializes with `#[serde(default)]`, so a partial
//! configuration document overrides only what it names. Durations are whole
//! seconds.

use msl_proto::{EncoderFormat, KeyExchangeScheme};
use serde::{Deserialize, Serialize};

use crate::error::MslError;

/// How many superseded master token sequence numbers remain acceptable.
pub const DEFAULT_SEQUENCE_TOLERANCE: u64 = 32;

/// Width of the non-replayable id window per master token serial number.
pub const DEFAULT_REPLAY_WINDOW: u64 = 65_536;

/// Seconds an expired master token may still be renewed.
pub const DEFAULT_RENEWAL_GRACE_SECS: u64 = 5;

/// Seconds from master token issue until its renewal window opens.
pub const DEFAULT_MASTER_TOKEN_RENEWAL_OFFSET_SECS: u64 = 6 * 60 * 60;

/// Seconds from master token issue until it expires.
pub const DEFAULT_MASTER_TOKEN_LIFETIME_SECS: u64 = 24 * 60 * 60;

/// Seconds from user id token issue until its renewal window opens.
pub const DEFAULT_USER_ID_TOKEN_RENEWAL_OFFSET_SECS: u64 = 60 * 60;

/// Seconds from user id token issue until it expires.
pub const DEFAULT_USER_ID_TOKEN_LIFETIME_SECS: u64 = 2 * 60 * 60;

/// Seconds wrap-ladder wrap data stays valid.
pub const DEFAULT_WRAPDATA_LIFETIME_SECS: u64 = 7 * 24 * 60 * 60;

/// Maximum application bytes per payload chunk.
pub const DEFAULT_PAYLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Protocol policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MslConfig {
    /// Superseded master tokens within this many sequence numbers of the
    /// newest are still accepted and kept in the store
    pub sequence_tolerance: u64,
    /// Non-replayable id window per master token serial number
    pub replay_window: u64,
    /// Seconds after expiration during which renewal is still attempted
    pub renewal_grace_secs: u64,
    /// Master token renewal window offset from issue time
    pub master_token_renewal_offset_secs: u64,
    /// Master token lifetime
    pub master_token_lifetime_secs: u64,
    /// User id token renewal window offset from issue time
    pub user_id_token_renewal_offset_secs: u64,
    /// User id token lifetime
    pub user_id_token_lifetime_secs: u64,
    /// Renew master tokens as soon as their renewal window opens
    pub proactive_renewal: bool,
    /// Encoding for outgoing messages and persisted snapshots
    pub encoding: EncoderFormat,
    /// Wrap-ladder wrap data lifetime
    pub wrapdata_lifetime_secs: u64,
    /// Maximum application bytes per payload chunk
    pub payload_chunk_size: usize,
    /// Key exchange schemes offered by a requester, most preferred first
    pub key_exchange_schemes: Vec<KeyExchangeScheme>,
}

impl Default for MslConfig {
    fn default() -> Self {
        Self {
            sequence_tolerance: DEFAULT_SEQUENCE_TOLERANCE,
            replay_window: DEFAULT_REPLAY_WINDOW,
            renewal_grace_secs: DEFAULT_RENEWAL_GRACE_SECS,
            master_token_renewal_offset_secs: DEFAULT_MASTER_TOKEN_RENEWAL_OFFSET_SECS,
            master_token_lifetime_secs: DEFAULT_MASTER_TOKEN_LIFETIME_SECS,
            user_id_token_renewal_offset_secs: DEFAULT_USER_ID_TOKEN_RENEWAL_OFFSET_SECS,
            user_id_token_lifetime_secs: DEFAULT_USER_ID_TOKEN_LIFETIME_SECS,
            proactive_renewal: true,
            encoding: EncoderFormat::Cbor,
            wrapdata_lifetime_secs: DEFAULT_WRAPDATA_LIFETIME_SECS,
            payload_chunk_size: DEFAULT_PAYLOAD_CHUNK_SIZE,
            key_exchange_schemes: vec![KeyExchangeScheme::SymmetricWrapped],
        }
    }
}

impl MslConfig {
    /// Check that the policy is internally consistent.
    ///
    /// # Errors
    ///
    /// - `Internal` naming the first inconsistent field
    pub fn validate(&self) -> Result<(), MslError> {
        if self.sequence_tolerance == 0 {
            return Err(MslError::internal("sequence_tolerance must be positive"));
        }
        if self.replay_window == 0 {
            return Err(MslError::internal("replay_window must be positive"));
        }
        if self.master_token_renewal_offset_secs >= self.master_token_lifetime_secs {
            return Err(MslError::internal(
                "master_token_renewal_offset_secs must be less than master_token_lifetime_secs",
            ));
        }
        if self.user_id_token_renewal_offset_secs >= self.user_id_token_lifetime_secs {
            return Err(MslError::internal(
                "user_id_token_renewal_offset_secs must be less than user_id_token_lifetime_secs",
            ));
        }
        if self.payload_chunk_size == 0 {
            return Err(MslError::internal("payload_chunk_size must be positive"));
        }
        if self.key_exchange_schemes.is_empty() {
            return Err(MslError::internal("key_exchange_schemes must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(MslConfig::default().validate().is_ok());
    }

    #[test]
    fn renewal_offset_must_precede_lifetime() {
        let config = MslConfig { master_token_renewal_offset_secs: 100, master_token_lifetime_secs: 100, ..MslConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_scheme_list_rejected() {
        let config = MslConfig { key_exchange_schemes: vec![], ..MslConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config: MslConfig =
            msl_proto::decode(br#"{"sequence_tolerance": 4, "encoding": "json"}"#).unwrap();

        assert_eq!(config.sequence_tolerance, 4);
        assert_eq!(config.encoding, EncoderFormat::Json);
        assert_eq!(config.replay_window, DEFAULT_REPLAY_WINDOW);
        assert!(config.proactive_renewal);
    }
}
