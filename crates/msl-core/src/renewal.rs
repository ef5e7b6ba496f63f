//! Master token renewal policy.
//!
//! ```text
//!   issue        renewal_window        expiration     expiration + grace
//!     |--- Current ---|---- MayRenew ----|-- MustRenew --|--- Expired --->
//! ```

use crate::{config::MslConfig, error::MslError, tokens::MasterToken};

/// What the requester should do with its master token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    /// Before the renewal window.
    Current,
    /// Inside the renewal window.
    MayRenew,
    /// Expired but within the grace period.
    MustRenew,
}

impl RenewalDecision {
    /// Whether a key exchange should accompany the next request.
    pub fn should_renew(self, config: &MslConfig) -> bool {
        match self {
            Self::Current => false,
            Self::MayRenew => config.proactive_renewal,
            Self::MustRenew => true,
        }
    }
}

/// Classify `master_token` at `now`.
///
/// # Errors
///
/// - `Expired` if the token expired more than `renewal_grace_secs` ago; the
///   token must be discarded and the entity re-authenticated
pub fn decide(master_token: &MasterToken, now: u64, config: &MslConfig) -> Result<RenewalDecision, MslError> {
    if master_token.is_past_grace(now, config.renewal_grace_secs) {
        return Err(MslError::expired(format!(
            "master token expired at {} (now {now}, grace {}s)",
            master_token.expiration(),
            config.renewal_grace_secs
        ))
        .with_master_token(master_token.serial_number(), master_token.sequence_number()));
    }

    if master_token.is_expired(now) {
        Ok(RenewalDecision::MustRenew)
    } else if master_token.is_renewable(now) {
        Ok(RenewalDecision::MayRenew)
    } else {
        Ok(RenewalDecision::Current)
    }
}
