//! Token trust model.
//!
//! Three token types establish trust between endpoints:
//!
//! ```text
//! MasterToken (serial S, sequence N)       entity identity + session keys
//!   └── UserIdToken (mt serial S)          user identity
//!         └── ServiceToken (mt S, uit U)   application data
//! ```
//!
//! Tokens are immutable. Renewal produces a new instance: a master token
//! keeps its serial number and takes the next sequence number, a user id
//! token keeps its serial number and its binding.
//!
//! # Trust
//!
//! Only the issuer holds the context that signs and encrypts token data. A
//! token parsed without that context is *unverified* and *undecrypted*: its
//! plaintext lifecycle fields are usable as hints, but the identity and
//! secrets it carries are not available.

mod master;
mod service;
mod user_id;

pub use master::{MasterToken, MasterTokenFields};
pub use service::{ServiceToken, ServiceTokenFields, ServiceTokenScope};
pub use user_id::{UserIdToken, UserIdTokenFields};

use msl_proto::MAX_COUNTER;

/// Sequence numbers further apart than this are treated as having wrapped.
pub(crate) const SEQUENCE_WRAP_WINDOW: u64 = 127;

/// How many sequence numbers `older` lies behind `newer`, accounting for
/// wraparound in the 53-bit counter space.
pub fn sequence_distance(newer: u64, older: u64) -> u64 {
    if newer >= older { newer - older } else { newer + (MAX_COUNTER - older) + 1 }
}

/// Shared lifecycle checks for tokens with a renewal window and expiration.
pub(crate) fn is_expired(expiration: u64, now: u64) -> bool {
    now >= expiration
}

pub(crate) fn is_renewable(renewal_window: u64, now: u64) -> bool {
    now >= renewal_window
}

pub(crate) fn is_past_grace(expiration: u64, now: u64, grace_secs: u64) -> bool {
    now >= expiration.saturating_add(grace_secs)
}
