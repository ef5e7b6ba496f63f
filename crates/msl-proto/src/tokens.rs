//! Token wire structures.
//!
//! Every token travels as a [`TokenEnvelope`]: the encoded token data plus a
//! signature over exactly those bytes. Token data holds the plaintext
//! lifecycle fields (so a peer without the issuer's keys can still reason
//! about renewal) and an encrypted inner blob with the secrets.
//!
//! # Invariants
//!
//! - `renewal_window < expiration`
//! - serial and sequence numbers are within [`MAX_COUNTER`]
//! - a service token bound to a user id token is also bound to a master token

use serde::{Deserialize, Serialize};

use crate::{
    codes::MAX_COUNTER,
    errors::{ProtocolError, Result},
};

/// Signed token bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenEnvelope {
    /// Encoded token data
    pub tokendata: Vec<u8>,
    /// Signature over `tokendata`
    pub signature: Vec<u8>,
}

/// Plaintext master token fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterTokenData {
    /// Seconds since epoch from which the token may be renewed
    pub renewal_window: u64,
    /// Seconds since epoch at which the token expires
    pub expiration: u64,
    /// Renewal counter
    pub sequence_number: u64,
    /// Stable identifier across renewals
    pub serial_number: u64,
    /// [`SessionData`] encrypted under the issuer's context
    pub session_data: Vec<u8>,
}

impl MasterTokenData {
    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// - `OutOfRange` for counters beyond [`MAX_COUNTER`]
    /// - `InvalidField` if the renewal window is not before expiration
    pub fn validate(&self) -> Result<()> {
        check_counter("sequence_number", self.sequence_number)?;
        check_counter("serial_number", self.serial_number)?;
        check_window(self.renewal_window, self.expiration)
    }
}

/// Secret master token fields.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    /// Entity identity
    pub identity: String,
    /// Session encryption key
    pub encryption_key: Vec<u8>,
    /// Session HMAC key
    pub hmac_key: Vec<u8>,
}

impl std::fmt::Debug for SessionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionData").field("identity", &self.identity).finish_non_exhaustive()
    }
}

/// Plaintext user id token fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdTokenData {
    /// Seconds since epoch from which the token may be renewed
    pub renewal_window: u64,
    /// Seconds since epoch at which the token expires
    pub expiration: u64,
    /// Serial number of the bound master token
    pub mt_serial_number: u64,
    /// Token serial number
    pub serial_number: u64,
    /// [`UserData`] encrypted under the issuer's context
    pub user_data: Vec<u8>,
}

impl UserIdTokenData {
    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// - `OutOfRange` for counters beyond [`MAX_COUNTER`]
    /// - `InvalidField` if the renewal window is not before expiration
    pub fn validate(&self) -> Result<()> {
        check_counter("mt_serial_number", self.mt_serial_number)?;
        check_counter("serial_number", self.serial_number)?;
        check_window(self.renewal_window, self.expiration)
    }
}

/// Secret user id token fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    /// User identity
    pub identity: String,
}

/// Service token fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTokenData {
    /// Token name
    pub name: String,
    /// Serial number of the bound master token
    pub mt_serial_number: Option<u64>,
    /// Serial number of the bound user id token
    pub uit_serial_number: Option<u64>,
    /// Whether `service_data` is encrypted
    pub encrypted: bool,
    /// Application data, possibly encrypted
    pub service_data: Vec<u8>,
}

impl ServiceTokenData {
    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// - `OutOfRange` for serial numbers beyond [`MAX_COUNTER`]
    /// - `InvalidField` for a user binding without a master binding or an
    ///   empty name
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ProtocolError::InvalidField { field: "name", reason: "empty".to_string() });
        }
        if let Some(serial) = self.mt_serial_number {
            check_counter("mt_serial_number", serial)?;
        }
        if let Some(serial) = self.uit_serial_number {
            check_counter("uit_serial_number", serial)?;
            if self.mt_serial_number.is_none() {
                return Err(ProtocolError::InvalidField {
                    field: "uit_serial_number",
                    reason: "user binding requires a master token binding".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn check_counter(field: &'static str, value: u64) -> Result<()> {
    if value > MAX_COUNTER {
        return Err(ProtocolError::OutOfRange { field, value });
    }
    Ok(())
}

fn check_window(renewal_window: u64, expiration: u64) -> Result<()> {
    if renewal_window >= expiration {
        return Err(ProtocolError::InvalidField {
            field: "renewal_window",
            reason: format!("renewal window {renewal_window} not before expiration {expiration}"),
        });
    }
    Ok(())
}
