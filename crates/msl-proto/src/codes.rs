//! Response codes carried in error headers.

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Largest value of any protocol counter (serial numbers, sequence numbers,
/// message ids). Counters live in a 53-bit space so they survive a round
/// trip through JSON numbers.
pub const MAX_COUNTER: u64 = (1 << 53) - 1;

/// Next value of a protocol counter, wrapping to zero after [`MAX_COUNTER`].
#[must_use]
pub const fn next_counter(value: u64) -> u64 {
    if value >= MAX_COUNTER { 0 } else { value + 1 }
}

/// Error header response code.
///
/// Tells the requester how to recover. Codes for which [`is_renewable`]
/// returns true are answered with exactly one recovery cycle; the rest are
/// surfaced to the caller.
///
/// [`is_renewable`]: ResponseCode::is_renewable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ResponseCode {
    /// The message could not be processed
    Fail,
    /// Temporary failure; the same request may succeed later
    TransientFailure,
    /// Entity must re-authenticate (master token rejected)
    EntityReauth,
    /// User must re-authenticate (user id token rejected)
    UserReauth,
    /// Key exchange is required
    KeyxRequired,
    /// Entity authentication data was rejected; fresh data required
    EntityDataReauth,
    /// User authentication data was rejected; fresh data required
    UserDataReauth,
    /// Master token expired and was not renewable
    Expired,
    /// Non-replayable message id was already seen
    Replayed,
}

impl ResponseCode {
    /// Numeric code for [`Self::Fail`].
    pub const FAIL: u16 = 1;
    /// Numeric code for [`Self::TransientFailure`].
    pub const TRANSIENT_FAILURE: u16 = 2;
    /// Numeric code for [`Self::EntityReauth`].
    pub const ENTITY_REAUTH: u16 = 3;
    /// Numeric code for [`Self::UserReauth`].
    pub const USER_REAUTH: u16 = 4;
    /// Numeric code for [`Self::KeyxRequired`].
    pub const KEYX_REQUIRED: u16 = 5;
    /// Numeric code for [`Self::EntityDataReauth`].
    pub const ENTITY_DATA_REAUTH: u16 = 6;
    /// Numeric code for [`Self::UserDataReauth`].
    pub const USER_DATA_REAUTH: u16 = 7;
    /// Numeric code for [`Self::Expired`].
    pub const EXPIRED: u16 = 8;
    /// Numeric code for [`Self::Replayed`].
    pub const REPLAYED: u16 = 9;

    /// Numeric wire value.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Fail => Self::FAIL,
            Self::TransientFailure => Self::TRANSIENT_FAILURE,
            Self::EntityReauth => Self::ENTITY_REAUTH,
            Self::UserReauth => Self::USER_REAUTH,
            Self::KeyxRequired => Self::KEYX_REQUIRED,
            Self::EntityDataReauth => Self::ENTITY_DATA_REAUTH,
            Self::UserDataReauth => Self::USER_DATA_REAUTH,
            Self::Expired => Self::EXPIRED,
            Self::Replayed => Self::REPLAYED,
        }
    }

    /// Whether the requester should re-run authentication or key exchange
    /// and resend once.
    #[must_use]
    pub const fn is_renewable(self) -> bool {
        matches!(
            self,
            Self::EntityReauth
                | Self::UserReauth
                | Self::KeyxRequired
                | Self::EntityDataReauth
                | Self::UserDataReauth
                | Self::Expired
        )
    }
}

impl TryFrom<u16> for ResponseCode {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            Self::FAIL => Ok(Self::Fail),
            Self::TRANSIENT_FAILURE => Ok(Self::TransientFailure),
            Self::ENTITY_REAUTH => Ok(Self::EntityReauth),
            Self::USER_REAUTH => Ok(Self::UserReauth),
            Self::KEYX_REQUIRED => Ok(Self::KeyxRequired),
            Self::ENTITY_DATA_REAUTH => Ok(Self::EntityDataReauth),
            Self::USER_DATA_REAUTH => Ok(Self::UserDataReauth),
            Self::EXPIRED => Ok(Self::Expired),
            Self::REPLAYED => Ok(Self::Replayed),
            other => Err(ProtocolError::UnknownResponseCode(other)),
        }
    }
}

impl From<ResponseCode> for u16 {
    fn from(code: ResponseCode) -> Self {
        code.code()
    }
}
