//! Entity and user authentication data.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Entity authentication scheme identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityAuthScheme {
    /// Pre-shared symmetric keys
    Psk,
    /// Ed25519 signature over the header
    Signed,
    /// No cryptographic authentication
    Unauthenticated,
}

/// Entity authentication data carried in headers without a master token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityAuthData {
    /// Entity shares symmetric keys with the responder.
    Psk {
        /// Entity identity
        identity: String,
    },
    /// Entity signs with an Ed25519 key known to the peer.
    Signed {
        /// Entity identity
        identity: String,
    },
    /// Entity claims an identity without proof.
    Unauthenticated {
        /// Entity identity
        identity: String,
    },
}

impl EntityAuthData {
    /// Claimed entity identity.
    pub fn identity(&self) -> &str {
        match self {
            Self::Psk { identity } | Self::Signed { identity } | Self::Unauthenticated { identity } => {
                identity
            },
        }
    }

    /// Scheme of this data.
    pub fn scheme(&self) -> EntityAuthScheme {
        match self {
            Self::Psk { .. } => EntityAuthScheme::Psk,
            Self::Signed { .. } => EntityAuthScheme::Signed,
            Self::Unauthenticated { .. } => EntityAuthScheme::Unauthenticated,
        }
    }
}

/// User authentication scheme identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UserAuthScheme {
    /// Email address and password
    EmailPassword,
}

/// User authentication data carried in headers without a user id token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserAuthData {
    /// Email and password credentials.
    EmailPassword {
        /// Account email
        email: String,
        /// Account password
        password: String,
    },
}

impl UserAuthData {
    /// Scheme of this data.
    pub fn scheme(&self) -> UserAuthScheme {
        match self {
            Self::EmailPassword { .. } => UserAuthScheme::EmailPassword,
        }
    }
}

impl fmt::Debug for UserAuthData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmailPassword { email, .. } => f
                .debug_struct("EmailPassword")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_scheme_independent() {
        let psk = EntityAuthData::Psk { identity: "device".to_string() };
        let none = EntityAuthData::Unauthenticated { identity: "device".to_string() };

        assert_eq!(psk.identity(), none.identity());
        assert_ne!(psk.scheme(), none.scheme());
    }

    #[test]
    fn password_not_printed() {
        let data = UserAuthData::EmailPassword {
            email: "kirito@example.com".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{data:?}");
        assert!(rendered.contains("kirito@example.com"));
        assert!(!rendered.contains("hunter2"));
    }
}
