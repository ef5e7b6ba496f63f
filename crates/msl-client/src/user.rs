//! User credentials.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use msl_core::{MslError, MslUser};
use msl_proto::UserAuthData;

/// Source of user authentication data.
///
/// Consulted when a request names a user with no usable user id token, and
/// again after the responder rejected the user's token or credentials.
#[async_trait]
pub trait UserAuthProvider: Send + Sync {
    /// Authentication data for `user`.
    ///
    /// # Errors
    ///
    /// - `UserAuth` if no credentials are available
    async fn credentials(&self, user: &MslUser) -> Result<UserAuthData, MslError>;
}

/// Email and password credentials known up front.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    passwords: HashMap<MslUser, String>,
}

impl StaticCredentials {
    /// Provider with no users.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the password of the user identified by `email`.
    #[must_use]
    pub fn with_user(mut self, email: impl Into<String>, password: impl Into<String>) -> Self {
        self.passwords.insert(MslUser::new(email), password.into());
        self
    }
}

#[async_trait]
impl UserAuthProvider for StaticCredentials {
    async fn credentials(&self, user: &MslUser) -> Result<UserAuthData, MslError> {
        match self.passwords.get(user) {
            Some(password) => {
                Ok(UserAuthData::EmailPassword { email: user.identity().to_string(), password: password.clone() })
            },
            None => Err(MslError::user_auth("no credentials for user").with_user(user.identity())),
        }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials").field("users", &self.passwords.keys()).finish()
    }
}
