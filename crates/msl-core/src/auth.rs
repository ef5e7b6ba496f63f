//! Entity and user authentication.
//!
//! Entity authentication turns [`EntityAuthData`] from a header into the
//! crypto context that protects that header. User authentication turns
//! [`UserAuthData`] into an [`MslUser`]. Both are pluggable per scheme and
//! dispatched through a registry.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use msl_crypto::{AsymmetricCryptoContext, CryptoContext, NullCryptoContext, SymmetricCryptoContext};
use msl_proto::{EntityAuthData, EntityAuthScheme, UserAuthData, UserAuthScheme};
use serde::{Deserialize, Serialize};

use crate::{error::MslError, tokens::MasterToken};

/// Authenticated user identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MslUser(String);

impl MslUser {
    /// Create a user from its identity string.
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Identity string.
    pub fn identity(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MslUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves entity authentication data to a crypto context.
pub trait EntityAuthFactory: Send + Sync {
    /// Scheme handled by this factory.
    fn scheme(&self) -> EntityAuthScheme;

    /// Crypto context for the entity named in `data`.
    ///
    /// # Errors
    ///
    /// - `EntityAuth` if the entity is unknown to this factory
    fn crypto_context(&self, data: &EntityAuthData) -> Result<Arc<dyn CryptoContext>, MslError>;
}

/// Entity authentication factories keyed by scheme.
#[derive(Clone, Default)]
pub struct EntityAuthRegistry {
    factories: BTreeMap<EntityAuthScheme, Arc<dyn EntityAuthFactory>>,
}

impl EntityAuthRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory`, replacing any factory for the same scheme.
    #[must_use]
    pub fn with(mut self, factory: impl EntityAuthFactory + 'static) -> Self {
        self.register(Arc::new(factory));
        self
    }

    /// Register `factory`, replacing any factory for the same scheme.
    pub fn register(&mut self, factory: Arc<dyn EntityAuthFactory>) {
        self.factories.insert(factory.scheme(), factory);
    }

    /// Whether a factory for `scheme` is registered.
    pub fn supports(&self, scheme: EntityAuthScheme) -> bool {
        self.factories.contains_key(&scheme)
    }

    /// Crypto context for `data`.
    ///
    /// # Errors
    ///
    /// - `EntityAuth` if no factory handles the scheme or the factory
    ///   rejects the entity
    pub fn crypto_context(&self, data: &EntityAuthData) -> Result<Arc<dyn CryptoContext>, MslError> {
        let Some(factory) = self.factories.get(&data.scheme()) else {
            return Err(MslError::entity_auth(format!("no factory for {:?}", data.scheme()))
                .with_entity(data.identity()));
        };
        factory.crypto_context(data)
    }
}

impl fmt::Debug for EntityAuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityAuthRegistry").field("schemes", &self.factories.keys()).finish()
    }
}

/// Pre-shared key entity authentication.
///
/// Each identity maps to a symmetric context; give the contexts a wrap key
/// so they can serve as the wrapping context of symmetric and wrap-ladder
/// key exchange.
#[derive(Debug, Clone, Default)]
pub struct PskEntityAuth {
    keys: HashMap<String, Arc<SymmetricCryptoContext>>,
}

impl PskEntityAuth {
    /// Create a factory with no entities.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the pre-shared key context of `identity`.
    #[must_use]
    pub fn with_entity(mut self, identity: impl Into<String>, context: SymmetricCryptoContext) -> Self {
        self.keys.insert(identity.into(), Arc::new(context));
        self
    }
}

impl EntityAuthFactory for PskEntityAuth {
    fn scheme(&self) -> EntityAuthScheme {
        EntityAuthScheme::Psk
    }

    fn crypto_context(&self, data: &EntityAuthData) -> Result<Arc<dyn CryptoContext>, MslError> {
        match self.keys.get(data.identity()) {
            Some(ctx) => Ok(ctx.clone()),
            None => Err(MslError::entity_auth("unknown pre-shared key identity").with_entity(data.identity())),
        }
    }
}

/// Signature-based entity authentication.
///
/// The local entity registers a context holding its signing key, peers
/// register contexts holding only the verifying key.
#[derive(Debug, Clone, Default)]
pub struct SignedEntityAuth {
    contexts: HashMap<String, Arc<AsymmetricCryptoContext>>,
}

impl SignedEntityAuth {
    /// Create a factory with no entities.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the signing or verifying context of `identity`.
    #[must_use]
    pub fn with_entity(mut self, identity: impl Into<String>, context: AsymmetricCryptoContext) -> Self {
        self.contexts.insert(identity.into(), Arc::new(context));
        self
    }
}

impl EntityAuthFactory for SignedEntityAuth {
    fn scheme(&self) -> EntityAuthScheme {
        EntityAuthScheme::Signed
    }

    fn crypto_context(&self, data: &EntityAuthData) -> Result<Arc<dyn CryptoContext>, MslError> {
        match self.contexts.get(data.identity()) {
            Some(ctx) => Ok(ctx.clone()),
            None => Err(MslError::entity_auth("unknown signing identity").with_entity(data.identity())),
        }
    }
}

/// Unauthenticated entities. Headers are neither encrypted nor signed.
///
/// Register this only where unauthenticated peers are acceptable.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnauthenticatedEntityAuth;

impl EntityAuthFactory for UnauthenticatedEntityAuth {
    fn scheme(&self) -> EntityAuthScheme {
        EntityAuthScheme::Unauthenticated
    }

    fn crypto_context(&self, _data: &EntityAuthData) -> Result<Arc<dyn CryptoContext>, MslError> {
        Ok(Arc::new(NullCryptoContext))
    }
}

/// Authenticates users from user authentication data.
pub trait UserAuthFactory: Send + Sync {
    /// Scheme handled by this factory.
    fn scheme(&self) -> UserAuthScheme;

    /// Authenticate the user described by `data`.
    ///
    /// `master_token` is the token of the entity the user authenticates
    /// through, when one is present.
    ///
    /// # Errors
    ///
    /// - `UserAuth` if the credentials are rejected
    fn authenticate(&self, data: &UserAuthData, master_token: Option<&MasterToken>) -> Result<MslUser, MslError>;
}

/// User authentication factories keyed by scheme.
#[derive(Clone, Default)]
pub struct UserAuthRegistry {
    factories: BTreeMap<UserAuthScheme, Arc<dyn UserAuthFactory>>,
}

impl UserAuthRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory`, replacing any factory for the same scheme.
    #[must_use]
    pub fn with(mut self, factory: impl UserAuthFactory + 'static) -> Self {
        self.factories.insert(factory.scheme(), Arc::new(factory));
        self
    }

    /// Authenticate through the factory for `data`'s scheme.
    ///
    /// # Errors
    ///
    /// - `UserAuth` if no factory handles the scheme or the credentials are
    ///   rejected
    pub fn authenticate(&self, data: &UserAuthData, master_token: Option<&MasterToken>) -> Result<MslUser, MslError> {
        let Some(factory) = self.factories.get(&data.scheme()) else {
            return Err(MslError::user_auth(format!("no factory for {:?}", data.scheme())));
        };
        factory.authenticate(data, master_token)
    }
}

impl fmt::Debug for UserAuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAuthRegistry").field("schemes", &self.factories.keys()).finish()
    }
}

/// Email and password user authentication against a fixed credential table.
#[derive(Clone, Default)]
pub struct EmailPasswordAuth {
    credentials: HashMap<String, String>,
}

impl EmailPasswordAuth {
    /// Create a factory with no users.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user.
    #[must_use]
    pub fn with_user(mut self, email: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials.insert(email.into(), password.into());
        self
    }
}

impl fmt::Debug for EmailPasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailPasswordAuth").field("users", &self.credentials.len()).finish()
    }
}

impl UserAuthFactory for EmailPasswordAuth {
    fn scheme(&self) -> UserAuthScheme {
        UserAuthScheme::EmailPassword
    }

    fn authenticate(&self, data: &UserAuthData, _master_token: Option<&MasterToken>) -> Result<MslUser, MslError> {
        let UserAuthData::EmailPassword { email, password } = data;
        match self.credentials.get(email) {
            Some(expected) if expected == password => Ok(MslUser::new(email.clone())),
            _ => Err(MslError::user_auth("email or password incorrect").with_user(email.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn psk(identity: &str) -> EntityAuthData {
        EntityAuthData::Psk { identity: identity.to_string() }
    }

    #[test]
    fn psk_lookup_by_identity() {
        let registry = EntityAuthRegistry::new()
            .with(PskEntityAuth::new().with_entity("device-1", SymmetricCryptoContext::new("device-1", [1; 32], [2; 32])));

        let ctx = registry.crypto_context(&psk("device-1")).unwrap();
        let signature = ctx.sign(b"header").unwrap();
        assert!(ctx.verify(b"header", &signature));

        let Some(err) = registry.crypto_context(&psk("device-2")).err() else {
            panic!("unknown identity accepted")
        };
        assert_eq!(err.kind(), ErrorKind::EntityAuth);
        assert_eq!(err.context().entity.as_deref(), Some("device-2"));
    }

    #[test]
    fn unregistered_scheme_is_entity_auth_error() {
        let registry = EntityAuthRegistry::new().with(UnauthenticatedEntityAuth);
        assert!(registry.supports(EntityAuthScheme::Unauthenticated));
        assert!(!registry.supports(EntityAuthScheme::Psk));

        let Some(err) = registry.crypto_context(&psk("device-1")).err() else {
            panic!("unregistered scheme accepted")
        };
        assert_eq!(err.kind(), ErrorKind::EntityAuth);
    }

    #[test]
    fn signed_peer_verifies_local_signature() {
        let local = AsymmetricCryptoContext::new("server", msl_crypto::AsymmetricMode::SignVerify).with_signing_key([7; 32]);
        let Some(public) = local.verifying_key_bytes() else { unreachable!("signing key installed") };
        let peer = AsymmetricCryptoContext::new("server", msl_crypto::AsymmetricMode::SignVerify)
            .with_verifying_key(&public)
            .unwrap();

        let data = EntityAuthData::Signed { identity: "server".to_string() };
        let signer = EntityAuthRegistry::new().with(SignedEntityAuth::new().with_entity("server", local));
        let verifier = EntityAuthRegistry::new().with(SignedEntityAuth::new().with_entity("server", peer));

        let signature = signer.crypto_context(&data).unwrap().sign(b"error").unwrap();
        assert!(verifier.crypto_context(&data).unwrap().verify(b"error", &signature));
    }

    #[test]
    fn email_password() {
        let registry = UserAuthRegistry::new().with(EmailPasswordAuth::new().with_user("kirito@example.com", "hunter2"));

        let good = UserAuthData::EmailPassword {
            email: "kirito@example.com".to_string(),
            password: "hunter2".to_string(),
        };
        let bad = UserAuthData::EmailPassword {
            email: "kirito@example.com".to_string(),
            password: "hunter3".to_string(),
        };

        assert_eq!(registry.authenticate(&good, None).unwrap().identity(), "kirito@example.com");
        assert_eq!(registry.authenticate(&bad, None).unwrap_err().kind(), ErrorKind::UserAuth);
    }
}
