//! Server configuration file.
//!
//! A JSON document naming the server's keys, the entities and users it
//! accepts, and the protocol policy. Keys are arrays of 32 byte values.
//!
//! ```json
//! {
//!   "identity": "server",
//!   "signing_key": [1, 2, ...],
//!   "issuer": { "encryption": [...], "hmac": [...] },
//!   "entities": [{ "identity": "device-1", "keys": { "encryption": [...], "hmac": [...], "wrap": [...] } }],
//!   "users": [{ "email": "kirito@example.com", "password": "hunter2" }],
//!   "msl": { "sequence_tolerance": 16 }
//! }
//! ```

use std::{path::Path, sync::Arc};

use msl_core::{
    EmailPasswordAuth, EntityAuthRegistry, Environment, MslConfig, PskEntityAuth, UserAuthRegistry,
    keyx::{
        AsymmetricWrappedFactory, DiffieHellmanFactory, KeyExchangeRegistry, SymmetricWrappedFactory,
        WrapLadderFactory,
    },
};
use msl_crypto::{AsymmetricCryptoContext, AsymmetricMode, KEY_SIZE, SymmetricCryptoContext};
use serde::Deserialize;

use crate::{error::ServerError, server::MslServer};

/// Symmetric key set.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeySet {
    /// Encryption key
    pub encryption: [u8; KEY_SIZE],
    /// HMAC key
    pub hmac: [u8; KEY_SIZE],
    /// Key wrapping key, for symmetric and wrap-ladder key exchange
    #[serde(default)]
    pub wrap: Option<[u8; KEY_SIZE]>,
}

impl KeySet {
    fn context(&self, key_id: &str) -> SymmetricCryptoContext {
        let ctx = SymmetricCryptoContext::new(key_id, self.encryption, self.hmac);
        match self.wrap {
            Some(wrap) => ctx.with_wrap_key(wrap),
            None => ctx,
        }
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySet").field("wrap", &self.wrap.is_some()).finish_non_exhaustive()
    }
}

/// Entity authenticated by pre-shared keys.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PskEntity {
    /// Entity identity
    pub identity: String,
    /// Pre-shared keys
    pub keys: KeySet,
}

/// User authenticated by email and password.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserCredentials {
    /// Email address
    pub email: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredentials").field("email", &self.email).finish_non_exhaustive()
    }
}

/// Server configuration.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Server identity in signed entity authentication data
    pub identity: String,
    /// Ed25519 seed signing error headers and entity-authenticated
    /// responses
    pub signing_key: [u8; 32],
    /// Keys protecting issued master and user id tokens
    pub issuer: KeySet,
    /// Keys protecting unbound service tokens; the issuer keys if absent
    #[serde(default)]
    pub service_tokens: Option<KeySet>,
    /// Keys sealing wrap-ladder wrap data; wrap-ladder key exchange is
    /// offered only when present
    #[serde(default)]
    pub wrapdata: Option<KeySet>,
    /// Entities authenticated by pre-shared keys
    #[serde(default)]
    pub entities: Vec<PskEntity>,
    /// Users authenticated by email and password
    #[serde(default)]
    pub users: Vec<UserCredentials>,
    /// Protocol policy
    #[serde(default)]
    pub msl: MslConfig,
}

impl ServerConfig {
    /// Read a configuration file.
    ///
    /// # Errors
    ///
    /// - `Config` if the file cannot be read or is not a valid document
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| ServerError::Config(format!("failed to read '{}': {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ServerError::Config(format!("failed to parse '{}': {e}", path.display())))
    }

    /// Build the server this configuration describes.
    ///
    /// # Errors
    ///
    /// - `Config` if the protocol policy is inconsistent
    pub fn into_server(self, env: Arc<dyn Environment>) -> Result<MslServer, ServerError> {
        let signer = AsymmetricCryptoContext::new(&self.identity, AsymmetricMode::SignVerify)
            .with_signing_key(self.signing_key);
        let issuer = self.issuer.context("issuer");

        let psk = self.entities.iter().fold(PskEntityAuth::new(), |psk, entity| {
            psk.with_entity(entity.identity.clone(), entity.keys.context(&entity.identity))
        });
        let users = self
            .users
            .iter()
            .fold(EmailPasswordAuth::new(), |users, user| users.with_user(user.email.clone(), user.password.clone()));

        let mut key_exchange = KeyExchangeRegistry::new()
            .with(SymmetricWrappedFactory)
            .with(AsymmetricWrappedFactory)
            .with(DiffieHellmanFactory::new());
        if let Some(wrapdata) = &self.wrapdata {
            key_exchange = key_exchange.with(WrapLadderFactory::responder(
                Arc::new(wrapdata.context("wrapdata")),
                self.msl.wrapdata_lifetime_secs,
            ));
        }

        let mut builder = MslServer::builder(self.identity.clone(), signer, issuer)
            .config(self.msl)
            .env(env)
            .entity_auth(EntityAuthRegistry::new().with(psk))
            .user_auth(UserAuthRegistry::new().with(users))
            .key_exchange(key_exchange);
        if let Some(keys) = &self.service_tokens {
            builder = builder.service_token_context(keys.context("service"));
        }
        builder.build()
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("identity", &self.identity)
            .field("entities", &self.entities.iter().map(|e| &e.identity).collect::<Vec<_>>())
            .field("users", &self.users.len())
            .field("wrapdata", &self.wrapdata.is_some())
            .field("msl", &self.msl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use msl_core::FixedEnv;

    use super::*;

    fn document() -> String {
        let key = |byte: u8| format!("[{}]", vec![byte.to_string(); 32].join(","));
        format!(
            r#"{{
                "identity": "server",
                "signing_key": {},
                "issuer": {{ "encryption": {}, "hmac": {} }},
                "wrapdata": {{ "encryption": {}, "hmac": {} }},
                "entities": [{{ "identity": "device-1", "keys": {{ "encryption": {}, "hmac": {}, "wrap": {} }} }}],
                "users": [{{ "email": "kirito@example.com", "password": "hunter2" }}],
                "msl": {{ "sequence_tolerance": 4 }}
            }}"#,
            key(1),
            key(2),
            key(3),
            key(4),
            key(5),
            key(6),
            key(7),
            key(8)
        )
    }

    #[test]
    fn load_builds_server() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(document().as_bytes()).unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.entities[0].identity, "device-1");
        assert_eq!(config.msl.sequence_tolerance, 4);
        assert_eq!(config.msl.replay_window, MslConfig::default().replay_window);

        let server = config.into_server(Arc::new(FixedEnv::new(1_700_000_000, 1))).unwrap();
        assert_eq!(server.identity(), "server");
        assert_eq!(server.config().sequence_tolerance, 4);
    }

    #[test]
    fn unknown_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"identity": "server", "port": 1}"#).unwrap();

        assert!(matches!(ServerConfig::load(file.path()), Err(ServerError::Config(_))));
    }

    #[test]
    fn inconsistent_policy_rejected() {
        let mut config: ServerConfig = serde_json::from_str(&document()).unwrap();
        config.msl.replay_window = 0;

        let result = config.into_server(Arc::new(FixedEnv::new(1_700_000_000, 1)));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
