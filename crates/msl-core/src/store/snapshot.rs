//! Store persistence.
//!
//! A snapshot keeps tokens in their wire form together with the session
//! keys of every stored master token. Restored tokens are parsed without an
//! issuer context: they are unverified, as on any requester. Service tokens
//! bound to a master token are re-read with that token's session context;
//! encrypted unbound service tokens come back without their data.

use std::{
    collections::HashMap,
    fmt, fs,
    path::Path,
    sync::{Arc, RwLock},
};

use msl_crypto::{CryptoContext, SessionCryptoContext, SessionKeys};
use msl_proto::TokenEnvelope;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::{EntityState, TokenStore};
use crate::{
    auth::MslUser,
    error::MslError,
    tokens::{MasterToken, ServiceToken, UserIdToken},
};

/// Serializable copy of a [`TokenStore`].
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    entities: Vec<EntitySnapshot>,
}

impl StoreSnapshot {
    /// Entities captured in the snapshot.
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|e| e.entity.as_str())
    }
}

impl fmt::Debug for StoreSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSnapshot").field("entities", &self.entities.len()).finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct EntitySnapshot {
    entity: String,
    sessions: Vec<SessionSnapshot>,
    user_id_tokens: Vec<(MslUser, TokenEnvelope)>,
    service_tokens: Vec<TokenEnvelope>,
    non_replayable_ids: Vec<(u64, u64)>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SessionSnapshot {
    master_token: TokenEnvelope,
    key_id: String,
    encryption_key: Vec<u8>,
    hmac_key: Vec<u8>,
}

impl Drop for SessionSnapshot {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
        self.hmac_key.zeroize();
    }
}

impl EntityState {
    fn snapshot(&self, entity: &str) -> EntitySnapshot {
        let sessions = self
            .master_tokens
            .iter()
            .filter_map(|mt| {
                let ctx = self.crypto_contexts.get(&(mt.serial_number(), mt.sequence_number()))?;
                Some(SessionSnapshot {
                    master_token: mt.envelope().clone(),
                    key_id: ctx.key_id().to_string(),
                    encryption_key: ctx.keys().encryption_key().to_vec(),
                    hmac_key: ctx.keys().hmac_key().to_vec(),
                })
            })
            .collect();

        EntitySnapshot {
            entity: entity.to_string(),
            sessions,
            user_id_tokens: self
                .user_id_tokens
                .iter()
                .map(|(user, uit)| (user.clone(), uit.envelope().clone()))
                .collect(),
            service_tokens: self.service_tokens.values().map(|t| t.envelope().clone()).collect(),
            non_replayable_ids: self.non_replayable_ids.iter().map(|(&serial, &id)| (serial, id)).collect(),
        }
    }

    fn restore(snapshot: &EntitySnapshot) -> Result<Self, MslError> {
        let mut state = Self::default();

        for session in &snapshot.sessions {
            let master_token = MasterToken::parse(session.master_token.clone(), None)?;
            let keys = SessionKeys::from_slices(&session.encryption_key, &session.hmac_key)?;
            let ctx = SessionCryptoContext::with_key_id(session.key_id.clone(), keys);
            state
                .crypto_contexts
                .insert((master_token.serial_number(), master_token.sequence_number()), Arc::new(ctx));
            state.master_tokens.push(master_token);
        }

        for (user, envelope) in &snapshot.user_id_tokens {
            let mt = state.newest_of_serial(envelope)?;
            let uit = UserIdToken::parse(envelope.clone(), mt, None)?;
            state.user_id_tokens.insert(user.clone(), uit);
        }

        for envelope in &snapshot.service_tokens {
            let data: msl_proto::ServiceTokenData = msl_proto::decode(&envelope.tokendata)?;
            let mt = data.mt_serial_number.and_then(|serial| state.newest(serial));
            let uit = data
                .uit_serial_number
                .and_then(|serial| state.user_id_tokens.values().find(|u| u.serial_number() == serial));
            let ctx: Option<&dyn CryptoContext> = match mt {
                Some(mt) => state
                    .crypto_contexts
                    .get(&(mt.serial_number(), mt.sequence_number()))
                    .map(|c| c.as_ref() as &dyn CryptoContext),
                None => None,
            };
            let token = ServiceToken::parse(envelope.clone(), mt, uit, ctx)?;
            state.service_tokens.insert(token.scope().clone(), token);
        }

        state.non_replayable_ids = snapshot.non_replayable_ids.iter().copied().collect();
        Ok(state)
    }

    fn newest(&self, serial_number: u64) -> Option<&MasterToken> {
        self.master_tokens
            .iter()
            .filter(|t| t.serial_number() == serial_number)
            .reduce(|newest, t| if t.is_newer_than(newest) { t } else { newest })
    }

    fn newest_of_serial(&self, user_id_token: &TokenEnvelope) -> Result<Option<&MasterToken>, MslError> {
        let data: msl_proto::UserIdTokenData = msl_proto::decode(&user_id_token.tokendata)?;
        Ok(self.newest(data.mt_serial_number))
    }
}

impl TokenStore {
    /// Copy of every entity's tokens and session keys.
    #[allow(clippy::expect_used)]
    pub fn snapshot(&self) -> StoreSnapshot {
        let entities = self.entities.read().expect("RwLock poisoned");
        let mut snapshot = StoreSnapshot {
            entities: entities
                .iter()
                .map(|(entity, state)| state.read().expect("RwLock poisoned").snapshot(entity))
                .collect(),
        };
        snapshot.entities.sort_by(|a, b| a.entity.cmp(&b.entity));
        snapshot
    }

    /// Replace the whole store content with `snapshot`.
    ///
    /// Observers are not notified.
    ///
    /// # Errors
    ///
    /// - `Encoding` if a stored token is malformed
    /// - `Crypto` if stored session keys are malformed
    /// - `Message` if a stored token binding is broken
    #[allow(clippy::expect_used)]
    pub fn restore(&self, snapshot: &StoreSnapshot) -> Result<(), MslError> {
        let mut restored = HashMap::with_capacity(snapshot.entities.len());
        for entity in &snapshot.entities {
            let state = EntityState::restore(entity).map_err(|e| e.with_entity(&entity.entity))?;
            restored.insert(entity.entity.clone(), Arc::new(RwLock::new(state)));
        }
        *self.entities.write().expect("RwLock poisoned") = restored;
        Ok(())
    }

    /// Write a snapshot to `path`.
    ///
    /// The snapshot goes to a sibling temporary file first and is renamed
    /// over `path`, so readers never see a partial file.
    ///
    /// # Errors
    ///
    /// - `Encoding` if the snapshot cannot be serialized
    /// - `Internal` on I/O failure
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MslError> {
        let path = path.as_ref();
        let bytes = self.format.encode(&self.snapshot())?;
        let tmp = path.with_extension("tmp");

        fs::write(&tmp, &bytes)
            .map_err(|e| MslError::internal(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .map_err(|e| MslError::internal(format!("rename {} to {}: {e}", tmp.display(), path.display())))?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "token store saved");
        Ok(())
    }

    /// Replace the store content with the snapshot at `path`.
    ///
    /// # Errors
    ///
    /// - `Internal` on I/O failure
    /// - `Encoding` if the file is not a snapshot
    /// - the errors of [`restore`](Self::restore)
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), MslError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| MslError::internal(format!("read {}: {e}", path.display())))?;
        let snapshot: StoreSnapshot = msl_proto::decode(&bytes)?;
        self.restore(&snapshot)?;

        tracing::debug!(path = %path.display(), entities = snapshot.entities.len(), "token store loaded");
        Ok(())
    }
}
