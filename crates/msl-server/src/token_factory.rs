//! Responder token issuance.
//!
//! Tracks, per master token serial number, the newest sequence number issued
//! and its validity period. Renewal always continues from the newest issued
//! token, never from the one presented, so two renewals racing from the same
//! token still produce strictly increasing sequence numbers.
//!
//! ```text
//! serial 4711:  seq 1 ── renew ──► seq 2 ── renew ──► seq 3 (newest)
//!                                    ▲
//!                    accepted while newest - 2 <= tolerance
//! ```

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use msl_core::{
    Environment, MasterToken, MslConfig, MslError, MslUser, TokenFactory, UserIdToken,
    header::{ReplayGuard, ReplayWindows},
    tokens::{MasterTokenFields, UserIdTokenFields, sequence_distance},
};
use msl_crypto::{CryptoContext, SessionKeys, SymmetricCryptoContext};
use msl_proto::next_counter;

/// Validity of the newest master token issued for a serial number.
#[derive(Debug, Clone, Copy)]
struct IssuedMasterToken {
    sequence_number: u64,
    renewal_window: u64,
    expiration: u64,
}

#[derive(Debug, Default)]
struct IssuanceState {
    newest: HashMap<u64, IssuedMasterToken>,
    revoked: HashSet<u64>,
}

/// Token factory backed by in-memory issuance state.
///
/// Restarting the responder forgets every issued serial number; requesters
/// then re-authenticate through entity authentication.
pub struct ServerTokenFactory {
    issuer: SymmetricCryptoContext,
    config: MslConfig,
    state: Mutex<IssuanceState>,
    replay: ReplayWindows,
}

impl ServerTokenFactory {
    /// Create a factory signing and encrypting tokens with `issuer`.
    pub fn new(issuer: SymmetricCryptoContext, config: MslConfig) -> Self {
        let replay = ReplayWindows::new(config.replay_window);
        Self { issuer, config, state: Mutex::new(IssuanceState::default()), replay }
    }

    /// Revoke every master token with `serial_number`.
    ///
    /// Requests carrying a revoked token are answered with an entity
    /// re-authentication error.
    #[allow(clippy::expect_used)]
    pub fn revoke(&self, serial_number: u64) {
        let mut state = self.state.lock().expect("Mutex poisoned");
        state.revoked.insert(serial_number);
        state.newest.remove(&serial_number);
        drop(state);

        self.replay.forget(serial_number);
        tracing::info!(serial = serial_number, "master token serial revoked");
    }

    /// Whether `serial_number` was revoked.
    #[allow(clippy::expect_used)]
    pub fn is_revoked(&self, serial_number: u64) -> bool {
        self.state.lock().expect("Mutex poisoned").revoked.contains(&serial_number)
    }

    /// Whether newer tokens of `master_token`'s serial number were issued
    /// beyond the sequence tolerance.
    #[allow(clippy::expect_used)]
    pub fn is_superseded(&self, master_token: &MasterToken) -> bool {
        let state = self.state.lock().expect("Mutex poisoned");
        state.newest.get(&master_token.serial_number()).is_some_and(|newest| {
            sequence_distance(newest.sequence_number, master_token.sequence_number()) > self.config.sequence_tolerance
        })
    }

    /// Newest sequence number issued for `serial_number`.
    #[allow(clippy::expect_used)]
    pub fn newest_sequence_number(&self, serial_number: u64) -> Option<u64> {
        self.state.lock().expect("Mutex poisoned").newest.get(&serial_number).map(|issued| issued.sequence_number)
    }

    fn mint(
        &self,
        env: &dyn Environment,
        identity: &str,
        keys: &SessionKeys,
        serial_number: u64,
        issued: IssuedMasterToken,
    ) -> Result<MasterToken, MslError> {
        let fields = MasterTokenFields {
            renewal_window: issued.renewal_window,
            expiration: issued.expiration,
            sequence_number: issued.sequence_number,
            serial_number,
            identity,
            keys,
        };
        MasterToken::create(fields, &self.issuer, env, self.config.encoding)
    }

    /// Validity period for a token issued at `now`.
    fn master_token_validity(&self, now: u64) -> (u64, u64) {
        (
            now.saturating_add(self.config.master_token_renewal_offset_secs),
            now.saturating_add(self.config.master_token_lifetime_secs),
        )
    }

    fn user_id_token_validity(&self, now: u64) -> (u64, u64) {
        (
            now.saturating_add(self.config.user_id_token_renewal_offset_secs),
            now.saturating_add(self.config.user_id_token_lifetime_secs),
        )
    }
}

impl std::fmt::Debug for ServerTokenFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTokenFactory")
            .field("issuer", &self.issuer.key_id())
            .field("sequence_tolerance", &self.config.sequence_tolerance)
            .finish_non_exhaustive()
    }
}

impl TokenFactory for ServerTokenFactory {
    fn issuer_context(&self) -> &dyn CryptoContext {
        &self.issuer
    }

    #[allow(clippy::expect_used)]
    fn create_master_token(
        &self,
        env: &dyn Environment,
        identity: &str,
        keys: &SessionKeys,
    ) -> Result<MasterToken, MslError> {
        let now = env.now_secs();
        let (renewal_window, expiration) = self.master_token_validity(now);
        let issued = IssuedMasterToken { sequence_number: 1, renewal_window, expiration };

        let mut state = self.state.lock().expect("Mutex poisoned");
        let serial_number = loop {
            let candidate = env.random_counter();
            if !state.newest.contains_key(&candidate) && !state.revoked.contains(&candidate) {
                break candidate;
            }
        };
        let master_token = self.mint(env, identity, keys, serial_number, issued)?;
        state.newest.insert(serial_number, issued);
        drop(state);

        tracing::info!(entity = identity, serial = serial_number, "master token issued");
        Ok(master_token)
    }

    #[allow(clippy::expect_used)]
    fn renew_master_token(
        &self,
        env: &dyn Environment,
        master_token: &MasterToken,
        keys: &SessionKeys,
    ) -> Result<MasterToken, MslError> {
        let serial_number = master_token.serial_number();
        let Some(identity) = master_token.identity() else {
            return Err(MslError::entity_auth("renewing an undecrypted master token")
                .with_master_token(serial_number, master_token.sequence_number()));
        };

        let mut state = self.state.lock().expect("Mutex poisoned");
        if state.revoked.contains(&serial_number) {
            return Err(MslError::entity_auth(format!("master token serial {serial_number} revoked"))
                .with_entity(identity)
                .with_master_token(serial_number, master_token.sequence_number()));
        }
        let Some(newest) = state.newest.get(&serial_number).copied() else {
            return Err(MslError::entity_auth(format!("master token serial {serial_number} not issued here"))
                .with_entity(identity)
                .with_master_token(serial_number, master_token.sequence_number()));
        };

        // Validity never moves backwards, even when the clock does.
        let (renewal_window, expiration) = self.master_token_validity(env.now_secs());
        let issued = IssuedMasterToken {
            sequence_number: next_counter(newest.sequence_number),
            renewal_window: renewal_window.max(newest.renewal_window),
            expiration: expiration.max(newest.expiration),
        };
        let renewed = self.mint(env, identity, keys, serial_number, issued)?;
        state.newest.insert(serial_number, issued);
        drop(state);

        tracing::info!(
            entity = identity,
            serial = serial_number,
            sequence = issued.sequence_number,
            "master token renewed"
        );
        Ok(renewed)
    }

    #[allow(clippy::expect_used)]
    fn check_master_token(&self, _env: &dyn Environment, master_token: &MasterToken) -> Result<(), MslError> {
        let serial_number = master_token.serial_number();
        let sequence_number = master_token.sequence_number();
        let state = self.state.lock().expect("Mutex poisoned");

        if state.revoked.contains(&serial_number) {
            return Err(MslError::entity_auth(format!("master token serial {serial_number} revoked"))
                .with_master_token(serial_number, sequence_number));
        }
        let Some(newest) = state.newest.get(&serial_number) else {
            return Err(MslError::entity_auth(format!("master token serial {serial_number} not issued here"))
                .with_master_token(serial_number, sequence_number));
        };

        let behind = sequence_distance(newest.sequence_number, sequence_number);
        if behind > self.config.sequence_tolerance {
            return Err(MslError::key_exchange(format!(
                "master token sequence {sequence_number} is {behind} behind newest {}",
                newest.sequence_number
            ))
            .with_master_token(serial_number, sequence_number));
        }
        Ok(())
    }

    fn create_user_id_token(
        &self,
        env: &dyn Environment,
        user: &MslUser,
        master_token: &MasterToken,
    ) -> Result<UserIdToken, MslError> {
        let (renewal_window, expiration) = self.user_id_token_validity(env.now_secs());
        let fields = UserIdTokenFields { renewal_window, expiration, serial_number: env.random_counter(), user };
        let token = UserIdToken::create(fields, master_token, &self.issuer, env, self.config.encoding)?;

        tracing::info!(
            user = %user,
            serial = token.serial_number(),
            master_token = master_token.serial_number(),
            "user id token issued"
        );
        Ok(token)
    }

    fn renew_user_id_token(
        &self,
        env: &dyn Environment,
        user_id_token: &UserIdToken,
        master_token: &MasterToken,
    ) -> Result<UserIdToken, MslError> {
        let Some(user) = user_id_token.user() else {
            return Err(MslError::user_auth("renewing an undecrypted user id token")
                .with_user_id_token(user_id_token.serial_number()));
        };

        let (renewal_window, expiration) = self.user_id_token_validity(env.now_secs());
        let fields = UserIdTokenFields {
            renewal_window: renewal_window.max(user_id_token.renewal_window()),
            expiration: expiration.max(user_id_token.expiration()),
            serial_number: user_id_token.serial_number(),
            user,
        };
        let token = UserIdToken::create(fields, master_token, &self.issuer, env, self.config.encoding)?;

        tracing::debug!(
            user = %user,
            serial = token.serial_number(),
            master_token = master_token.serial_number(),
            "user id token renewed"
        );
        Ok(token)
    }
}

impl ReplayGuard for ServerTokenFactory {
    fn accept(&self, master_token: &MasterToken, non_replayable_id: u64) -> Result<(), MslError> {
        self.replay.accept(master_token, non_replayable_id)
    }
}
