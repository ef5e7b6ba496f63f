//! Token and crypto context store.
//!
//! Holds, per entity, the master tokens still acceptable to the peer with
//! their session contexts, user id tokens by user, service tokens by scope
//! and the non-replayable id counters.
//!
//! # Consistency
//!
//! Each entity's state sits behind its own lock. Every mutation runs on a
//! copy of that state and replaces it only when the whole mutation
//! succeeded, so a failed [`TokenStore::merge`] leaves nothing behind.
//!
//! # Cascades
//!
//! ```text
//! master token serial S evicted ──► user id tokens bound to S
//!                               └─► service tokens bound to S
//! user id token U removed ────────► service tokens bound to U
//! ```
//!
//! Installing a master token evicts tokens of other serial numbers and
//! tokens of the same serial more than `sequence_tolerance` renewals
//! behind.

mod observer;
mod snapshot;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use msl_crypto::{CryptoContext, SessionCryptoContext};
use msl_proto::{EncoderFormat, MAX_COUNTER, next_counter};
pub use observer::{StoreEvent, StoreObserver, TracingObserver};
pub use snapshot::StoreSnapshot;

use crate::{
    auth::MslUser,
    config::MslConfig,
    error::MslError,
    header::SessionResolver,
    tokens::{MasterToken, ServiceToken, ServiceTokenScope, UserIdToken, sequence_distance},
};

/// Tokens and contexts to apply in one step, typically from a validated
/// response.
#[derive(Debug, Default)]
pub struct StoreUpdate {
    /// New current master token and its session context
    pub master_token: Option<(MasterToken, SessionCryptoContext)>,
    /// User id token issued to a user
    pub user_id_token: Option<(MslUser, UserIdToken)>,
    /// Service tokens to add, or remove when empty
    pub service_tokens: Vec<ServiceToken>,
}

#[derive(Clone, Default)]
struct EntityState {
    master_tokens: Vec<MasterToken>,
    crypto_contexts: HashMap<(u64, u64), Arc<SessionCryptoContext>>,
    user_id_tokens: HashMap<MslUser, UserIdToken>,
    service_tokens: BTreeMap<ServiceTokenScope, ServiceToken>,
    non_replayable_ids: HashMap<u64, u64>,
}

impl EntityState {
    fn is_empty(&self) -> bool {
        self.master_tokens.is_empty()
            && self.user_id_tokens.is_empty()
            && self.service_tokens.is_empty()
            && self.non_replayable_ids.is_empty()
    }

    fn current(&self) -> Option<&MasterToken> {
        self.master_tokens.iter().reduce(|newest, t| if t.is_newer_than(newest) { t } else { newest })
    }

    fn has_serial(&self, serial_number: u64) -> bool {
        self.master_tokens.iter().any(|t| t.serial_number() == serial_number)
    }

    fn install(
        &mut self,
        master_token: MasterToken,
        ctx: SessionCryptoContext,
        tolerance: u64,
        events: &mut Vec<StoreEvent>,
    ) {
        let serial = master_token.serial_number();
        let sequence = master_token.sequence_number();

        let stale: Vec<(u64, u64)> = self
            .master_tokens
            .iter()
            .filter(|t| {
                t.serial_number() != serial
                    || (!t.is_newer_than(&master_token)
                        && sequence_distance(sequence, t.sequence_number()) > tolerance)
            })
            .map(|t| (t.serial_number(), t.sequence_number()))
            .collect();

        self.master_tokens.retain(|t| (t.serial_number(), t.sequence_number()) != (serial, sequence));
        self.master_tokens.push(master_token);
        self.crypto_contexts.insert((serial, sequence), Arc::new(ctx));
        events.push(StoreEvent::MasterTokenInstalled { serial_number: serial, sequence_number: sequence });

        for (serial, sequence) in stale {
            self.remove_master_token(serial, sequence, events);
        }
    }

    fn remove_master_token(&mut self, serial: u64, sequence: u64, events: &mut Vec<StoreEvent>) {
        let before = self.master_tokens.len();
        self.master_tokens.retain(|t| (t.serial_number(), t.sequence_number()) != (serial, sequence));
        self.crypto_contexts.remove(&(serial, sequence));
        if self.master_tokens.len() == before {
            return;
        }
        events.push(StoreEvent::MasterTokenRemoved { serial_number: serial, sequence_number: sequence });

        if !self.has_serial(serial) {
            self.user_id_tokens.retain(|user, uit| {
                let keep = uit.mt_serial_number() != serial;
                if !keep {
                    events.push(StoreEvent::UserIdTokenRemoved {
                        user: user.clone(),
                        serial_number: uit.serial_number(),
                    });
                }
                keep
            });
            self.remove_service_tokens_where(|scope| scope.mt_serial_number == Some(serial), events);
            self.non_replayable_ids.remove(&serial);
        }
    }

    fn add_user_id_token(
        &mut self,
        user: MslUser,
        user_id_token: UserIdToken,
        events: &mut Vec<StoreEvent>,
    ) -> Result<(), MslError> {
        let mt_serial = user_id_token.mt_serial_number();
        if !self.has_serial(mt_serial) {
            return Err(MslError::message(format!("user id token bound to unknown master token {mt_serial}"))
                .with_user(user.identity())
                .with_user_id_token(user_id_token.serial_number()));
        }

        let serial = user_id_token.serial_number();
        if let Some(previous) = self.user_id_tokens.insert(user.clone(), user_id_token)
            && previous.serial_number() != serial
        {
            self.remove_user_bound(&previous, events);
        }
        events.push(StoreEvent::UserIdTokenAdded { user, serial_number: serial });
        Ok(())
    }

    fn remove_user_id_token(&mut self, user_id_token: &UserIdToken, events: &mut Vec<StoreEvent>) {
        let Some(user) = self
            .user_id_tokens
            .iter()
            .find(|(_, t)| *t == user_id_token)
            .map(|(user, _)| user.clone())
        else {
            return;
        };
        self.user_id_tokens.remove(&user);
        events.push(StoreEvent::UserIdTokenRemoved { user, serial_number: user_id_token.serial_number() });
        self.remove_user_bound(user_id_token, events);
    }

    fn remove_user_bound(&mut self, user_id_token: &UserIdToken, events: &mut Vec<StoreEvent>) {
        let mt_serial = Some(user_id_token.mt_serial_number());
        let uit_serial = Some(user_id_token.serial_number());
        self.remove_service_tokens_where(
            |scope| scope.mt_serial_number == mt_serial && scope.uit_serial_number == uit_serial,
            events,
        );
    }

    fn add_service_tokens(&mut self, tokens: Vec<ServiceToken>, events: &mut Vec<StoreEvent>) -> Result<(), MslError> {
        for token in &tokens {
            if let Some(serial) = token.mt_serial_number()
                && !self.has_serial(serial)
            {
                return Err(MslError::message(format!(
                    "service token {} bound to unknown master token {serial}",
                    token.name()
                )));
            }
            if let Some(serial) = token.uit_serial_number()
                && !self.user_id_tokens.values().any(|uit| {
                    uit.serial_number() == serial && Some(uit.mt_serial_number()) == token.mt_serial_number()
                })
            {
                return Err(MslError::message(format!(
                    "service token {} bound to unknown user id token {serial}",
                    token.name()
                ))
                .with_user_id_token(serial));
            }
        }

        for token in tokens {
            let scope = token.scope().clone();
            if token.is_deleted() {
                if self.service_tokens.remove(&scope).is_some() {
                    events.push(StoreEvent::ServiceTokenRemoved { name: scope.name });
                }
            } else {
                self.service_tokens.insert(scope.clone(), token);
                events.push(StoreEvent::ServiceTokenAdded { name: scope.name });
            }
        }
        Ok(())
    }

    fn remove_service_tokens_where(
        &mut self,
        matches: impl Fn(&ServiceTokenScope) -> bool,
        events: &mut Vec<StoreEvent>,
    ) {
        self.service_tokens.retain(|scope, _| {
            let keep = !matches(scope);
            if !keep {
                events.push(StoreEvent::ServiceTokenRemoved { name: scope.name.clone() });
            }
            keep
        });
    }
}

fn check_user_binding(
    master_token: Option<&MasterToken>,
    user_id_token: Option<&UserIdToken>,
) -> Result<(), MslError> {
    match (master_token, user_id_token) {
        (_, None) => Ok(()),
        (Some(mt), Some(uit)) if uit.is_bound_to(mt) => Ok(()),
        (_, Some(uit)) => Err(MslError::message("user id token not bound to the given master token")
            .with_user_id_token(uit.serial_number())),
    }
}

/// Per-entity token and crypto context store.
pub struct TokenStore {
    sequence_tolerance: u64,
    format: EncoderFormat,
    entities: RwLock<HashMap<String, Arc<RwLock<EntityState>>>>,
    observers: RwLock<Vec<Arc<dyn StoreObserver>>>,
}

impl TokenStore {
    /// Empty store applying `config`'s sequence tolerance and persisting in
    /// its encoding.
    pub fn new(config: &MslConfig) -> Self {
        Self {
            sequence_tolerance: config.sequence_tolerance,
            format: config.encoding,
            entities: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register `observer` for every subsequent mutation.
    #[allow(clippy::expect_used)]
    pub fn add_observer(&self, observer: Arc<dyn StoreObserver>) {
        self.observers.write().expect("RwLock poisoned").push(observer);
    }

    /// Entities with state in the store.
    #[allow(clippy::expect_used)]
    pub fn entities(&self) -> Vec<String> {
        self.entities.read().expect("RwLock poisoned").keys().cloned().collect()
    }

    #[allow(clippy::expect_used)]
    fn read<T>(&self, entity: &str, f: impl FnOnce(&EntityState) -> T) -> Option<T> {
        let state = self.entities.read().expect("RwLock poisoned").get(entity).cloned()?;
        let state = state.read().expect("RwLock poisoned");
        Some(f(&state))
    }

    #[allow(clippy::expect_used)]
    fn entity_state(&self, entity: &str) -> Arc<RwLock<EntityState>> {
        let mut entities = self.entities.write().expect("RwLock poisoned");
        Arc::clone(entities.entry(entity.to_string()).or_default())
    }

    /// Apply `f` to a copy of `entity`'s state and commit the copy only if
    /// `f` succeeds.
    #[allow(clippy::expect_used)]
    fn try_mutate<T>(
        &self,
        entity: &str,
        f: impl FnOnce(&mut EntityState, &mut Vec<StoreEvent>) -> Result<T, MslError>,
    ) -> Result<T, MslError> {
        let state = self.entity_state(entity);
        let mut events = Vec::new();
        let out = {
            let mut current = state.write().expect("RwLock poisoned");
            let mut next = current.clone();
            let out = f(&mut next, &mut events);
            if out.is_ok() {
                *current = next;
            }
            out
        };
        self.prune(entity, &state);

        let out = out?;
        self.notify(entity, &events);
        Ok(out)
    }

    #[allow(clippy::expect_used)]
    fn mutate<T>(&self, entity: &str, f: impl FnOnce(&mut EntityState, &mut Vec<StoreEvent>) -> T) -> T {
        let state = self.entity_state(entity);
        let mut events = Vec::new();
        let out = {
            let mut current = state.write().expect("RwLock poisoned");
            f(&mut *current, &mut events)
        };
        self.prune(entity, &state);
        self.notify(entity, &events);
        out
    }

    /// Drop `entity`'s entry once it holds nothing and no other caller has
    /// a handle to it.
    #[allow(clippy::expect_used)]
    fn prune(&self, entity: &str, state: &Arc<RwLock<EntityState>>) {
        let mut entities = self.entities.write().expect("RwLock poisoned");
        let idle = entities.get(entity).is_some_and(|held| Arc::ptr_eq(held, state)) && Arc::strong_count(state) == 2;
        if idle && state.read().expect("RwLock poisoned").is_empty() {
            entities.remove(entity);
        }
    }

    #[allow(clippy::expect_used)]
    fn notify(&self, entity: &str, events: &[StoreEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read().expect("RwLock poisoned").clone();
        for event in events {
            for observer in &observers {
                observer.on_event(entity, event);
            }
        }
    }

    /// Newest master token of `entity`.
    pub fn get_master_token(&self, entity: &str) -> Option<MasterToken> {
        self.read(entity, |state| state.current().cloned()).flatten()
    }

    /// Install `master_token` with its session context as the current
    /// token, evicting tokens that are no longer acceptable.
    pub fn set_master_token(&self, entity: &str, master_token: MasterToken, ctx: SessionCryptoContext) {
        let tolerance = self.sequence_tolerance;
        self.mutate(entity, |state, events| state.install(master_token, ctx, tolerance, events));
    }

    /// Remove `master_token` and its context; once no token of its serial
    /// number remains, bound user id and service tokens go too.
    pub fn remove_master_token(&self, entity: &str, master_token: &MasterToken) {
        let (serial, sequence) = (master_token.serial_number(), master_token.sequence_number());
        self.mutate(entity, |state, events| state.remove_master_token(serial, sequence, events));
    }

    /// Session context of exactly `master_token`.
    pub fn get_crypto_context(&self, entity: &str, master_token: &MasterToken) -> Option<Arc<SessionCryptoContext>> {
        let key = (master_token.serial_number(), master_token.sequence_number());
        self.read(entity, |state| state.crypto_contexts.get(&key).cloned()).flatten()
    }

    /// Session context of `master_token`, or of the token one renewal
    /// earlier.
    ///
    /// A peer that renewed the token may still protect a message with the
    /// previous session while the response is in flight.
    pub fn get_crypto_context_or_prior(
        &self,
        entity: &str,
        master_token: &MasterToken,
    ) -> Option<Arc<SessionCryptoContext>> {
        let serial = master_token.serial_number();
        let sequence = master_token.sequence_number();
        let prior = if sequence == 0 { MAX_COUNTER } else { sequence - 1 };
        self.read(entity, |state| {
            state
                .crypto_contexts
                .get(&(serial, sequence))
                .or_else(|| state.crypto_contexts.get(&(serial, prior)))
                .cloned()
        })
        .flatten()
    }

    /// Remove every master token and context of every entity, with the
    /// tokens bound to them. Unbound service tokens stay.
    pub fn clear_crypto_contexts(&self) {
        for entity in self.entities() {
            self.mutate(&entity, |state, events| {
                let keys: Vec<(u64, u64)> =
                    state.master_tokens.iter().map(|t| (t.serial_number(), t.sequence_number())).collect();
                for (serial, sequence) in keys {
                    state.remove_master_token(serial, sequence, events);
                }
            });
        }
    }

    /// User id token of `user`.
    pub fn get_user_id_token(&self, entity: &str, user: &MslUser) -> Option<UserIdToken> {
        self.read(entity, |state| state.user_id_tokens.get(user).cloned()).flatten()
    }

    /// Store `user_id_token` for `user`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// - `Message` if the bound master token is not in the store
    pub fn add_user_id_token(&self, entity: &str, user: MslUser, user_id_token: UserIdToken) -> Result<(), MslError> {
        self.try_mutate(entity, |state, events| state.add_user_id_token(user, user_id_token, events))
    }

    /// Remove `user_id_token` and the service tokens bound to it.
    pub fn remove_user_id_token(&self, entity: &str, user_id_token: &UserIdToken) {
        self.mutate(entity, |state, events| state.remove_user_id_token(user_id_token, events));
    }

    /// Add `tokens`, replacing tokens of the same scope. Deleted tokens
    /// remove their scope instead.
    ///
    /// # Errors
    ///
    /// - `Message` if a token is bound to a master or user id token that is
    ///   not in the store; no token is added then
    pub fn add_service_tokens(&self, entity: &str, tokens: Vec<ServiceToken>) -> Result<(), MslError> {
        self.try_mutate(entity, |state, events| state.add_service_tokens(tokens, events))
    }

    /// Service tokens usable with `master_token` and `user_id_token`:
    /// unbound tokens, tokens bound only to the master token, and tokens
    /// bound to both.
    ///
    /// # Errors
    ///
    /// - `Message` if `user_id_token` is not bound to `master_token`
    pub fn get_service_tokens(
        &self,
        entity: &str,
        master_token: Option<&MasterToken>,
        user_id_token: Option<&UserIdToken>,
    ) -> Result<Vec<ServiceToken>, MslError> {
        check_user_binding(master_token, user_id_token)?;
        let mt_serial = master_token.map(MasterToken::serial_number);
        let uit_serial = user_id_token.map(UserIdToken::serial_number);

        Ok(self
            .read(entity, |state| {
                state
                    .service_tokens
                    .iter()
                    .filter(|(scope, _)| match (scope.mt_serial_number, scope.uit_serial_number) {
                        (None, _) => true,
                        (Some(mt), None) => mt_serial == Some(mt),
                        (Some(mt), Some(uit)) => mt_serial == Some(mt) && uit_serial == Some(uit),
                    })
                    .map(|(_, token)| token.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Remove service tokens matching every given filter. An absent filter
    /// matches any token.
    ///
    /// # Errors
    ///
    /// - `Message` if both tokens are given and `user_id_token` is not bound
    ///   to `master_token`
    pub fn remove_service_tokens(
        &self,
        entity: &str,
        name: Option<&str>,
        master_token: Option<&MasterToken>,
        user_id_token: Option<&UserIdToken>,
    ) -> Result<(), MslError> {
        if master_token.is_some() {
            check_user_binding(master_token, user_id_token)?;
        }
        let mt_serial = master_token.map(MasterToken::serial_number);
        let uit_serial = user_id_token.map(UserIdToken::serial_number);

        self.mutate(entity, |state, events| {
            state.remove_service_tokens_where(
                |scope| {
                    name.is_none_or(|n| scope.name == n)
                        && mt_serial.is_none_or(|s| scope.mt_serial_number == Some(s))
                        && uit_serial.is_none_or(|s| scope.uit_serial_number == Some(s))
                },
                events,
            );
        });
        Ok(())
    }

    /// Next non-replayable id for messages sent with `master_token`.
    ///
    /// Ids count up per serial number from 1 and wrap in the 53-bit
    /// counter space.
    pub fn next_non_replayable_id(&self, entity: &str, master_token: &MasterToken) -> u64 {
        let serial = master_token.serial_number();
        self.mutate(entity, |state, _| {
            let id = state.non_replayable_ids.entry(serial).or_insert(0);
            *id = next_counter(*id);
            *id
        })
    }

    /// Apply `update` atomically: the master token first, then the user id
    /// token, then the service tokens.
    ///
    /// # Errors
    ///
    /// - `Message` if a token's binding is missing after the master token is
    ///   installed; the store is left unchanged
    pub fn merge(&self, entity: &str, update: StoreUpdate) -> Result<(), MslError> {
        let tolerance = self.sequence_tolerance;
        self.try_mutate(entity, |state, events| {
            if let Some((master_token, ctx)) = update.master_token {
                state.install(master_token, ctx, tolerance, events);
            }
            if let Some((user, user_id_token)) = update.user_id_token {
                state.add_user_id_token(user, user_id_token, events)?;
            }
            state.add_service_tokens(update.service_tokens, events)
        })
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("sequence_tolerance", &self.sequence_tolerance)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Resolves session contexts from an entity's stored master tokens.
#[derive(Debug, Clone, Copy)]
pub struct StoreSessions<'a> {
    store: &'a TokenStore,
    entity: &'a str,
}

impl<'a> StoreSessions<'a> {
    /// Resolver over `entity`'s state in `store`.
    pub fn new(store: &'a TokenStore, entity: &'a str) -> Self {
        Self { store, entity }
    }
}

impl SessionResolver for StoreSessions<'_> {
    fn resolve(&self, master_token: &MasterToken) -> Result<Arc<dyn CryptoContext>, MslError> {
        match self.store.get_crypto_context_or_prior(self.entity, master_token) {
            Some(ctx) => {
                let ctx: Arc<dyn CryptoContext> = ctx;
                Ok(ctx)
            },
            None => Err(MslError::crypto("no session context for master token")
                .with_entity(self.entity)
                .with_master_token(master_token.serial_number(), master_token.sequence_number())),
        }
    }
}
