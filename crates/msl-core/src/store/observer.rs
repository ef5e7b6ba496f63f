//! Store mutation observers.

use crate::auth::MslUser;

/// Mutation applied to one entity's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Master token installed with its session context
    MasterTokenInstalled {
        /// Serial number
        serial_number: u64,
        /// Sequence number
        sequence_number: u64,
    },
    /// Master token and its session context evicted or removed
    MasterTokenRemoved {
        /// Serial number
        serial_number: u64,
        /// Sequence number
        sequence_number: u64,
    },
    /// User id token added
    UserIdTokenAdded {
        /// Token owner
        user: MslUser,
        /// Serial number
        serial_number: u64,
    },
    /// User id token removed
    UserIdTokenRemoved {
        /// Token owner
        user: MslUser,
        /// Serial number
        serial_number: u64,
    },
    /// Service token added or replaced
    ServiceTokenAdded {
        /// Token name
        name: String,
    },
    /// Service token removed
    ServiceTokenRemoved {
        /// Token name
        name: String,
    },
}

/// Receives store events after the mutation completed.
///
/// Callbacks run outside the store locks and may read the store.
pub trait StoreObserver: Send + Sync {
    /// Called once per event, in mutation order.
    fn on_event(&self, entity: &str, event: &StoreEvent);
}

/// Logs every store event at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl StoreObserver for TracingObserver {
    fn on_event(&self, entity: &str, event: &StoreEvent) {
        match event {
            StoreEvent::MasterTokenInstalled { serial_number, sequence_number } => {
                tracing::debug!(entity, serial = serial_number, sequence = sequence_number, "master token installed");
            },
            StoreEvent::MasterTokenRemoved { serial_number, sequence_number } => {
                tracing::debug!(entity, serial = serial_number, sequence = sequence_number, "master token removed");
            },
            StoreEvent::UserIdTokenAdded { user, serial_number } => {
                tracing::debug!(entity, user = %user, serial = serial_number, "user id token added");
            },
            StoreEvent::UserIdTokenRemoved { user, serial_number } => {
                tracing::debug!(entity, user = %user, serial = serial_number, "user id token removed");
            },
            StoreEvent::ServiceTokenAdded { name } => {
                tracing::debug!(entity, name = %name, "service token added");
            },
            StoreEvent::ServiceTokenRemoved { name } => {
                tracing::debug!(entity, name = %name, "service token removed");
            },
        }
    }
}
