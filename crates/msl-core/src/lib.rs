//! Message Security Layer Protocol Core
//!
//! Trust between a requester (client) and a responder (server) rests on
//! three tokens issued by the responder:
//!
//! ```text
//! entity auth ──keyx──► MasterToken ──user auth──► UserIdToken
//!                           │                          │
//!                           └──────► ServiceToken ◄────┘
//! ```
//!
//! - [`tokens`]: master, user id and service tokens, their lifecycle and
//!   bindings
//! - [`keyx`]: key exchange schemes producing master tokens with fresh
//!   session keys
//! - [`header`]: building and validating message and error headers
//! - [`store`]: the requester's tokens and session contexts
//! - [`renewal`]: when a master token must or may be renewed
//!
//! # Time and Randomness
//!
//! Protocol code never reads the clock or an RNG directly. Both come from an
//! [`Environment`], so tests drive them with [`FixedEnv`].
//!
//! # Errors
//!
//! Every fallible operation returns [`MslError`], whose [`ErrorKind`]
//! decides the response code sent to the peer and whether recovery is
//! possible.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod auth;
pub mod config;
pub mod env;
pub mod error;
pub mod factory;
pub mod header;
pub mod keyx;
pub mod renewal;
pub mod store;
pub mod tokens;

pub use auth::{
    EmailPasswordAuth, EntityAuthFactory, EntityAuthRegistry, MslUser, PskEntityAuth, SignedEntityAuth,
    UnauthenticatedEntityAuth, UserAuthFactory, UserAuthRegistry,
};
pub use config::MslConfig;
pub use env::{Environment, FixedEnv, SystemEnv};
pub use error::{ErrorContext, ErrorKind, MslError};
pub use factory::TokenFactory;
pub use header::{
    ErrorHeader, HeaderAuth, MessageContexts, MessageHeader, ParsedMessage, ReceiveContext, ReceivedMessage,
    parse_message,
};
pub use keyx::{
    KeyExchangeData, KeyExchangeFactory, KeyExchangeRegistry, KeyExchangeState, KeyExchangeTarget, KeyRequest,
    NegotiatedSession, PendingKeyExchange, RequesterContext, ResponderContext,
};
pub use renewal::RenewalDecision;
pub use store::{StoreEvent, StoreObserver, StoreSessions, StoreSnapshot, StoreUpdate, TokenStore, TracingObserver};
pub use tokens::{MasterToken, ServiceToken, ServiceTokenScope, UserIdToken};
