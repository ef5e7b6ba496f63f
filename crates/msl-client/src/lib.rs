//! Message security layer requester.
//!
//! [`MslClient`] wraps a [`Transport`] and keeps the entity's tokens current:
//! it bootstraps a master token through entity authentication, renews it in
//! its renewal window, authenticates users on demand and recovers once from
//! renewable error responses.
//!
//! # Components
//!
//! - [`MslClient`]: request pipeline with single-flight key exchange
//! - [`Transport`]: request/response exchange with the responder
//! - [`UserAuthProvider`]: user credentials on demand
//!
//! # Transport
//!
//! With the `tcp` feature (on by default), [`tcp::TcpTransport`] speaks the
//! length-prefixed framing of the `msl-server` binary.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod client;
mod transport;
mod user;

#[cfg(feature = "tcp")]
pub mod tcp;

pub use client::{MslClient, MslClientBuilder, Request, Response};
pub use transport::{Transport, TransportError};
pub use user::{StaticCredentials, UserAuthProvider};
