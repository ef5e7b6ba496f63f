//! Message security layer responder.
//!
//! The responder issues and renews every token in the system and answers
//! requests with protected responses or signed error headers.
//!
//! # Components
//!
//! - [`ServerTokenFactory`]: master and user id token issuance, renewal,
//!   revocation and per-serial replay windows
//! - [`MslServer`]: request validation and response construction
//! - [`ServerConfig`]: configuration file describing keys, entities and users
//! - [`TcpTransport`]: length-prefixed frames over TCP
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use msl_server::{Reply, ServerConfig, TcpTransport, handler};
//! # async fn run() -> Result<(), msl_server::ServerError> {
//! let server = ServerConfig::load("server.json")?.into_server(Arc::new(msl_core::SystemEnv::new()))?;
//! let transport = TcpTransport::bind("127.0.0.1:7443").await?;
//! transport.run(Arc::new(server), handler(|request| Ok(Reply::new(request.payload())))).await
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod error;
mod server;
mod token_factory;
pub mod transport;

pub use config::{KeySet, PskEntity, ServerConfig, UserCredentials};
pub use error::ServerError;
pub use server::{Handler, MslServer, MslServerBuilder, Reply, ReplyServiceToken, Request, TokenBinding, handler};
pub use token_factory::ServerTokenFactory;
pub use transport::TcpTransport;
