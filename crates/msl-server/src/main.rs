//! Message security layer server binary.
//!
//! Answers every request by echoing its payload. Useful for exercising
//! requesters against a real responder.
//!
//! # Usage
//!
//! ```bash
//! msl-server --config server.json --bind 127.0.0.1:7443
//! ```

use std::sync::Arc;

use clap::Parser;
use msl_core::SystemEnv;
use msl_server::{Reply, ServerConfig, TcpTransport, handler};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Message security layer echo server
#[derive(Parser, Debug)]
#[command(name = "msl-server")]
#[command(about = "Message security layer echo server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:7443")]
    bind: String,

    /// Path to the server configuration (JSON)
    #[arg(short, long)]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = ServerConfig::load(&args.config)?;
    tracing::info!(identity = %config.identity, entities = config.entities.len(), "MSL server starting");

    let server = Arc::new(config.into_server(Arc::new(SystemEnv::new()))?);
    let transport = TcpTransport::bind(&args.bind).await?;
    tracing::info!("Server listening on {}", transport.local_addr()?);

    let echo = handler(|request| {
        tracing::debug!(message_id = request.message_id(), bytes = request.payload().len(), "echo");
        Ok(Reply::new(request.payload()))
    });
    transport.run(server, echo).await?;

    Ok(())
}
