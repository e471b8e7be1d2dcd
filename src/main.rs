//! proactor-server: a TCP server built on a simulated Proactor
//!
//! A single dispatch thread owns every socket and performs all reads and
//! writes on a readiness multiplexer. Application logic runs on a bounded
//! worker pool that only ever sees a connection's buffers.
//!
//! Protocols:
//! - Echo: every byte sent back unchanged
//! - Ping: line-based PING/PONG
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod protocols;
mod runtime;
mod signal;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Every thread spawned from here on inherits the mask.
    signal::block_shutdown_signals()?;
    signal::ignore_sigpipe();

    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        protocol = ?config.protocol,
        workers = config.worker_threads(),
        queue_capacity = config.queue_capacity,
        max_connections = config.max_connections,
        "Starting proactor-server"
    );

    let server = runtime::Server::bind(&config, runtime::application(&config))?;
    let handle = server.handle();
    info!(addr = %handle.local_addr(), "Listening");
    signal::spawn_shutdown_listener(handle)?;
    server.run()?;

    Ok(())
}
