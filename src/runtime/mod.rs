//! Custom runtime: a Proactor simulated on top of a readiness multiplexer.
//!
//! - `poller`: one-shot readiness notifications over mio
//! - `connection`: generation-checked connection table
//! - `pool`: bounded task queue and worker threads
//! - `event_loop`: the dispatch loop tying them together
//!
//! Sockets are only ever touched by the dispatch thread. Workers see a
//! connection's buffers, never its socket.

mod connection;
mod event_loop;
mod poller;
mod pool;
pub mod protocol;
mod sync;
mod task;
mod token;

pub use event_loop::{Server, ServerHandle};
pub use protocol::{Application, ProcessResult, Protocol};

use crate::config::{Config, ProtocolType};
use std::sync::Arc;

/// Build the application selected by the configuration.
pub fn application(config: &Config) -> Arc<dyn Application> {
    let protocol = match config.protocol {
        ProtocolType::Echo => Protocol::Echo,
        ProtocolType::Ping => Protocol::Ping,
    };
    protocol.application()
}
