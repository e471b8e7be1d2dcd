//! Application logic contract for the worker pool.
//!
//! Workers never touch sockets. They run an `Application` against the bytes
//! the dispatch loop has accumulated for a connection and leave whatever
//! should be sent back in the output buffer.

use bytes::BytesMut;
use std::sync::Arc;

use crate::protocols::{echo::Echo, ping::Ping};

/// Protocol type for command processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Echo,
    Ping,
}

impl Protocol {
    /// Build the application implementing this protocol.
    pub fn application(self) -> Arc<dyn Application> {
        match self {
            Protocol::Echo => Arc::new(Echo),
            Protocol::Ping => Arc::new(Ping),
        }
    }
}

/// Result of processing a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Need more data to complete parsing.
    NeedData,
    /// Input consumed, response appended to the output buffer.
    Response,
    /// Client asked to close the connection.
    Quit,
    /// Protocol error, connection should be closed.
    Error,
}

/// Application logic run on a worker thread.
///
/// `process` consumes the bytes it handled from the front of `input` and
/// appends its reply to `output`. It must not block.
pub trait Application: Send + Sync + 'static {
    fn process(&self, input: &mut BytesMut, output: &mut BytesMut) -> ProcessResult;
}

impl<F> Application for F
where
    F: Fn(&mut BytesMut, &mut BytesMut) -> ProcessResult + Send + Sync + 'static,
{
    fn process(&self, input: &mut BytesMut, output: &mut BytesMut) -> ProcessResult {
        self(input, output)
    }
}
