//! Payloads passed between the dispatch loop and the worker pool.

use crate::runtime::connection::Buffers;
use crate::runtime::protocol::ProcessResult;
use crate::runtime::token::ConnId;

/// A connection handed to a worker: its identity and its buffers.
///
/// The socket stays behind in the connection table.
#[derive(Debug)]
pub struct Task {
    pub id: ConnId,
    pub buffers: Buffers,
}

/// A finished task travelling back to the dispatch loop.
#[derive(Debug)]
pub struct Completion {
    pub id: ConnId,
    pub buffers: Buffers,
    pub result: ProcessResult,
}
