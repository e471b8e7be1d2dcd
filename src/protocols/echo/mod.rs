//! Echo protocol implementation.
//!
//! Every byte received is sent back unchanged, in order. There is no
//! framing: whatever the dispatch loop has accumulated when the worker runs
//! is echoed as one response.
//!
//! ## Use Cases
//!
//! 1. **Throughput testing**: Measure raw I/O throughput of the reactor and
//!    worker hop without any parsing overhead.
//!
//! 2. **Correctness validation**: Verify data integrity by comparing echoed
//!    data against sent data, including payloads that need several reads
//!    and partial writes.

use bytes::BytesMut;

use crate::runtime::{Application, ProcessResult};

/// Echo application.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Application for Echo {
    fn process(&self, input: &mut BytesMut, output: &mut BytesMut) -> ProcessResult {
        if input.is_empty() {
            return ProcessResult::NeedData;
        }
        if output.is_empty() {
            // Hand the input allocation over instead of copying it.
            std::mem::swap(input, output);
        } else {
            output.extend_from_slice(input);
            input.clear();
        }
        ProcessResult::Response
    }
}
