//! Ping protocol implementation.
//!
//! A minimal protocol for health checks and latency measurement:
//! - Client sends: `PING\r\n` or `PING <message>\r\n`
//! - Server responds: `PONG\r\n` or `PONG <message>\r\n`
//!
//! ## Use Cases
//!
//! 1. **Health checks**: Load balancers and monitoring systems can verify
//!    the server is responsive.
//!
//! 2. **Latency measurement**: Measures network + dispatch overhead, i.e.
//!    one reactor read, one worker hop and one reactor write per request.
//!
//! 3. **Pipelining**: Several commands sent back to back are answered in a
//!    single response, in order.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  PING\r\n
//! Response: PONG\r\n
//!
//! Request:  PING hello\r\n
//! Response: PONG hello\r\n
//!
//! Request:  QUIT\r\n
//! (connection closed)
//! ```

pub mod parser;

use bytes::{Buf, BytesMut};
use parser::{Command, ParseResult};

use crate::runtime::{Application, ProcessResult};

/// Ping application.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

impl Application for Ping {
    fn process(&self, input: &mut BytesMut, output: &mut BytesMut) -> ProcessResult {
        let mut responded = false;

        loop {
            let consumed = match parser::parse(input) {
                ParseResult::Complete(Command::Ping, consumed) => {
                    parser::response_pong(output);
                    consumed
                }
                ParseResult::Complete(Command::PingMsg(msg), consumed) => {
                    parser::response_pong_msg(msg, output);
                    consumed
                }
                // Replies to earlier commands go out first; QUIT stays in
                // the input and closes the connection on the next pass.
                ParseResult::Complete(Command::Quit, _) if responded => break,
                ParseResult::Complete(Command::Quit, _) => return ProcessResult::Quit,
                ParseResult::Unknown(consumed) => {
                    parser::response_error(output);
                    consumed
                }
                ParseResult::Incomplete => break,
                ParseResult::TooLong if responded => break,
                ParseResult::TooLong => return ProcessResult::Error,
            };
            input.advance(consumed);
            responded = true;
        }

        if responded {
            ProcessResult::Response
        } else {
            ProcessResult::NeedData
        }
    }
}
