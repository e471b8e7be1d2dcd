//! Ping protocol parser.

use bytes::{BufMut, BytesMut};

/// Longest accepted command line, excluding the CRLF.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(&'a [u8]),
    /// Quit command.
    Quit,
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult<'a> {
    /// Successfully parsed command with bytes consumed.
    Complete(Command<'a>, usize),
    /// Need more data.
    Incomplete,
    /// Unknown command; the line is `usize` bytes long including CRLF.
    Unknown(usize),
    /// No line ending within `MAX_LINE_LENGTH` bytes.
    TooLong,
}

/// Parse a ping protocol command from the input buffer.
pub fn parse(input: &[u8]) -> ParseResult<'_> {
    // Find line ending
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_LINE_LENGTH + 1 => return ParseResult::TooLong,
        None => return ParseResult::Incomplete,
    };
    if line_end > MAX_LINE_LENGTH {
        return ParseResult::TooLong;
    }

    let line = &input[..line_end];
    let consumed = line_end + 2; // include \r\n

    // Parse command (case-insensitive)
    if line.eq_ignore_ascii_case(b"PING") {
        ParseResult::Complete(Command::Ping, consumed)
    } else if line.eq_ignore_ascii_case(b"QUIT") {
        ParseResult::Complete(Command::Quit, consumed)
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        ParseResult::Complete(Command::PingMsg(&line[5..]), consumed)
    } else {
        ParseResult::Unknown(consumed)
    }
}

/// Append a PONG response.
pub fn response_pong(output: &mut BytesMut) {
    output.put_slice(b"PONG\r\n");
}

/// Append a PONG response with message.
pub fn response_pong_msg(msg: &[u8], output: &mut BytesMut) {
    output.reserve(5 + msg.len() + 2);
    output.put_slice(b"PONG ");
    output.put_slice(msg);
    output.put_slice(b"\r\n");
}

/// Append an error response.
pub fn response_error(output: &mut BytesMut) {
    output.put_slice(b"ERROR unknown command\r\n");
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        match parse(b"PING\r\n") {
            ParseResult::Complete(Command::Ping, 6) => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"ping\r\n") {
            ParseResult::Complete(Command::Ping, 6) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ping_msg() {
        match parse(b"PING hello\r\n") {
            ParseResult::Complete(Command::PingMsg(msg), 12) => {
                assert_eq!(msg, b"hello");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_quit() {
        match parse(b"QUIT\r\n") {
            ParseResult::Complete(Command::Quit, 6) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        match parse(b"PING") {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command() {
        match parse(b"FOO\r\nPING\r\n") {
            ParseResult::Unknown(5) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_line_too_long() {
        let long = vec![b'x'; MAX_LINE_LENGTH + 2];
        assert!(matches!(parse(&long), ParseResult::TooLong));

        let mut terminated = vec![b'x'; MAX_LINE_LENGTH + 1];
        terminated.extend_from_slice(b"\r\n");
        assert!(matches!(parse(&terminated), ParseResult::TooLong));
    }

    #[test]
    fn test_response_pong_msg() {
        let mut buf = BytesMut::new();
        response_pong_msg(b"hello", &mut buf);
        assert_eq!(&buf[..], b"PONG hello\r\n");
    }
}
