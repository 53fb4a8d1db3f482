//! # RESP2 Request Parsing and Reply Encoding
//!
//! Requests arrive as arrays of bulk strings. The parser works on a growing
//! `BytesMut`: it consumes one complete command at a time and leaves partial
//! input in place until more bytes arrive, so pipelined batches split across
//! reads are handled naturally.

use bytes::{Buf, BytesMut};

// Bound allocations driven by untrusted length headers.
const MAX_ARGS: usize = 1024 * 1024;
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Framing failure; the connection is closed after reporting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    Protocol,
}

/// Incremental request parser.
#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Parses one command, or returns `Ok(None)` when the buffer holds only
    /// part of one.
    pub fn parse(&mut self, buffer: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        let mut cursor = &buffer[..];
        match parse_command(&mut cursor)? {
            Some(args) => {
                let consumed = buffer.len() - cursor.len();
                buffer.advance(consumed);
                Ok(Some(args))
            }
            None => Ok(None),
        }
    }
}

fn parse_command(input: &mut &[u8]) -> Result<Option<Vec<Vec<u8>>>, RespError> {
    if input.is_empty() {
        return Ok(None);
    }
    if input[0] != b'*' {
        return Err(RespError::Protocol);
    }
    let count = match read_len(input)? {
        Some(count) if count <= MAX_ARGS => count,
        Some(_) => return Err(RespError::Protocol),
        None => return Ok(None),
    };

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if input.is_empty() {
            return Ok(None);
        }
        if input[0] != b'$' {
            return Err(RespError::Protocol);
        }
        let len = match read_len(input)? {
            Some(len) if len <= MAX_BULK_LEN => len,
            Some(_) => return Err(RespError::Protocol),
            None => return Ok(None),
        };
        if input.len() < len + 2 {
            return Ok(None);
        }
        if &input[len..len + 2] != b"\r\n" {
            return Err(RespError::Protocol);
        }
        args.push(input[..len].to_vec());
        *input = &input[len + 2..];
    }
    Ok(Some(args))
}

// Reads `<prefix><digits>\r\n` and advances past it.
fn read_len(input: &mut &[u8]) -> Result<Option<usize>, RespError> {
    let end = match input.windows(2).position(|window| window == b"\r\n") {
        Some(end) => end,
        None => return Ok(None),
    };
    let digits = &input[1..end];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(RespError::Protocol);
    }
    let value = digits
        .iter()
        .fold(0usize, |acc, b| acc.saturating_mul(10).saturating_add((b - b'0') as usize));
    *input = &input[end + 2..];
    Ok(Some(value))
}

pub fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"+");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

/// `-ERR <message>`.
pub fn resp_error(message: &str) -> Vec<u8> {
    resp_error_kind("ERR", message)
}

/// Error reply with an explicit code such as `EXECABORT` or `NOAUTH`.
pub fn resp_error_kind(kind: &str, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(kind.len() + message.len() + 4);
    buf.extend_from_slice(b"-");
    buf.extend_from_slice(kind.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_integer(value: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b":");
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 16);
    buf.extend_from_slice(b"$");
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn resp_null_array() -> Vec<u8> {
    b"*-1\r\n".to_vec()
}

/// Array of already-encoded replies.
pub fn resp_array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"*");
    buf.extend_from_slice(items.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for item in items {
        buf.extend_from_slice(item);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pipelined_commands_one_at_a_time() {
        let mut buffer = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"[..]);
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buffer).unwrap(), Some(vec![b"PING".to_vec()]));
        assert_eq!(parser.parse(&mut buffer).unwrap(), Some(vec![b"GET".to_vec(), b"k".to_vec()]));
        assert_eq!(parser.parse(&mut buffer).unwrap(), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn waits_for_partial_input() {
        let mut buffer = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$5\r\nhel"[..]);
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buffer).unwrap(), None);
        assert_eq!(buffer.len(), 20);
        buffer.extend_from_slice(b"lo\r\n");
        assert_eq!(
            parser.parse(&mut buffer).unwrap(),
            Some(vec![b"GET".to_vec(), b"hello".to_vec()])
        );
    }

    #[test]
    fn rejects_inline_and_bad_lengths() {
        let mut parser = RespParser::new();
        let mut buffer = BytesMut::from(&b"PING\r\n"[..]);
        assert_eq!(parser.parse(&mut buffer), Err(RespError::Protocol));
        let mut buffer = BytesMut::from(&b"*1\r\n$x\r\n"[..]);
        assert_eq!(parser.parse(&mut buffer), Err(RespError::Protocol));
        let mut buffer = BytesMut::from(&b"*1\r\n$2\r\nabcd\r\n"[..]);
        assert_eq!(parser.parse(&mut buffer), Err(RespError::Protocol));
    }

    #[test]
    fn encodes_nested_reply() {
        let reply = resp_array(&[resp_integer(1), resp_null()]);
        assert_eq!(reply, b"*2\r\n:1\r\n$-1\r\n".to_vec());
        assert_eq!(resp_error_kind("EXECABORT", "x"), b"-EXECABORT x\r\n".to_vec());
    }
}
