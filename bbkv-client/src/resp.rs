//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server responses without
//! external dependencies, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Responses are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.
//! 5. **Batch-Friendly**: Several commands can be encoded back to back into
//!    one buffer and their replies read one at a time, in order.

use std::io::{BufRead, Read};

use crate::error::{ClientError, ClientResult};

// Length headers come from the store and are bounded before allocating.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
const MAX_ARRAY_LEN: i64 = 1024 * 1024;
// Larger payloads grow as their bytes actually arrive.
const PREALLOC_BULK: usize = 64 * 1024;
const PREALLOC_ITEMS: usize = 64;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +QUEUED style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays (EXEC and SCAN replies).
    Array(Vec<RespValue>),
    /// *-1, returned by EXEC when a watched key changed.
    NullArray,
}

impl RespValue {
    /// True for `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::Simple(text) if text == b"OK")
    }

    /// Integer payload, also accepting numeric bulk strings.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            RespValue::Bulk(Some(data)) => parse_i64(data).ok(),
            _ => None,
        }
    }

    /// Bulk payload; `Ok(None)` for a null bulk string.
    pub fn into_bulk(self) -> ClientResult<Option<Vec<u8>>> {
        match self {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Simple(text) => Ok(Some(text)),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}

/// Encodes a RESP2 array command into the provided buffer.
///
/// The buffer is appended to, not cleared, so pipelines can stack commands.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        _ => Err(ClientError::Protocol),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    match len {
        -1 => return Ok(RespValue::Bulk(None)),
        len if !(0..=MAX_BULK_LEN).contains(&len) => return Err(ClientError::Protocol),
        _ => {}
    }
    let len = len as usize;
    let mut data = Vec::with_capacity(len.min(PREALLOC_BULK));
    reader
        .by_ref()
        .take(len as u64)
        .read_to_end(&mut data)
        .map_err(ClientError::from_io)?;
    if data.len() < len {
        return Err(closed_by_store());
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).map_err(ClientError::from_io)?;
    if crlf != [b'\r', b'\n'] {
        return Err(ClientError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    match len {
        -1 => return Ok(RespValue::NullArray),
        len if !(0..=MAX_ARRAY_LEN).contains(&len) => return Err(ClientError::Protocol),
        _ => {}
    }

    let mut items = Vec::with_capacity((len as usize).min(PREALLOC_ITEMS));
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf).map_err(ClientError::from_io)?;
    if bytes == 0 {
        return Err(closed_by_store());
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn closed_by_store() -> ClientError {
    ClientError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed by store",
    ))
}

pub(crate) fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol);
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }
    if idx == data.len() {
        return Err(ClientError::Protocol);
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(bytes: &[u8]) -> ClientResult<RespValue> {
        let mut reader = Cursor::new(bytes.to_vec());
        let mut line = Vec::new();
        read_response(&mut reader, &mut line)
    }

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&[b"GET".as_slice(), b"key"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn encodes_commands_back_to_back() {
        let mut buf = Vec::new();
        encode_command(&[b"MULTI".to_vec()], &mut buf);
        encode_command(&[b"INCR".to_vec(), b"n".to_vec()], &mut buf);
        assert_eq!(&buf, b"*1\r\n$5\r\nMULTI\r\n*2\r\n$4\r\nINCR\r\n$1\r\nn\r\n");
    }

    #[test]
    fn parses_simple_string() {
        assert_eq!(parse(b"+OK\r\n").unwrap(), RespValue::Simple(b"OK".to_vec()));
    }

    #[test]
    fn parses_bulk_string() {
        assert_eq!(parse(b"$5\r\nhello\r\n").unwrap(), RespValue::Bulk(Some(b"hello".to_vec())));
    }

    #[test]
    fn parses_null_bulk_string() {
        assert_eq!(parse(b"$-1\r\n").unwrap(), RespValue::Bulk(None));
    }

    #[test]
    fn parses_integer() {
        assert_eq!(parse(b":42\r\n").unwrap(), RespValue::Integer(42));
        assert_eq!(parse(b":-2\r\n").unwrap(), RespValue::Integer(-2));
    }

    #[test]
    fn parses_error() {
        assert_eq!(parse(b"-ERR bad\r\n").unwrap(), RespValue::Error(b"ERR bad".to_vec()));
    }

    #[test]
    fn distinguishes_null_and_empty_arrays() {
        assert_eq!(parse(b"*-1\r\n").unwrap(), RespValue::NullArray);
        assert_eq!(parse(b"*0\r\n").unwrap(), RespValue::Array(Vec::new()));
    }

    #[test]
    fn parses_scan_reply() {
        let resp = parse(b"*2\r\n$2\r\n17\r\n*2\r\n$1\r\na\r\n$1\r\nb\r\n").unwrap();
        assert_eq!(
            resp,
            RespValue::Array(vec![
                RespValue::Bulk(Some(b"17".to_vec())),
                RespValue::Array(vec![
                    RespValue::Bulk(Some(b"a".to_vec())),
                    RespValue::Bulk(Some(b"b".to_vec())),
                ]),
            ])
        );
    }

    #[test]
    fn rejects_bad_framing() {
        assert!(matches!(parse(b"?what\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b"+OK\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b":-\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b"*-2\r\n"), Err(ClientError::Protocol)));
    }

    #[test]
    fn rejects_oversized_length_headers() {
        assert!(matches!(parse(b"*9223372036854775807\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b"$9223372036854775807\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse(b"$99999999999999999999\r\n"), Err(ClientError::Protocol)));
    }

    #[test]
    fn large_header_with_short_body_is_transport_failure() {
        // A header under the cap must not allocate the claimed size up front.
        let err = parse(b"$400000000\r\nabc").unwrap_err();
        assert!(err.is_transport());
        let err = parse(b"*1000000\r\n:1\r\n").unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn eof_is_transport_failure() {
        let err = parse(b"").unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn integer_accessor_reads_bulk_digits() {
        assert_eq!(RespValue::Bulk(Some(b"7".to_vec())).as_integer(), Some(7));
        assert_eq!(RespValue::Bulk(None).as_integer(), None);
    }
}
