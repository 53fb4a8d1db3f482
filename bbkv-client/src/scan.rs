//! # Keyspace Scanning
//!
//! Purpose: Walk the keyspace with `SCAN` in bounded pages so the store is
//! never blocked by one huge reply.
//!
//! ## Guarantees
//! - A key present for the whole scan is returned at least once.
//! - Keys added or removed mid-scan may be returned zero or more times; there
//!   is no point-in-time snapshot.
//! - The scan ends when the store hands back cursor `0` after the first page.

use std::collections::VecDeque;
use std::time::Duration;

use crate::command::Command;
use crate::context::Deadline;
use crate::error::{ClientError, ClientResult};
use crate::pool::ConnectionPool;
use crate::resp::RespValue;

/// Restartable cursor over keys matching a glob pattern.
pub struct ScanCursor {
    pool: ConnectionPool,
    pattern: Vec<u8>,
    count: Option<usize>,
    cursor: u64,
    done: bool,
}

impl ScanCursor {
    /// `count` is a page-size hint passed as `COUNT`; the store may return
    /// more or fewer keys per page.
    pub fn new(pool: &ConnectionPool, pattern: impl AsRef<[u8]>, count: Option<usize>) -> Self {
        ScanCursor {
            pool: pool.clone(),
            pattern: pattern.as_ref().to_vec(),
            count,
            cursor: 0,
            done: false,
        }
    }

    /// Current position token; `0` before the first page and after the last.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// Starts over from the beginning of the keyspace.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.done = false;
    }

    /// Fetches the next page of matching keys.
    ///
    /// After the final page this returns an empty batch without a round trip.
    /// On error the position is unchanged, so the same page can be retried.
    pub fn next_batch(&mut self, deadline: &Deadline) -> ClientResult<Vec<Vec<u8>>> {
        if self.done {
            return Ok(Vec::new());
        }
        let mut command = Command::new("SCAN")
            .arg(self.cursor.to_string())
            .arg("MATCH")
            .arg(&self.pattern);
        if let Some(count) = self.count {
            command = command.arg("COUNT").arg(count.to_string());
        }

        let mut conn = self.pool.acquire(deadline)?;
        let reply = conn.exec(command.parts(), deadline)?;
        let (next, keys) = parse_scan_reply(reply)?;

        self.cursor = next;
        self.done = next == 0;
        Ok(keys)
    }
}

fn parse_scan_reply(reply: RespValue) -> ClientResult<(u64, Vec<Vec<u8>>)> {
    let mut parts = match reply {
        RespValue::Array(parts) if parts.len() == 2 => parts,
        RespValue::Error(message) => return Err(ClientError::Server { message }),
        _ => return Err(ClientError::UnexpectedResponse),
    };
    let keys = match parts.pop() {
        Some(RespValue::Array(items)) => items,
        _ => return Err(ClientError::UnexpectedResponse),
    };
    let cursor = match parts.pop() {
        Some(RespValue::Bulk(Some(token))) => parse_cursor(&token)?,
        _ => return Err(ClientError::UnexpectedResponse),
    };

    let keys = keys
        .into_iter()
        .map(|item| match item {
            RespValue::Bulk(Some(key)) => Ok(key),
            _ => Err(ClientError::UnexpectedResponse),
        })
        .collect::<ClientResult<Vec<_>>>()?;
    Ok((cursor, keys))
}

fn parse_cursor(token: &[u8]) -> ClientResult<u64> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(ClientError::Protocol)
}

/// Lazy iterator over every key a `ScanCursor` yields.
///
/// Each page gets its own deadline of `page_timeout`. An error is yielded
/// once and ends the iteration.
pub struct ScanIter {
    cursor: ScanCursor,
    page_timeout: Duration,
    page: VecDeque<Vec<u8>>,
    failed: bool,
}

impl ScanIter {
    pub fn new(cursor: ScanCursor, page_timeout: Duration) -> Self {
        ScanIter {
            cursor,
            page_timeout,
            page: VecDeque::new(),
            failed: false,
        }
    }

    /// The underlying cursor, e.g. to inspect its position.
    pub fn cursor(&self) -> &ScanCursor {
        &self.cursor
    }
}

impl Iterator for ScanIter {
    type Item = ClientResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.page.pop_front() {
                return Some(Ok(key));
            }
            if self.failed || self.cursor.done() {
                return None;
            }
            match self.cursor.next_batch(&Deadline::after(self.page_timeout)) {
                Ok(keys) => self.page.extend(keys),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(data: &[u8]) -> RespValue {
        RespValue::Bulk(Some(data.to_vec()))
    }

    #[test]
    fn parses_page_and_cursor() {
        let keys = RespValue::Array(vec![bulk(b"a"), bulk(b"b")]);
        let reply = RespValue::Array(vec![bulk(b"42"), keys]);
        let (cursor, keys) = parse_scan_reply(reply).unwrap();
        assert_eq!(cursor, 42);
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn rejects_malformed_cursor() {
        let reply = RespValue::Array(vec![bulk(b"x1"), RespValue::Array(Vec::new())]);
        assert!(matches!(parse_scan_reply(reply), Err(ClientError::Protocol)));
        let reply = RespValue::Array(vec![bulk(b"0")]);
        assert!(matches!(parse_scan_reply(reply), Err(ClientError::UnexpectedResponse)));
    }

    #[test]
    fn server_error_surfaces() {
        let reply = RespValue::Error(b"ERR invalid cursor".to_vec());
        assert!(matches!(parse_scan_reply(reply), Err(ClientError::Server { .. })));
    }
}
