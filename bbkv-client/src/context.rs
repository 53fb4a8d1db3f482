//! # Deadlines and Cancellation
//!
//! Purpose: Bound every suspending call (pool acquire, pipeline exchange,
//! watch commit) by an explicit deadline, optionally paired with a token the
//! caller can fire from another thread.
//!
//! ## Design Principles
//! 1. **No Unbounded Waits**: A `Deadline` always has an expiry instant.
//! 2. **Cheap Checks**: `check()` is an `Instant` compare plus one atomic load.
//! 3. **Socket-Friendly**: `remaining()` yields a non-zero duration suitable
//!    for `set_read_timeout`, or the cancellation error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CancelReason, ClientError, ClientResult};

/// Shared flag a caller flips to cancel in-flight calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every call observing this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Expiry instant plus optional cancel token for one logical call.
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Instant,
    cancel: Option<CancelToken>,
}

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            expires_at: Instant::now() + timeout,
            cancel: None,
        }
    }

    /// Deadline at an absolute instant.
    pub fn at(expires_at: Instant) -> Self {
        Deadline {
            expires_at,
            cancel: None,
        }
    }

    /// Attaches a cancel token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Fails with `Cancelled` when the token fired or the deadline passed.
    pub fn check(&self) -> ClientResult<()> {
        self.remaining().map(|_| ())
    }

    /// Time left before expiry; never returns a zero duration.
    ///
    /// Zero is rejected by `TcpStream::set_read_timeout`, so an expired
    /// deadline is reported as an error instead.
    pub fn remaining(&self) -> ClientResult<Duration> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(ClientError::Cancelled {
                reason: CancelReason::Requested,
            });
        }
        let left = self.expires_at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(ClientError::Cancelled {
                reason: CancelReason::DeadlineExceeded,
            });
        }
        Ok(left)
    }

    /// Like `remaining`, capped at `limit` when one is configured.
    pub(crate) fn remaining_capped(&self, limit: Option<Duration>) -> ClientResult<Duration> {
        let left = self.remaining()?;
        Ok(match limit {
            Some(limit) if !limit.is_zero() => left.min(limit),
            _ => left,
        })
    }

    /// Sleeps for `pause` or until the deadline, whichever comes first.
    ///
    /// The cancel token is polled in short slices so a fired token cuts the
    /// sleep short.
    pub(crate) fn sleep(&self, pause: Duration) -> ClientResult<()> {
        const SLICE: Duration = Duration::from_millis(5);
        let wake_at = Instant::now() + pause;
        loop {
            let left = self.remaining()?;
            let now = Instant::now();
            if now >= wake_at {
                return Ok(());
            }
            std::thread::sleep(left.min(wake_at - now).min(SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_deadline_reports_cancelled() {
        let deadline = Deadline::at(Instant::now() - Duration::from_millis(1));
        assert!(matches!(
            deadline.check(),
            Err(ClientError::Cancelled {
                reason: CancelReason::DeadlineExceeded
            })
        ));
    }

    #[test]
    fn token_cancels_before_expiry() {
        let token = CancelToken::new();
        let deadline = Deadline::after(Duration::from_secs(60)).with_cancel(token.clone());
        assert!(deadline.check().is_ok());
        token.cancel();
        assert!(matches!(
            deadline.remaining(),
            Err(ClientError::Cancelled {
                reason: CancelReason::Requested
            })
        ));
    }

    #[test]
    fn remaining_is_capped() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let left = deadline.remaining_capped(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(left, Duration::from_millis(10));
    }

    #[test]
    fn sleep_stops_at_deadline() {
        let deadline = Deadline::after(Duration::from_millis(20));
        let started = Instant::now();
        let result = deadline.sleep(Duration::from_secs(5));
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
