//! # Watch Sessions
//!
//! Purpose: Optimistic read-modify-write against a store shared with other,
//! uncoordinated clients. Keys are `WATCH`ed, the caller's transition
//! function reads current values and decides the writes, and the writes are
//! committed with `MULTI`/`EXEC`. The store refuses the `EXEC` if any watched
//! key changed in between, and the session retries from scratch.
//!
//! ## State Machine
//!
//! ```text
//! Ready ──begin──▶ Watching ──commit──▶ Applying ──▶ Committed
//!                     │                     ├──────▶ Conflicted ──begin──▶ Watching
//!                     │                     └──────▶ Failed
//!                     └──abort──▶ Aborted
//! ```
//!
//! `run` drives this machine with an explicit attempt counter. Conflicts are
//! retried up to `RetryPolicy::max_attempts` with backoff between attempts;
//! exhaustion fails with `MaxRetriesExceeded`. Transport errors fail the
//! session immediately since they say nothing about whether `EXEC` applied.
//!
//! ## Notes
//! - The transition function runs while the watch is held; every moment it
//!   spends is a window for a conflicting writer.
//! - Reads inside the transition function travel on the watched connection.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, warn};

use crate::command::{Command, Reply};
use crate::context::Deadline;
use crate::error::{AbortReason, ClientError, ClientResult};
use crate::pipeline::Pipeline;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::resp::{parse_i64, RespValue};

/// Pause between conflicted attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Same pause before every retry.
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Pause after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(pause) => pause,
            Backoff::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// Bound on how often a conflicted session is re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(8),
                max: Duration::from_millis(256),
            },
        }
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Created, nothing sent yet.
    Ready,
    /// Keys are watched on a leased connection.
    Watching,
    /// `MULTI`/`EXEC` is in flight.
    Applying,
    Committed,
    /// The last `EXEC` was refused; `begin` may run again.
    Conflicted,
    /// Cancelled by the caller or its transition function.
    Aborted,
    /// Transport failure, rejected transaction, or retries exhausted.
    Failed,
}

impl WatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WatchState::Committed | WatchState::Aborted | WatchState::Failed)
    }
}

/// Outcome of one `commit` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    /// Writes applied; one reply per staged command.
    Committed(Vec<Reply>),
    /// A watched key changed; nothing was applied.
    Conflicted,
}

/// Successful result of `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchCommit {
    pub replies: Vec<Reply>,
    /// Attempts used, including the one that committed.
    pub attempts: u32,
}

/// Read handle passed to the transition function.
pub struct WatchTx<'a> {
    conn: &'a mut PooledConnection,
    deadline: &'a Deadline,
}

impl WatchTx<'_> {
    /// Runs a non-transactional command on the watched connection.
    pub fn exec(&mut self, command: &Command) -> ClientResult<RespValue> {
        match self.conn.exec(command.parts(), self.deadline)? {
            RespValue::Error(message) => Err(ClientError::Server { message }),
            other => Ok(other),
        }
    }

    /// Fetches a value by key; `Ok(None)` when missing.
    pub fn get(&mut self, key: impl AsRef<[u8]>) -> ClientResult<Option<Vec<u8>>> {
        self.exec(&Command::get(key))?.into_bulk()
    }

    /// Fetches a value and parses it as a decimal integer.
    pub fn get_i64(&mut self, key: impl AsRef<[u8]>) -> ClientResult<Option<i64>> {
        match self.get(key)? {
            Some(data) => parse_i64(&data).map(Some).map_err(|_| ClientError::UnexpectedResponse),
            None => Ok(None),
        }
    }
}

/// Optimistic transaction over a fixed set of watched keys.
pub struct WatchSession {
    pool: ConnectionPool,
    keys: BTreeSet<Vec<u8>>,
    policy: RetryPolicy,
    state: WatchState,
    attempts: u32,
    conn: Option<PooledConnection>,
}

impl WatchSession {
    /// Creates a session; duplicate keys collapse into one.
    pub fn new<I, K>(pool: &ConnectionPool, keys: I, policy: RetryPolicy) -> ClientResult<Self>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let keys: BTreeSet<Vec<u8>> = keys.into_iter().map(|key| key.as_ref().to_vec()).collect();
        if keys.is_empty() {
            return Err(ClientError::InvalidArgument("watch session needs at least one key".into()));
        }
        if policy.max_attempts == 0 {
            return Err(ClientError::InvalidArgument("max_attempts must be at least 1".into()));
        }
        Ok(WatchSession {
            pool: pool.clone(),
            keys,
            policy,
            state: WatchState::Ready,
            attempts: 0,
            conn: None,
        })
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn keys(&self) -> &BTreeSet<Vec<u8>> {
        &self.keys
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Leases a connection and watches every key, starting a new attempt.
    pub fn begin(&mut self, deadline: &Deadline) -> ClientResult<()> {
        self.expect_state(&[WatchState::Ready, WatchState::Conflicted], "begin")?;
        self.attempts += 1;

        let mut conn = match self.pool.acquire(deadline) {
            Ok(conn) => conn,
            Err(err) => return Err(self.fail(err)),
        };
        let mut watch: Vec<&[u8]> = Vec::with_capacity(self.keys.len() + 1);
        watch.push(b"WATCH");
        watch.extend(self.keys.iter().map(Vec::as_slice));

        match conn.exec(watch.as_slice(), deadline) {
            Ok(reply) if reply.is_ok() => {}
            Ok(RespValue::Error(message)) => return Err(self.fail(ClientError::Server { message })),
            Ok(_) => {
                conn.discard();
                return Err(self.fail(ClientError::UnexpectedResponse));
            }
            Err(err) => return Err(self.fail(err)),
        }

        debug!(attempt = self.attempts, keys = self.keys.len(), "watching keys");
        self.conn = Some(conn);
        self.state = WatchState::Watching;
        Ok(())
    }

    /// Read access on the watched connection.
    pub fn reader<'a>(&'a mut self, deadline: &'a Deadline) -> ClientResult<WatchTx<'a>> {
        self.expect_state(&[WatchState::Watching], "read")?;
        match self.conn.as_mut() {
            Some(conn) => Ok(WatchTx { conn, deadline }),
            None => Err(ClientError::InvalidState("watching without a connection".into())),
        }
    }

    /// Stages `writes` in `MULTI`/`EXEC` on the watched connection.
    ///
    /// Returns `Conflicted` when a watched key changed since `begin`; the
    /// writes were not applied and the watch is released.
    pub fn commit(
        &mut self,
        writes: Vec<Command>,
        deadline: &Deadline,
    ) -> ClientResult<CommitStatus> {
        self.expect_state(&[WatchState::Watching], "commit")?;
        let mut pipeline = Pipeline::transactional(&self.pool);
        for write in writes {
            pipeline.append(write)?;
        }
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let err = ClientError::InvalidState("watching without a connection".into());
                return Err(self.fail(err));
            }
        };
        self.state = WatchState::Applying;

        // EXEC releases the watch whatever its outcome, so the lease can go
        // back to the pool once it drops here.
        match pipeline.execute_on(&mut conn, deadline) {
            Ok(replies) => {
                self.state = WatchState::Committed;
                debug!(attempt = self.attempts, writes = replies.len(), "watch session committed");
                Ok(CommitStatus::Committed(replies))
            }
            Err(ClientError::Aborted {
                reason: AbortReason::WatchConflict,
            }) => {
                self.state = WatchState::Conflicted;
                debug!(attempt = self.attempts, "watched key changed, commit refused");
                Ok(CommitStatus::Conflicted)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Releases the watch without committing.
    pub fn abort(&mut self, deadline: &Deadline) {
        if let Some(mut conn) = self.conn.take() {
            // Unless UNWATCH is acknowledged the lease is closed instead of
            // returning to the pool still watching.
            match conn.exec(&[b"UNWATCH"], deadline) {
                Ok(reply) if reply.is_ok() => {}
                Ok(reply) => {
                    debug!(?reply, "unwatch rejected, dropping connection");
                    conn.discard();
                }
                Err(err) => debug!(error = %err, "unwatch failed, dropping connection"),
            }
        }
        if !self.state.is_terminal() {
            self.state = WatchState::Aborted;
        }
    }

    /// Runs the full optimistic loop.
    ///
    /// `transition` is re-evaluated on every attempt against freshly watched
    /// state; it returns the writes to stage. An `Err` from it aborts the
    /// session and is returned unchanged.
    pub fn run<F>(&mut self, deadline: &Deadline, mut transition: F) -> ClientResult<WatchCommit>
    where
        F: FnMut(&mut WatchTx<'_>) -> ClientResult<Vec<Command>>,
    {
        self.expect_state(&[WatchState::Ready], "run")?;
        loop {
            self.begin(deadline)?;

            let decided = {
                let mut tx = self.reader(deadline)?;
                transition(&mut tx)
            };
            let writes = match decided {
                Ok(writes) => writes,
                Err(err) => {
                    if self.conn.as_ref().is_some_and(|conn| !conn.is_valid()) {
                        return Err(self.fail(err));
                    }
                    self.abort(deadline);
                    return Err(err);
                }
            };

            match self.commit(writes, deadline)? {
                CommitStatus::Committed(replies) => {
                    return Ok(WatchCommit {
                        replies,
                        attempts: self.attempts,
                    })
                }
                CommitStatus::Conflicted => {}
            }

            if self.attempts >= self.policy.max_attempts {
                warn!(
                    attempts = self.attempts,
                    keys = self.keys.len(),
                    "watch session retries exhausted"
                );
                let exhausted = ClientError::MaxRetriesExceeded {
                    attempts: self.attempts,
                    keys: self.keys.iter().cloned().collect(),
                };
                return Err(self.fail(exhausted));
            }
            let pause = self.policy.backoff.delay(self.attempts);
            if !pause.is_zero() {
                if let Err(err) = deadline.sleep(pause) {
                    return Err(self.fail(err));
                }
            }
        }
    }

    fn expect_state(&self, allowed: &[WatchState], op: &str) -> ClientResult<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(ClientError::InvalidState(format!(
            "{} not allowed in state {:?}",
            op, self.state
        )))
    }

    fn fail(&mut self, err: ClientError) -> ClientError {
        if let Some(mut conn) = self.conn.take() {
            conn.discard();
        }
        self.state = WatchState::Failed;
        err
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        // Still watching: the connection must not be reused with a live WATCH.
        if let Some(mut conn) = self.conn.take() {
            conn.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            addr: "127.0.0.1:1".to_string(),
            password: None,
            db: 0,
            max_open: 1,
            max_idle: 1,
            idle_timeout: None,
            connect_timeout: None,
        })
        .unwrap()
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(8),
            max: Duration::from_millis(50),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(8));
        assert_eq!(backoff.delay(2), Duration::from_millis(16));
        assert_eq!(backoff.delay(3), Duration::from_millis(32));
        assert_eq!(backoff.delay(4), Duration::from_millis(50));
        assert_eq!(backoff.delay(100), Duration::from_millis(50));
    }

    #[test]
    fn empty_key_set_is_rejected() {
        let keys: Vec<&str> = Vec::new();
        let err = WatchSession::new(&pool(), keys, RetryPolicy::default()).err().unwrap();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn keys_are_deduplicated() {
        let session = WatchSession::new(&pool(), ["b", "a", "b"], RetryPolicy::default()).unwrap();
        let keys: Vec<_> = session.keys().iter().cloned().collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(session.state(), WatchState::Ready);
    }

    #[test]
    fn commit_before_begin_is_invalid() {
        let mut session = WatchSession::new(&pool(), ["k"], RetryPolicy::default()).unwrap();
        let deadline = Deadline::after(Duration::from_millis(10));
        let err = session.commit(Vec::new(), &deadline).err().unwrap();
        assert!(matches!(err, ClientError::InvalidState(_)));
        assert_eq!(session.state(), WatchState::Ready);
    }

    #[test]
    fn abort_from_ready_is_terminal() {
        let mut session = WatchSession::new(&pool(), ["k"], RetryPolicy::default()).unwrap();
        session.abort(&Deadline::after(Duration::from_millis(10)));
        assert_eq!(session.state(), WatchState::Aborted);
        assert!(session.state().is_terminal());
    }
}
