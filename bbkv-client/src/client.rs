//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API for batching commands, running
//! atomic and optimistic transactions, and scanning keys against a
//! Redis-compatible store over RESP2.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling, deadlines, and protocol
//!    details behind one explicit handle; there is no global client.
//! 2. **Borrow-Friendly API**: Accept `AsRef<[u8]>` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.
//! 4. **Bounded Calls**: Every facade call runs under the configured
//!    per-call timeout; the `_with` variants take an explicit `Deadline`.

use std::time::Duration;

use crate::command::{Command, Reply};
use crate::config::ClientConfig;
use crate::context::Deadline;
use crate::error::{ClientError, ClientResult};
use crate::pipeline::{Pipeline, PipelineMode};
use crate::pool::{ConnectionPool, PoolStats};
use crate::resp::RespValue;
use crate::scan::{ScanCursor, ScanIter};
use crate::watch::{RetryPolicy, WatchCommit, WatchSession, WatchTx};

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Synchronous client with connection pooling.
///
/// Cloning shares the pool. Call `close` to drain it at shutdown.
#[derive(Clone)]
pub struct KVClient {
    pool: ConnectionPool,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl KVClient {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        let config = ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        };
        Self::with_config(config)
    }

    /// Creates a client from a `redis://` URL.
    pub fn from_url(url: &str) -> ClientResult<Self> {
        Self::with_config(ClientConfig::from_url(url)?)
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(config.pool_config())?;
        Ok(KVClient {
            pool,
            call_timeout: config.call_timeout(),
            retry: config.retry_policy(),
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Fresh deadline of one configured call timeout.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.call_timeout)
    }

    /// Sends `commands` in one round trip; one reply per command, in order.
    pub fn run_pipeline(&self, commands: Vec<Command>) -> ClientResult<Vec<Reply>> {
        self.run_batch(PipelineMode::Plain, commands, &self.deadline())
    }

    /// Like `run_pipeline`, but applied atomically with `MULTI`/`EXEC`.
    pub fn run_transaction(&self, commands: Vec<Command>) -> ClientResult<Vec<Reply>> {
        self.run_batch(PipelineMode::Transactional, commands, &self.deadline())
    }

    /// Runs a batch of the given mode under an explicit deadline.
    pub fn run_batch(
        &self,
        mode: PipelineMode,
        commands: Vec<Command>,
        deadline: &Deadline,
    ) -> ClientResult<Vec<Reply>> {
        let mut pipeline = Pipeline::with_mode(&self.pool, mode);
        for command in commands {
            pipeline.append(command)?;
        }
        pipeline.execute(deadline)
    }

    /// Builds a plain pipeline in `build`, executes it, and returns it so
    /// slot indices handed out by `append` can be looked up.
    pub fn pipelined<F>(&self, build: F) -> ClientResult<Pipeline>
    where
        F: FnOnce(&mut Pipeline) -> ClientResult<()>,
    {
        self.build_and_run(PipelineMode::Plain, build)
    }

    /// Transactional counterpart of `pipelined`.
    pub fn tx_pipelined<F>(&self, build: F) -> ClientResult<Pipeline>
    where
        F: FnOnce(&mut Pipeline) -> ClientResult<()>,
    {
        self.build_and_run(PipelineMode::Transactional, build)
    }

    fn build_and_run<F>(&self, mode: PipelineMode, build: F) -> ClientResult<Pipeline>
    where
        F: FnOnce(&mut Pipeline) -> ClientResult<()>,
    {
        let mut pipeline = Pipeline::with_mode(&self.pool, mode);
        build(&mut pipeline)?;
        pipeline.execute(&self.deadline())?;
        Ok(pipeline)
    }

    /// Optimistic read-modify-write over `keys` with the configured retry policy.
    ///
    /// The deadline covers every attempt, including backoff pauses.
    pub fn run_optimistic<I, K, F>(&self, keys: I, transition: F) -> ClientResult<WatchCommit>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
        F: FnMut(&mut WatchTx<'_>) -> ClientResult<Vec<Command>>,
    {
        let deadline = Deadline::after(self.call_timeout.saturating_mul(self.retry.max_attempts));
        self.run_optimistic_with(keys, self.retry, &deadline, transition)
    }

    /// `run_optimistic` with an explicit policy and deadline.
    pub fn run_optimistic_with<I, K, F>(
        &self,
        keys: I,
        policy: RetryPolicy,
        deadline: &Deadline,
        transition: F,
    ) -> ClientResult<WatchCommit>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
        F: FnMut(&mut WatchTx<'_>) -> ClientResult<Vec<Command>>,
    {
        WatchSession::new(&self.pool, keys, policy)?.run(deadline, transition)
    }

    /// A watch session for stepwise use (`begin` / `reader` / `commit`).
    pub fn watch_session<I, K>(&self, keys: I) -> ClientResult<WatchSession>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        WatchSession::new(&self.pool, keys, self.retry)
    }

    /// Lazily iterates keys matching `pattern`.
    pub fn scan(&self, pattern: impl AsRef<[u8]>) -> ScanIter {
        ScanIter::new(self.scan_cursor(pattern, None), self.call_timeout)
    }

    /// Explicit cursor for page-at-a-time scanning.
    pub fn scan_cursor(&self, pattern: impl AsRef<[u8]>, count: Option<usize>) -> ScanCursor {
        ScanCursor::new(&self.pool, pattern, count)
    }

    /// Runs any single command; error replies become `ClientError::Server`.
    pub fn do_command(&self, command: &Command) -> ClientResult<RespValue> {
        let deadline = self.deadline();
        let mut conn = self.pool.acquire(&deadline)?;
        match conn.exec(command.parts(), &deadline)? {
            RespValue::Error(message) => Err(ClientError::Server { message }),
            other => Ok(other),
        }
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: impl AsRef<[u8]>) -> ClientResult<Option<Vec<u8>>> {
        match self.do_command(&Command::get(key))? {
            RespValue::Bulk(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches a value, falling back to `default` when the key is missing.
    pub fn get_or_default(&self, key: impl AsRef<[u8]>, default: &[u8]) -> ClientResult<Vec<u8>> {
        Ok(self.get(key)?.unwrap_or_else(|| default.to_vec()))
    }

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> ClientResult<()> {
        expect_simple(self.do_command(&Command::set(key, value))?)
    }

    /// Sets a value and attaches an expiration in seconds.
    pub fn set_with_ttl(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        ttl: Duration,
    ) -> ClientResult<()> {
        expect_simple(self.do_command(&Command::set_with_ttl(key, value, ttl))?)
    }

    /// Increments an integer value, returning the new value.
    pub fn incr(&self, key: impl AsRef<[u8]>) -> ClientResult<i64> {
        match self.do_command(&Command::incr(key))? {
            RespValue::Integer(value) => Ok(value),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> ClientResult<bool> {
        match self.do_command(&Command::del(key))? {
            RespValue::Integer(count) => Ok(count > 0),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub fn expire(&self, key: impl AsRef<[u8]>, ttl: Duration) -> ClientResult<bool> {
        match self.do_command(&Command::expire(key, ttl))? {
            RespValue::Integer(value) => Ok(value == 1),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns TTL status for a key.
    pub fn ttl(&self, key: impl AsRef<[u8]>) -> ClientResult<ClientTtl> {
        match self.do_command(&Command::ttl(key))? {
            RespValue::Integer(-2) => Ok(ClientTtl::Missing),
            RespValue::Integer(-1) => Ok(ClientTtl::NoExpiry),
            RespValue::Integer(value) if value >= 0 => {
                Ok(ClientTtl::ExpiresIn(Duration::from_secs(value as u64)))
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Pings the server. Returns the raw response payload.
    pub fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        let command = match payload {
            Some(data) => Command::ping().arg(data),
            None => Command::ping(),
        };
        match self.do_command(&command)? {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Drains the pool; later calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.pool.close();
    }
}

fn expect_simple(reply: RespValue) -> ClientResult<()> {
    match reply {
        RespValue::Simple(_) => Ok(()),
        _ => Err(ClientError::UnexpectedResponse),
    }
}
