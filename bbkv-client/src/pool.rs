//! # Connection Pool
//!
//! Purpose: Reuse TCP connections for the sync client to reduce handshake
//! latency and allocation churn, while bounding how many are open at once.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections;
//!    connects and liveness checks run outside it.
//! 3. **Bounded Waits**: A saturated pool parks the caller on a condvar, but
//!    never past the caller's `Deadline`.
//! 4. **Scoped Leases**: `PooledConnection` returns itself on drop, on every
//!    exit path. A lease that saw an error is closed instead of reused.
//! 5. **Cache-Friendly Buffers**: Each connection reuses its own buffers.

use std::collections::VecDeque;
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::context::Deadline;
use crate::error::{CancelReason, ClientError, ClientResult, Interrupted};
use crate::resp::{encode_command, read_response, RespValue};

// Upper bound on a single condvar park so cancel tokens are noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(10);
// Upper bound on a single blocking socket call, for the same reason.
const IO_SLICE: Duration = Duration::from_millis(20);

/// Pool configuration for the sync client.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Password sent with `AUTH` right after connecting.
    pub password: Option<String>,
    /// Logical database selected right after connecting; 0 skips `SELECT`.
    pub db: u32,
    /// Maximum total connections (idle + in-use).
    pub max_open: usize,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Option<Duration>,
    /// Optional TCP connect timeout; the call deadline still applies.
    pub connect_timeout: Option<Duration>,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently open, leased or idle.
    pub open: usize,
    /// Connections parked in the idle list.
    pub idle: usize,
    /// Configured ceiling on open connections.
    pub max_open: usize,
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConnection>,
    open: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    // Signalled whenever a slot frees up or a connection goes idle.
    available: Condvar,
}

/// Connection pool handle.
///
/// Cloning is cheap; all clones share one free-list.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a new connection pool with the provided configuration.
    ///
    /// No connection is opened here; they are established lazily on acquire.
    pub fn new(mut config: PoolConfig) -> ClientResult<Self> {
        if config.addr.is_empty() {
            return Err(ClientError::InvalidAddress);
        }
        config.max_idle = config.max_idle.min(config.max_open);
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            open: 0,
            closed: false,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquires a connection from the pool.
    ///
    /// Prefers an idle connection, then opens a new one while under
    /// `max_open`, then waits. Fails with `PoolExhausted` once the deadline
    /// passes without a connection becoming available.
    pub fn acquire(&self, deadline: &Deadline) -> ClientResult<PooledConnection> {
        let started = Instant::now();
        loop {
            match self.try_acquire(deadline)? {
                Some(conn) => return Ok(conn),
                None => self.wait(deadline, started)?,
            }
        }
    }

    fn try_acquire(&self, deadline: &Deadline) -> ClientResult<Option<PooledConnection>> {
        while let Some(idle) = self.pop_idle()? {
            if self.is_stale(&idle) {
                debug!(addr = %self.inner.config.addr, "closing stale idle connection");
                self.release_slot();
                continue;
            }
            return Ok(Some(PooledConnection::new(self.inner.clone(), idle.conn)));
        }

        if !self.try_reserve() {
            return Ok(None);
        }

        match Connection::connect(&self.inner.config, deadline) {
            Ok(conn) => Ok(Some(PooledConnection::new(self.inner.clone(), conn))),
            Err(err) => {
                self.release_slot();
                warn!(addr = %self.inner.config.addr, error = %err, "connect failed");
                Err(err)
            }
        }
    }

    fn wait(&self, deadline: &Deadline, started: Instant) -> ClientResult<()> {
        let left = match deadline.remaining() {
            Ok(left) => left,
            Err(ClientError::Cancelled {
                reason: CancelReason::DeadlineExceeded,
            }) => {
                return Err(ClientError::PoolExhausted {
                    waited: started.elapsed(),
                })
            }
            Err(err) => return Err(err),
        };
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(ClientError::PoolClosed);
        }
        // Re-check under the lock so a release between try_acquire and here
        // is not missed.
        if !state.idle.is_empty() || state.open < self.inner.config.max_open {
            return Ok(());
        }
        self.inner.available.wait_for(&mut state, left.min(WAIT_SLICE));
        Ok(())
    }

    fn is_stale(&self, idle: &IdleConnection) -> bool {
        let expired = self
            .inner
            .config
            .idle_timeout
            .is_some_and(|limit| idle.since.elapsed() >= limit);
        expired || !idle.conn.is_healthy()
    }

    fn pop_idle(&self) -> ClientResult<Option<IdleConnection>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(ClientError::PoolClosed);
        }
        Ok(state.idle.pop_front())
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.open >= self.inner.config.max_open {
            return false;
        }
        state.open += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.open = state.open.saturating_sub(1);
        drop(state);
        self.inner.available.notify_one();
    }

    fn return_connection(&self, conn: Connection) {
        if !conn.is_healthy() {
            debug!(addr = %self.inner.config.addr, "discarding unhealthy connection on release");
            self.release_slot();
            return;
        }
        let mut state = self.inner.state.lock();
        if !state.closed && state.idle.len() < self.inner.config.max_idle {
            state.idle.push_back(IdleConnection {
                conn,
                since: Instant::now(),
            });
        } else {
            state.open = state.open.saturating_sub(1);
        }
        drop(state);
        self.inner.available.notify_one();
    }

    /// Returns current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            max_open: self.inner.config.max_open,
        }
    }

    /// Closes idle connections and refuses further acquires.
    ///
    /// Leased connections are closed when their lease drops.
    pub fn close(&self) {
        let drained: Vec<IdleConnection> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.open = state.open.saturating_sub(drained.len());
            drained
        };
        debug!(addr = %self.inner.config.addr, closed = drained.len(), "pool closed");
        self.inner.available.notify_all();
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Executes a RESP command and returns the parsed response.
    pub fn exec<A: AsRef<[u8]>>(
        &mut self,
        args: &[A],
        deadline: &Deadline,
    ) -> ClientResult<RespValue> {
        self.send_batch(std::iter::once(args), deadline)?;
        self.read_reply(deadline)
    }

    /// Encodes every command into one buffer and writes it in a single call.
    pub fn send_batch<'a, A, I>(&mut self, commands: I, deadline: &Deadline) -> ClientResult<()>
    where
        A: AsRef<[u8]> + 'a,
        I: IntoIterator<Item = &'a [A]>,
    {
        let result = match self.conn.as_mut() {
            Some(conn) => conn.send_batch(commands, deadline),
            None => Err(ClientError::Protocol),
        };
        self.track(result)
    }

    /// Reads the next reply on this connection.
    pub fn read_reply(&mut self, deadline: &Deadline) -> ClientResult<RespValue> {
        let result = match self.conn.as_mut() {
            Some(conn) => conn.read_reply(deadline),
            None => Err(ClientError::Protocol),
        };
        self.track(result)
    }

    /// Marks this lease unusable; it is closed rather than returned.
    pub fn discard(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn track<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        if result.is_err() {
            // If IO/protocol fails or the call was cut short, the wire is in
            // an unknown state: do not return this connection to the pool.
            self.valid = false;
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        let pool = ConnectionPool {
            inner: self.pool.clone(),
        };

        if self.valid {
            pool.return_connection(conn);
        } else {
            debug!(addr = %self.pool.config.addr, "discarding connection after failed call");
            pool.release_slot();
        }
    }
}

/// TCP stream whose every read and write is bounded by the armed deadline.
///
/// Each socket call waits at most `IO_SLICE`, then the deadline is consulted
/// again, so a peer trickling bytes cannot stretch a call past its budget.
struct DeadlineStream {
    stream: TcpStream,
    deadline: Deadline,
}

impl DeadlineStream {
    fn arm(&mut self, deadline: &Deadline) {
        self.deadline = deadline.clone();
    }

    fn slice(&self) -> io::Result<Duration> {
        match self.deadline.remaining() {
            Ok(left) => Ok(left.min(IO_SLICE)),
            Err(ClientError::Cancelled { reason }) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, Interrupted(reason)))
            }
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err.to_string())),
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

impl Read for DeadlineStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.set_read_timeout(Some(self.slice()?))?;
            match self.stream.read(buf) {
                Err(err) if is_timeout(&err) => continue,
                other => return other,
            }
        }
    }
}

impl Write for DeadlineStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            self.stream.set_write_timeout(Some(self.slice()?))?;
            match self.stream.write(buf) {
                Err(err) if is_timeout(&err) => continue,
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Single TCP connection with reusable buffers.
///
/// The buffers are stored on the connection to avoid per-call allocations.
pub struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<DeadlineStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    fn connect(config: &PoolConfig, deadline: &Deadline) -> ClientResult<Self> {
        let stream = connect_stream(config, deadline)?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let stream = DeadlineStream {
            stream,
            deadline: deadline.clone(),
        };
        let mut conn = Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        };
        conn.handshake(config, deadline)?;
        debug!(addr = %config.addr, "connection established");
        Ok(conn)
    }

    fn handshake(&mut self, config: &PoolConfig, deadline: &Deadline) -> ClientResult<()> {
        if let Some(password) = config.password.as_deref() {
            let reply = self.exec(&[b"AUTH".as_slice(), password.as_bytes()], deadline)?;
            expect_ok(reply)?;
        }
        if config.db != 0 {
            let db = config.db.to_string();
            let reply = self.exec(&[b"SELECT".as_slice(), db.as_bytes()], deadline)?;
            expect_ok(reply)?;
        }
        Ok(())
    }

    fn exec<A: AsRef<[u8]>>(
        &mut self,
        args: &[A],
        deadline: &Deadline,
    ) -> ClientResult<RespValue> {
        self.send_batch(std::iter::once(args), deadline)?;
        self.read_reply(deadline)
    }

    fn send_batch<'a, A, I>(&mut self, commands: I, deadline: &Deadline) -> ClientResult<()>
    where
        A: AsRef<[u8]> + 'a,
        I: IntoIterator<Item = &'a [A]>,
    {
        self.write_buf.clear();
        for args in commands {
            encode_command(args, &mut self.write_buf);
        }

        deadline.check()?;
        let stream = self.reader.get_mut();
        stream.arm(deadline);
        stream.write_all(&self.write_buf).map_err(ClientError::from_io)?;
        stream.flush().map_err(ClientError::from_io)?;
        Ok(())
    }

    fn read_reply(&mut self, deadline: &Deadline) -> ClientResult<RespValue> {
        deadline.check()?;
        self.reader.get_mut().arm(deadline);
        read_response(&mut self.reader, &mut self.line_buf)
    }

    /// Liveness check: the peer has not closed and no stray bytes are queued.
    ///
    /// Unread bytes mean replies from an earlier exchange are still pending,
    /// which would be mis-attributed to the next command.
    fn is_healthy(&self) -> bool {
        if !self.reader.buffer().is_empty() {
            return false;
        }
        let stream = &self.reader.get_ref().stream;
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let healthy = matches!(
            stream.peek(&mut byte),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock
        );
        stream.set_nonblocking(false).is_ok() && healthy
    }
}

fn expect_ok(reply: RespValue) -> ClientResult<()> {
    match reply {
        RespValue::Simple(_) => Ok(()),
        RespValue::Error(message) => Err(ClientError::Server { message }),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn resolve_addr(addr: &str) -> ClientResult<SocketAddr> {
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    addr.to_socket_addrs()
        .map_err(|_| ClientError::InvalidAddress)?
        .next()
        .ok_or(ClientError::InvalidAddress)
}

fn connect_stream(config: &PoolConfig, deadline: &Deadline) -> ClientResult<TcpStream> {
    let addr = resolve_addr(&config.addr)?;
    let timeout = deadline.remaining_capped(config.connect_timeout)?;
    TcpStream::connect_timeout(&addr, timeout).map_err(ClientError::from_io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn config(addr: String, max_open: usize) -> PoolConfig {
        PoolConfig {
            addr,
            password: None,
            db: 0,
            max_open,
            max_idle: max_open,
            idle_timeout: None,
            connect_timeout: Some(Duration::from_secs(1)),
        }
    }

    #[test]
    fn zero_capacity_pool_times_out() {
        let pool = ConnectionPool::new(config("127.0.0.1:1".to_string(), 0)).unwrap();
        let started = Instant::now();
        let err = pool
            .acquire(&Deadline::after(Duration::from_millis(50)))
            .err()
            .unwrap();
        let waited = started.elapsed();
        assert!(matches!(err, ClientError::PoolExhausted { .. }));
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(1));
    }

    #[test]
    fn lease_returns_to_idle_list() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _accept = std::thread::spawn(move || listener.accept().map(|(stream, _)| stream));

        let pool = ConnectionPool::new(config(addr, 1)).unwrap();
        let deadline = Deadline::after(Duration::from_secs(1));
        let lease = pool.acquire(&deadline).unwrap();
        assert_eq!(pool.stats(), PoolStats { open: 1, idle: 0, max_open: 1 });
        drop(lease);
        assert_eq!(pool.stats(), PoolStats { open: 1, idle: 1, max_open: 1 });
    }

    #[test]
    fn discarded_lease_frees_its_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _accept = std::thread::spawn(move || listener.accept().map(|(stream, _)| stream));

        let pool = ConnectionPool::new(config(addr, 1)).unwrap();
        let mut lease = pool.acquire(&Deadline::after(Duration::from_secs(1))).unwrap();
        lease.discard();
        drop(lease);
        assert_eq!(pool.stats(), PoolStats { open: 0, idle: 0, max_open: 1 });
    }

    #[test]
    fn closed_pool_refuses_acquire() {
        let pool = ConnectionPool::new(config("127.0.0.1:1".to_string(), 1)).unwrap();
        pool.close();
        let err = pool.acquire(&Deadline::after(Duration::from_millis(10))).err().unwrap();
        assert!(matches!(err, ClientError::PoolClosed));
    }
}
