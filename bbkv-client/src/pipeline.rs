//! # Pipelines
//!
//! Purpose: Send many independent commands in one round trip and hand back
//! one reply per command, in the order they were appended.
//!
//! ## Design Principles
//! 1. **One Write, N Reads**: The whole batch is encoded into the
//!    connection's write buffer and flushed once; replies are then read
//!    strictly in submission order.
//! 2. **Per-Command Failure**: An error reply fills only its own slot; the
//!    remaining replies are still read off the wire.
//! 3. **All Or Nothing For Calls**: A transport failure fails the call and
//!    marks every unresolved slot; callers never see a partial result set.
//! 4. **Transactions Are A Mode**: `Transactional` brackets the same batch
//!    with `MULTI`/`EXEC` so the store applies it atomically or not at all.
//!
//! ## Wire Shape (transactional)
//!
//! ```text
//! client: MULTI | cmd 1 | ... | cmd N | EXEC        (one write)
//! store:  +OK | +QUEUED x N | *N [reply 1..N]       (applied)
//!                           | *-1                   (watched key changed)
//!                           | -EXECABORT ...        (a command was rejected)
//! ```

use std::iter;

use tracing::debug;

use crate::command::{Command, Reply};
use crate::context::Deadline;
use crate::error::{AbortReason, ClientError, ClientResult, CommandError};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::resp::RespValue;

/// How the batch is applied by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Commands run one after another; other clients may interleave.
    Plain,
    /// Commands are wrapped in `MULTI`/`EXEC` and applied atomically.
    Transactional,
}

/// Lifecycle of a pipeline. Only `Built` accepts new commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Built,
    Sent,
    Completed,
    Failed,
}

/// Ordered batch of commands executed on a single pooled connection.
///
/// A pipeline is owned by the caller that built it and runs at most once.
pub struct Pipeline {
    pool: ConnectionPool,
    mode: PipelineMode,
    state: PipelineState,
    commands: Vec<Command>,
}

impl Pipeline {
    /// Creates an empty plain pipeline.
    pub fn new(pool: &ConnectionPool) -> Self {
        Self::with_mode(pool, PipelineMode::Plain)
    }

    /// Creates an empty transactional pipeline.
    pub fn transactional(pool: &ConnectionPool) -> Self {
        Self::with_mode(pool, PipelineMode::Transactional)
    }

    pub fn with_mode(pool: &ConnectionPool, mode: PipelineMode) -> Self {
        Pipeline {
            pool: pool.clone(),
            mode,
            state: PipelineState::Built,
            commands: Vec::new(),
        }
    }

    /// Queues a command and returns its slot index.
    pub fn append(&mut self, command: Command) -> ClientResult<usize> {
        self.ensure_unsent()?;
        self.commands.push(command);
        Ok(self.commands.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Queued commands with their result slots.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Reply for the slot returned by `append`, once executed.
    pub fn result(&self, slot: usize) -> Option<&Reply> {
        self.commands.get(slot).and_then(Command::result)
    }

    /// Acquires a connection, runs the batch, and releases the connection.
    pub fn execute(&mut self, deadline: &Deadline) -> ClientResult<Vec<Reply>> {
        self.ensure_unsent()?;
        if self.commands.is_empty() && self.mode == PipelineMode::Plain {
            self.state = PipelineState::Completed;
            return Ok(Vec::new());
        }
        let mut conn = match self.pool.acquire(deadline) {
            Ok(conn) => conn,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };
        self.execute_on(&mut conn, deadline)
    }

    /// Runs the batch on a connection the caller already holds.
    ///
    /// Watch sessions use this so `EXEC` travels on the connection that
    /// issued `WATCH`.
    pub fn execute_on(
        &mut self,
        conn: &mut PooledConnection,
        deadline: &Deadline,
    ) -> ClientResult<Vec<Reply>> {
        self.ensure_unsent()?;
        self.state = PipelineState::Sent;
        debug!(commands = self.commands.len(), mode = ?self.mode, "sending pipeline");

        let outcome = match self.mode {
            PipelineMode::Plain => self.exchange_plain(conn, deadline),
            PipelineMode::Transactional => self.exchange_transaction(conn, deadline),
        };
        match outcome {
            Ok(()) => {
                self.state = PipelineState::Completed;
                Ok(self.replies())
            }
            Err(err) => {
                if !matches!(err, ClientError::Aborted { .. }) {
                    conn.discard();
                }
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn exchange_plain(
        &mut self,
        conn: &mut PooledConnection,
        deadline: &Deadline,
    ) -> ClientResult<()> {
        conn.send_batch(self.commands.iter().map(Command::parts), deadline)?;
        for command in &mut self.commands {
            let reply = conn.read_reply(deadline)?;
            command.resolve(into_reply(reply));
        }
        Ok(())
    }

    fn exchange_transaction(
        &mut self,
        conn: &mut PooledConnection,
        deadline: &Deadline,
    ) -> ClientResult<()> {
        let multi = vec![b"MULTI".to_vec()];
        let exec = vec![b"EXEC".to_vec()];
        let batch = iter::once(multi.as_slice())
            .chain(self.commands.iter().map(Command::parts))
            .chain(iter::once(exec.as_slice()));
        conn.send_batch(batch, deadline)?;

        match conn.read_reply(deadline)? {
            RespValue::Simple(_) => {}
            // A refused MULTI means the connection was already inside a
            // transaction; the queued commands may have run unbracketed.
            RespValue::Error(message) => return Err(ClientError::Server { message }),
            _ => return Err(ClientError::UnexpectedResponse),
        }

        let mut rejected = None;
        for _ in 0..self.commands.len() {
            match conn.read_reply(deadline)? {
                RespValue::Simple(_) => {}
                RespValue::Error(message) if rejected.is_none() => rejected = Some(message),
                RespValue::Error(_) => {}
                _ => return Err(ClientError::UnexpectedResponse),
            }
        }

        match conn.read_reply(deadline)? {
            RespValue::Array(items) if items.len() == self.commands.len() => {
                for (command, reply) in self.commands.iter_mut().zip(items) {
                    command.resolve(into_reply(reply));
                }
                Ok(())
            }
            RespValue::Array(_) => Err(ClientError::Protocol),
            RespValue::NullArray => Err(ClientError::Aborted {
                reason: AbortReason::WatchConflict,
            }),
            RespValue::Error(message) => {
                let message = rejected.unwrap_or(message);
                Err(ClientError::Aborted {
                    reason: AbortReason::Rejected(String::from_utf8_lossy(&message).into_owned()),
                })
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    fn ensure_unsent(&self) -> ClientResult<()> {
        if self.state != PipelineState::Built {
            return Err(ClientError::AlreadySent);
        }
        Ok(())
    }

    fn fail(&mut self, err: &ClientError) {
        let marker = CommandError::unresolved(err);
        for command in &mut self.commands {
            command.resolve(Err(marker.clone()));
        }
        self.state = PipelineState::Failed;
    }

    fn replies(&self) -> Vec<Reply> {
        self.commands
            .iter()
            .map(|command| command.result().cloned().unwrap_or(Err(CommandError::Transport)))
            .collect()
    }
}

fn into_reply(value: RespValue) -> Reply {
    match value {
        RespValue::Error(message) => Err(CommandError::Server(message)),
        other => Ok(other),
    }
}
