//! # bluebell-kv Sync Client
//!
//! Purpose: Provide a synchronous Redis-compatible client that cuts round
//! trips with pipelines, applies batches atomically with `MULTI`/`EXEC`, and
//! runs optimistic `WATCH` transactions with bounded retry.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Explicit Deadlines**: Every suspending call is bounded by a `Deadline`.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//! 5. **Explicit State Machines**: Pipelines and watch sessions expose their
//!    state instead of hiding it in callbacks.

mod client;
mod command;
mod config;
mod context;
mod error;
mod pipeline;
mod pool;
mod resp;
mod scan;
mod watch;

pub use client::{ClientTtl, KVClient};
pub use command::{Command, Reply};
pub use config::{BackoffConfig, ClientConfig};
pub use context::{CancelToken, Deadline};
pub use error::{AbortReason, CancelReason, ClientError, ClientResult, CommandError};
pub use pipeline::{Pipeline, PipelineMode, PipelineState};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use resp::RespValue;
pub use scan::{ScanCursor, ScanIter};
pub use watch::{Backoff, CommitStatus, RetryPolicy, WatchCommit, WatchSession, WatchState, WatchTx};
