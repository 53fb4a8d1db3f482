//! # Client Errors
//!
//! Purpose: One error taxonomy for every layer of the client, from socket IO up
//! to watch-session retry exhaustion.
//!
//! ## Design Principles
//! 1. **Kind Over Message**: Callers branch on variants, not on strings.
//! 2. **Context Travels With The Error**: Waited time, attempt counts, and
//!    watched keys are carried in the variant that needs them.
//! 3. **Two Levels**: `ClientError` fails a whole call; `CommandError` fails a
//!    single slot inside an otherwise healthy pipeline.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Why a transaction was refused by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// `EXEC` returned a null array: a watched key changed.
    WatchConflict,
    /// `EXEC` returned `EXECABORT` because a queued command was rejected.
    Rejected(String),
    /// The transition function of a watch session gave up.
    Caller(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::WatchConflict => write!(f, "watched key modified"),
            AbortReason::Rejected(message) => write!(f, "rejected by store: {}", message),
            AbortReason::Caller(message) => write!(f, "aborted by caller: {}", message),
        }
    }
}

/// Why an in-flight call stopped before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The call deadline elapsed.
    DeadlineExceeded,
    /// The caller's cancel token fired.
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            CancelReason::Requested => write!(f, "cancel requested"),
        }
    }
}

/// Errors surfaced by the sync client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Server returned an error reply to a single command.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Address could not be parsed into a socket address.
    #[error("invalid address")]
    InvalidAddress,
    /// A caller-supplied argument was rejected before touching the network.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An operation was called in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Configuration could not be parsed or failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// No connection became available before the deadline.
    #[error("connection pool exhausted after {waited:?}")]
    PoolExhausted { waited: Duration },
    /// The pool was closed; no more connections will be handed out.
    #[error("connection pool closed")]
    PoolClosed,
    /// A command was appended to a pipeline that was already executed.
    #[error("pipeline already sent")]
    AlreadySent,
    /// The store refused to apply a transaction; none of its writes happened.
    #[error("transaction aborted: {reason}")]
    Aborted { reason: AbortReason },
    /// A watch session conflicted on every permitted attempt.
    #[error(
        "optimistic transaction failed after {attempts} attempts on keys {}",
        display_keys(.keys)
    )]
    MaxRetriesExceeded { attempts: u32, keys: Vec<Vec<u8>> },
    /// The call was cancelled or its deadline elapsed.
    #[error("cancelled: {reason}")]
    Cancelled { reason: CancelReason },
}

impl ClientError {
    /// Shorthand for a transition function that decides not to commit.
    pub fn aborted_by_caller(message: impl Into<String>) -> Self {
        ClientError::Aborted {
            reason: AbortReason::Caller(message.into()),
        }
    }

    /// Returns true when the same call may succeed if simply issued again.
    ///
    /// `Aborted` needs new input and `MaxRetriesExceeded` already spent its
    /// budget, so neither qualifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Protocol
                | ClientError::PoolExhausted { .. }
                | ClientError::Cancelled {
                    reason: CancelReason::DeadlineExceeded
                }
        )
    }

    /// Returns true for failures of the connection itself, which leave the
    /// wire in an unknown state.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Protocol)
    }

    /// Maps socket timeouts to `Cancelled` so deadline expiry has one shape.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        let interrupted = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<Interrupted>())
            .map(|interrupted| interrupted.0);
        if let Some(reason) = interrupted {
            return ClientError::Cancelled { reason };
        }
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ClientError::Cancelled {
                    reason: CancelReason::DeadlineExceeded,
                }
            }
            _ => ClientError::Io(err),
        }
    }
}

/// Deadline or cancel token observed between two socket calls.
///
/// Travels inside an `io::Error` through `Read`/`Write` and is turned back
/// into `ClientError::Cancelled` by `from_io`.
#[derive(Debug, Error)]
#[error("{0}")]
pub(crate) struct Interrupted(pub(crate) CancelReason);

/// Failure of a single command slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The store answered this command with an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.0))]
    Server(Vec<u8>),
    /// The connection failed before this command's reply arrived.
    #[error("transport error")]
    Transport,
    /// The enclosing transaction was not applied.
    #[error("transaction aborted: {0}")]
    Aborted(AbortReason),
    /// The call was cancelled before this command's reply arrived.
    #[error("cancelled: {0}")]
    Cancelled(CancelReason),
    /// No connection was obtained, so the command never left the client.
    #[error("not sent")]
    NotSent,
}

impl CommandError {
    /// Slot-level marker for an unresolved command after a call-level failure.
    pub(crate) fn unresolved(err: &ClientError) -> Self {
        match err {
            ClientError::Cancelled { reason } => CommandError::Cancelled(*reason),
            ClientError::Aborted { reason } => CommandError::Aborted(reason.clone()),
            ClientError::PoolExhausted { .. } | ClientError::PoolClosed => CommandError::NotSent,
            _ => CommandError::Transport,
        }
    }
}

fn display_keys(keys: &[Vec<u8>]) -> String {
    let names: Vec<_> = keys.iter().map(|key| String::from_utf8_lossy(key)).collect();
    format!("[{}]", names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_become_deadline_cancellation() {
        let err = ClientError::from_io(std::io::Error::new(std::io::ErrorKind::WouldBlock, "slow"));
        assert!(matches!(
            err,
            ClientError::Cancelled {
                reason: CancelReason::DeadlineExceeded
            }
        ));
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "rst");
        let err = ClientError::from_io(reset);
        assert!(err.is_transport());
    }

    #[test]
    fn interrupted_io_keeps_cancel_reason() {
        let io = std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            Interrupted(CancelReason::Requested),
        );
        assert!(matches!(
            ClientError::from_io(io),
            ClientError::Cancelled {
                reason: CancelReason::Requested
            }
        ));
    }

    #[test]
    fn unsent_slots_are_not_transport_failures() {
        let exhausted = ClientError::PoolExhausted {
            waited: Duration::from_millis(5),
        };
        assert_eq!(CommandError::unresolved(&exhausted), CommandError::NotSent);
        assert_eq!(CommandError::unresolved(&ClientError::PoolClosed), CommandError::NotSent);
        assert_eq!(
            CommandError::unresolved(&ClientError::Protocol),
            CommandError::Transport
        );
    }

    #[test]
    fn retry_classification() {
        assert!(ClientError::PoolExhausted { waited: Duration::ZERO }.is_retryable());
        assert!(!ClientError::aborted_by_caller("no").is_retryable());
        assert!(!ClientError::MaxRetriesExceeded { attempts: 3, keys: vec![] }.is_retryable());
    }

    #[test]
    fn max_retries_message_names_keys() {
        let err = ClientError::MaxRetriesExceeded {
            attempts: 2,
            keys: vec![b"a".to_vec(), b"b".to_vec()],
        };
        assert_eq!(
            err.to_string(),
            "optimistic transaction failed after 2 attempts on keys [a, b]"
        );
    }
}
