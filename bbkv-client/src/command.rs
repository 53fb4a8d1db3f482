//! # Commands
//!
//! A `Command` is the unit queued into pipelines: the operation name, its
//! ordered arguments, and a result slot filled exactly once when the owning
//! pipeline runs.

use std::time::Duration;

use crate::error::CommandError;
use crate::resp::RespValue;

/// Outcome of a single command inside a batch.
pub type Reply = Result<RespValue, CommandError>;

/// One request plus its eventual reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    // args[0] is the operation name so the slice encodes directly.
    args: Vec<Vec<u8>>,
    result: Option<Reply>,
}

impl Command {
    /// Starts a command with the given operation name.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Command {
            args: vec![name.as_ref().to_vec()],
            result: None,
        }
    }

    /// Appends a binary-safe argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    /// Appends an integer argument in its decimal form.
    pub fn arg_int(mut self, value: i64) -> Self {
        let (digits, len) = encode_i64(value);
        self.args.push(digits[..len].to_vec());
        self
    }

    pub fn get(key: impl AsRef<[u8]>) -> Self {
        Command::new("GET").arg(key)
    }

    pub fn set(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        Command::new("SET").arg(key).arg(value)
    }

    /// `SET key value EX seconds`.
    pub fn set_with_ttl(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Command::set(key, value).arg("EX").arg_int(secs(ttl))
    }

    pub fn del(key: impl AsRef<[u8]>) -> Self {
        Command::new("DEL").arg(key)
    }

    pub fn exists(key: impl AsRef<[u8]>) -> Self {
        Command::new("EXISTS").arg(key)
    }

    pub fn incr(key: impl AsRef<[u8]>) -> Self {
        Command::new("INCR").arg(key)
    }

    pub fn incr_by(key: impl AsRef<[u8]>, delta: i64) -> Self {
        Command::new("INCRBY").arg(key).arg_int(delta)
    }

    pub fn expire(key: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Command::new("EXPIRE").arg(key).arg_int(secs(ttl))
    }

    pub fn ttl(key: impl AsRef<[u8]>) -> Self {
        Command::new("TTL").arg(key)
    }

    pub fn ping() -> Self {
        Command::new("PING")
    }

    /// Operation name as sent on the wire.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// Arguments after the operation name.
    pub fn args(&self) -> &[Vec<u8>] {
        &self.args[1..]
    }

    /// Name and arguments, in wire order.
    pub(crate) fn parts(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Reply slot; `None` until the owning pipeline has run.
    pub fn result(&self) -> Option<&Reply> {
        self.result.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }

    /// Fills the slot. Later writes are ignored so a slot never changes once set.
    pub(crate) fn resolve(&mut self, reply: Reply) {
        if self.result.is_none() {
            self.result = Some(reply);
        }
    }
}

fn secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

fn encode_i64(value: i64) -> ([u8; 20], usize) {
    // Stack buffer keeps conversion allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    let negative = value < 0;
    let mut rest = value.unsigned_abs();
    if rest == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while rest > 0 {
        buf[len] = b'0' + (rest % 10) as u8;
        rest /= 10;
        len += 1;
    }
    if negative {
        buf[len] = b'-';
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_set_with_ttl() {
        let cmd = Command::set_with_ttl("k", "v", Duration::from_secs(3600));
        assert_eq!(cmd.name(), b"SET");
        assert_eq!(
            cmd.args(),
            &[b"k".to_vec(), b"v".to_vec(), b"EX".to_vec(), b"3600".to_vec()]
        );
        assert!(cmd.result().is_none());
    }

    #[test]
    fn integer_arguments_keep_sign() {
        let cmd = Command::incr_by("n", -42);
        assert_eq!(cmd.args()[1], b"-42".to_vec());
        let cmd = Command::new("X").arg_int(i64::MIN);
        assert_eq!(cmd.args()[0], i64::MIN.to_string().into_bytes());
        let cmd = Command::new("X").arg_int(0);
        assert_eq!(cmd.args()[0], b"0".to_vec());
    }

    #[test]
    fn result_slot_is_write_once() {
        let mut cmd = Command::get("k");
        cmd.resolve(Ok(RespValue::Bulk(None)));
        cmd.resolve(Err(CommandError::Transport));
        assert_eq!(cmd.result(), Some(&Ok(RespValue::Bulk(None))));
    }
}
