//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the
//! shared keyspace with minimal overhead.
//!
//! Each connection owns a `Session` carrying its `MULTI` queue and watched
//! key versions. `EXEC` re-checks those versions and applies the queue under
//! a single keyspace lock, so a transaction is atomic relative to every other
//! connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::keyspace::{Keyspace, TtlStatus};
use crate::protocol::{
    resp_array, resp_bulk, resp_error, resp_error_kind, resp_integer, resp_null, resp_null_array,
    resp_simple, RespError, RespParser,
};

/// Keyspace shared by every connection.
pub type SharedKeyspace = Arc<Mutex<Keyspace>>;

/// Server-wide settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// When set, clients must `AUTH` before any other command.
    pub password: Option<String>,
}

/// Handles a single TCP client connection.
pub async fn handle_connection(
    stream: TcpStream,
    keyspace: SharedKeyspace,
    config: Arc<ServerConfig>,
) -> std::io::Result<()> {
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = Vec::with_capacity(8 * 1024);
    let mut parser = RespParser::new();
    let mut session = Session::new(config.password.is_none());

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        // Answer every complete command from this read with one write.
        out.clear();
        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => {
                    let response = session.handle(&args, &keyspace, &config);
                    out.extend_from_slice(&response);
                }
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    out.extend_from_slice(&resp_error("protocol error"));
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
        }
    }

    Ok(())
}

/// Per-connection transaction state.
#[derive(Debug, Default)]
struct Session {
    authenticated: bool,
    // Some while between MULTI and EXEC/DISCARD.
    queued: Option<Vec<Vec<Vec<u8>>>>,
    // A command was rejected while queuing; EXEC must abort.
    dirty: bool,
    watched: HashMap<Vec<u8>, u64>,
}

impl Session {
    fn new(authenticated: bool) -> Self {
        Session {
            authenticated,
            ..Session::default()
        }
    }

    fn handle(
        &mut self,
        args: &[Vec<u8>],
        keyspace: &SharedKeyspace,
        config: &ServerConfig,
    ) -> Vec<u8> {
        if args.is_empty() {
            return resp_error("empty command");
        }
        let name = args[0].to_ascii_uppercase();

        if name == b"AUTH" {
            return self.handle_auth(args, config);
        }
        if !self.authenticated {
            return resp_error_kind("NOAUTH", "Authentication required.");
        }

        match name.as_slice() {
            b"MULTI" => return self.handle_multi(args),
            b"EXEC" => return self.handle_exec(args, keyspace),
            b"DISCARD" => return self.handle_discard(args),
            b"WATCH" => return self.handle_watch(args, keyspace),
            b"UNWATCH" => {
                self.watched.clear();
                return resp_simple("OK");
            }
            _ => {}
        }

        if let Err(message) = check_arity(&name, args.len()) {
            if self.queued.is_some() {
                self.dirty = true;
            }
            return resp_error(&message);
        }

        if let Some(queue) = self.queued.as_mut() {
            queue.push(args.to_vec());
            return resp_simple("QUEUED");
        }

        let mut keyspace = keyspace.lock();
        dispatch_command(&name, args, &mut keyspace)
    }

    fn handle_auth(&mut self, args: &[Vec<u8>], config: &ServerConfig) -> Vec<u8> {
        if args.len() != 2 {
            return resp_error("wrong number of arguments for AUTH");
        }
        match config.password.as_deref() {
            None => resp_error("AUTH <password> called without any password configured"),
            Some(password) if password.as_bytes() == args[1].as_slice() => {
                self.authenticated = true;
                resp_simple("OK")
            }
            Some(_) => resp_error_kind("WRONGPASS", "invalid password"),
        }
    }

    fn handle_multi(&mut self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() != 1 {
            return resp_error("wrong number of arguments for MULTI");
        }
        if self.queued.is_some() {
            return resp_error("MULTI calls can not be nested");
        }
        self.queued = Some(Vec::new());
        self.dirty = false;
        resp_simple("OK")
    }

    fn handle_discard(&mut self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() != 1 {
            return resp_error("wrong number of arguments for DISCARD");
        }
        if self.queued.take().is_none() {
            return resp_error("DISCARD without MULTI");
        }
        self.dirty = false;
        self.watched.clear();
        resp_simple("OK")
    }

    fn handle_watch(&mut self, args: &[Vec<u8>], keyspace: &SharedKeyspace) -> Vec<u8> {
        if args.len() < 2 {
            return resp_error("wrong number of arguments for WATCH");
        }
        if self.queued.is_some() {
            return resp_error("WATCH inside MULTI is not allowed");
        }
        let mut keyspace = keyspace.lock();
        for key in &args[1..] {
            // The first WATCH of a key pins its version.
            if !self.watched.contains_key(key) {
                let version = keyspace.version(key);
                self.watched.insert(key.clone(), version);
            }
        }
        resp_simple("OK")
    }

    fn handle_exec(&mut self, args: &[Vec<u8>], keyspace: &SharedKeyspace) -> Vec<u8> {
        if args.len() != 1 {
            return resp_error("wrong number of arguments for EXEC");
        }
        let queued = match self.queued.take() {
            Some(queued) => queued,
            None => return resp_error("EXEC without MULTI"),
        };
        let watched = std::mem::take(&mut self.watched);
        if std::mem::take(&mut self.dirty) {
            return resp_error_kind(
                "EXECABORT",
                "Transaction discarded because of previous errors.",
            );
        }

        let mut keyspace = keyspace.lock();
        let conflict = watched
            .iter()
            .any(|(key, version)| keyspace.version(key) != *version);
        if conflict {
            debug!(keys = watched.len(), "exec aborted, watched key changed");
            return resp_null_array();
        }

        let replies: Vec<Vec<u8>> = queued
            .iter()
            .map(|args| {
                let name = args[0].to_ascii_uppercase();
                dispatch_command(&name, args, &mut keyspace)
            })
            .collect();
        resp_array(&replies)
    }
}

/// Validates the command name and argument count.
fn check_arity(name: &[u8], argc: usize) -> Result<(), String> {
    let (min, max) = match name {
        b"PING" => (1, Some(2)),
        b"GET" | b"INCR" | b"TTL" => (2, Some(2)),
        b"SET" => (3, Some(5)),
        b"DEL" | b"EXISTS" => (2, None),
        b"INCRBY" | b"EXPIRE" => (3, Some(3)),
        b"SCAN" => (2, Some(6)),
        b"SELECT" => (2, Some(2)),
        b"DBSIZE" | b"FLUSHALL" => (1, Some(1)),
        _ => return Err(format!("unknown command '{}'", String::from_utf8_lossy(name))),
    };
    if argc < min || max.is_some_and(|max| argc > max) {
        return Err(format!(
            "wrong number of arguments for '{}' command",
            String::from_utf8_lossy(name).to_lowercase()
        ));
    }
    Ok(())
}

fn dispatch_command(name: &[u8], args: &[Vec<u8>], keyspace: &mut Keyspace) -> Vec<u8> {
    match name {
        b"PING" => handle_ping(args),
        b"GET" => handle_get(args, keyspace),
        b"SET" => handle_set(args, keyspace),
        b"DEL" => handle_del(args, keyspace),
        b"EXISTS" => handle_exists(args, keyspace),
        b"INCR" => handle_incr_by(&args[1], 1, keyspace),
        b"INCRBY" => match parse_i64(&args[2]) {
            Ok(delta) => handle_incr_by(&args[1], delta, keyspace),
            Err(resp) => resp,
        },
        b"EXPIRE" => handle_expire(args, keyspace),
        b"TTL" => handle_ttl(args, keyspace),
        b"SCAN" => handle_scan(args, keyspace),
        b"SELECT" => handle_select(args),
        b"DBSIZE" => resp_integer(keyspace.len() as i64),
        b"FLUSHALL" => {
            keyspace.clear();
            resp_simple("OK")
        }
        _ => resp_error("unknown command"),
    }
}

fn handle_ping(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        1 => resp_simple("PONG"),
        _ => resp_bulk(&args[1]),
    }
}

fn handle_get(args: &[Vec<u8>], keyspace: &mut Keyspace) -> Vec<u8> {
    match keyspace.get(&args[1]) {
        Some(value) => resp_bulk(value),
        None => resp_null(),
    }
}

fn handle_set(args: &[Vec<u8>], keyspace: &mut Keyspace) -> Vec<u8> {
    let key = args[1].clone();
    let value = args[2].clone();

    if args.len() == 3 {
        keyspace.set(key, value, None);
        return resp_simple("OK");
    }

    if args.len() == 5 && args[3].eq_ignore_ascii_case(b"EX") {
        let seconds = match parse_u64(&args[4]) {
            Ok(0) => return resp_error("invalid expire time in 'set' command"),
            Ok(value) => value,
            Err(resp) => return resp,
        };
        keyspace.set(key, value, Some(Duration::from_secs(seconds)));
        return resp_simple("OK");
    }

    resp_error("syntax error")
}

fn handle_del(args: &[Vec<u8>], keyspace: &mut Keyspace) -> Vec<u8> {
    let removed = args[1..].iter().filter(|key| keyspace.delete(key)).count();
    resp_integer(removed as i64)
}

fn handle_exists(args: &[Vec<u8>], keyspace: &mut Keyspace) -> Vec<u8> {
    let found = args[1..].iter().filter(|key| keyspace.exists(key)).count();
    resp_integer(found as i64)
}

fn handle_incr_by(key: &[u8], delta: i64, keyspace: &mut Keyspace) -> Vec<u8> {
    match keyspace.incr_by(key, delta) {
        Ok(value) => resp_integer(value),
        Err(err) => resp_error(err.message()),
    }
}

fn handle_expire(args: &[Vec<u8>], keyspace: &mut Keyspace) -> Vec<u8> {
    let seconds = match parse_u64(&args[2]) {
        Ok(value) => value,
        Err(resp) => return resp,
    };

    if keyspace.expire(&args[1], Duration::from_secs(seconds)) {
        resp_integer(1)
    } else {
        resp_integer(0)
    }
}

fn handle_ttl(args: &[Vec<u8>], keyspace: &mut Keyspace) -> Vec<u8> {
    match keyspace.ttl(&args[1]) {
        TtlStatus::Missing => resp_integer(-2),
        TtlStatus::NoExpiry => resp_integer(-1),
        TtlStatus::ExpiresIn(remaining) => resp_integer(remaining.as_secs() as i64),
    }
}

fn handle_scan(args: &[Vec<u8>], keyspace: &mut Keyspace) -> Vec<u8> {
    let cursor = match parse_u64(&args[1]) {
        Ok(value) => value,
        Err(_) => return resp_error("invalid cursor"),
    };

    let mut pattern = None;
    let mut count = None;
    let mut idx = 2;
    while idx < args.len() {
        if idx + 1 >= args.len() {
            return resp_error("syntax error");
        }
        let option = &args[idx];
        let value = &args[idx + 1];
        if option.eq_ignore_ascii_case(b"MATCH") {
            pattern = Some(String::from_utf8_lossy(value).into_owned());
        } else if option.eq_ignore_ascii_case(b"COUNT") {
            match parse_u64(value) {
                Ok(0) | Err(_) => return resp_error("syntax error"),
                Ok(n) => count = Some(n as usize),
            }
        } else {
            return resp_error("syntax error");
        }
        idx += 2;
    }

    let (next, keys) = keyspace.scan(cursor, pattern.as_deref(), count);
    let keys: Vec<Vec<u8>> = keys.iter().map(|key| resp_bulk(key)).collect();
    resp_array(&[resp_bulk(next.to_string().as_bytes()), resp_array(&keys)])
}

fn handle_select(args: &[Vec<u8>]) -> Vec<u8> {
    match parse_u64(&args[1]) {
        Ok(0) => resp_simple("OK"),
        _ => resp_error("DB index is out of range"),
    }
}

fn parse_u64(arg: &[u8]) -> Result<u64, Vec<u8>> {
    if arg.is_empty() {
        return Err(resp_error("invalid integer"));
    }
    let mut value: u64 = 0;
    for &b in arg {
        if !b.is_ascii_digit() {
            return Err(resp_error("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
    }
    Ok(value)
}

fn parse_i64(arg: &[u8]) -> Result<i64, Vec<u8>> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| resp_error("value is not an integer or out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|part| part.as_bytes().to_vec()).collect()
    }

    fn setup() -> (Session, SharedKeyspace, ServerConfig) {
        (Session::new(true), Arc::new(Mutex::new(Keyspace::new())), ServerConfig::default())
    }

    #[test]
    fn multi_exec_applies_queue() {
        let (mut session, keyspace, config) = setup();
        assert_eq!(session.handle(&cmd(&["MULTI"]), &keyspace, &config), b"+OK\r\n");
        assert_eq!(session.handle(&cmd(&["INCR", "n"]), &keyspace, &config), b"+QUEUED\r\n");
        assert_eq!(session.handle(&cmd(&["INCR", "n"]), &keyspace, &config), b"+QUEUED\r\n");
        assert_eq!(session.handle(&cmd(&["EXEC"]), &keyspace, &config), b"*2\r\n:1\r\n:2\r\n");
    }

    #[test]
    fn watched_write_aborts_exec() {
        let (mut session, keyspace, config) = setup();
        let mut other = Session::new(true);
        session.handle(&cmd(&["WATCH", "k"]), &keyspace, &config);
        other.handle(&cmd(&["SET", "k", "x"]), &keyspace, &config);
        session.handle(&cmd(&["MULTI"]), &keyspace, &config);
        session.handle(&cmd(&["SET", "k", "mine"]), &keyspace, &config);
        assert_eq!(session.handle(&cmd(&["EXEC"]), &keyspace, &config), b"*-1\r\n");
        assert_eq!(keyspace.lock().get(b"k"), Some(b"x".as_slice()));
    }

    #[test]
    fn rejected_command_poisons_transaction() {
        let (mut session, keyspace, config) = setup();
        session.handle(&cmd(&["MULTI"]), &keyspace, &config);
        session.handle(&cmd(&["SET", "a", "1"]), &keyspace, &config);
        let reply = session.handle(&cmd(&["NOPE"]), &keyspace, &config);
        assert!(reply.starts_with(b"-ERR unknown command"));
        let reply = session.handle(&cmd(&["EXEC"]), &keyspace, &config);
        assert!(reply.starts_with(b"-EXECABORT"));
        assert_eq!(keyspace.lock().get(b"a"), None);
    }

    #[test]
    fn unsupported_commands_are_unknown() {
        let (mut session, keyspace, config) = setup();
        for name in ["INFO", "HGET", "SUBSCRIBE"] {
            let reply = session.handle(&cmd(&[name]), &keyspace, &config);
            assert!(reply.starts_with(b"-ERR unknown command"), "{name}");
        }
    }

    #[test]
    fn auth_is_required_when_configured() {
        let keyspace = Arc::new(Mutex::new(Keyspace::new()));
        let config = ServerConfig {
            password: Some("pw".to_string()),
        };
        let mut session = Session::new(false);
        assert!(session.handle(&cmd(&["GET", "k"]), &keyspace, &config).starts_with(b"-NOAUTH"));
        let reply = session.handle(&cmd(&["AUTH", "bad"]), &keyspace, &config);
        assert!(reply.starts_with(b"-WRONGPASS"));
        assert_eq!(session.handle(&cmd(&["AUTH", "pw"]), &keyspace, &config), b"+OK\r\n");
        assert_eq!(session.handle(&cmd(&["GET", "k"]), &keyspace, &config), b"$-1\r\n");
    }

    #[test]
    fn scan_reply_shape() {
        let (mut session, keyspace, config) = setup();
        session.handle(&cmd(&["SET", "a", "1"]), &keyspace, &config);
        let reply = session.handle(&cmd(&["SCAN", "0", "MATCH", "*"]), &keyspace, &config);
        assert_eq!(reply, b"*2\r\n$1\r\n0\r\n*1\r\n$1\r\na\r\n");
    }
}
