//! # Keyspace
//!
//! Ordered in-memory map with lazy TTL expiry and per-key write versions.
//!
//! ## Design Principles
//!
//! 1. **Versions Outlive Values**: Every write, delete, or expiry stamps the
//!    key with a fresh version from a global clock. Deleted keys keep their
//!    last version, so `WATCH` on a missing key still detects a later `SET`.
//! 2. **TTL Fast Path**: Expiration is checked on access; there is no
//!    background expirer.
//! 3. **Ordered Scan**: A `BTreeMap` gives `SCAN` a stable order; the cursor
//!    is the number of keys already walked.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use wildmatch::WildMatch;

const DEFAULT_SCAN_COUNT: usize = 10;

/// TTL state for a key, mirroring Redis `TTL` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    Missing,
    NoExpiry,
    ExpiresIn(Duration),
}

/// Errors surfaced to clients as `-ERR` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyspaceError {
    NotAnInteger,
    Overflow,
}

impl KeyspaceError {
    pub fn message(self) -> &'static str {
        match self {
            KeyspaceError::NotAnInteger => "value is not an integer or out of range",
            KeyspaceError::Overflow => "increment or decrement would overflow",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Debug, Default)]
pub struct Keyspace {
    entries: BTreeMap<Vec<u8>, Entry>,
    versions: HashMap<Vec<u8>, u64>,
    clock: u64,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live keys, counting ones whose TTL passed but were not yet touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write version of `key`; 0 if it was never written.
    pub fn version(&mut self, key: &[u8]) -> u64 {
        self.purge_if_expired(key, Instant::now());
        self.versions.get(key).copied().unwrap_or(0)
    }

    pub fn get(&mut self, key: &[u8]) -> Option<&[u8]> {
        self.purge_if_expired(key, Instant::now());
        self.entries.get(key).map(|entry| entry.value.as_slice())
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.touch(&key);
        self.entries.insert(key, Entry { value, expires_at });
    }

    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.purge_if_expired(key, Instant::now());
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.touch(key);
        }
        removed
    }

    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Adds `delta` to an integer value; a missing key counts as 0.
    /// An existing TTL is kept.
    pub fn incr_by(&mut self, key: &[u8], delta: i64) -> Result<i64, KeyspaceError> {
        let now = Instant::now();
        self.purge_if_expired(key, now);
        let (current, expires_at) = match self.entries.get(key) {
            Some(entry) => {
                let text =
                    std::str::from_utf8(&entry.value).map_err(|_| KeyspaceError::NotAnInteger)?;
                let current: i64 = text.parse().map_err(|_| KeyspaceError::NotAnInteger)?;
                (current, entry.expires_at)
            }
            None => (0, None),
        };
        let next = current.checked_add(delta).ok_or(KeyspaceError::Overflow)?;
        self.touch(key);
        self.entries.insert(
            key.to_vec(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    /// Attaches a TTL. Returns false when the key does not exist.
    pub fn expire(&mut self, key: &[u8], ttl: Duration) -> bool {
        self.purge_if_expired(key, Instant::now());
        let updated = match self.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        };
        if updated {
            self.touch(key);
        }
        updated
    }

    pub fn ttl(&mut self, key: &[u8]) -> TtlStatus {
        let now = Instant::now();
        self.purge_if_expired(key, now);
        match self.entries.get(key) {
            None => TtlStatus::Missing,
            Some(Entry { expires_at: None, .. }) => TtlStatus::NoExpiry,
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => TtlStatus::ExpiresIn(deadline.saturating_duration_since(now)),
        }
    }

    /// Walks up to `count` keys from position `cursor` and returns the ones
    /// matching `pattern`, plus the next cursor (0 when the walk is complete).
    pub fn scan(
        &mut self,
        cursor: u64,
        pattern: Option<&str>,
        count: Option<usize>,
    ) -> (u64, Vec<Vec<u8>>) {
        let now = Instant::now();
        let count = count.unwrap_or(DEFAULT_SCAN_COUNT).max(1);
        let matcher = pattern.map(WildMatch::new);
        let start = usize::try_from(cursor).unwrap_or(usize::MAX);

        let mut walked = 0;
        let mut keys = Vec::new();
        for (key, entry) in self.entries.iter().skip(start).take(count) {
            walked += 1;
            if entry.is_expired(now) {
                continue;
            }
            let matched = match &matcher {
                Some(matcher) => matcher.matches(&String::from_utf8_lossy(key)),
                None => true,
            };
            if matched {
                keys.push(key.clone());
            }
        }

        let next = start.saturating_add(walked);
        if walked < count || next >= self.entries.len() {
            (0, keys)
        } else {
            (next as u64, keys)
        }
    }

    /// Removes every key; each removal counts as a write for watchers.
    pub fn clear(&mut self) {
        let keys: Vec<Vec<u8>> = self.entries.keys().cloned().collect();
        for key in keys {
            self.touch(&key);
        }
        self.entries.clear();
    }

    fn touch(&mut self, key: &[u8]) {
        self.clock += 1;
        self.versions.insert(key.to_vec(), self.clock);
    }

    fn purge_if_expired(&mut self, key: &[u8], now: Instant) {
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            self.entries.remove(key);
            self.touch(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_change_on_every_write() {
        let mut ks = Keyspace::new();
        assert_eq!(ks.version(b"k"), 0);
        ks.set(b"k".to_vec(), b"1".to_vec(), None);
        let v1 = ks.version(b"k");
        ks.incr_by(b"k", 1).unwrap();
        let v2 = ks.version(b"k");
        assert!(v2 > v1);
        assert!(ks.delete(b"k"));
        assert!(ks.version(b"k") > v2);
        assert!(!ks.delete(b"k"));
    }

    #[test]
    fn incr_rejects_non_integers() {
        let mut ks = Keyspace::new();
        ks.set(b"k".to_vec(), b"abc".to_vec(), None);
        assert_eq!(ks.incr_by(b"k", 1), Err(KeyspaceError::NotAnInteger));
        ks.set(b"n".to_vec(), i64::MAX.to_string().into_bytes(), None);
        assert_eq!(ks.incr_by(b"n", 1), Err(KeyspaceError::Overflow));
        assert_eq!(ks.incr_by(b"fresh", 5), Ok(5));
    }

    #[test]
    fn expired_keys_disappear_on_access() {
        let mut ks = Keyspace::new();
        ks.set(b"k".to_vec(), b"v".to_vec(), Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ks.get(b"k"), None);
        assert_eq!(ks.ttl(b"k"), TtlStatus::Missing);
    }

    #[test]
    fn scan_visits_each_key_once() {
        let mut ks = Keyspace::new();
        for idx in 0..25 {
            ks.set(format!("user:{idx}").into_bytes(), b"x".to_vec(), None);
        }
        ks.set(b"other".to_vec(), b"x".to_vec(), None);

        let mut cursor = 0;
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let (next, keys) = ks.scan(cursor, Some("user:*"), Some(7));
            seen.extend(keys);
            pages += 1;
            if next == 0 {
                break;
            }
            cursor = next;
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 25);
        assert_eq!(pages, 4);
    }
}
