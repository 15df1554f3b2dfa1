//! Purpose: In-process store with the semantics the engine expects from a real server.
//! Exports: `MemoryServer`, `MemoryStore`, `MemoryConnector`, `FailOp`.
//! Role: Test double for the engine and an embeddable target for callers without a server.
//! Invariants: Scan cursors are stable ids; deleting keys mid-scan never hides other keys.
//! Invariants: Expired keys are invisible to every operation.
//! Invariants: Payloads are stored and returned verbatim.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};
use crate::store::{Connector, Expiry, ScanPage, Store};

/// Operations that can be made to fail for a given key.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailOp {
    Dump,
    Ttl,
    Restore,
    Del,
    Exists,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    payload: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Database {
    next_id: u64,
    entries: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
}

impl Database {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|entry| entry.is_live(now))
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.id);
        Some(entry)
    }

    fn put(&mut self, key: &str, payload: Vec<u8>, expires_at: Option<Instant>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.payload = payload;
            entry.expires_at = expires_at;
            return;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.order.insert(id, key.to_string());
        self.entries.insert(
            key.to_string(),
            Entry {
                id,
                payload,
                expires_at,
            },
        );
    }
}

#[derive(Debug)]
struct Inner {
    databases: Vec<Database>,
    failures: HashSet<(u64, String, FailOp)>,
    fail_scans: HashSet<u64>,
    ops: u64,
}

/// Shared in-memory server holding `database_count` logical databases.
#[derive(Clone, Debug)]
pub struct MemoryServer {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryServer {
    pub fn new(database_count: u64) -> Self {
        let databases = (0..database_count.max(1)).map(|_| Database::default()).collect();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                databases,
                failures: HashSet::new(),
                fail_scans: HashSet::new(),
                ops: 0,
            })),
        }
    }

    pub fn database_count(&self) -> u64 {
        self.lock().databases.len() as u64
    }

    pub fn store(&self, db: u64) -> MemoryStore {
        MemoryStore {
            server: self.clone(),
            db,
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    /// Insert `key` directly, bypassing the restore path.
    pub fn insert(&self, db: u64, key: &str, payload: impl Into<Vec<u8>>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut inner = self.lock();
        if let Some(database) = inner.databases.get_mut(db as usize) {
            database.put(key, payload.into(), expires_at);
        }
    }

    pub fn get(&self, db: u64, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .databases
            .get(db as usize)?
            .live(key, now)
            .map(|entry| entry.payload.clone())
    }

    /// Remaining expiry, `None` for persistent or missing keys.
    pub fn ttl_of(&self, db: u64, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .databases
            .get(db as usize)?
            .live(key, now)?
            .expires_at
            .map(|at| at.saturating_duration_since(now))
    }

    /// Live keys of `db`, sorted.
    pub fn keys(&self, db: u64) -> Vec<String> {
        let now = Instant::now();
        let inner = self.lock();
        let mut keys: Vec<String> = inner
            .databases
            .get(db as usize)
            .map(|database| {
                database
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.is_live(now))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn fail(&self, db: u64, key: &str, op: FailOp) {
        self.lock().failures.insert((db, key.to_string(), op));
    }

    pub fn heal(&self, db: u64, key: &str, op: FailOp) {
        self.lock().failures.remove(&(db, key.to_string(), op));
    }

    pub fn fail_scans(&self, db: u64) {
        self.lock().fail_scans.insert(db);
    }

    /// Number of store calls served so far.
    pub fn op_count(&self) -> u64 {
        self.lock().ops
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_db<T>(
        &self,
        db: u64,
        key: Option<(&str, FailOp)>,
        f: impl FnOnce(&mut Database, Instant) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.ops += 1;
        if let Some((key, op)) = key {
            if inner.failures.contains(&(db, key.to_string(), op)) {
                return Err(Error::new(ErrorKind::Transport)
                    .with_message(format!("injected {op:?} failure"))
                    .with_db(db)
                    .with_key(key));
            }
        }
        let database = inner.databases.get_mut(db as usize).ok_or_else(|| {
            Error::new(ErrorKind::Transport)
                .with_message("ERR DB index is out of range")
                .with_db(db)
        })?;
        f(database, now)
    }
}

#[derive(Clone, Debug)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl Connector for MemoryConnector {
    type Store = MemoryStore;

    async fn connect(&self, db: u64) -> Result<MemoryStore, Error> {
        if db >= self.server.database_count() {
            return Err(Error::new(ErrorKind::Transport)
                .with_message("ERR DB index is out of range")
                .with_db(db));
        }
        Ok(self.server.store(db))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Clone, Debug)]
pub struct MemoryStore {
    server: MemoryServer,
    db: u64,
}

impl MemoryStore {
    fn write(
        &self,
        key: &str,
        ttl: Option<Duration>,
        payload: &[u8],
        replace: bool,
    ) -> Result<(), Error> {
        self.server
            .with_db(self.db, Some((key, FailOp::Restore)), |database, now| {
                if database.live(key, now).is_some() {
                    if !replace {
                        return Err(Error::new(ErrorKind::Transport)
                            .with_message("BUSYKEY Target key name already exists.")
                            .with_key(key));
                    }
                } else {
                    database.remove(key);
                }
                let expires_at = ttl.filter(|ttl| !ttl.is_zero()).map(|ttl| now + ttl);
                database.put(key, payload.to_vec(), expires_at);
                Ok(())
            })
    }
}

impl Store for MemoryStore {
    async fn scan(
        &self,
        cursor: u64,
        pattern: Option<&str>,
        count: usize,
    ) -> Result<ScanPage, Error> {
        if self.server.lock().fail_scans.contains(&self.db) {
            return Err(Error::new(ErrorKind::Transport)
                .with_message("injected SCAN failure")
                .with_db(self.db));
        }
        let count = count.max(1);
        self.server.with_db(self.db, None, |database, now| {
            let mut keys = Vec::new();
            let mut visited = 0usize;
            let mut next_cursor = 0u64;
            for (&id, key) in database.order.range(cursor.max(1)..) {
                if visited == count {
                    next_cursor = id;
                    break;
                }
                visited += 1;
                let live = database.live(key, now).is_some();
                if live && pattern.is_none_or(|pattern| glob_match(pattern, key)) {
                    keys.push(key.clone());
                }
            }
            Ok(ScanPage { keys, next_cursor })
        })
    }

    async fn dump(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.server
            .with_db(self.db, Some((key, FailOp::Dump)), |database, now| {
                Ok(database.live(key, now).map(|entry| entry.payload.clone()))
            })
    }

    async fn ttl(&self, key: &str) -> Result<Expiry, Error> {
        self.server
            .with_db(self.db, Some((key, FailOp::Ttl)), |database, now| {
                Ok(match database.live(key, now) {
                    None => Expiry::Missing,
                    Some(Entry {
                        expires_at: None, ..
                    }) => Expiry::Persistent,
                    Some(Entry {
                        expires_at: Some(at),
                        ..
                    }) => Expiry::Remaining(at.saturating_duration_since(now)),
                })
            })
    }

    async fn restore(&self, key: &str, ttl: Option<Duration>, payload: &[u8]) -> Result<(), Error> {
        self.write(key, ttl, payload, false)
    }

    async fn restore_replace(
        &self,
        key: &str,
        ttl: Option<Duration>,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.write(key, ttl, payload, true)
    }

    async fn del(&self, key: &str) -> Result<bool, Error> {
        self.server
            .with_db(self.db, Some((key, FailOp::Del)), |database, now| {
                let was_live = database.live(key, now).is_some();
                database.remove(key);
                Ok(was_live)
            })
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        self.server
            .with_db(self.db, Some((key, FailOp::Exists)), |database, now| {
                Ok(database.live(key, now).is_some())
            })
    }

    async fn database_count(&self) -> Result<u64, Error> {
        Ok(self.server.database_count())
    }
}

/// Glob subset used by `SCAN MATCH`: `*`, `?`, and literal characters.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::{FailOp, MemoryServer, glob_match};
    use crate::core::error::ErrorKind;
    use crate::store::{Expiry, Store};
    use std::time::Duration;

    #[tokio::test]
    async fn scan_survives_deletion_mid_pass() {
        let server = MemoryServer::new(1);
        for i in 0..10 {
            server.insert(0, &format!("k{i}"), vec![i as u8], None);
        }
        let store = server.store(0);

        let first = store.scan(0, None, 3).await.expect("scan");
        assert_eq!(first.keys.len(), 3);
        assert_ne!(first.next_cursor, 0);
        for key in &first.keys {
            store.del(key).await.expect("del");
        }

        let mut seen = first.keys.clone();
        let mut cursor = first.next_cursor;
        while cursor != 0 {
            let page = store.scan(cursor, None, 3).await.expect("scan");
            seen.extend(page.keys);
            cursor = page.next_cursor;
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn empty_database_scan_ends_immediately() {
        let server = MemoryServer::new(1);
        let page = server.store(0).scan(0, None, 100).await.expect("scan");
        assert!(page.keys.is_empty());
        assert_eq!(page.next_cursor, 0);
    }

    #[tokio::test]
    async fn restore_refuses_existing_key_unless_replacing() {
        let server = MemoryServer::new(1);
        let store = server.store(0);
        store.restore("a", None, b"1").await.expect("create");
        let err = store.restore("a", None, b"2").await.expect_err("busy");
        assert_eq!(err.kind(), ErrorKind::Transport);

        store
            .restore_replace("a", Some(Duration::from_secs(30)), b"3")
            .await
            .expect("replace");
        assert_eq!(server.get(0, "a"), Some(b"3".to_vec()));
        match store.ttl("a").await.expect("ttl") {
            Expiry::Remaining(left) => assert!(left <= Duration::from_secs(30)),
            other => panic!("unexpected expiry {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_keys_are_invisible() {
        let server = MemoryServer::new(1);
        server.insert(0, "gone", b"x".to_vec(), Some(Duration::ZERO));
        let store = server.store(0);
        assert!(!store.exists("gone").await.expect("exists"));
        assert_eq!(store.dump("gone").await.expect("dump"), None);
        assert_eq!(store.ttl("gone").await.expect("ttl"), Expiry::Missing);
        assert!(server.keys(0).is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_transport_errors() {
        let server = MemoryServer::new(2);
        server.insert(1, "bad", b"x".to_vec(), None);
        server.fail(1, "bad", FailOp::Dump);
        let store = server.store(1);
        let err = store.dump("bad").await.expect_err("injected");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.key(), Some("bad"));

        server.heal(1, "bad", FailOp::Dump);
        assert_eq!(store.dump("bad").await.expect("dump"), Some(b"x".to_vec()));
    }

    #[test]
    fn glob_subset_matches_like_scan_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("user:*", "user:42"));
        assert!(!glob_match("user:*", "session:42"));
        assert!(glob_match("k?y", "key"));
        assert!(glob_match("*:*:end", "a:b:c:end"));
        assert!(!glob_match("a*b", "acd"));
    }
}
