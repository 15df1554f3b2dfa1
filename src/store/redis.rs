// Redis-protocol backend over a multiplexed async connection.
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind};
use crate::store::{Connector, Endpoint, Expiry, ScanPage, Store, transport_error};

const DATABASES_PARAM: &str = "databases";

#[derive(Clone, Debug)]
pub struct RedisConnector {
    endpoint: Endpoint,
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(endpoint: Endpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Connector for RedisConnector {
    type Store = RedisStore;

    async fn connect(&self, db: u64) -> Result<RedisStore, Error> {
        let url = self.endpoint.url(db)?;
        let client = ::redis::Client::open(url.as_str()).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid store address: {}", self.endpoint.redacted()))
                .with_db(db)
                .with_source(err)
        })?;
        let connect = client.get_multiplexed_async_connection();
        let conn = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::new(ErrorKind::Timeout)
                    .with_message(format!("connect to {} timed out", self.endpoint.redacted()))
                    .with_db(db)
            })?
            .map_err(|err| {
                transport_error("connect", err)
                    .with_message(format!("connect to {} failed", self.endpoint.redacted()))
                    .with_hint("Check --host/--password and that the server is reachable.")
                    .with_db(db)
            })?;
        debug!(db, addr = %self.endpoint.redacted(), "connected");
        Ok(RedisStore { conn, db })
    }

    fn describe(&self) -> String {
        self.endpoint.redacted()
    }
}

/// Handle bound to one logical database. Clones share the connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    db: u64,
}

fn expire_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl Store for RedisStore {
    async fn scan(
        &self,
        cursor: u64,
        pattern: Option<&str>,
        count: usize,
    ) -> Result<ScanPage, Error> {
        let mut cmd = ::redis::cmd("SCAN");
        cmd.arg(cursor);
        if let Some(pattern) = pattern {
            cmd.arg("MATCH").arg(pattern);
        }
        cmd.arg("COUNT").arg(count);
        let mut conn = self.conn.clone();
        let reply: ::redis::Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| transport_error("SCAN", err).with_db(self.db))?;
        decode_scan_reply(self.db, &reply)
    }

    async fn dump(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut conn = self.conn.clone();
        let payload: Option<Vec<u8>> = ::redis::cmd("DUMP")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| transport_error("DUMP", err).with_db(self.db).with_key(key))?;
        Ok(payload)
    }

    async fn ttl(&self, key: &str) -> Result<Expiry, Error> {
        let mut conn = self.conn.clone();
        let millis: i64 = ::redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| transport_error("PTTL", err).with_db(self.db).with_key(key))?;
        Ok(match millis {
            -2 => Expiry::Missing,
            ms if ms < 0 => Expiry::Persistent,
            ms => Expiry::Remaining(Duration::from_millis(ms as u64)),
        })
    }

    async fn restore(&self, key: &str, ttl: Option<Duration>, payload: &[u8]) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let () = ::redis::cmd("RESTORE")
            .arg(key)
            .arg(expire_millis(ttl))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|err| transport_error("RESTORE", err).with_db(self.db).with_key(key))?;
        Ok(())
    }

    async fn restore_replace(
        &self,
        key: &str,
        ttl: Option<Duration>,
        payload: &[u8],
    ) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let () = ::redis::cmd("RESTORE")
            .arg(key)
            .arg(expire_millis(ttl))
            .arg(payload)
            .arg("REPLACE")
            .query_async(&mut conn)
            .await
            .map_err(|err| {
                transport_error("RESTORE REPLACE", err)
                    .with_db(self.db)
                    .with_key(key)
                    .with_hint("Old servers lack REPLACE; try --write-policy delete-then-write.")
            })?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let removed: i64 = ::redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| transport_error("DEL", err).with_db(self.db).with_key(key))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let found: i64 = ::redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| transport_error("EXISTS", err).with_db(self.db).with_key(key))?;
        Ok(found > 0)
    }

    async fn database_count(&self) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = ::redis::cmd("CONFIG")
            .arg("GET")
            .arg(DATABASES_PARAM)
            .query_async(&mut conn)
            .await
            .map_err(|err| transport_error("CONFIG GET databases", err))?;
        parse_database_count(&reply)
    }
}

/// Keys come back as raw bytes; a key that is not UTF-8 is logged and left
/// out instead of failing the whole batch.
fn decode_scan_reply(db: u64, reply: &::redis::Value) -> Result<ScanPage, Error> {
    let (next_cursor, raw): (u64, Vec<Vec<u8>>) = ::redis::from_redis_value(reply)
        .map_err(|err| transport_error("SCAN", err).with_db(db))?;
    let mut keys = Vec::with_capacity(raw.len());
    for bytes in raw {
        match String::from_utf8(bytes) {
            Ok(key) => keys.push(key),
            Err(err) => {
                let lossy = String::from_utf8_lossy(err.as_bytes()).into_owned();
                warn!(db, key = %lossy, "skipping key that is not valid UTF-8");
            }
        }
    }
    Ok(ScanPage { keys, next_cursor })
}

fn parse_database_count(reply: &[String]) -> Result<u64, Error> {
    let value = match reply {
        [name, value] if name.eq_ignore_ascii_case(DATABASES_PARAM) => value,
        _ => {
            return Err(Error::new(ErrorKind::Transport)
                .with_message("unexpected CONFIG GET databases reply")
                .with_hint("Pass --database-count explicitly."));
        }
    };
    match value.trim().parse::<u64>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(Error::new(ErrorKind::Transport)
            .with_message(format!("invalid database count: {value}"))
            .with_hint("Pass --database-count explicitly.")),
    }
}
