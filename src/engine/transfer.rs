// Per-key transfer units: dump one key, restore one record, copy or prune one key.
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::record::{Expiry, Record};
use crate::store::{Store, with_timeout};

/// How a record is written to the destination.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// One atomic overwrite-or-create call.
    #[default]
    Replace,
    /// Delete the key, then create it. For servers without an atomic replace.
    DeleteThenWrite,
}

#[derive(Clone, Debug)]
pub struct DumpUnit<S> {
    store: S,
    db: u64,
    timeout: Duration,
}

impl<S: Store> DumpUnit<S> {
    pub fn new(store: S, db: u64, timeout: Duration) -> Self {
        Self { store, db, timeout }
    }

    /// Fetch the serialized payload and remaining expiry of `key`.
    ///
    /// A key that vanished since it was scanned yields a `NotFound` error.
    pub async fn dump(&self, key: &str) -> Result<Record, Error> {
        let payload = with_timeout(self.timeout, "DUMP", self.store.dump(key))
            .await
            .map_err(|err| {
                self.fetch_error(ErrorKind::SerializeFetch, "fetch serialized value", key, err)
            })?;
        let Some(payload) = payload else {
            return Err(self.vanished(key));
        };
        let expiry = with_timeout(self.timeout, "PTTL", self.store.ttl(key))
            .await
            .map_err(|err| self.fetch_error(ErrorKind::TtlFetch, "fetch ttl", key, err))?;
        if expiry == Expiry::Missing {
            return Err(self.vanished(key));
        }
        Ok(Record {
            db: self.db,
            key: key.to_string(),
            value: Bytes::from(payload),
            ttl_seconds: expiry.as_ttl_seconds(),
        })
    }

    fn fetch_error(&self, kind: ErrorKind, what: &str, key: &str, err: Error) -> Error {
        Error::new(kind)
            .with_message(format!("{what} failed"))
            .with_db(self.db)
            .with_key(key)
            .with_source(err)
    }

    fn vanished(&self, key: &str) -> Error {
        Error::new(ErrorKind::NotFound)
            .with_message("key vanished before it could be dumped")
            .with_db(self.db)
            .with_key(key)
    }
}

#[derive(Clone, Debug)]
pub struct RestoreUnit<S> {
    store: S,
    policy: WritePolicy,
    timeout: Duration,
}

impl<S: Store> RestoreUnit<S> {
    pub fn new(store: S, policy: WritePolicy, timeout: Duration) -> Self {
        Self {
            store,
            policy,
            timeout,
        }
    }

    /// Write `record` with the configured policy. Non-positive TTLs restore without expiry.
    pub async fn apply(&self, record: &Record) -> Result<(), Error> {
        let ttl = record.restore_ttl();
        let result = match self.policy {
            WritePolicy::Replace => {
                with_timeout(
                    self.timeout,
                    "RESTORE REPLACE",
                    self.store.restore_replace(&record.key, ttl, &record.value),
                )
                .await
            }
            WritePolicy::DeleteThenWrite => self.delete_then_write(record, ttl).await,
        };
        result.map_err(|err| {
            Error::new(ErrorKind::RestoreApply)
                .with_message("restore failed")
                .with_record(record.clone())
                .with_source(err)
        })
    }

    async fn delete_then_write(&self, record: &Record, ttl: Option<Duration>) -> Result<(), Error> {
        with_timeout(self.timeout, "DEL", self.store.del(&record.key)).await?;
        with_timeout(
            self.timeout,
            "RESTORE",
            self.store.restore(&record.key, ttl, &record.value),
        )
        .await
    }
}

/// Dump from one store straight into another, without an intermediate file.
#[derive(Clone, Debug)]
pub struct CopyUnit<S, D> {
    source: DumpUnit<S>,
    dest: RestoreUnit<D>,
}

impl<S: Store, D: Store> CopyUnit<S, D> {
    pub fn new(source: DumpUnit<S>, dest: RestoreUnit<D>) -> Self {
        Self { source, dest }
    }

    pub async fn copy(&self, key: &str) -> Result<Record, Error> {
        let record = self.source.dump(key).await?;
        self.dest.apply(&record).await?;
        Ok(record)
    }
}

/// Delete a destination key that no longer exists in the source.
#[derive(Clone, Debug)]
pub struct PruneUnit<S, D> {
    source: S,
    dest: D,
    db: u64,
    timeout: Duration,
}

impl<S: Store, D: Store> PruneUnit<S, D> {
    pub fn new(source: S, dest: D, db: u64, timeout: Duration) -> Self {
        Self {
            source,
            dest,
            db,
            timeout,
        }
    }

    /// Returns `true` when the key was deleted from the destination.
    ///
    /// A failed existence check keeps the key.
    pub async fn prune(&self, key: &str) -> Result<bool, Error> {
        let exists = with_timeout(self.timeout, "EXISTS", self.source.exists(key))
            .await
            .map_err(|err| err.with_db(self.db).with_key(key))?;
        if exists {
            return Ok(false);
        }
        with_timeout(self.timeout, "DEL", self.dest.del(key))
            .await
            .map_err(|err| err.with_db(self.db).with_key(key))
    }
}
