//! Purpose: Describe the store capabilities the transfer engine relies on.
//! Exports: `Store`, `Connector`, `ScanPage`, `Endpoint`, plus the Redis and in-memory backends.
//! Role: Seam between the engine and the wire protocol; the engine never sees a socket.
//! Invariants: Payloads returned by `dump` are opaque and only valid for `restore*` on a
//! store of the same kind/version.
//! Invariants: A `Store` is bound to exactly one logical database.
use std::future::Future;
use std::time::Duration;

use url::Url;

use crate::core::error::{Error, ErrorKind};
pub use crate::core::record::Expiry;

pub mod memory;
pub mod redis;

/// One batch of a cursor-driven enumeration. `next_cursor == 0` ends the pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub keys: Vec<String>,
    pub next_cursor: u64,
}

pub trait Store: Clone + Send + Sync + 'static {
    fn scan(
        &self,
        cursor: u64,
        pattern: Option<&str>,
        count: usize,
    ) -> impl Future<Output = Result<ScanPage, Error>> + Send;

    /// Serialized payload, or `None` when the key no longer exists.
    fn dump(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send;

    fn ttl(&self, key: &str) -> impl Future<Output = Result<Expiry, Error>> + Send;

    /// Create `key`; fails when it already exists.
    fn restore(
        &self,
        key: &str,
        ttl: Option<Duration>,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Create or overwrite `key`.
    fn restore_replace(
        &self,
        key: &str,
        ttl: Option<Duration>,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Returns whether a key was removed; a missing key is not an error.
    fn del(&self, key: &str) -> impl Future<Output = Result<bool, Error>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Number of logical databases the server is configured with.
    fn database_count(&self) -> impl Future<Output = Result<u64, Error>> + Send;
}

/// Opens store handles bound to a logical database.
pub trait Connector: Clone + Send + Sync + 'static {
    type Store: Store;

    fn connect(&self, db: u64) -> impl Future<Output = Result<Self::Store, Error>> + Send;

    /// Human-readable address used in logs.
    fn describe(&self) -> String;
}

/// Host and credential for one store, as given on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub password: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, password: Option<String>) -> Self {
        Self {
            host: host.into(),
            password: password.filter(|value| !value.is_empty()),
        }
    }

    /// `redis://` URL selecting logical database `db`.
    pub fn url(&self, db: u64) -> Result<Url, Error> {
        let host = self.host.trim();
        let base = if host.contains("://") {
            host.to_string()
        } else {
            format!("redis://{host}")
        };
        let mut url = Url::parse(&base).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid store address: {host}"))
                .with_hint("Use host:port, e.g. 127.0.0.1:6379.")
                .with_source(err)
        })?;
        if !matches!(url.scheme(), "redis" | "rediss") {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unsupported scheme: {}", url.scheme()))
                .with_hint("Use redis:// or rediss://, or a bare host:port."));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("store address has no host: {host}"))
                .with_hint("Use host:port, e.g. 127.0.0.1:6379."));
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password)).map_err(|()| {
                Error::new(ErrorKind::Usage).with_message("store address cannot carry a password")
            })?;
        }
        url.set_path(&format!("/{db}"));
        Ok(url)
    }

    /// Address with the credential stripped, for logs.
    pub fn redacted(&self) -> String {
        match self.url(0) {
            Ok(mut url) => {
                let _ = url.set_password(None);
                url.set_path("");
                url.to_string()
            }
            Err(_) => self.host.clone(),
        }
    }
}

/// Bound one store call by `limit`; an elapsed call becomes a `Timeout` error.
pub async fn with_timeout<T>(
    limit: Duration,
    op: &str,
    call: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(ErrorKind::Timeout)
            .with_message(format!("{op} timed out after {}ms", limit.as_millis()))),
    }
}

pub(crate) fn transport_error(
    op: &str,
    err: impl std::error::Error + Send + Sync + 'static,
) -> Error {
    Error::new(ErrorKind::Transport)
        .with_message(format!("{op} failed"))
        .with_source(err)
}
