// Transferable key record and its newline-delimited JSON encoding.
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

/// Remaining lifetime of a key as reported by the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expiry {
    /// The key exists and never expires.
    Persistent,
    /// The key does not exist (anymore).
    Missing,
    Remaining(Duration),
}

impl Expiry {
    /// Whole seconds left, truncated toward zero. Keys without an expiry map to `0`.
    pub fn as_ttl_seconds(self) -> i64 {
        match self {
            Expiry::Remaining(left) => i64::try_from(left.as_secs()).unwrap_or(i64::MAX),
            Expiry::Persistent | Expiry::Missing => 0,
        }
    }
}

/// One key of one logical database, with its payload in the store's own
/// serialization. The payload is never interpreted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub db: u64,
    pub key: String,
    pub value: Bytes,
    pub ttl_seconds: i64,
}

#[derive(Serialize, Deserialize)]
struct RecordLine<'a> {
    db: u64,
    #[serde(borrow)]
    key: std::borrow::Cow<'a, str>,
    value: String,
    #[serde(default)]
    ttl: i64,
}

impl Record {
    pub fn new(db: u64, key: impl Into<String>, value: impl Into<Bytes>, ttl_seconds: i64) -> Self {
        Self {
            db,
            key: key.into(),
            value: value.into(),
            ttl_seconds,
        }
    }

    /// Expiry to hand to the destination; `None` means "no expiry".
    pub fn restore_ttl(&self) -> Option<Duration> {
        if self.ttl_seconds > 0 {
            Some(Duration::from_secs(self.ttl_seconds as u64))
        } else {
            None
        }
    }

    /// Encode as one JSON object without the trailing newline.
    pub fn to_json_line(&self) -> Result<String, Error> {
        let line = RecordLine {
            db: self.db,
            key: std::borrow::Cow::Borrowed(self.key.as_str()),
            value: BASE64.encode(&self.value),
            ttl: self.ttl_seconds,
        };
        serde_json::to_string(&line).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode record")
                .with_key(self.key.clone())
                .with_db(self.db)
                .with_source(err)
        })
    }

    pub fn from_json_line(line: &str) -> Result<Self, Error> {
        let parsed: RecordLine<'_> = serde_json::from_str(line).map_err(|err| {
            Error::new(ErrorKind::Decode)
                .with_message("invalid record line")
                .with_source(err)
        })?;
        let value = BASE64.decode(parsed.value.as_bytes()).map_err(|err| {
            Error::new(ErrorKind::Decode)
                .with_message("invalid base64 payload")
                .with_key(&*parsed.key)
                .with_db(parsed.db)
                .with_source(err)
        })?;
        Ok(Self {
            db: parsed.db,
            key: parsed.key.into_owned(),
            value: Bytes::from(value),
            ttl_seconds: parsed.ttl,
        })
    }
}
