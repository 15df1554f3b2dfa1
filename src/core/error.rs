// Error model shared by the store layer, the transfer engine, and the CLI.
use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use crate::core::record::Record;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    Io,
    Transport,
    Timeout,
    Decode,
    SerializeFetch,
    TtlFetch,
    RestoreApply,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    key: Option<String>,
    db: Option<u64>,
    record: Option<Box<Record>>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            key: None,
            db: None,
            record: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn db(&self) -> Option<u64> {
        self.db
    }

    /// The record whose replay failed, for `RestoreApply` errors.
    pub fn record(&self) -> Option<&Record> {
        self.record.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_db(mut self, db: u64) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_record(mut self, record: Record) -> Self {
        self.key = Some(record.key.clone());
        self.db = Some(record.db);
        self.record = Some(Box::new(record));
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Per-key outcomes that say nothing about the health of the run.
    pub fn is_benign(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(db) = self.db {
            write!(f, " (db: {db})")?;
        }
        if let Some(key) = &self.key {
            write!(f, " (key: {key})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Io => 4,
        ErrorKind::Transport => 5,
        ErrorKind::Timeout => 6,
        ErrorKind::Decode => 7,
        ErrorKind::SerializeFetch => 8,
        ErrorKind::TtlFetch => 9,
        ErrorKind::RestoreApply => 10,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};
    use crate::core::record::Record;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::Io, 4),
            (ErrorKind::Transport, 5),
            (ErrorKind::Timeout, 6),
            (ErrorKind::Decode, 7),
            (ErrorKind::SerializeFetch, 8),
            (ErrorKind::TtlFetch, 9),
            (ErrorKind::RestoreApply, 10),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn restore_error_keeps_record_context() {
        let record = Record::new(3, "user:1", b"payload".to_vec(), 42);
        let err = Error::new(ErrorKind::RestoreApply)
            .with_message("restore failed")
            .with_record(record);

        assert_eq!(err.key(), Some("user:1"));
        assert_eq!(err.db(), Some(3));
        assert_eq!(err.record().map(|r| r.ttl_seconds), Some(42));
        let text = err.to_string();
        assert!(text.starts_with("RestoreApply: restore failed"));
        assert!(text.contains("(db: 3)"));
        assert!(text.contains("(key: user:1)"));
    }

    #[test]
    fn only_not_found_is_benign() {
        assert!(Error::new(ErrorKind::NotFound).is_benign());
        assert!(!Error::new(ErrorKind::Transport).is_benign());
        assert!(!Error::new(ErrorKind::SerializeFetch).is_benign());
    }
}
