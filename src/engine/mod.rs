//! Purpose: Orchestrate whole-keyspace transfers on top of the worker pool and scanner.
//! Exports: `dump`, `restore`, `sync` orchestrators and the per-key transfer units.
//! Role: Library core driven by the CLI; owns concurrency, failure isolation, and reporting.
//! Invariants: Per-key failures never abort a dump or a sync round; they are logged and counted.
//! Invariants: Every round drains its worker pool before reporting.
//! Invariants: A logical database's clients are never shared with another database's loop.
use std::time::Duration;

use tracing::info;

use crate::core::error::{Error, ErrorKind};
use crate::store::{Connector, Store, with_timeout};

pub mod dump;
pub mod restore;
pub mod sync;
pub mod transfer;

/// Worker count used when none is configured: one per available core.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
}

/// Use `requested` when non-zero, otherwise ask the server on database 0.
pub async fn resolve_database_count<C: Connector>(
    connector: &C,
    requested: u64,
    timeout: Duration,
) -> Result<u64, Error> {
    if requested > 0 {
        return Ok(requested);
    }
    let store = connector.connect(0).await?;
    let count = with_timeout(timeout, "CONFIG GET databases", store.database_count())
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "could not discover database count on {}",
                    connector.describe()
                ))
                .with_hint("Pass --database-count explicitly.")
                .with_source(err)
        })?;
    info!(count, addr = %connector.describe(), "discovered logical databases");
    Ok(count)
}

pub(crate) fn require_positive(value: u64, flag: &str, example: &str) -> Result<(), Error> {
    if value == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("{flag} must be greater than zero"))
            .with_hint(format!("Use a positive value like {example}.")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{default_threads, require_positive, resolve_database_count};
    use crate::core::error::ErrorKind;
    use crate::store::memory::MemoryServer;
    use std::time::Duration;

    #[tokio::test]
    async fn explicit_count_wins_over_discovery() {
        let server = MemoryServer::new(3);
        let count = resolve_database_count(&server.connector(), 9, Duration::from_secs(1))
            .await
            .expect("count");
        assert_eq!(count, 9);
    }

    #[tokio::test]
    async fn zero_count_is_discovered() {
        let server = MemoryServer::new(3);
        let count = resolve_database_count(&server.connector(), 0, Duration::from_secs(1))
            .await
            .expect("count");
        assert_eq!(count, 3);
    }

    #[test]
    fn zero_values_are_usage_errors() {
        let err = require_positive(0, "--threads", "8").expect_err("zero");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.hint(), Some("Use a positive value like 8."));
        assert!(require_positive(1, "--threads", "8").is_ok());
        assert!(default_threads() >= 1);
    }
}
