//! Purpose: Dump every logical database of a store into a newline-delimited JSON stream.
//! Exports: `DumpOptions`, `ErrorPolicy`, `DumpReport`, `DatabaseDump`, `dump`.
//! Role: Scanner -> worker pool -> dump unit -> single writer task.
//! Invariants: Exactly one task writes to the output; every record is one whole line.
//! Invariants: Once a database's stop flag is raised no new key of that database is
//! dispatched; in-flight keys finish and the next database still runs.
//! Invariants: Databases are dumped one after another, in id order.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::cursor::{DEFAULT_PIPELINE_DEPTH, KeyScanner, ScanOptions};
use crate::core::error::{Error, ErrorKind};
use crate::core::pool::WorkerPool;
use crate::core::record::Record;
use crate::engine::transfer::DumpUnit;
use crate::engine::{default_threads, require_positive, resolve_database_count};
use crate::store::{Connector, Store};

/// What a failed key does to the rest of the dump.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Stop dispatching new keys after the first failure.
    #[default]
    Stop,
    /// Log the failure and keep going.
    Skip,
}

#[derive(Clone, Debug)]
pub struct DumpOptions {
    /// `0` discovers the count from the server.
    pub database_count: u64,
    pub threads: usize,
    pub scan: ScanOptions,
    pub timeout: Duration,
    pub errors: ErrorPolicy,
    pub report_every: u64,
    pub pipeline_depth: usize,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            database_count: 0,
            threads: default_threads(),
            scan: ScanOptions::default(),
            timeout: Duration::from_secs(30),
            errors: ErrorPolicy::Stop,
            report_every: 1000,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
        }
    }
}

impl DumpOptions {
    pub fn validate(&self) -> Result<(), Error> {
        require_positive(self.threads as u64, "--threads", "8")?;
        require_positive(self.timeout.as_millis() as u64, "--timeout-ms", "30000")?;
        require_positive(self.scan.count as u64, "--scan-count", "100")?;
        require_positive(self.report_every, "report interval", "1000")?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct DatabaseDump {
    pub db: u64,
    pub dumped: u64,
    /// Keys that disappeared between scan and dump.
    pub skipped: u64,
    pub failed: u64,
    pub scan_complete: bool,
    /// A failed key stopped dispatch for this database.
    pub stopped_early: bool,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct DumpReport {
    pub databases: Vec<DatabaseDump>,
    /// Lines written to the output.
    pub records: u64,
    /// Any database stopped early.
    pub stopped_early: bool,
}

#[derive(Default)]
struct Counters {
    dumped: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Dump every database reachable through `connector` into `output`.
///
/// Per-key failures are logged and counted rather than returned; the call only
/// fails on configuration problems or when the output cannot be written.
pub async fn dump<C, W>(
    connector: &C,
    output: W,
    options: &DumpOptions,
) -> Result<(DumpReport, W), Error>
where
    C: Connector,
    W: AsyncWrite + Unpin + Send + 'static,
{
    options.validate()?;
    let database_count =
        resolve_database_count(connector, options.database_count, options.timeout).await?;

    let (sink, writer) = spawn_writer(output, options.threads.saturating_mul(2));
    let mut report = DumpReport::default();

    for db in 0..database_count {
        let store = match connector.connect(db).await {
            Ok(store) => store,
            Err(err) => {
                error!(db, error = %err, "connect failed; database not dumped");
                report.databases.push(DatabaseDump {
                    db,
                    failed: 1,
                    ..DatabaseDump::default()
                });
                continue;
            }
        };
        let summary = dump_database(store, db, &sink, options).await;
        info!(
            db,
            dumped = summary.dumped,
            skipped = summary.skipped,
            failed = summary.failed,
            stopped_early = summary.stopped_early,
            "database dumped"
        );
        report.stopped_early |= summary.stopped_early;
        report.databases.push(summary);
    }

    drop(sink);
    let (output, written) = writer.await.map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("dump writer task failed")
            .with_source(err)
    })??;
    report.records = written;
    info!(records = written, "dump finished");
    Ok((report, output))
}

/// Dump one database. The stop flag lives here: a failed key under
/// `ErrorPolicy::Stop` ends dispatch for this database only.
async fn dump_database<S: Store>(
    store: S,
    db: u64,
    sink: &mpsc::Sender<Record>,
    options: &DumpOptions,
) -> DatabaseDump {
    let pool = WorkerPool::new(options.threads, || {
        DumpUnit::new(store.clone(), db, options.timeout)
    });
    let counters = Arc::new(Counters::default());
    let stop = Arc::new(AtomicBool::new(false));
    let (mut keys, scan) =
        KeyScanner::new(store.clone(), db, options.scan.clone()).spawn(options.pipeline_depth);

    while let Some(key) = keys.recv().await {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let unit = pool.acquire().await;
        if stop.load(Ordering::Acquire) {
            break;
        }
        let sink = sink.clone();
        let stop = Arc::clone(&stop);
        let counters = Arc::clone(&counters);
        let policy = options.errors;
        let report_every = options.report_every;
        tokio::spawn(async move {
            match unit.dump(&key).await {
                Ok(record) => {
                    if sink.send(record).await.is_err() {
                        error!(db, key = %key, "dump output closed");
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        stop.store(true, Ordering::Release);
                        return;
                    }
                    let dumped = counters.dumped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dumped % report_every == 0 {
                        info!(db, dumped, "dump progress");
                    }
                }
                Err(err) if err.is_benign() => {
                    debug!(db, key = %key, "key vanished during dump");
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    warn!(db, key = %key, kind = ?err.kind(), error = %err, "dump failed");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    if policy == ErrorPolicy::Stop {
                        stop.store(true, Ordering::Release);
                    }
                }
            }
            drop(unit);
        });
    }
    drop(keys);

    pool.drain().await;
    let scan = match scan.await {
        Ok(summary) => summary,
        Err(err) => {
            error!(db, error = %err, "scanner task failed");
            Default::default()
        }
    };
    drop(pool.take_idle());

    DatabaseDump {
        db,
        dumped: counters.dumped.load(Ordering::Relaxed),
        skipped: counters.skipped.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
        scan_complete: scan.complete,
        stopped_early: stop.load(Ordering::Acquire),
    }
}

/// Single writer: the only task that touches the output.
fn spawn_writer<W>(
    mut output: W,
    depth: usize,
) -> (mpsc::Sender<Record>, JoinHandle<Result<(W, u64), Error>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Record>(depth.max(1));
    let handle: JoinHandle<Result<(W, u64), Error>> = tokio::spawn(async move {
        let mut written = 0u64;
        while let Some(record) = rx.recv().await {
            let mut line = record.to_json_line()?;
            line.push('\n');
            output.write_all(line.as_bytes()).await.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to write dump output")
                    .with_source(err)
            })?;
            written += 1;
        }
        output.flush().await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to flush dump output")
                .with_source(err)
        })?;
        Ok((output, written))
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::{DumpOptions, ErrorPolicy, dump};
    use crate::core::cursor::ScanOptions;
    use crate::core::error::ErrorKind;
    use crate::core::record::Record;
    use crate::store::memory::{FailOp, MemoryServer};

    fn options() -> DumpOptions {
        DumpOptions {
            threads: 4,
            scan: ScanOptions {
                count: 7,
                ..ScanOptions::default()
            },
            ..DumpOptions::default()
        }
    }

    fn parse(output: &[u8]) -> Vec<Record> {
        std::str::from_utf8(output)
            .expect("utf8")
            .lines()
            .map(|line| Record::from_json_line(line).expect("record"))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_database_is_written_line_by_line() {
        let server = MemoryServer::new(3);
        for i in 0..40 {
            server.insert(0, &format!("a{i}"), vec![b'x'; 64], None);
        }
        server.insert(2, "c", b"\n\x00binary".to_vec(), None);

        let (report, output) = dump(&server.connector(), Vec::new(), &options())
            .await
            .expect("dump");
        assert_eq!(report.records, 41);
        assert_eq!(report.databases.len(), 3);
        assert!(!report.stopped_early);
        assert!(report.databases.iter().all(|db| db.scan_complete));

        let records = parse(&output);
        assert_eq!(records.len(), 41);
        let binary = records.iter().find(|record| record.key == "c").expect("c");
        assert_eq!(binary.db, 2);
        assert_eq!(binary.value.as_ref(), b"\n\x00binary");
    }

    #[tokio::test]
    async fn stop_policy_halts_dispatch_for_that_database_only() {
        let server = MemoryServer::new(2);
        for i in 0..200 {
            server.insert(0, &format!("k{i}"), b"v".to_vec(), None);
        }
        server.insert(1, "later", b"v".to_vec(), None);
        server.fail(0, "k0", FailOp::Dump);

        let options = DumpOptions {
            threads: 1,
            ..options()
        };
        let (report, output) = dump(&server.connector(), Vec::new(), &options)
            .await
            .expect("dump");
        assert!(report.stopped_early);
        assert_eq!(report.databases.len(), 2);
        assert!(report.databases[0].stopped_early);
        assert_eq!(report.databases[0].failed, 1);
        assert!(report.databases[0].dumped < 199);

        assert!(!report.databases[1].stopped_early);
        assert_eq!(report.databases[1].dumped, 1);
        let records = parse(&output);
        let later = records.iter().find(|record| record.key == "later").expect("later");
        assert_eq!(later.db, 1);
    }

    #[tokio::test]
    async fn unreachable_database_is_counted_and_the_rest_still_dump() {
        let server = MemoryServer::new(1);
        server.insert(0, "a", b"v".to_vec(), None);
        let options = DumpOptions {
            database_count: 2,
            ..options()
        };
        let (report, output) = dump(&server.connector(), Vec::new(), &options)
            .await
            .expect("dump");
        assert_eq!(report.databases[0].dumped, 1);
        assert_eq!(report.databases[1].failed, 1);
        assert_eq!(parse(&output).len(), 1);
    }

    #[tokio::test]
    async fn skip_policy_isolates_failed_keys() {
        let server = MemoryServer::new(1);
        for i in 0..20 {
            server.insert(0, &format!("k{i}"), b"v".to_vec(), None);
        }
        server.fail(0, "k3", FailOp::Dump);
        server.fail(0, "k4", FailOp::Ttl);

        let options = DumpOptions {
            errors: ErrorPolicy::Skip,
            ..options()
        };
        let (report, output) = dump(&server.connector(), Vec::new(), &options)
            .await
            .expect("dump");
        assert!(!report.stopped_early);
        assert_eq!(report.databases[0].failed, 2);
        assert_eq!(report.databases[0].dumped, 18);
        assert_eq!(parse(&output).len(), 18);
    }

    #[tokio::test]
    async fn zero_threads_is_rejected() {
        let server = MemoryServer::new(1);
        let options = DumpOptions {
            threads: 0,
            ..options()
        };
        let err = dump(&server.connector(), Vec::new(), &options)
            .await
            .expect_err("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
