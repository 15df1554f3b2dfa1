//! Purpose: Mirror a live store into another by repeated copy + prune rounds.
//! Exports: `SyncOptions`, `SyncReport`, `DatabaseSync`, `RoundOutcome`, `SyncWorker`, `sync`.
//! Role: One independent round loop per logical database, all databases concurrently.
//! Invariants: The copy phase fully drains before the prune phase starts.
//! Invariants: A destination key is deleted only after the source confirmed it is absent.
//! Invariants: A round that moved nothing is followed by an idle backoff, never a busy loop.
//! Invariants: Shutdown is observed between rounds; a started round always completes.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::core::cursor::{DEFAULT_PIPELINE_DEPTH, KeyScanner, ScanOptions, ScanSummary};
use crate::core::error::{Error, ErrorKind};
use crate::core::pool::WorkerPool;
use crate::engine::transfer::{CopyUnit, DumpUnit, PruneUnit, RestoreUnit, WritePolicy};
use crate::engine::{default_threads, require_positive, resolve_database_count};
use crate::store::{Connector, Store};

#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// `0` discovers the count from the source.
    pub database_count: u64,
    pub threads: usize,
    /// Rounds per database; `0` runs until shutdown.
    pub rounds: u64,
    pub write_policy: WritePolicy,
    pub scan: ScanOptions,
    pub timeout: Duration,
    pub idle_backoff: Duration,
    pub pipeline_depth: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            database_count: 0,
            threads: default_threads(),
            rounds: 0,
            write_policy: WritePolicy::Replace,
            scan: ScanOptions::default(),
            timeout: Duration::from_secs(30),
            idle_backoff: Duration::from_secs(1),
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
        }
    }
}

impl SyncOptions {
    pub fn validate(&self) -> Result<(), Error> {
        require_positive(self.threads as u64, "--threads", "8")?;
        require_positive(self.timeout.as_millis() as u64, "--timeout-ms", "30000")?;
        require_positive(self.scan.count as u64, "--scan-count", "100")?;
        Ok(())
    }
}

/// Counts for one copy + prune round.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct RoundOutcome {
    pub copied: u64,
    pub pruned: u64,
    pub failed: u64,
    pub source_scan_complete: bool,
    pub dest_scan_complete: bool,
}

impl RoundOutcome {
    /// Keys moved or removed; zero means the round was idle.
    pub fn transferred(&self) -> u64 {
        self.copied + self.pruned
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct DatabaseSync {
    pub db: u64,
    pub rounds: u64,
    pub copied: u64,
    pub pruned: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct SyncReport {
    pub databases: Vec<DatabaseSync>,
}

#[derive(Default)]
struct PhaseCounters {
    done: AtomicU64,
    failed: AtomicU64,
}

/// Per-round worker: one copy unit and one prune unit sharing the same clients.
#[derive(Clone)]
struct RoundUnit<S, D> {
    copy: CopyUnit<S, D>,
    prune: PruneUnit<S, D>,
}

/// Round loop for one logical database. Owns that database's source and
/// destination clients for its whole lifetime.
pub struct SyncWorker<S, D> {
    db: u64,
    source: S,
    dest: D,
    options: Arc<SyncOptions>,
}

impl<S: Store, D: Store> SyncWorker<S, D> {
    pub fn new(db: u64, source: S, dest: D, options: Arc<SyncOptions>) -> Self {
        Self {
            db,
            source,
            dest,
            options,
        }
    }

    /// Run rounds until the configured limit is reached or `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> DatabaseSync {
        let mut totals = DatabaseSync {
            db: self.db,
            ..DatabaseSync::default()
        };
        loop {
            if self.options.rounds != 0 && totals.rounds >= self.options.rounds {
                break;
            }
            if *shutdown.borrow() {
                break;
            }
            let outcome = self.round().await;
            totals.rounds += 1;
            totals.copied += outcome.copied;
            totals.pruned += outcome.pruned;
            totals.failed += outcome.failed;
            info!(
                db = self.db,
                round = totals.rounds,
                copied = outcome.copied,
                pruned = outcome.pruned,
                failed = outcome.failed,
                "synchronized database"
            );

            let more = self.options.rounds == 0 || totals.rounds < self.options.rounds;
            if outcome.transferred() == 0 && more {
                idle(self.options.idle_backoff, &mut shutdown).await;
            }
        }
        totals
    }

    /// One copy phase followed by one prune phase over a fresh worker pool.
    pub async fn round(&self) -> RoundOutcome {
        let options = &self.options;
        let pool = WorkerPool::new(options.threads, || RoundUnit {
            copy: CopyUnit::new(
                DumpUnit::new(self.source.clone(), self.db, options.timeout),
                RestoreUnit::new(self.dest.clone(), options.write_policy, options.timeout),
            ),
            prune: PruneUnit::new(self.source.clone(), self.dest.clone(), self.db, options.timeout),
        });

        let copy = Arc::new(PhaseCounters::default());
        let (mut keys, scan) = KeyScanner::new(self.source.clone(), self.db, options.scan.clone())
            .spawn(options.pipeline_depth);
        while let Some(key) = keys.recv().await {
            let unit = pool.acquire().await;
            let counters = Arc::clone(&copy);
            let db = self.db;
            tokio::spawn(async move {
                match unit.copy.copy(&key).await {
                    Ok(_) => {
                        counters.done.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) if err.is_benign() => {
                        debug!(db, key = %key, "key vanished during copy");
                    }
                    Err(err) => {
                        warn!(db, key = %key, kind = ?err.kind(), error = %err, "copy failed");
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                drop(unit);
            });
        }
        pool.drain().await;
        let source_scan = join_scan(self.db, scan).await;

        let prune = Arc::new(PhaseCounters::default());
        let (mut keys, scan) = KeyScanner::new(self.dest.clone(), self.db, options.scan.clone())
            .spawn(options.pipeline_depth);
        while let Some(key) = keys.recv().await {
            let unit = pool.acquire().await;
            let counters = Arc::clone(&prune);
            let db = self.db;
            tokio::spawn(async move {
                match unit.prune.prune(&key).await {
                    Ok(true) => {
                        counters.done.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(db, key = %key, error = %err, "prune check failed; key kept");
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                drop(unit);
            });
        }
        pool.drain().await;
        let dest_scan = join_scan(self.db, scan).await;
        drop(pool.take_idle());

        RoundOutcome {
            copied: copy.done.load(Ordering::Relaxed),
            pruned: prune.done.load(Ordering::Relaxed),
            failed: copy.failed.load(Ordering::Relaxed) + prune.failed.load(Ordering::Relaxed),
            source_scan_complete: source_scan,
            dest_scan_complete: dest_scan,
        }
    }
}

async fn join_scan(db: u64, scan: JoinHandle<ScanSummary>) -> bool {
    match scan.await {
        Ok(summary) => summary.complete,
        Err(err) => {
            error!(db, error = %err, "scanner task failed");
            false
        }
    }
}

async fn idle(backoff: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(backoff) => {}
        changed = shutdown.changed() => {
            if changed.is_err() {
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Mirror every database of `source` into `dest`.
///
/// Each database gets its own pair of clients and its own round loop; all loops
/// run concurrently. Returns once every loop finished its rounds or observed
/// `shutdown`.
pub async fn sync<S, D>(
    source: &S,
    dest: &D,
    options: SyncOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<SyncReport, Error>
where
    S: Connector,
    D: Connector,
{
    options.validate()?;
    let database_count =
        resolve_database_count(source, options.database_count, options.timeout).await?;
    info!(
        source = %source.describe(),
        dest = %dest.describe(),
        databases = database_count,
        "starting synchronizer"
    );

    let options = Arc::new(options);
    let mut workers = Vec::new();
    for db in 0..database_count {
        let source_store = source.connect(db).await?;
        let dest_store = dest.connect(db).await?;
        workers.push(SyncWorker::new(db, source_store, dest_store, Arc::clone(&options)));
    }

    let mut loops = JoinSet::new();
    for worker in workers {
        loops.spawn(worker.run(shutdown.clone()));
    }

    let mut report = SyncReport::default();
    while let Some(joined) = loops.join_next().await {
        let totals = joined.map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("sync loop failed")
                .with_source(err)
        })?;
        report.databases.push(totals);
    }
    report.databases.sort_by_key(|totals| totals.db);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::{SyncOptions, SyncWorker, sync};
    use crate::core::cursor::ScanOptions;
    use crate::engine::transfer::WritePolicy;
    use crate::store::memory::{FailOp, MemoryServer};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    fn options(rounds: u64) -> SyncOptions {
        SyncOptions {
            threads: 3,
            rounds,
            scan: ScanOptions {
                count: 5,
                ..ScanOptions::default()
            },
            idle_backoff: Duration::from_millis(10),
            ..SyncOptions::default()
        }
    }

    #[tokio::test]
    async fn one_round_makes_destination_equal_source() {
        let source = MemoryServer::new(1);
        let dest = MemoryServer::new(1);
        for i in 0..30 {
            source.insert(0, &format!("s{i}"), vec![i as u8], None);
        }
        for i in 0..12 {
            dest.insert(0, &format!("d{i}"), b"stale".to_vec(), None);
        }
        dest.insert(0, "s3", b"old".to_vec(), None);

        let worker = SyncWorker::new(0, source.store(0), dest.store(0), Arc::new(options(1)));
        let outcome = worker.round().await;
        assert_eq!(outcome.copied, 30);
        assert_eq!(outcome.pruned, 12);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.source_scan_complete && outcome.dest_scan_complete);
        assert_eq!(dest.keys(0), source.keys(0));
        assert_eq!(dest.get(0, "s3"), Some(vec![3u8]));
    }

    #[tokio::test]
    async fn failed_prune_check_keeps_key_for_next_round() {
        let source = MemoryServer::new(1);
        let dest = MemoryServer::new(1);
        dest.insert(0, "orphan", b"x".to_vec(), None);
        source.fail(0, "orphan", FailOp::Exists);

        let worker = SyncWorker::new(0, source.store(0), dest.store(0), Arc::new(options(1)));
        let outcome = worker.round().await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(dest.keys(0), vec!["orphan".to_string()]);

        source.heal(0, "orphan", FailOp::Exists);
        let outcome = worker.round().await;
        assert_eq!(outcome.pruned, 1);
        assert!(dest.keys(0).is_empty());
    }

    #[tokio::test]
    async fn round_limit_is_honored_per_database() {
        let source = MemoryServer::new(2);
        let dest = MemoryServer::new(2);
        source.insert(0, "a", b"1".to_vec(), None);
        source.insert(1, "b", b"2".to_vec(), Some(Duration::from_secs(60)));
        let (_tx, rx) = watch::channel(false);

        let report = sync(&source.connector(), &dest.connector(), options(3), rx)
            .await
            .expect("sync");
        assert_eq!(report.databases.len(), 2);
        for totals in &report.databases {
            assert_eq!(totals.rounds, 3);
            assert_eq!(totals.copied, 3);
        }
        assert_eq!(dest.get(1, "b"), Some(b"2".to_vec()));
        assert!(dest.ttl_of(1, "b").is_some());
    }

    #[tokio::test]
    async fn endless_sync_stops_on_shutdown() {
        let source = MemoryServer::new(1);
        let dest = MemoryServer::new(1);
        let (tx, rx) = watch::channel(false);
        let handle = {
            let source = source.connector();
            let dest = dest.connector();
            tokio::spawn(async move { sync(&source, &dest, options(0), rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.insert(0, "late", b"1".to_vec(), None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).expect("signal");

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("stopped")
            .expect("join")
            .expect("sync");
        assert!(report.databases[0].rounds >= 1);
        assert_eq!(dest.get(0, "late"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn delete_then_write_policy_converges_too() {
        let source = MemoryServer::new(1);
        let dest = MemoryServer::new(1);
        source.insert(0, "k", b"new".to_vec(), None);
        dest.insert(0, "k", b"old".to_vec(), None);
        let options = SyncOptions {
            write_policy: WritePolicy::DeleteThenWrite,
            ..options(1)
        };
        let worker = SyncWorker::new(0, source.store(0), dest.store(0), Arc::new(options));
        let outcome = worker.round().await;
        assert_eq!(outcome.copied, 1);
        assert_eq!(dest.get(0, "k"), Some(b"new".to_vec()));
    }
}
