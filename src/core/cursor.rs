// Cursor-driven keyspace enumeration feeding a bounded key pipeline.
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{Store, with_timeout};

/// Pipeline depth used when the caller does not pick one.
pub const DEFAULT_PIPELINE_DEPTH: usize = 1024;

#[derive(Clone, Debug)]
pub struct ScanOptions {
    /// `SCAN MATCH` pattern; `None` enumerates everything.
    pub pattern: Option<String>,
    /// Per-call batch size hint.
    pub count: usize,
    /// Bound on each scan call.
    pub timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            pattern: None,
            count: 100,
            timeout: Duration::from_secs(30),
        }
    }
}

/// How one enumeration pass ended.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScanSummary {
    pub batches: u64,
    pub keys: u64,
    /// `false` when the pass stopped before the store returned cursor 0.
    pub complete: bool,
}

/// One pass over a logical database, starting at cursor 0.
///
/// Every key is pushed into the pipeline in store order. The sender is
/// dropped when the pass ends, whether it finished or failed, so receivers
/// see the closed channel as the only end-of-scan signal.
pub struct KeyScanner<S> {
    store: S,
    db: u64,
    options: ScanOptions,
}

impl<S: Store> KeyScanner<S> {
    pub fn new(store: S, db: u64, options: ScanOptions) -> Self {
        Self { store, db, options }
    }

    /// Start the pass on its own task and hand back the consuming end.
    pub fn spawn(self, depth: usize) -> (mpsc::Receiver<String>, JoinHandle<ScanSummary>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let handle = tokio::spawn(self.run(tx));
        (rx, handle)
    }

    pub async fn run(self, tx: mpsc::Sender<String>) -> ScanSummary {
        let mut summary = ScanSummary::default();
        let mut cursor = 0u64;
        loop {
            let call = self
                .store
                .scan(cursor, self.options.pattern.as_deref(), self.options.count);
            let page = match with_timeout(self.options.timeout, "SCAN", call).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        db = self.db,
                        cursor,
                        error = %err,
                        "scan failed; enumeration is partial"
                    );
                    return summary;
                }
            };
            summary.batches += 1;
            for key in page.keys {
                if tx.send(key).await.is_err() {
                    debug!(db = self.db, "key pipeline closed by consumer");
                    return summary;
                }
                summary.keys += 1;
            }
            if page.next_cursor == 0 {
                summary.complete = true;
                return summary;
            }
            cursor = page.next_cursor;
        }
    }
}
