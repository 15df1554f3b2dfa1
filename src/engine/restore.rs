//! Purpose: Replay a newline-delimited JSON dump into a store, one record at a time.
//! Exports: `RestoreOptions`, `RestoreReport`, `restore`.
//! Role: Sequential reader; destination clients are opened lazily and cached per database.
//! Invariants: Undecodable lines are skipped with a log line and never counted as restored.
//! Invariants: The first failed write aborts the run; nothing after it is applied.
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::engine::require_positive;
use crate::engine::transfer::{RestoreUnit, WritePolicy};
use crate::store::Connector;

#[derive(Clone, Debug)]
pub struct RestoreOptions {
    pub write_policy: WritePolicy,
    pub timeout: Duration,
    pub report_every: u64,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            write_policy: WritePolicy::Replace,
            timeout: Duration::from_secs(30),
            report_every: 1000,
        }
    }
}

impl RestoreOptions {
    pub fn validate(&self) -> Result<(), Error> {
        require_positive(self.timeout.as_millis() as u64, "--timeout-ms", "30000")?;
        require_positive(self.report_every, "report interval", "1000")?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: u64,
    /// Lines that could not be decoded.
    pub skipped_lines: u64,
    /// Databases that received at least one record, ascending.
    pub databases: Vec<u64>,
}

/// Replay every record in `input` through `connector`.
///
/// Returns the first `RestoreApply` error when a write fails; the records
/// restored before it stay in place.
pub async fn restore<C, R>(
    connector: &C,
    input: R,
    options: &RestoreOptions,
) -> Result<RestoreReport, Error>
where
    C: Connector,
    R: AsyncBufRead + Unpin,
{
    options.validate()?;
    let mut input = input;
    let mut report = RestoreReport::default();
    let mut units: BTreeMap<u64, RestoreUnit<C::Store>> = BTreeMap::new();
    let mut buf = Vec::new();
    let mut line_no = 0u64;

    loop {
        buf.clear();
        let read = input.read_until(b'\n', &mut buf).await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read restore input")
                .with_source(err)
        })?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let record = match decode_line(&buf) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(err) => {
                warn!(line = line_no, error = %err, "skipping undecodable line");
                report.skipped_lines += 1;
                continue;
            }
        };

        let unit = match units.entry(record.db) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let store = connector.connect(record.db).await?;
                entry.insert(RestoreUnit::new(store, options.write_policy, options.timeout))
            }
        };

        if let Err(err) = unit.apply(&record).await {
            error!(
                line = line_no,
                db = record.db,
                key = %record.key,
                ttl = record.ttl_seconds,
                error = %err,
                "restore failed; aborting"
            );
            info!(restored = report.restored, "restore aborted");
            return Err(err);
        }

        report.restored += 1;
        if report.restored % options.report_every == 0 {
            info!(restored = report.restored, "restore progress");
        }
    }

    report.databases = units.keys().copied().collect();
    info!(
        restored = report.restored,
        skipped_lines = report.skipped_lines,
        "restore finished"
    );
    Ok(report)
}

/// `Ok(None)` for blank lines.
fn decode_line(raw: &[u8]) -> Result<Option<Record>, Error> {
    let text = std::str::from_utf8(raw).map_err(|err| {
        Error::new(ErrorKind::Decode)
            .with_message("line is not valid UTF-8")
            .with_source(err)
    })?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    Record::from_json_line(text).map(Some)
}
