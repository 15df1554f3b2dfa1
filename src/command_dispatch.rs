//! Purpose: Hold top-level CLI command dispatch for `keyferry`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Store addresses are validated before any connection is attempted.
//! Invariants: Each command prints exactly one report line on success.

use super::*;

use keyferry::api::{
    DumpOptions, Endpoint, RedisConnector, RestoreOptions, ScanOptions, SyncOptions, dump,
    restore, sync,
};
use keyferry::engine::default_threads;
use tokio::io::{AsyncBufRead, BufReader, BufWriter};
use tokio::sync::watch;
use tracing::info;

pub(super) fn dispatch_command(
    command: Command,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;

    let report = match command {
        Command::Dump(args) => runtime.block_on(run_dump(args))?,
        Command::Restore(args) => runtime.block_on(run_restore(args))?,
        Command::Sync(args) => runtime.block_on(run_sync(args))?,
    };
    emit_json(report, color_mode);
    Ok(RunOutcome::ok())
}

fn connector(
    host: &str,
    password: Option<String>,
    timeout: &TimeoutArgs,
) -> Result<RedisConnector, Error> {
    let endpoint = Endpoint::new(host, password);
    endpoint.url(0)?;
    Ok(RedisConnector::new(endpoint, timeout.duration()))
}

fn scan_options(scan: ScanArgs, timeout: &TimeoutArgs) -> ScanOptions {
    ScanOptions {
        pattern: scan.pattern,
        count: scan.scan_count,
        timeout: timeout.duration(),
    }
}

async fn run_dump(args: DumpArgs) -> Result<Value, Error> {
    let connector = connector(&args.store.host, args.store.password, &args.timeout)?;
    let options = DumpOptions {
        database_count: args.database_count,
        threads: args.threads.unwrap_or_else(default_threads),
        scan: scan_options(args.scan, &args.timeout),
        timeout: args.timeout.duration(),
        errors: args.errors.into(),
        ..DumpOptions::default()
    };
    options.validate()?;

    let file = tokio::fs::File::create(&args.output).await.map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create dump output")
            .with_path(&args.output)
            .with_source(err)
    })?;
    info!(
        addr = %connector.endpoint().redacted(),
        output = %args.output.display(),
        "starting dump"
    );
    let (report, _output) = dump(&connector, BufWriter::new(file), &options).await?;
    report_json("dump", &report)
}

async fn run_restore(args: RestoreArgs) -> Result<Value, Error> {
    let connector = connector(&args.store.host, args.store.password, &args.timeout)?;
    let options = RestoreOptions {
        write_policy: args.write_policy.into(),
        timeout: args.timeout.duration(),
        ..RestoreOptions::default()
    };
    options.validate()?;

    let input = open_restore_input(&args.input).await?;
    info!(addr = %connector.endpoint().redacted(), input = %args.input, "starting restore");
    let report = restore(&connector, input, &options).await?;
    report_json("restore", &report)
}

async fn open_restore_input(input: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>, Error> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let path = PathBuf::from(input);
    let file = tokio::fs::File::open(&path).await.map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to open restore input")
            .with_path(&path)
            .with_hint("Check the --input path, or pass `-` to read from stdin.")
            .with_source(err)
    })?;
    Ok(Box::new(BufReader::new(file)))
}

async fn run_sync(args: SyncArgs) -> Result<Value, Error> {
    let source = connector(&args.source_host, args.source_password, &args.timeout)?;
    let dest = connector(&args.dest_host, args.dest_password, &args.timeout)?;
    let options = SyncOptions {
        database_count: args.database_count,
        threads: args.threads.unwrap_or_else(default_threads),
        rounds: args.rounds,
        write_policy: args.write_policy.into(),
        scan: scan_options(args.scan, &args.timeout),
        timeout: args.timeout.duration(),
        idle_backoff: Duration::from_millis(args.idle_backoff_ms),
        ..SyncOptions::default()
    };
    options.validate()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let watcher = tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested; finishing current rounds");
        let _ = stop_tx.send(true);
    });
    let result = sync(&source, &dest, options, stop_rx).await;
    watcher.abort();
    report_json("sync", &result?)
}
