//! Purpose: `keyferry` CLI entry point.
//! Role: Binary crate root; parses args, runs one transfer mode, emits a JSON report on stdout.
//! Invariants: Logs go to stderr through `tracing`; stdout carries only the final report.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Per-key failures are reported in logs and counts, never in the exit code.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use keyferry::api::{Error, ErrorKind, ErrorPolicy, WritePolicy, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                return Ok(RunOutcome::ok());
            }
            _ => {
                let message = clap_error_summary(&err);
                let hint = clap_error_hint(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint(hint),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    command_dispatch::dispatch_command(cli.command, color_mode)
        .map_err(add_io_hint)
        .map_err(add_transport_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "keyferry",
    version,
    about = "Dump, restore, and live-sync Redis-compatible keyspaces",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Every logical database is copied key by key with DUMP/RESTORE, so values
keep their server-side encoding and TTLs survive the trip.

Mental model:
  - `dump` writes one JSON line per key to a file
  - `restore` replays such a file into a server
  - `sync` mirrors one live server into another, round after round
"#,
    after_help = r#"EXAMPLES
  $ keyferry dump --host 10.0.0.5:6379 --output prod.json
  $ keyferry restore --host 127.0.0.1:6380 --input prod.json
  $ keyferry sync --source-host 10.0.0.5:6379 --dest-host 10.0.0.6:6379 --rounds 0

LEARN MORE
  $ keyferry <command> --help
  Set RUST_LOG=debug for per-key diagnostics."#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        global = true,
        help = "Colorize diagnostics, pretty-print the report on a terminal: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ErrorPolicyCli {
    Stop,
    Skip,
}

impl From<ErrorPolicyCli> for ErrorPolicy {
    fn from(policy: ErrorPolicyCli) -> Self {
        match policy {
            ErrorPolicyCli::Stop => ErrorPolicy::Stop,
            ErrorPolicyCli::Skip => ErrorPolicy::Skip,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum WritePolicyCli {
    Replace,
    DeleteThenWrite,
}

impl From<WritePolicyCli> for WritePolicy {
    fn from(policy: WritePolicyCli) -> Self {
        match policy {
            WritePolicyCli::Replace => WritePolicy::Replace,
            WritePolicyCli::DeleteThenWrite => WritePolicy::DeleteThenWrite,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Dump every logical database to a JSON-lines file",
        long_about = r#"Scan each logical database and write one line per key:
{"db":0,"key":"...","value":"<base64 DUMP payload>","ttl":<seconds>}

Keys that vanish between scan and dump are skipped. Other per-key failures are
logged; with --errors stop (default) a failed key ends dispatch for its database,
and the remaining databases are still dumped."#,
        after_help = r#"EXAMPLES
  $ keyferry dump
  $ keyferry dump --host 10.0.0.5:6379 --password s3cret --output prod.json
  $ keyferry dump --match 'session:*' --threads 16 --errors skip"#
    )]
    Dump(DumpArgs),
    #[command(
        about = "Replay a JSON-lines dump into a server",
        long_about = r#"Read records line by line and RESTORE each into its logical database.

Undecodable lines are skipped and counted. The first failed write aborts the run."#,
        after_help = r#"EXAMPLES
  $ keyferry restore --input prod.json
  $ cat prod.json | keyferry restore --input - --host 127.0.0.1:6380
  $ keyferry restore --write-policy delete-then-write"#
    )]
    Restore(RestoreArgs),
    #[command(
        about = "Mirror a live source server into a destination server",
        long_about = r#"Each round copies every source key to the destination, then deletes
destination keys the source no longer has. Rounds repeat until --rounds is reached, or forever
with --rounds 0 (stop with Ctrl-C; the current round finishes first)."#,
        after_help = r#"EXAMPLES
  $ keyferry sync --source-host 10.0.0.5:6379 --dest-host 10.0.0.6:6379 --rounds 1
  $ keyferry sync --source-host a:6379 --dest-host b:6379 --rounds 0 --idle-backoff-ms 5000"#
    )]
    Sync(SyncArgs),
}

#[derive(Args)]
struct StoreArgs {
    #[arg(
        long,
        default_value = "127.0.0.1:6379",
        help = "Store address: host:port or redis://host:port"
    )]
    host: String,
    #[arg(long, env = "KEYFERRY_PASSWORD", hide_env_values = true, help = "Store password")]
    password: Option<String>,
}

#[derive(Args)]
struct TimeoutArgs {
    #[arg(long, default_value_t = 30_000, help = "Per-call store timeout in milliseconds")]
    timeout_ms: u64,
}

impl TimeoutArgs {
    fn duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Args)]
struct ScanArgs {
    #[arg(long = "match", value_name = "PATTERN", help = "Only transfer keys matching this glob")]
    pattern: Option<String>,
    #[arg(long, default_value_t = 100, help = "Keys requested per SCAN batch")]
    scan_count: usize,
}

#[derive(Args)]
struct DumpArgs {
    #[command(flatten)]
    store: StoreArgs,
    #[arg(
        long,
        default_value = "dump.json",
        value_hint = ValueHint::FilePath,
        help = "Output file"
    )]
    output: PathBuf,
    #[arg(long, default_value_t = 0, help = "Logical databases to dump (0 = ask the server)")]
    database_count: u64,
    #[arg(long, help = "Concurrent dump workers (default: CPU cores)")]
    threads: Option<usize>,
    #[command(flatten)]
    scan: ScanArgs,
    #[arg(
        long,
        default_value = "stop",
        value_enum,
        help = "After a failed key: stop dispatching or skip and continue"
    )]
    errors: ErrorPolicyCli,
    #[command(flatten)]
    timeout: TimeoutArgs,
}

#[derive(Args)]
struct RestoreArgs {
    #[command(flatten)]
    store: StoreArgs,
    #[arg(
        long,
        default_value = "dump.json",
        value_hint = ValueHint::FilePath,
        help = "Dump file to replay (`-` for stdin)"
    )]
    input: String,
    #[arg(long, default_value = "replace", value_enum, help = "How existing keys are overwritten")]
    write_policy: WritePolicyCli,
    #[command(flatten)]
    timeout: TimeoutArgs,
}

#[derive(Args)]
struct SyncArgs {
    #[arg(long, default_value = "127.0.0.1:6379", help = "Source store address")]
    source_host: String,
    #[arg(long, env = "KEYFERRY_SOURCE_PASSWORD", hide_env_values = true, help = "Source password")]
    source_password: Option<String>,
    #[arg(long, help = "Destination store address")]
    dest_host: String,
    #[arg(
        long,
        env = "KEYFERRY_DEST_PASSWORD",
        hide_env_values = true,
        help = "Destination password"
    )]
    dest_password: Option<String>,
    #[arg(long, default_value_t = 0, help = "Logical databases to sync (0 = ask the source)")]
    database_count: u64,
    #[arg(long, help = "Concurrent workers per database (default: CPU cores)")]
    threads: Option<usize>,
    #[arg(long, default_value_t = 1, help = "Rounds per database (0 = until interrupted)")]
    rounds: u64,
    #[arg(long, default_value = "replace", value_enum, help = "How existing keys are overwritten")]
    write_policy: WritePolicyCli,
    #[command(flatten)]
    scan: ScanArgs,
    #[arg(long, default_value_t = 1000, help = "Pause after a round that moved nothing")]
    idle_backoff_ms: u64,
    #[command(flatten)]
    timeout: TimeoutArgs,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    err.with_hint("I/O error. Check the path, permissions, and disk space.")
}

fn add_transport_hint(err: Error) -> Error {
    if !matches!(err.kind(), ErrorKind::Transport | ErrorKind::Timeout) || err.hint().is_some() {
        return err;
    }
    err.with_hint("Check that the server is reachable and the password is correct.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint("Unexpected internal failure. Retry with RUST_BACKTRACE=1 and report it.")
}

fn now_rfc3339() -> Result<String, Error> {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("time went backwards")
            .with_source(err)
    })?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128)
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("invalid timestamp")
                .with_source(err)
        })?;
    ts.format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("timestamp format failed")
            .with_source(err)
    })
}

/// Wrap a serialized report as `{"mode": ..., <report fields>, "finished_at": ...}`.
fn report_json(mode: &str, report: impl serde::Serialize) -> Result<Value, Error> {
    let value = serde_json::to_value(report).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("report encode failed")
            .with_source(err)
    })?;
    let mut outer = Map::new();
    outer.insert("mode".to_string(), json!(mode));
    if let Value::Object(fields) = value {
        outer.extend(fields);
    }
    outer.insert("finished_at".to_string(), json!(now_rfc3339()?));
    Ok(Value::Object(outer))
}

/// The report is indented only for a terminal; color never applies to it.
fn pretty_report(color_mode: ColorMode, is_tty: bool) -> bool {
    is_tty && color_mode.use_color(is_tty)
}

fn emit_json(value: Value, color_mode: ColorMode) {
    let json = if pretty_report(color_mode, io::stdout().is_terminal()) {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::NotFound => "not found",
        ErrorKind::Io => "i/o error",
        ErrorKind::Transport => "store call failed",
        ErrorKind::Timeout => "store call timed out",
        ErrorKind::Decode => "record could not be decoded",
        ErrorKind::SerializeFetch => "could not fetch serialized value",
        ErrorKind::TtlFetch => "could not fetch ttl",
        ErrorKind::RestoreApply => "restore failed",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(db) = err.db() {
        inner.insert("db".to_string(), json!(db));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(record) = err.record() {
        inner.insert("ttl".to_string(), json!(record.ttl_seconds));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(db) = err.db() {
        lines.push(format!(
            "{} {db}",
            colorize_label("db:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(key) = err.key() {
        lines.push(format!(
            "{} {key}",
            colorize_label("key:", use_color, AnsiColor::Yellow)
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `keyferry --help`.".to_string();
    };
    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "keyferry") else {
        return "Try `keyferry --help`.".to_string();
    };
    match tokens.get(pos + 1) {
        Some(command) if !command.starts_with(['-', '<', '[']) => {
            format!("Try `keyferry {command} --help`.")
        }
        _ => "Try `keyferry --help`.".to_string(),
    }
}
