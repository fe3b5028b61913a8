//! Purpose: `ringlogd` entry point: parse flags, optionally daemonize, run the log server.
//! Role: Binary crate root; wires SIGINT/SIGTERM into an orderly shutdown.
//! Invariants: A clean shutdown prints one JSON summary line on stdout.
//! Invariants: Errors are emitted as JSON on stderr when stderr is not a terminal.
//! Invariants: Process exit code is derived from `to_exit_code`.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use ringlog::core::backing::{BackendConfig, DEFAULT_DATA_FILE};
use ringlog::core::error::{Error, ErrorKind, to_exit_code};
use ringlog::server::config::{
    DEFAULT_MAX_RECORD_LEN, DEFAULT_PORT, DEFAULT_READ_CHUNK, DEFAULT_SHUTDOWN_GRACE,
};
use ringlog::server::{ServerConfig, ServerSummary, start};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Memory,
    File,
}

#[derive(Parser, Debug)]
#[command(
    name = "ringlogd",
    version,
    about = "Bounded ring-buffer log server",
    long_about = None,
    after_help = r#"EXAMPLES
  $ ringlogd --port 9000 --capacity 10
  $ printf 'hello\n' | nc -q1 localhost 9000     # prints the whole retained log
  $ ringlogd -d --backend file --data-file /var/tmp/aesdsocketdata"#
)]
struct Cli {
    #[arg(short = 'd', long, help = "Detach and run in the background")]
    daemon: bool,
    #[arg(long, default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED), help = "Address to listen on")]
    bind: IpAddr,
    #[arg(long, default_value_t = DEFAULT_PORT, help = "TCP port to listen on")]
    port: u16,
    #[arg(long, default_value_t = ringlog::core::ring::DEFAULT_CAPACITY, help = "Records retained before the oldest is evicted")]
    capacity: usize,
    #[arg(
        long,
        default_value = "\\n",
        value_parser = parse_terminator,
        help = "Record terminator: one character, an escape (\\n, \\r, \\0, \\t), or 0xNN"
    )]
    terminator: u8,
    #[arg(long, default_value_t = 10, help = "Seconds between timestamp records")]
    interval_secs: u64,
    #[arg(long, value_enum, default_value = "memory", help = "Where the retained log is mirrored")]
    backend: Backend,
    #[arg(long, default_value = DEFAULT_DATA_FILE, help = "Mirror file for --backend file")]
    data_file: PathBuf,
    #[arg(long, help = "Keep the mirror file after shutdown")]
    keep_data_file: bool,
    #[arg(long, default_value_t = DEFAULT_MAX_RECORD_LEN, help = "Largest accepted record in bytes")]
    max_record_len: usize,
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE.as_millis() as u64, help = "How long shutdown waits for sessions")]
    shutdown_grace_ms: u64,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let backend = match self.backend {
            Backend::Memory => BackendConfig::Memory,
            Backend::File => BackendConfig::File {
                path: self.data_file.clone(),
                keep: self.keep_data_file,
            },
        };
        ServerConfig {
            bind: SocketAddr::new(self.bind, self.port),
            capacity: self.capacity,
            terminator: self.terminator,
            interval: Duration::from_secs(self.interval_secs),
            backend,
            read_chunk: DEFAULT_READ_CHUNK,
            max_record_len: self.max_record_len,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                return Ok(0);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `ringlogd --help` for the list of flags."));
            }
        },
    };
    let config = cli.server_config();
    ringlog::server::validate_config(&config)?;

    if cli.daemon {
        daemonize()?;
    }
    init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start async runtime")
                .with_source(err)
        })?;
    let summary = runtime.block_on(start(config, shutdown_signal()))?;
    emit_summary(&summary);
    Ok(0)
}

/// Forks into the background before any runtime threads exist.
fn daemonize() -> Result<(), Error> {
    let rc = unsafe { libc::daemon(0, 0) };
    if rc != 0 {
        return Err(Error::new(ErrorKind::Internal)
            .with_message("failed to daemonize")
            .with_source(io::Error::last_os_error()));
    }
    Ok(())
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
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn parse_terminator(value: &str) -> Result<u8, String> {
    match value {
        "\\n" => return Ok(b'\n'),
        "\\r" => return Ok(b'\r'),
        "\\t" => return Ok(b'\t'),
        "\\0" => return Ok(0),
        _ => {}
    }
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        return u8::from_str_radix(hex, 16).map_err(|_| format!("invalid hex byte: {value}"));
    }
    match value.as_bytes() {
        [byte] => Ok(*byte),
        _ => Err(format!(
            "terminator must be a single byte, an escape like \\n, or 0xNN (got {value:?})"
        )),
    }
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let line = rendered
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("invalid arguments");
    line.trim_start_matches("error:").trim().to_string()
}

fn emit_summary(summary: &ServerSummary) {
    let value = json!({ "summary": summary });
    println!("{value}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
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
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Protocol => "protocol violation".to_string(),
        ErrorKind::Exhausted => "store cannot accept more data".to_string(),
        ErrorKind::Closed => "store is closed".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = StdError::source(err);
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
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}
