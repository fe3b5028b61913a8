//! Purpose: Runtime configuration for the log server and its validation rules.
//! Exports: `ServerConfig`, `validate_config`, default constants.
//! Role: Single source of defaults shared by the binary and tests.
//! Invariants: Defaults are port 9000, 10 records, `\n` terminator and a 10 s timer.
//! Invariants: Every zero-valued limit is rejected as a usage error before anything is bound.
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::core::backing::BackendConfig;
use crate::core::error::{Error, ErrorKind};
use crate::core::ring::DEFAULT_CAPACITY;

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_TERMINATOR: u8 = b'\n';
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_CHUNK: usize = 1024;
pub const DEFAULT_MAX_RECORD_LEN: usize = 16 * 1024 * 1024;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub capacity: usize,
    pub terminator: u8,
    pub interval: Duration,
    pub backend: BackendConfig,
    pub read_chunk: usize,
    pub max_record_len: usize,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_PORT),
            capacity: DEFAULT_CAPACITY,
            terminator: DEFAULT_TERMINATOR,
            interval: DEFAULT_INTERVAL,
            backend: BackendConfig::Memory,
            read_chunk: DEFAULT_READ_CHUNK,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Error> {
    if config.capacity == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--capacity must be greater than zero")
            .with_hint("Use a positive value like 10."));
    }
    if config.interval.is_zero() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--interval-secs must be greater than zero")
            .with_hint("Use a positive value like 10."));
    }
    if config.read_chunk == 0 {
        return Err(
            Error::new(ErrorKind::Usage).with_message("read chunk must be greater than zero")
        );
    }
    if config.max_record_len == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-record-len must be greater than zero")
            .with_hint("Use a positive value like 16777216."));
    }
    if let BackendConfig::File { path, .. } = &config.backend {
        if path.as_os_str().is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("--data-file must not be empty")
                .with_hint("Pass a path like /var/tmp/aesdsocketdata."));
        }
    }
    Ok(())
}
