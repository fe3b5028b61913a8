//! Purpose: Timer task that appends a wall-clock timestamp record at a fixed interval.
//! Exports: `Injector`, `timestamp_record`.
//! Role: Competes with sessions for the same `StoreGuard`; commits exactly like a session.
//! Invariants: First firing happens one full interval after start; none after shutdown.
//! Invariants: Formatting or commit failures are fatal and end the task with an error.
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::core::error::{Error, ErrorKind};
use crate::core::guard::StoreGuard;
use crate::core::record::Record;
use crate::server::supervisor::shutdown_requested;

const PREFIX: &[u8] = b"timestamp:";

pub struct Injector {
    guard: Arc<StoreGuard>,
    interval: Duration,
    terminator: u8,
    shutdown: watch::Receiver<bool>,
}

impl Injector {
    pub fn new(
        guard: Arc<StoreGuard>,
        interval: Duration,
        terminator: u8,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            guard,
            interval,
            terminator,
            shutdown,
        }
    }

    /// Runs until shutdown; returns the number of records injected.
    pub async fn run(mut self) -> Result<u64, Error> {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fired = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => {
                    debug!(fired, "injector stopped");
                    return Ok(fired);
                }
                _ = ticker.tick() => {}
            }
            let record = timestamp_record(OffsetDateTime::now_utc(), self.terminator)?;
            let outcome = self
                .guard
                .commit(record)
                .await
                .map_err(Error::into_fatal)?;
            fired += 1;
            info!(evicted = outcome.evicted.is_some(), "injected timestamp record");
        }
    }
}

/// `timestamp:<RFC 2822 time><terminator>`.
pub fn timestamp_record(now: OffsetDateTime, terminator: u8) -> Result<Record, Error> {
    let stamp = now.format(&Rfc2822).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to format timestamp")
            .with_source(err)
    })?;
    let mut content = Vec::with_capacity(PREFIX.len() + stamp.len() + 1);
    content.extend_from_slice(PREFIX);
    content.extend_from_slice(stamp.as_bytes());
    content.push(terminator);
    Ok(Record::from(content))
}
