//! Purpose: Track in-flight session tasks so shutdown can join or abort every one of them.
//! Exports: `SessionRegistry`, `SessionEntry`, `Joined`, `DrainReport`.
//! Role: Owned by the supervisor; replaces manual session bookkeeping with a `JoinSet`.
//! Invariants: An entry exists from spawn until its task has been joined.
//! Invariants: `drain` waits at most `grace`, then aborts and joins whatever is left.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::task::{self, JoinError, JoinSet};
use tracing::{error, warn};

use crate::core::error::{Error, ErrorKind};
use crate::server::session::{SessionId, SessionOutcome, SessionState};

#[derive(Debug)]
pub struct SessionEntry {
    pub peer: String,
    pub started: Instant,
    task: task::Id,
    complete: Arc<AtomicBool>,
}

impl SessionEntry {
    /// Set once the session future has returned, even before the task is joined.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

/// A joined task. `result` is `Err` only for fatal session errors, panics, or aborts.
#[derive(Debug)]
pub struct Joined {
    pub id: SessionId,
    pub peer: String,
    pub elapsed: Duration,
    pub result: Result<SessionOutcome, Error>,
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub joined: usize,
    pub aborted: usize,
    pub fatal: Option<Error>,
}

impl DrainReport {
    fn tally(&mut self, result: Result<SessionOutcome, Error>) {
        match result {
            Err(err) if err.kind() == ErrorKind::Closed => self.aborted += 1,
            Err(err) if err.is_fatal() => {
                self.joined += 1;
                if self.fatal.is_none() {
                    self.fatal = Some(err);
                }
            }
            _ => self.joined += 1,
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    next_id: SessionId,
    tasks: JoinSet<(SessionId, Result<SessionOutcome, Error>)>,
    entries: HashMap<SessionId, SessionEntry>,
    started: u64,
    failed: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the future built for the next session id and records it.
    pub fn spawn<F, Fut>(&mut self, peer: impl Into<String>, make: F) -> SessionId
    where
        F: FnOnce(SessionId) -> Fut,
        Fut: Future<Output = Result<SessionOutcome, Error>> + Send + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;
        let complete = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&complete);
        let session = make(id);
        let handle = self.tasks.spawn(async move {
            let result = session.await;
            done.store(true, Ordering::Release);
            (id, result)
        });
        self.entries.insert(
            id,
            SessionEntry {
                peer: peer.into(),
                started: Instant::now(),
                task: handle.id(),
                complete,
            },
        );
        self.started += 1;
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionEntry> {
        self.entries.get(&id)
    }

    pub fn started(&self) -> u64 {
        self.started
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Waits for the next task to finish. Pending forever when nothing is tracked, so it can sit
    /// in a `select!` next to the accept loop.
    pub async fn join_next(&mut self) -> Joined {
        loop {
            match self.tasks.join_next_with_id().await {
                Some(joined) => return self.settle(joined),
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Joins, within `grace`, every task that was already spawned; aborts the stragglers.
    pub async fn drain(&mut self, grace: Duration) -> DrainReport {
        let mut report = DrainReport::default();
        let deadline = tokio::time::Instant::now() + grace;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next_with_id()).await {
                Ok(Some(joined)) => report.tally(self.settle(joined).result),
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = self.tasks.len(), "sessions did not close in time; aborting");
                    self.tasks.abort_all();
                    // Tasks that were mid-poll may still finish with their own result.
                    while let Some(joined) = self.tasks.join_next_with_id().await {
                        report.tally(self.settle(joined).result);
                    }
                }
            }
        }
        report
    }

    fn settle(
        &mut self,
        joined: Result<(task::Id, (SessionId, Result<SessionOutcome, Error>)), JoinError>,
    ) -> Joined {
        let (id, result) = match joined {
            Ok((_, (id, result))) => (id, result),
            Err(err) => {
                let id = self.id_for_task(err.id());
                let kind = if err.is_cancelled() {
                    ErrorKind::Closed
                } else {
                    error!(session = id, "session task panicked");
                    ErrorKind::Protocol
                };
                (
                    id,
                    Err(Error::new(kind)
                        .with_message("session task did not run to completion")
                        .with_source(err)),
                )
            }
        };
        let (peer, elapsed) = self
            .entries
            .remove(&id)
            .map(|entry| (entry.peer, entry.started.elapsed()))
            .unwrap_or_default();
        let failed = match &result {
            Ok(outcome) => outcome.state == SessionState::Failed,
            Err(_) => true,
        };
        if failed {
            self.failed += 1;
        }
        Joined {
            id,
            peer,
            elapsed,
            result,
        }
    }

    fn id_for_task(&self, task: task::Id) -> SessionId {
        self.entries
            .iter()
            .find_map(|(id, entry)| (entry.task == task).then_some(*id))
            .unwrap_or_default()
    }
}
