//! Purpose: Own the store guard, session registry, and injector; accept and supervise sessions.
//! Exports: `Server`, `Supervisor`, `ShutdownHandle`, `ServerSummary`.
//! Role: Control surface for the binary (`Server::bind` + `run`, `request_shutdown`).
//! Invariants: After shutdown is requested no connection is accepted and no timer fires.
//! Invariants: Shutdown waits at most `shutdown_grace` for sessions, then aborts them.
//! Invariants: The guard is closed only after every session and the injector have stopped.
//! Notes: A fatal session or injector error triggers the same orderly shutdown, then `run`
//! returns that error.
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::backing::{BackendConfig, open_backing};
use crate::core::error::{Error, ErrorKind};
use crate::core::guard::{GuardStats, StoreGuard};
use crate::core::ring::CircularStore;
use crate::server::config::{ServerConfig, validate_config};
use crate::server::injector::Injector;
use crate::server::registry::{Joined, SessionRegistry};
use crate::server::session::{Session, SessionId, SessionSettings, SessionState};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Cloneable trigger for an orderly shutdown.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn request_shutdown(&self) {
        self.tx.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves once shutdown is requested or the handle is gone. Yields `()` so no `watch::Ref`
/// is held by the caller's `select!` output.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServerSummary {
    pub sessions_started: u64,
    pub sessions_failed: u64,
    pub sessions_aborted: usize,
    pub injected: u64,
    pub store: GuardStats,
}

/// Session and injector supervision, independent of the transport.
pub struct Supervisor {
    guard: Arc<StoreGuard>,
    registry: SessionRegistry,
    injector: Option<JoinHandle<Result<u64, Error>>>,
    injected: u64,
    settings: SessionSettings,
    shutdown: ShutdownHandle,
    grace: Duration,
}

impl Supervisor {
    /// Starts the injector; must be called inside a tokio runtime.
    pub fn new(config: &ServerConfig, guard: Arc<StoreGuard>, shutdown: ShutdownHandle) -> Self {
        let injector = Injector::new(
            Arc::clone(&guard),
            config.interval,
            config.terminator,
            shutdown.subscribe(),
        );
        Self {
            guard,
            registry: SessionRegistry::new(),
            injector: Some(tokio::spawn(injector.run())),
            injected: 0,
            settings: SessionSettings {
                terminator: config.terminator,
                read_chunk: config.read_chunk,
                max_record_len: config.max_record_len,
            },
            shutdown,
            grace: config.shutdown_grace,
        }
    }

    pub fn guard(&self) -> &Arc<StoreGuard> {
        &self.guard
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Hands one accepted connection to a new session task.
    pub fn spawn_session<C>(&mut self, conn: C, peer: impl Into<String>) -> SessionId
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = peer.into();
        let guard = Arc::clone(&self.guard);
        let settings = self.settings;
        let shutdown = self.shutdown.subscribe();
        let label = peer.clone();
        let id = self.registry.spawn(peer.as_str(), move |id| {
            Session::new(id, label, conn, guard, settings, shutdown).run()
        });
        info!(session = id, peer = %peer, "accepted connection");
        id
    }

    /// Resolves with the first fatal error from a session or the injector. Non-fatal session
    /// completions are logged and reaped along the way.
    pub async fn next_fatal(&mut self) -> Error {
        loop {
            tokio::select! {
                result = wait_injector(&mut self.injector) => {
                    self.injector = None;
                    match result {
                        Ok(fired) => self.injected += fired,
                        Err(err) => return err,
                    }
                }
                joined = self.registry.join_next() => {
                    if let Some(err) = log_joined(joined) {
                        return err;
                    }
                }
            }
        }
    }

    /// Stops the injector and every session, then closes the guard.
    pub async fn shutdown(mut self) -> Result<ServerSummary, Error> {
        self.shutdown.request_shutdown();
        let mut fatal = None;

        if let Some(mut handle) = self.injector.take() {
            match tokio::time::timeout(self.grace, &mut handle).await {
                Ok(result) => match flatten(result) {
                    Ok(fired) => self.injected += fired,
                    Err(err) => fatal = Some(err),
                },
                Err(_) => {
                    warn!("injector did not stop in time; aborting");
                    handle.abort();
                }
            }
        }

        let report = self.registry.drain(self.grace).await;
        if fatal.is_none() {
            fatal = report.fatal;
        }

        let store = self.guard.close().await?;
        let summary = ServerSummary {
            sessions_started: self.registry.started(),
            sessions_failed: self.registry.failed(),
            sessions_aborted: report.aborted,
            injected: self.injected,
            store,
        };
        info!(
            sessions = summary.sessions_started,
            aborted = summary.sessions_aborted,
            records = store.records,
            "supervisor stopped"
        );
        match fatal {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

async fn wait_injector(
    injector: &mut Option<JoinHandle<Result<u64, Error>>>,
) -> Result<u64, Error> {
    match injector {
        Some(handle) => flatten(handle.await),
        None => std::future::pending().await,
    }
}

fn flatten(result: Result<Result<u64, Error>, tokio::task::JoinError>) -> Result<u64, Error> {
    result.map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("injector task did not run to completion")
            .with_source(err)
    })?
}

fn log_joined(joined: Joined) -> Option<Error> {
    let elapsed_ms = joined.elapsed.as_millis() as u64;
    match joined.result {
        Ok(outcome) if outcome.state == SessionState::Failed => {
            info!(
                session = joined.id,
                peer = %joined.peer,
                elapsed_ms,
                "session ended after failure"
            );
            None
        }
        Ok(outcome) => {
            debug!(session = joined.id, records = outcome.records, elapsed_ms, "session joined");
            None
        }
        Err(err) if err.is_fatal() => {
            error!(session = joined.id, peer = %joined.peer, error = %err, "fatal session error");
            Some(err)
        }
        Err(err) => {
            warn!(
                session = joined.id,
                peer = %joined.peer,
                error = %err,
                "session did not complete"
            );
            None
        }
    }
}

/// TCP front end around a `Supervisor`.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    guard: Arc<StoreGuard>,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Validates the config, opens the backing, and binds the listener. Nothing is served yet.
    pub async fn bind(config: ServerConfig) -> Result<Self, Error> {
        validate_config(&config)?;
        let store = CircularStore::new(config.capacity)?;
        let backing = open_backing(&config.backend)?;
        if let BackendConfig::File { path, .. } = &config.backend {
            info!(path = %path.display(), "mirroring log to file");
        }
        let listener = TcpListener::bind(config.bind).await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to bind {}", config.bind))
                .with_hint("Pick a free port with --port or a different --bind address.")
                .with_source(err)
        })?;
        Ok(Self {
            config,
            listener,
            guard: Arc::new(StoreGuard::new(store, backing)),
            shutdown: ShutdownHandle::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read listener address")
                .with_source(err)
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accepts connections until shutdown is requested or a fatal error occurs.
    pub async fn run(self) -> Result<ServerSummary, Error> {
        let Server {
            config,
            listener,
            guard,
            shutdown,
        } = self;
        info!(bind = %config.bind, capacity = config.capacity, "log server listening");
        let mut stop = shutdown.subscribe();
        let mut supervisor = Supervisor::new(&config, guard, shutdown);
        let mut fatal = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut stop) => {
                    info!("shutdown requested");
                    break;
                }
                err = supervisor.next_fatal() => {
                    fatal = Some(err);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        supervisor.spawn_session(stream, addr.to_string());
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
        drop(listener);

        let result = supervisor.shutdown().await;
        match fatal {
            Some(err) => Err(err),
            None => result,
        }
    }
}

/// Binds and serves until `shutdown` fires.
pub async fn start(
    config: ServerConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<ServerSummary, Error> {
    let server = Server::bind(config).await?;
    let handle = server.shutdown_handle();
    let run = server.run();
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => result,
        _ = shutdown => {
            handle.request_shutdown();
            run.await
        }
    }
}
