//! Purpose: Per-connection handler: accumulate bytes into records, commit, replay the log.
//! Exports: `Session`, `SessionSettings`, `SessionState`, `SessionOutcome`, `SessionId`.
//! Role: One task per accepted connection; talks to other sessions only through `StoreGuard`.
//! Invariants: Bytes after a terminator stay buffered and start the next record; none are dropped.
//! Invariants: A partial record at peer EOF or shutdown is discarded, never committed.
//! Invariants: The replay written back reflects the store right after this session's commit.
//! Invariants: Local failures end only this session; fatal store errors are returned to the caller.
use std::io;
use std::sync::Arc;

use bstr::ByteSlice;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::guard::{Replay, StoreGuard};
use crate::core::record::Record;
use crate::server::supervisor::shutdown_requested;

pub type SessionId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Receiving,
    Committing,
    Replaying,
    Closed,
    Failed,
}

#[derive(Clone, Copy, Debug)]
pub struct SessionSettings {
    pub terminator: u8,
    pub read_chunk: usize,
    pub max_record_len: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub records: u64,
    pub replayed_bytes: u64,
}

enum Fill {
    Data,
    Eof,
    Shutdown,
}

pub struct Session<C> {
    id: SessionId,
    peer: String,
    conn: C,
    guard: Arc<StoreGuard>,
    settings: SessionSettings,
    shutdown: watch::Receiver<bool>,
    buf: BytesMut,
    scanned: usize,
    state: SessionState,
    records: u64,
    replayed_bytes: u64,
}

impl<C> Session<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: SessionId,
        peer: impl Into<String>,
        conn: C,
        guard: Arc<StoreGuard>,
        settings: SessionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            conn,
            guard,
            settings,
            shutdown,
            buf: BytesMut::with_capacity(settings.read_chunk),
            scanned: 0,
            state: SessionState::Receiving,
            records: 0,
            replayed_bytes: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serves the connection until EOF, shutdown, or failure. Only fatal errors are returned.
    pub async fn run(mut self) -> Result<SessionOutcome, Error> {
        let result = self.drive().await;
        match result {
            Ok(()) => {
                self.state = SessionState::Closed;
                let _ = self.conn.shutdown().await;
                info!(
                    session = self.id,
                    peer = %self.peer,
                    records = self.records,
                    "closed connection"
                );
            }
            Err(err) if err.is_fatal() => {
                self.state = SessionState::Failed;
                return Err(err);
            }
            Err(err) => {
                self.state = SessionState::Failed;
                warn!(session = self.id, peer = %self.peer, error = %err, "session failed");
            }
        }
        Ok(SessionOutcome {
            state: self.state,
            records: self.records,
            replayed_bytes: self.replayed_bytes,
        })
    }

    async fn drive(&mut self) -> Result<(), Error> {
        loop {
            while let Some(record) = self.take_record()? {
                if !self.commit_and_replay(record).await? {
                    return Ok(());
                }
            }
            self.state = SessionState::Receiving;
            match self.fill().await? {
                Fill::Data => {}
                Fill::Eof => {
                    if !self.buf.is_empty() {
                        debug!(
                            session = self.id,
                            discarded = self.buf.len(),
                            "peer closed with an unterminated record"
                        );
                    }
                    return Ok(());
                }
                Fill::Shutdown => {
                    debug!(session = self.id, "shutdown requested while receiving");
                    return Ok(());
                }
            }
        }
    }

    /// Splits the first complete record off the buffer, keeping whatever follows it.
    fn take_record(&mut self) -> Result<Option<Record>, Error> {
        let max = self.settings.max_record_len;
        match self.buf[self.scanned..].find_byte(self.settings.terminator) {
            Some(pos) => {
                let end = self.scanned + pos + 1;
                if end > max {
                    return Err(record_too_long(end, max));
                }
                self.scanned = 0;
                Ok(Some(Record::new(self.buf.split_to(end).freeze())))
            }
            None => {
                self.scanned = self.buf.len();
                if self.buf.len() >= max {
                    return Err(record_too_long(self.buf.len(), max));
                }
                Ok(None)
            }
        }
    }

    /// Reads at most one chunk straight into the accumulation buffer.
    async fn fill(&mut self) -> Result<Fill, Error> {
        let chunk = self.settings.read_chunk;
        self.buf.reserve(chunk);
        let mut limited = (&mut self.conn).take(chunk as u64);
        let read = tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => return Ok(Fill::Shutdown),
            read = limited.read_buf(&mut self.buf) => read,
        };
        let n = read.map_err(|err| transport_error("read failed", err))?;
        if n == 0 {
            return Ok(Fill::Eof);
        }
        Ok(Fill::Data)
    }

    /// Returns `false` when shutdown interrupted the replay.
    async fn commit_and_replay(&mut self, record: Record) -> Result<bool, Error> {
        self.state = SessionState::Committing;
        let len = record.len();
        let outcome = self.guard.commit(record).await.map_err(|err| {
            if err.kind() == ErrorKind::Closed {
                err
            } else {
                err.into_fatal()
            }
        })?;
        self.records += 1;
        if let Some(evicted) = outcome.evicted {
            debug!(session = self.id, evicted = ?evicted, "evicted oldest record");
        }
        debug!(session = self.id, bytes = len, "committed record");

        self.state = SessionState::Replaying;
        let written = tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => return Ok(false),
            written = write_replay(&mut self.conn, &outcome.replay) => written,
        };
        written.map_err(|err| transport_error("replay write failed", err))?;
        self.replayed_bytes += outcome.replay.len_bytes() as u64;
        Ok(true)
    }
}

async fn write_replay<W>(conn: &mut W, replay: &Replay) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(conn);
    for chunk in replay.iter() {
        writer.write_all(chunk).await?;
    }
    writer.flush().await
}

fn transport_error(message: &str, err: io::Error) -> Error {
    Error::new(ErrorKind::Io).with_message(message).with_source(err)
}

fn record_too_long(len: usize, max: usize) -> Error {
    Error::new(ErrorKind::Protocol).with_message(format!(
        "record of {len} bytes exceeds the {max} byte limit"
    ))
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionOutcome, SessionSettings, SessionState};
    use crate::core::backing::{Backing, MemoryBacking};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::guard::StoreGuard;
    use crate::core::record::Record;
    use crate::core::ring::CircularStore;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::sync::watch;

    fn settings() -> SessionSettings {
        SessionSettings {
            terminator: b'\n',
            read_chunk: 1024,
            max_record_len: 64,
        }
    }

    fn guard(capacity: usize) -> Arc<StoreGuard> {
        Arc::new(StoreGuard::new(
            CircularStore::new(capacity).expect("store"),
            Box::new(MemoryBacking),
        ))
    }

    type SessionTask = tokio::task::JoinHandle<Result<SessionOutcome, Error>>;

    fn spawn_session(
        guard: &Arc<StoreGuard>,
        shutdown: &watch::Receiver<bool>,
    ) -> (DuplexStream, SessionTask) {
        spawn_session_with(guard, shutdown, settings(), 4096)
    }

    fn spawn_session_with(
        guard: &Arc<StoreGuard>,
        shutdown: &watch::Receiver<bool>,
        settings: SessionSettings,
        pipe_capacity: usize,
    ) -> (DuplexStream, SessionTask) {
        let (client, server) = tokio::io::duplex(pipe_capacity);
        let session = Session::new(
            1,
            "test",
            server,
            Arc::clone(guard),
            settings,
            shutdown.clone(),
        );
        assert_eq!(session.state(), SessionState::Receiving);
        (client, tokio::spawn(session.run()))
    }

    async fn read_exactly(client: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut out))
            .await
            .expect("timely replay")
            .expect("read replay");
        out
    }

    #[tokio::test]
    async fn hello_then_world_replays_growing_log() {
        let guard = guard(3);
        let (_tx, rx) = watch::channel(false);

        let (mut a, task_a) = spawn_session(&guard, &rx);
        a.write_all(b"hello\n").await.expect("send");
        assert_eq!(read_exactly(&mut a, 6).await, b"hello\n");
        drop(a);
        let outcome = task_a.await.expect("join").expect("session");
        assert_eq!(outcome.state, SessionState::Closed);
        assert_eq!(outcome.records, 1);

        let (mut b, task_b) = spawn_session(&guard, &rx);
        b.write_all(b"world\n").await.expect("send");
        assert_eq!(read_exactly(&mut b, 12).await, b"hello\nworld\n");
        drop(b);
        task_b.await.expect("join").expect("session");

        assert_eq!(guard.snapshot().await.expect("snapshot").records(), 2);
    }

    #[tokio::test]
    async fn bytes_after_terminator_start_next_record() {
        let guard = guard(4);
        let (_tx, rx) = watch::channel(false);
        let (mut client, task) = spawn_session(&guard, &rx);

        client.write_all(b"one\ntwo\nthr").await.expect("send");
        assert_eq!(read_exactly(&mut client, 4).await, b"one\n");
        assert_eq!(read_exactly(&mut client, 8).await, b"one\ntwo\n");

        client.write_all(b"ee\n").await.expect("send rest");
        assert_eq!(read_exactly(&mut client, 14).await, b"one\ntwo\nthree\n");

        drop(client);
        let outcome = task.await.expect("join").expect("session");
        assert_eq!(outcome.records, 3);
        assert_eq!(outcome.replayed_bytes, 4 + 8 + 14);
    }

    #[tokio::test]
    async fn eof_without_terminator_commits_nothing() {
        let guard = guard(2);
        let (_tx, rx) = watch::channel(false);
        let (mut client, task) = spawn_session(&guard, &rx);

        client.write_all(b"dangling").await.expect("send");
        client.shutdown().await.expect("half close");
        let outcome = task.await.expect("join").expect("session");
        assert_eq!(outcome.state, SessionState::Closed);
        assert_eq!(outcome.records, 0);
        assert_eq!(guard.snapshot().await.expect("snapshot").records(), 0);
    }

    #[tokio::test]
    async fn oversized_record_fails_only_this_session() {
        let guard = guard(2);
        let (_tx, rx) = watch::channel(false);
        let (mut client, task) = spawn_session(&guard, &rx);

        client.write_all(&[b'x'; 80]).await.expect("send");
        let outcome = task.await.expect("join").expect("local failure");
        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(guard.snapshot().await.expect("snapshot").records(), 0);

        let (mut other, other_task) = spawn_session(&guard, &rx);
        other.write_all(b"fine\n").await.expect("send");
        assert_eq!(read_exactly(&mut other, 5).await, b"fine\n");
        drop(other);
        other_task.await.expect("join").expect("session");
    }

    #[tokio::test]
    async fn shutdown_unblocks_pending_read() {
        let guard = guard(2);
        let (tx, rx) = watch::channel(false);
        let (mut client, task) = spawn_session(&guard, &rx);
        client.write_all(b"partial").await.expect("send");

        tx.send_replace(true);
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session stops")
            .expect("join")
            .expect("session");
        assert_eq!(outcome.state, SessionState::Closed);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.expect("eof");
        assert!(rest.is_empty());
    }

    struct BrokenBacking;

    impl Backing for BrokenBacking {
        fn append(&mut self, _bytes: &[u8]) -> Result<(), Error> {
            Err(Error::new(ErrorKind::Io).with_message("no space left"))
        }

        fn read_all(&mut self) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }

        fn truncate(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn commit_failure_is_fatal() {
        let guard = Arc::new(StoreGuard::new(
            CircularStore::new(2).expect("store"),
            Box::new(BrokenBacking),
        ));
        let (_tx, rx) = watch::channel(false);
        let (mut client, task) = spawn_session(&guard, &rx);
        client.write_all(b"doomed\n").await.expect("send");

        let err = task.await.expect("join").expect_err("fatal");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn replay_survives_short_reads_and_writes() {
        let guard = guard(4);
        let (_tx, rx) = watch::channel(false);
        let narrow = SessionSettings {
            read_chunk: 2,
            ..settings()
        };
        let (client, task) = spawn_session_with(&guard, &rx, narrow, 3);
        let (mut reader, mut writer) = tokio::io::split(client);

        let sender = tokio::spawn(async move {
            writer.write_all(b"hello\nworld\n").await.expect("send");
            writer
        });
        let expected = b"hello\nhello\nworld\n";
        let mut out = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut out))
            .await
            .expect("timely replay")
            .expect("read replay");
        assert_eq!(out, expected);

        let writer = sender.await.expect("sender");
        drop(reader.unsplit(writer));
        let outcome = task.await.expect("join").expect("session");
        assert_eq!(outcome.state, SessionState::Closed);
        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.replayed_bytes, expected.len() as u64);
    }

    #[tokio::test]
    async fn peer_gone_during_replay_fails_only_this_session() {
        let guard = guard(16);
        for i in 0..10 {
            guard
                .commit(Record::from(format!("{i:0>40}\n").into_bytes()))
                .await
                .expect("seed");
        }
        let (_tx, rx) = watch::channel(false);
        let (mut client, task) = spawn_session_with(&guard, &rx, settings(), 8);
        client.write_all(b"x\n").await.expect("send");
        drop(client);

        let outcome = task.await.expect("join").expect("local failure");
        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(outcome.records, 1);
        assert_eq!(guard.snapshot().await.expect("snapshot").records(), 11);

        let (mut other, other_task) = spawn_session(&guard, &rx);
        other.write_all(b"y\n").await.expect("send");
        let replay = read_exactly(&mut other, 10 * 41 + 4).await;
        assert!(replay.ends_with(b"x\ny\n"));
        drop(other);
        other_task.await.expect("join").expect("session");
    }

    /// Accepts writes but fails every read with a reset.
    struct ResetOnRead;

    impl AsyncRead for ResetOnRead {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    impl AsyncWrite for ResetOnRead {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn read_error_fails_the_session() {
        let guard = guard(2);
        let (_tx, rx) = watch::channel(false);
        let session = Session::new(7, "reset", ResetOnRead, Arc::clone(&guard), settings(), rx);
        let outcome = session.run().await.expect("local failure");
        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(outcome.records, 0);
        assert_eq!(guard.snapshot().await.expect("snapshot").records(), 0);
    }
}
