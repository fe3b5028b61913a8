// Exclusive access to the ring and its backing; every read and write goes through here.
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::backing::Backing;
use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::ring::CircularStore;

/// Mutex around one `CircularStore` and its mirror.
///
/// The lock is a `tokio::sync::Mutex` so sessions waiting on it yield to the runtime.
pub struct StoreGuard {
    state: Mutex<GuardState>,
}

struct GuardState {
    store: CircularStore,
    backing: Box<dyn Backing>,
    stats: GuardStats,
    closed: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GuardStats {
    pub commits: u64,
    pub evictions: u64,
    pub records: usize,
    pub bytes: usize,
}

/// Result of one commit: what fell out of the ring, plus the log as it stood right after.
#[derive(Debug)]
pub struct CommitOutcome {
    pub evicted: Option<Record>,
    pub replay: Replay,
}

/// Snapshot of the logical stream. Chunks share storage with the ring.
#[derive(Clone, Debug, Default)]
pub struct Replay {
    chunks: Vec<Bytes>,
}

impl Replay {
    fn capture(store: &CircularStore) -> Self {
        Self {
            chunks: store.iter().map(|record| record.bytes().clone()).collect(),
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn records(&self) -> usize {
        self.chunks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.chunks.iter().map(|chunk| chunk.as_ref())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

impl StoreGuard {
    pub fn new(store: CircularStore, backing: Box<dyn Backing>) -> Self {
        Self {
            state: Mutex::new(GuardState {
                store,
                backing,
                stats: GuardStats::default(),
                closed: false,
            }),
        }
    }

    /// Runs `body` with the lock held. The lock is released on every return path.
    pub async fn with_store<T>(
        &self,
        body: impl FnOnce(&mut CircularStore, &mut dyn Backing) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::new(ErrorKind::Closed).with_message("store is closed"));
        }
        let GuardState { store, backing, .. } = &mut *state;
        body(store, backing.as_mut())
    }

    /// Mirrors `record`, inserts it, and captures the replay in one critical section.
    ///
    /// The backing is written first; if that fails the ring is left untouched and the mirror is
    /// rewritten from it. When the ring is full the mirror is replaced with the window that
    /// remains after eviction.
    pub async fn commit(&self, record: Record) -> Result<CommitOutcome, Error> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::new(ErrorKind::Closed).with_message("store is closed"));
        }
        let GuardState {
            store,
            backing,
            stats,
            ..
        } = &mut *state;

        if let Err(err) = mirror(store, backing.as_mut(), &record) {
            if let Err(restore) = restore_mirror(store, backing.as_mut()) {
                warn!(error = %restore, "mirror no longer matches the log");
            }
            return Err(err);
        }

        let evicted = store.add(record);
        stats.commits += 1;
        if evicted.is_some() {
            stats.evictions += 1;
        }
        Ok(CommitOutcome {
            evicted,
            replay: Replay::capture(store),
        })
    }

    /// Current content of the logical stream.
    pub async fn snapshot(&self) -> Result<Replay, Error> {
        self.with_store(|store, _| Ok(Replay::capture(store))).await
    }

    pub async fn stats(&self) -> GuardStats {
        let state = self.state.lock().await;
        GuardStats {
            records: state.store.len(),
            bytes: state.store.total_len(),
            ..state.stats
        }
    }

    /// Releases every record and closes the backing. Later calls are no-ops; later commits fail
    /// with `ErrorKind::Closed`.
    pub async fn close(&self) -> Result<GuardStats, Error> {
        let mut state = self.state.lock().await;
        let stats = GuardStats {
            records: state.store.len(),
            bytes: state.store.total_len(),
            ..state.stats
        };
        if state.closed {
            return Ok(stats);
        }
        state.closed = true;
        state.store.init();
        state.backing.close()?;
        Ok(stats)
    }
}

fn mirror(store: &CircularStore, backing: &mut dyn Backing, record: &Record) -> Result<(), Error> {
    if !store.is_full() {
        return backing.append(record.as_bytes());
    }
    let mut window = Vec::with_capacity(store.total_len() + record.len());
    for kept in store.iter().skip(1) {
        window.extend_from_slice(kept.as_bytes());
    }
    window.extend_from_slice(record.as_bytes());
    backing.truncate()?;
    backing.append(&window)
}

fn restore_mirror(store: &CircularStore, backing: &mut dyn Backing) -> Result<(), Error> {
    let mut window = Vec::with_capacity(store.total_len());
    for kept in store.iter() {
        window.extend_from_slice(kept.as_bytes());
    }
    backing.truncate()?;
    if window.is_empty() {
        return Ok(());
    }
    backing.append(&window)
}

#[cfg(test)]
mod tests {
    use super::StoreGuard;
    use crate::core::backing::{Backing, FileBacking, MemoryBacking};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::record::Record;
    use crate::core::ring::CircularStore;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    fn guard(capacity: usize) -> StoreGuard {
        StoreGuard::new(
            CircularStore::new(capacity).expect("store"),
            Box::new(MemoryBacking),
        )
    }

    struct FailingBacking;

    impl Backing for FailingBacking {
        fn append(&mut self, _bytes: &[u8]) -> Result<(), Error> {
            Err(Error::new(ErrorKind::Io).with_message("sink rejected append"))
        }

        fn read_all(&mut self) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }

        fn truncate(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    /// Shared in-memory mirror that rejects exactly one append.
    struct FlakyBacking {
        data: Arc<Mutex<Vec<u8>>>,
        appends: usize,
        fail_on: usize,
    }

    impl Backing for FlakyBacking {
        fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
            self.appends += 1;
            let mut data = self.data.lock().expect("mirror lock");
            if self.appends == self.fail_on {
                // A short write before the failure.
                data.extend_from_slice(&bytes[..bytes.len() / 2]);
                return Err(Error::new(ErrorKind::Io).with_message("disk full"));
            }
            data.extend_from_slice(bytes);
            Ok(())
        }

        fn read_all(&mut self) -> Result<Vec<u8>, Error> {
            Ok(self.data.lock().expect("mirror lock").clone())
        }

        fn truncate(&mut self) -> Result<(), Error> {
            self.data.lock().expect("mirror lock").clear();
            Ok(())
        }
    }

    #[tokio::test]
    async fn capacity_two_replays_last_two_records() {
        let guard = guard(2);
        guard.commit(Record::from(&b"ab\n"[..])).await.expect("commit");
        guard.commit(Record::from(&b"cd\n"[..])).await.expect("commit");
        let outcome = guard.commit(Record::from(&b"ef\n"[..])).await.expect("commit");

        assert_eq!(outcome.evicted.expect("evicted").as_bytes(), b"ab\n");
        assert_eq!(outcome.replay.to_vec(), b"cd\nef\n");
        let stats = guard.stats().await;
        assert_eq!((stats.commits, stats.evictions, stats.records), (3, 1, 2));
    }

    #[tokio::test]
    async fn failed_mirror_leaves_store_untouched() {
        let mut store = CircularStore::new(2).expect("store");
        store.add(Record::from(&b"kept\n"[..]));
        let guard = StoreGuard::new(store, Box::new(FailingBacking));

        let err = guard
            .commit(Record::from(&b"lost\n"[..]))
            .await
            .expect_err("append fails");
        assert_eq!(err.kind(), ErrorKind::Io);

        let replay = guard.snapshot().await.expect("snapshot");
        assert_eq!(replay.to_vec(), b"kept\n");
        assert_eq!(guard.stats().await.commits, 0);
    }

    #[tokio::test]
    async fn closure_error_releases_lock() {
        let guard = guard(2);
        let result: Result<(), Error> = guard
            .with_store(|_, _| Err(Error::new(ErrorKind::Internal).with_message("boom")))
            .await;
        assert!(result.is_err());
        guard
            .commit(Record::from(&b"after\n"[..]))
            .await
            .expect("lock was released");
    }

    #[tokio::test]
    async fn file_mirror_tracks_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mirror.data");
        let backing = FileBacking::create(&path, true).expect("backing");
        let guard = StoreGuard::new(CircularStore::new(2).expect("store"), Box::new(backing));

        for line in ["one\n", "two\n", "three\n"] {
            guard
                .commit(Record::from(line.as_bytes().to_vec()))
                .await
                .expect("commit");
        }
        let mirrored = guard
            .with_store(|_, backing| backing.read_all())
            .await
            .expect("read mirror");
        assert_eq!(mirrored, b"two\nthree\n");

        let stats = guard.close().await.expect("close");
        assert_eq!(stats.records, 2);
        assert_eq!(std::fs::read(&path).expect("kept file"), b"two\nthree\n");
    }

    #[tokio::test]
    async fn closed_guard_rejects_commits() {
        let guard = guard(2);
        guard.close().await.expect("close");
        guard.close().await.expect("idempotent close");
        let err = guard
            .commit(Record::from(&b"late\n"[..]))
            .await
            .expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_lose_nothing() {
        let sessions = 16;
        let guard = Arc::new(guard(sessions));
        let mut handles = Vec::new();
        for i in 0..sessions {
            let guard = Arc::clone(&guard);
            handles.push(tokio::spawn(async move {
                guard
                    .commit(Record::from(format!("session-{i}\n").into_bytes()))
                    .await
                    .map(|outcome| outcome.evicted.is_none())
            }));
        }
        for handle in handles {
            assert!(handle.await.expect("join").expect("commit"));
        }

        let replay = guard.snapshot().await.expect("snapshot");
        assert_eq!(replay.records(), sessions);
        let stored: BTreeSet<Vec<u8>> = replay.iter().map(<[u8]>::to_vec).collect();
        let expected: BTreeSet<Vec<u8>> = (0..sessions)
            .map(|i| format!("session-{i}\n").into_bytes())
            .collect();
        assert_eq!(stored, expected);
    }

    #[tokio::test]
    async fn failed_eviction_restores_mirror_from_ring() {
        let data = Arc::new(Mutex::new(Vec::new()));
        let backing = FlakyBacking {
            data: Arc::clone(&data),
            appends: 0,
            fail_on: 3,
        };
        let guard = StoreGuard::new(CircularStore::new(2).expect("store"), Box::new(backing));
        guard.commit(Record::from(&b"a\n"[..])).await.expect("commit");
        guard.commit(Record::from(&b"b\n"[..])).await.expect("commit");

        let err = guard
            .commit(Record::from(&b"c\n"[..]))
            .await
            .expect_err("mirror rewrite fails");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(guard.snapshot().await.expect("snapshot").to_vec(), b"a\nb\n");
        assert_eq!(*data.lock().expect("mirror lock"), b"a\nb\n");

        guard.commit(Record::from(&b"d\n"[..])).await.expect("commit");
        assert_eq!(*data.lock().expect("mirror lock"), b"b\nd\n");
    }

    #[tokio::test]
    async fn failed_append_drops_partial_bytes_from_mirror() {
        let data = Arc::new(Mutex::new(Vec::new()));
        let backing = FlakyBacking {
            data: Arc::clone(&data),
            appends: 0,
            fail_on: 2,
        };
        let guard = StoreGuard::new(CircularStore::new(4).expect("store"), Box::new(backing));
        guard.commit(Record::from(&b"first\n"[..])).await.expect("commit");

        guard
            .commit(Record::from(&b"second\n"[..]))
            .await
            .expect_err("append fails");
        assert_eq!(*data.lock().expect("mirror lock"), b"first\n");
        assert_eq!(guard.stats().await.commits, 1);
    }
}
