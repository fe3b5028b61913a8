// Optional persistence mirror for the ring: a no-op sink or a locked file.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::core::error::{Error, ErrorKind};

/// Default location of the mirror file.
pub const DEFAULT_DATA_FILE: &str = "/var/tmp/aesdsocketdata";

/// Byte sink mirroring the logical stream. The ring stays authoritative for reads.
pub trait Backing: Send {
    fn append(&mut self, bytes: &[u8]) -> Result<(), Error>;
    fn read_all(&mut self) -> Result<Vec<u8>, Error>;
    fn truncate(&mut self) -> Result<(), Error>;

    /// Flushes and releases the sink. Called once at teardown.
    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BackendConfig {
    #[default]
    Memory,
    File { path: PathBuf, keep: bool },
}

pub fn open_backing(config: &BackendConfig) -> Result<Box<dyn Backing>, Error> {
    match config {
        BackendConfig::Memory => Ok(Box::new(MemoryBacking)),
        BackendConfig::File { path, keep } => Ok(Box::new(FileBacking::create(path, *keep)?)),
    }
}

/// In-memory only: nothing is mirrored.
#[derive(Debug, Default)]
pub struct MemoryBacking;

impl Backing for MemoryBacking {
    fn append(&mut self, _bytes: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }

    fn truncate(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// File mirror holding an exclusive advisory lock for its whole lifetime.
#[derive(Debug)]
pub struct FileBacking {
    path: PathBuf,
    file: File,
    keep: bool,
    closed: bool,
}

impl FileBacking {
    /// Creates or truncates `path` and locks it. Fails when another process holds the lock.
    pub fn create(path: impl AsRef<Path>, keep: bool) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|err| io_error(&path, err))?;
        file.try_lock_exclusive().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("data file is locked")
                .with_hint("Another ringlogd may be using it; pass a different --data-file.")
                .with_path(&path)
                .with_source(err)
        })?;
        file.set_len(0).map_err(|err| io_error(&path, err))?;
        Ok(Self {
            path,
            file,
            keep,
            closed: false,
        })
    }
}

impl Backing for FileBacking {
    fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.file
            .write_all(bytes)
            .and_then(|_| self.file.flush())
            .map_err(|err| io_error(&self.path, err))
    }

    fn read_all(&mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut out))
            .map_err(|err| io_error(&self.path, err))?;
        Ok(out)
    }

    fn truncate(&mut self) -> Result<(), Error> {
        self.file
            .set_len(0)
            .map_err(|err| io_error(&self.path, err))
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.file
            .sync_all()
            .map_err(|err| io_error(&self.path, err))?;
        let _ = self.file.unlock();
        if !self.keep {
            fs::remove_file(&self.path).map_err(|err| io_error(&self.path, err))?;
        }
        Ok(())
    }
}

impl Drop for FileBacking {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn io_error(path: &Path, err: io::Error) -> Error {
    Error::new(ErrorKind::Io).with_path(path).with_source(err)
}
