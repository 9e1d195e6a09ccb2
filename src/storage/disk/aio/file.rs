//! Open-file handles accepted by the aio subsystem.
//!
//! The subsystem never opens or closes files on its own; callers hand it a
//! [`FileHandle`], a cheap clonable reference to anything implementing
//! [`IoFile`]. Two handles refer to the same file iff they share an id, which
//! is what the merge engine compares when it looks for adjacent requests.

use std::fmt::Debug;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::storage::disk::direct_io::{open_direct_io, DirectIOConfig};

/// Positioned, whole-buffer file operations.
pub trait IoFile: Send + Sync + Debug {
    /// Fills `buf` from `offset`. A short read is an error.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Writes all of `buf` at `offset`. A short write is an error.
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    fn sync_all(&self) -> io::Result<()>;

    /// Descriptor used by the native backend; `None` forces the simulated path.
    fn raw_fd(&self) -> Option<i32> {
        None
    }
}

#[cfg(unix)]
impl IoFile for File {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, buf, offset)
    }

    fn sync_all(&self) -> io::Result<()> {
        File::sync_all(self)
    }

    fn raw_fd(&self) -> Option<i32> {
        use std::os::unix::io::AsRawFd;
        Some(self.as_raw_fd())
    }
}

#[cfg(windows)]
impl IoFile for File {
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.seek_read(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.seek_write(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ))
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn sync_all(&self) -> io::Result<()> {
        File::sync_all(self)
    }
}

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct FileHandle {
    id: u64,
    inner: Arc<dyn IoFile>,
}

impl FileHandle {
    pub fn new<F: IoFile + 'static>(file: F) -> Self {
        Self::from_arc(Arc::new(file))
    }

    pub fn from_arc(inner: Arc<dyn IoFile>) -> Self {
        Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            inner,
        }
    }

    /// Opens (creating if needed) a read-write data file.
    pub fn open<P: AsRef<Path>>(path: P, config: &DirectIOConfig) -> io::Result<Self> {
        let file = open_direct_io(path, true, true, true, config)?;
        Ok(Self::new(file))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.inner.read_exact_at(buf, offset)
    }

    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.inner.write_all_at(buf, offset)
    }

    pub fn sync_all(&self) -> io::Result<()> {
        self.inner.sync_all()
    }

    pub fn raw_fd(&self) -> Option<i32> {
        self.inner.raw_fd()
    }
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FileHandle {}
