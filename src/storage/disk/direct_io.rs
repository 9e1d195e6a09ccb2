//! Platform-specific direct I/O helpers for bypassing the OS page cache
//!
//! Files opened here are handed to the aio subsystem as [`FileHandle`]s. The
//! [`AlignedBuffer`] is the scratch area the merge engine uses when several
//! adjacent slots are served by one syscall; it honours the alignment direct
//! I/O requires.
//!
//! [`FileHandle`]: crate::storage::disk::aio::file::FileHandle

use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::Result as IoResult;
use std::path::Path;

use crate::common::config::PAGE_SIZE;

/// Configuration for direct I/O operations
#[derive(Debug, Clone)]
pub struct DirectIOConfig {
    pub enabled: bool,
    pub alignment: usize, // Buffer alignment requirement (typically 512 bytes)
}

impl Default for DirectIOConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            alignment: 512, // Standard sector size
        }
    }
}

/// Platform-specific direct I/O file opening
pub fn open_direct_io<P: AsRef<Path>>(
    path: P,
    read: bool,
    write: bool,
    create: bool,
    config: &DirectIOConfig,
) -> IoResult<File> {
    let mut options = OpenOptions::new();
    options.read(read).write(write).create(create);

    if config.enabled {
        debug!("Opening file with direct I/O: {}", path.as_ref().display());

        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            warn!("Direct I/O not supported on this platform, falling back to buffered I/O");
        }
    } else {
        debug!("Opening file with buffered I/O: {}", path.as_ref().display());
    }

    let file = options.open(path.as_ref())?;

    #[cfg(target_os = "macos")]
    {
        if config.enabled {
            // macOS has no O_DIRECT; F_NOCACHE gives the same effect after open.
            use std::os::unix::io::AsRawFd;
            let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
            if result == -1 {
                warn!("Failed to set F_NOCACHE on macOS, continuing with buffered I/O");
            }
        }
    }

    Ok(file)
}

/// Check if a buffer is properly aligned for direct I/O
pub fn is_aligned(buffer: &[u8], alignment: usize) -> bool {
    buffer.as_ptr() as usize % alignment == 0
}

/// Growable, aligned scratch buffer.
///
/// The backing vector is over-allocated by `alignment` bytes and the usable
/// window starts at the first aligned address inside it. The buffer grows on
/// demand and never shrinks, so a handler thread pays for the allocation once.
#[derive(Debug)]
pub struct AlignedBuffer {
    storage: Vec<u8>,
    alignment: usize,
}

impl AlignedBuffer {
    pub fn new(alignment: usize) -> Self {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        Self {
            storage: Vec::new(),
            alignment,
        }
    }

    pub fn with_page_alignment() -> Self {
        Self::new(PAGE_SIZE)
    }

    /// Usable capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.len().saturating_sub(self.alignment)
    }

    /// Returns an aligned, mutable window of exactly `len` bytes, growing the
    /// backing storage if needed.
    pub fn window(&mut self, len: usize) -> &mut [u8] {
        if self.capacity() < len {
            debug!(
                "Growing merge buffer from {} to {} bytes",
                self.capacity(),
                len
            );
            self.storage = vec![0u8; len + self.alignment];
        }
        let pad = self.storage.as_ptr().align_offset(self.alignment);
        &mut self.storage[pad..pad + len]
    }
}
