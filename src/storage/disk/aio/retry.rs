//! # Error Classification and Retry
//!
//! Every failed syscall goes through [`ErrorHandler::handle`], which decides
//! whether the operation is worth repeating.
//!
//! | Class                 | Examples                         | Action                         |
//! |-----------------------|----------------------------------|--------------------------------|
//! | `RetryAfterDelay`     | EAGAIN, ENOMEM, EINTR            | sleep `retry_delay`, retry     |
//! | `RetryAfterLongDelay` | EBUSY, ETXTBSY, lock violations  | sleep `long_retry_delay`, retry|
//! | `DiskFull`            | ENOSPC, EDQUOT, short write      | log once per process, give up  |
//! | `AlreadyExists`       | EEXIST                           | give up                        |
//! | `PathError`           | ENOENT, ENOTDIR                  | give up                        |
//! | `Unknown`             | anything else                    | log with context, maybe abort  |
//!
//! [`ErrorHandler::retry`] wraps a fallible operation in that policy and
//! turns the terminal failure into an [`AioError`].

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use log::{error, warn};
use parking_lot::Mutex;

use crate::common::exception::AioError;
use crate::storage::disk::aio::config::AioConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RetryAfterDelay,
    RetryAfterLongDelay,
    DiskFull,
    AlreadyExists,
    PathError,
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::RetryAfterDelay | ErrorClass::RetryAfterLongDelay
        )
    }
}

#[cfg(unix)]
fn classify_os_error(code: i32) -> Option<ErrorClass> {
    let class = match code {
        libc::EAGAIN | libc::ENOMEM | libc::ENOBUFS | libc::EINTR => ErrorClass::RetryAfterDelay,
        libc::EBUSY | libc::ETXTBSY | libc::ENOLCK | libc::EDEADLK => {
            ErrorClass::RetryAfterLongDelay
        }
        libc::ENOSPC | libc::EDQUOT | libc::EFBIG => ErrorClass::DiskFull,
        libc::EEXIST => ErrorClass::AlreadyExists,
        libc::ENOENT | libc::ENOTDIR | libc::ENAMETOOLONG => ErrorClass::PathError,
        _ => return None,
    };
    Some(class)
}

#[cfg(windows)]
fn classify_os_error(code: i32) -> Option<ErrorClass> {
    const ERROR_FILE_NOT_FOUND: i32 = 2;
    const ERROR_PATH_NOT_FOUND: i32 = 3;
    const ERROR_NOT_ENOUGH_MEMORY: i32 = 8;
    const ERROR_SHARING_VIOLATION: i32 = 32;
    const ERROR_LOCK_VIOLATION: i32 = 33;
    const ERROR_HANDLE_DISK_FULL: i32 = 39;
    const ERROR_FILE_EXISTS: i32 = 80;
    const ERROR_DISK_FULL: i32 = 112;
    const ERROR_ALREADY_EXISTS: i32 = 183;
    const ERROR_NO_SYSTEM_RESOURCES: i32 = 1450;

    let class = match code {
        ERROR_NOT_ENOUGH_MEMORY | ERROR_NO_SYSTEM_RESOURCES => ErrorClass::RetryAfterDelay,
        ERROR_SHARING_VIOLATION | ERROR_LOCK_VIOLATION => ErrorClass::RetryAfterLongDelay,
        ERROR_DISK_FULL | ERROR_HANDLE_DISK_FULL => ErrorClass::DiskFull,
        ERROR_FILE_EXISTS | ERROR_ALREADY_EXISTS => ErrorClass::AlreadyExists,
        ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => ErrorClass::PathError,
        _ => return None,
    };
    Some(class)
}

/// Maps an I/O error to its retry class.
pub fn classify(err: &io::Error) -> ErrorClass {
    if let Some(class) = err.raw_os_error().and_then(classify_os_error) {
        return class;
    }
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory => {
            ErrorClass::RetryAfterDelay
        }
        // A write that makes no progress is how a full disk shows up without errno.
        io::ErrorKind::WriteZero => ErrorClass::DiskFull,
        io::ErrorKind::AlreadyExists => ErrorClass::AlreadyExists,
        io::ErrorKind::NotFound => ErrorClass::PathError,
        _ => ErrorClass::Unknown,
    }
}

/// Where a failed syscall happened.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    pub file: &'a str,
    pub operation: &'static str,
    pub offset: u64,
}

/// Snapshot of the most recent failure, readable right after a call fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub file: String,
    pub operation: &'static str,
    pub offset: u64,
    pub class: ErrorClass,
    pub raw_os_error: Option<i32>,
    pub message: String,
}

#[derive(Debug)]
pub struct ErrorHandler {
    fatal_on_unknown: bool,
    retry_delay: Duration,
    long_retry_delay: Duration,
    has_said_disk_full: AtomicBool,
    disk_full_reports: AtomicU64,
    retries: AtomicU64,
    last_error: Mutex<Option<LastError>>,
}

impl ErrorHandler {
    pub fn new(config: &AioConfig) -> Self {
        Self {
            fatal_on_unknown: config.fatal_on_unknown_error,
            retry_delay: config.retry_delay,
            long_retry_delay: config.long_retry_delay,
            has_said_disk_full: AtomicBool::new(false),
            disk_full_reports: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Decides whether the failed operation should be repeated. Sleeps the
    /// prescribed backoff before answering `true`.
    pub fn handle(&self, err: &io::Error, ctx: ErrorContext<'_>) -> bool {
        let class = classify(err);
        *self.last_error.lock() = Some(LastError {
            file: ctx.file.to_string(),
            operation: ctx.operation,
            offset: ctx.offset,
            class,
            raw_os_error: err.raw_os_error(),
            message: err.to_string(),
        });

        match class {
            ErrorClass::RetryAfterDelay => {
                warn!(
                    "{} on {} at offset {} hit a transient error ({}), retrying in {:?}",
                    ctx.operation, ctx.file, ctx.offset, err, self.retry_delay
                );
                self.retries.fetch_add(1, Ordering::Relaxed);
                thread::sleep(self.retry_delay);
                true
            }
            ErrorClass::RetryAfterLongDelay => {
                warn!(
                    "{} on {} blocked by a sharing or lock violation ({}), retrying in {:?}",
                    ctx.operation, ctx.file, err, self.long_retry_delay
                );
                self.retries.fetch_add(1, Ordering::Relaxed);
                thread::sleep(self.long_retry_delay);
                true
            }
            ErrorClass::DiskFull => {
                if !self.has_said_disk_full.swap(true, Ordering::AcqRel) {
                    self.disk_full_reports.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "{} on {} failed at offset {}: the disk is full or a quota is exceeded ({})",
                        ctx.operation, ctx.file, ctx.offset, err
                    );
                }
                false
            }
            ErrorClass::AlreadyExists | ErrorClass::PathError => {
                warn!("{} on {} failed: {}", ctx.operation, ctx.file, err);
                false
            }
            ErrorClass::Unknown => {
                error!(
                    "{} on {} failed at offset {}: os error {:?}: {}",
                    ctx.operation,
                    ctx.file,
                    ctx.offset,
                    err.raw_os_error(),
                    err
                );
                if self.fatal_on_unknown {
                    error!("Cannot continue after an unknown i/o error, aborting");
                    std::process::abort();
                }
                false
            }
        }
    }

    /// Runs `op` until it succeeds or fails with a non-retryable error.
    pub fn retry<T>(
        &self,
        ctx: ErrorContext<'_>,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> Result<T, AioError> {
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if self.handle(&err, ctx) {
                        continue;
                    }
                    return Err(Self::terminal_error(err, ctx));
                }
            }
        }
    }

    pub fn terminal_error(err: io::Error, ctx: ErrorContext<'_>) -> AioError {
        if classify(&err) == ErrorClass::DiskFull {
            AioError::DiskFull {
                file: ctx.file.to_string(),
                offset: ctx.offset,
            }
        } else {
            AioError::Io {
                file: ctx.file.to_string(),
                operation: ctx.operation,
                source: err,
            }
        }
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.last_error.lock().clone()
    }

    pub fn has_said_disk_full(&self) -> bool {
        self.has_said_disk_full.load(Ordering::Acquire)
    }

    /// How many times the disk-full message was logged. Never exceeds one.
    pub fn disk_full_reports(&self) -> u64 {
        self.disk_full_reports.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}
