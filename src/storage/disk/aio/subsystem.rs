//! # I/O Subsystem
//!
//! [`IoSubsystem`] is the single context a storage engine holds: it owns the
//! request arrays, the chosen backend and everything the handler threads need.
//!
//! ## Submission
//!
//! ```text
//!   submit(mode, request)
//!        │
//!        ├─ validate: len > 0, offset and len block aligned, no overflow,
//!        │            ibuf accepts reads only          ──fail──► InvalidRequest
//!        │                                                       (nothing reserved)
//!        ├─ mode Sync ──► positioned I/O on the caller thread with retry
//!        │
//!        ├─ pick array: Normal → read/write, Ibuf → ibuf, Log → log
//!        ├─ reserve_slot (blocks while the array is full)
//!        └─ backend.dispatch
//!              simulated: wake the slot's segment unless the wake is deferred
//!              native   : push to the segment's ring; a rejection frees the
//!                         slot and asks the retry policy whether to go again
//! ```
//!
//! Callers that defer wakes with [`IoSubsystem::submit_wake_later`] must call
//! [`IoSubsystem::wake_all_segments`] once their batch is queued.
//!
//! ## Buffer Contract
//!
//! The memory behind a request's [`IoBuf`] must stay valid and untouched until
//! that request's [`Completion`] has been returned by
//! [`IoSubsystem::handle_completion`].
//!
//! [`IoBuf`]: super::buffer::IoBuf

use std::sync::Arc;

use log::{debug, info, warn};

use crate::common::config::SegmentId;
use crate::common::exception::{AioError, RequestError};
use crate::common::time::{SystemTimeSource, TimeSource};
use crate::storage::disk::aio::backend::{AsyncIoBackend, IoCore};
use crate::storage::disk::aio::config::AioConfig;
use crate::storage::disk::aio::file::FileHandle;
use crate::storage::disk::aio::registry::{ArrayKind, ArrayRegistry};
use crate::storage::disk::aio::retry::{ErrorContext, ErrorHandler, LastError};
use crate::storage::disk::aio::simulated::SimulatedBackend;
use crate::storage::disk::aio::slot::{Completion, IoOp, IoRequest};
use crate::storage::disk::aio::stats::{print_status, IoStats, SegmentState, StatsSnapshot};
use crate::storage::disk::direct_io::AlignedBuffer;

/// Which array a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioMode {
    /// Reads to the read array, writes to the write array.
    Normal,
    /// Insert-buffer reads. Always wakes its handler immediately.
    Ibuf,
    Log,
    /// Performed synchronously on the calling thread, no slot involved.
    Sync,
}

#[derive(Debug)]
pub struct IoSubsystem {
    core: IoCore,
    backend: Box<dyn AsyncIoBackend>,
}

impl IoSubsystem {
    /// Builds every array and starts the backend. Falls back to the simulated
    /// backend when native aio is requested but unavailable.
    pub fn init(config: AioConfig) -> Result<Self, AioError> {
        Self::with_time_source(config, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(
        config: AioConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, AioError> {
        config.validate()?;
        let use_native = config.use_native_aio;
        let core = IoCore::new(config, clock);
        let backend = Self::choose_backend(&core, use_native);

        info!(
            "aio subsystem started: {} backend, {} segments, {} slots per segment",
            backend.name(),
            core.n_segments(),
            core.config.slots_per_segment
        );
        Ok(Self { core, backend })
    }

    #[cfg(test)]
    fn with_backend(config: AioConfig, backend: Box<dyn AsyncIoBackend>) -> Self {
        let core = IoCore::new(config, Arc::new(SystemTimeSource));
        Self { core, backend }
    }

    #[cfg(target_os = "linux")]
    fn choose_backend(core: &IoCore, use_native: bool) -> Box<dyn AsyncIoBackend> {
        use crate::storage::disk::aio::native::NativeBackend;

        if use_native {
            match NativeBackend::new(core) {
                Ok(native) => return Box::new(native),
                Err(err) => warn!(
                    "native aio requested but io_uring is unavailable ({}), using simulated aio",
                    err
                ),
            }
        }
        Box::new(SimulatedBackend::new())
    }

    #[cfg(not(target_os = "linux"))]
    fn choose_backend(_core: &IoCore, use_native: bool) -> Box<dyn AsyncIoBackend> {
        if use_native {
            warn!("native aio is not supported on this platform, using simulated aio");
        }
        Box::new(SimulatedBackend::new())
    }

    /// Native backend or an error; never falls back.
    #[cfg(target_os = "linux")]
    pub fn init_native(config: AioConfig) -> Result<Self, AioError> {
        use crate::storage::disk::aio::native::NativeBackend;

        config.validate()?;
        let core = IoCore::new(config, Arc::new(SystemTimeSource));
        let native =
            NativeBackend::new(&core).map_err(|e| AioError::NativeUnavailable(e.to_string()))?;
        Ok(Self {
            core,
            backend: Box::new(native),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn config(&self) -> &AioConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &ArrayRegistry {
        &self.core.registry
    }

    pub fn stats(&self) -> &IoStats {
        &self.core.stats
    }

    pub fn errors(&self) -> &ErrorHandler {
        &self.core.errors
    }

    pub fn n_segments(&self) -> usize {
        self.core.n_segments()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.core.is_shutting_down()
    }

    /// Queues a request and wakes its handler.
    pub fn submit(&self, mode: AioMode, request: IoRequest) -> Result<(), AioError> {
        self.submit_inner(mode, request, false)
    }

    /// Queues a request without waking its handler. Insert-buffer requests
    /// are woken regardless.
    pub fn submit_wake_later(&self, mode: AioMode, request: IoRequest) -> Result<(), AioError> {
        self.submit_inner(mode, request, true)
    }

    fn submit_inner(
        &self,
        mode: AioMode,
        request: IoRequest,
        wake_later: bool,
    ) -> Result<(), AioError> {
        self.validate_request(mode, &request)?;
        if self.core.is_shutting_down() {
            return Err(AioError::ShuttingDown);
        }

        let kind = match mode {
            AioMode::Sync => return self.transfer_sync(&request),
            AioMode::Normal if request.op.is_read() => ArrayKind::Read,
            AioMode::Normal => ArrayKind::Write,
            AioMode::Ibuf => ArrayKind::Ibuf,
            AioMode::Log => ArrayKind::Log,
        };
        let wake_later = wake_later && mode != AioMode::Ibuf;
        let array = self.core.registry.array(kind);

        loop {
            let handle = array.reserve_slot(
                request.clone(),
                self.core.clock.as_ref(),
                self.core.config.page_size_shift,
                || self.backend.on_array_full(&self.core),
            );

            match self.backend.dispatch(&self.core, kind, handle, wake_later) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    array.free_slot(handle);
                    let ctx = ErrorContext {
                        file: &request.name,
                        operation: request.op.syscall_name(),
                        offset: request.offset,
                    };
                    if self.core.errors.handle(&err, ctx) {
                        debug!("re-reserving after rejected dispatch on {}", request.name);
                        continue;
                    }
                    return Err(ErrorHandler::terminal_error(err, ctx));
                }
            }
        }
    }

    fn validate_request(&self, mode: AioMode, request: &IoRequest) -> Result<(), RequestError> {
        let block_size = self.core.config.block_size;
        let len = request.len();

        if len == 0 {
            return Err(RequestError::ZeroLength);
        }
        if len % block_size != 0 {
            return Err(RequestError::MisalignedLength { len, block_size });
        }
        if request.offset % block_size as u64 != 0 {
            return Err(RequestError::MisalignedOffset {
                offset: request.offset,
                block_size,
            });
        }
        if request.end_offset().is_none() {
            return Err(RequestError::OffsetOverflow {
                offset: request.offset,
                len,
            });
        }
        if mode == AioMode::Ibuf && !request.op.is_read() {
            return Err(RequestError::IbufWrite);
        }
        Ok(())
    }

    fn transfer_sync(&self, request: &IoRequest) -> Result<(), AioError> {
        // SAFETY: a synchronous request borrows its buffer only for this call.
        match request.op {
            IoOp::Read => {
                let buf = unsafe { request.buf.as_mut_slice() };
                self.read_sync(&request.file, &request.name, buf, request.offset)
            }
            IoOp::Write => {
                let buf = unsafe { request.buf.as_slice() };
                self.write_sync(&request.file, &request.name, buf, request.offset)
            }
        }
    }

    /// Positioned read on the calling thread, retried per the error policy.
    pub fn read_sync(
        &self,
        file: &FileHandle,
        name: &str,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), AioError> {
        let ctx = ErrorContext {
            file: name,
            operation: IoOp::Read.syscall_name(),
            offset,
        };
        self.core
            .errors
            .retry(ctx, || file.read_exact_at(buf, offset))?;
        self.core.stats.record_read(buf.len());
        Ok(())
    }

    /// Positioned write on the calling thread. A full disk is reported once
    /// per process and returned as [`AioError::DiskFull`] every time.
    pub fn write_sync(
        &self,
        file: &FileHandle,
        name: &str,
        buf: &[u8],
        offset: u64,
    ) -> Result<(), AioError> {
        let ctx = ErrorContext {
            file: name,
            operation: IoOp::Write.syscall_name(),
            offset,
        };
        self.core
            .errors
            .retry(ctx, || file.write_all_at(buf, offset))?;
        self.core.stats.record_write(buf.len());
        Ok(())
    }

    /// Flushes a file to stable storage.
    pub fn flush(&self, file: &FileHandle, name: &str) -> Result<(), AioError> {
        let ctx = ErrorContext {
            file: name,
            operation: "fsync",
            offset: 0,
        };
        self.core.errors.retry(ctx, || file.sync_all())?;
        self.core.stats.record_fsync();
        Ok(())
    }

    /// Blocks until one request of `segment` has completed and returns it.
    /// `None` means the subsystem is shutting down and the caller should exit.
    pub fn handle_completion(
        &self,
        segment: SegmentId,
        scratch: &mut AlignedBuffer,
    ) -> Option<Completion> {
        self.backend
            .wait_for_completion(&self.core, segment, scratch)
    }

    /// Non-blocking variant of [`IoSubsystem::handle_completion`].
    pub fn poll_completion(
        &self,
        segment: SegmentId,
        scratch: &mut AlignedBuffer,
    ) -> Option<Completion> {
        self.backend.try_completion(&self.core, segment, scratch)
    }

    pub fn wake_segment(&self, segment: SegmentId) {
        self.backend.wake_segment(&self.core, segment);
    }

    pub fn wake_all_segments(&self) {
        self.backend.wake_all_segments(&self.core);
    }

    pub fn put_read_threads_to_sleep(&self) {
        self.core.put_read_threads_to_sleep();
    }

    /// Blocks until the write array holds no requests.
    pub fn wait_until_no_pending_writes(&self) {
        self.core.registry.array(ArrayKind::Write).is_empty().wait();
    }

    pub fn all_slots_free(&self) -> bool {
        self.core.registry.all_slots_free()
    }

    /// Drains the write array, then releases every handler. Requests already
    /// queued in other arrays are still served before their handlers exit.
    /// Requires handler threads to be running. Later submissions fail with
    /// [`AioError::ShuttingDown`].
    pub fn shutdown(&self) {
        if self.core.is_shutting_down() {
            return;
        }
        info!("aio subsystem shutting down, waiting for pending writes");
        self.wake_all_segments();
        self.wait_until_no_pending_writes();
        if self.core.begin_shutdown() {
            self.backend.begin_shutdown(&self.core);
        }
        info!("aio subsystem shut down");
    }

    pub fn print_status(&self) -> String {
        print_status(
            &self.core.registry,
            &self.core.segment_states,
            &self.core.stats,
            self.core.clock.now(),
        )
    }

    /// Resets the "since last call" rate baseline without printing.
    pub fn refresh_stats(&self) -> StatsSnapshot {
        self.core.stats.refresh(self.core.clock.now())
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.core.errors.last_error()
    }

    pub fn mark_segment(&self, segment: SegmentId, state: SegmentState) {
        self.core.segment_states.set(segment, state);
    }

    /// Consistency scan of every array.
    pub fn validate(&self) {
        self.core.registry.validate();
    }
}
