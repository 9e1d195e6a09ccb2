//! # Native Asynchronous I/O (Linux, io_uring)
//!
//! Every global segment owns one io_uring instance sized to its slots. Reads
//! and writes live in different arrays and therefore complete on different
//! rings, so a read handler never reaps a write completion.
//!
//! ```text
//!   submitter                         ring[segment]                    handler[segment]
//!   ─────────                         ─────────────                    ────────────────
//!   reserve slot
//!   mark Issued, token = gen|index
//!   push Read/Write SQE  ───────────► SQ ──► kernel ──► CQ ───────────► pop CQE
//!   submit                                                              token -> slot
//!                                                                       full transfer?
//!                                                                        yes: Done, claim
//!                                                                        no : retry policy,
//!                                                                             one sync attempt
//! ```
//!
//! Shutdown pushes a `Nop` carrying [`SHUTDOWN_TOKEN`] into every ring. The
//! handler that reaps it posts it back once, then stops.
//!
//! Files that expose no descriptor (see [`IoFile::raw_fd`]) are transferred
//! synchronously at dispatch and surface through the ring as a `Nop`.
//!
//! [`IoFile::raw_fd`]: super::file::IoFile::raw_fd

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use io_uring::{opcode, squeue, types, IoUring};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::common::config::{SegmentId, SlotIndex};
use crate::storage::disk::aio::array::{ArrayState, RequestArray};
use crate::storage::disk::aio::backend::{AsyncIoBackend, IoCore};
use crate::storage::disk::aio::registry::ArrayKind;
use crate::storage::disk::aio::retry::ErrorContext;
use crate::storage::disk::aio::slot::{Completion, IoOp, IoRequest, SlotHandle, SlotStatus};
use crate::storage::disk::aio::stats::SegmentState;
use crate::storage::disk::direct_io::AlignedBuffer;

/// User data of the shutdown sentinel. No slot token can collide with it
/// because no array holds 2^32 slots.
pub const SHUTDOWN_TOKEN: u64 = u64::MAX;

struct SegmentRing {
    ring: IoUring,
    sq_lock: Mutex<()>,
    cq_lock: Mutex<()>,
    sentinel_reposted: AtomicBool,
    /// Set when a slot reached `Done` at dispatch but its `Nop` never made it
    /// into the ring. The handler then finds the slot by scanning.
    orphaned_done: AtomicBool,
}

// SAFETY: the submission queue is only touched under `sq_lock` and the
// completion queue only under `cq_lock`; `submit` and `submit_and_wait` go
// through io_uring_enter, which the kernel serializes per ring.
unsafe impl Send for SegmentRing {}
unsafe impl Sync for SegmentRing {}

impl std::fmt::Debug for SegmentRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentRing")
            .field("sentinel_reposted", &self.sentinel_reposted)
            .field("orphaned_done", &self.orphaned_done)
            .finish_non_exhaustive()
    }
}

impl SegmentRing {
    fn new(entries: u32) -> io::Result<Self> {
        Ok(Self {
            ring: IoUring::new(entries)?,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            sentinel_reposted: AtomicBool::new(false),
            orphaned_done: AtomicBool::new(false),
        })
    }

    /// Queues one entry and submits it. An error means the entry was not
    /// queued. Once it is queued, a failed submit is only logged: the next
    /// enter on this ring hands it to the kernel.
    ///
    /// # Safety
    ///
    /// Any buffer referenced by `entry` must stay valid until its completion
    /// has been reaped.
    unsafe fn push(&self, entry: &squeue::Entry) -> io::Result<()> {
        {
            let _guard = self.sq_lock.lock();
            let mut sq = self.ring.submission_shared();
            if sq.push(entry).is_err() {
                drop(sq);
                // Make room by handing what is queued to the kernel.
                self.ring.submit()?;
                let mut sq = self.ring.submission_shared();
                sq.push(entry).map_err(|_| {
                    io::Error::new(io::ErrorKind::WouldBlock, "io_uring submission queue full")
                })?;
            }
        }
        if let Err(err) = self.ring.submit() {
            if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EBUSY)) {
                trace!("io_uring submit deferred: {}", err);
            } else {
                warn!("io_uring submit failed, entry stays queued for the next enter: {}", err);
            }
        }
        Ok(())
    }

    fn pop(&self) -> Option<(u64, i32)> {
        let _guard = self.cq_lock.lock();
        // SAFETY: the completion queue is only accessed under `cq_lock`.
        let mut cq = unsafe { self.ring.completion_shared() };
        cq.next().map(|cqe| (cqe.user_data(), cqe.result()))
    }

    fn post_sentinel(&self) -> io::Result<()> {
        let nop = opcode::Nop::new().build().user_data(SHUTDOWN_TOKEN);
        // SAFETY: a Nop references no memory.
        unsafe { self.push(&nop) }
    }
}

#[derive(Debug)]
pub struct NativeBackend {
    rings: Vec<SegmentRing>,
}

impl NativeBackend {
    /// Creates one ring per global segment. Fails if the kernel does not
    /// support io_uring or the process may not use it.
    pub fn new(core: &IoCore) -> io::Result<Self> {
        let entries = core
            .config
            .slots_per_segment
            .next_power_of_two()
            .clamp(1, 32768) as u32;
        let rings = (0..core.n_segments())
            .map(|_| SegmentRing::new(entries))
            .collect::<io::Result<Vec<_>>>()?;
        info!(
            "native aio enabled: {} io_uring instances with {} entries each",
            rings.len(),
            entries
        );
        Ok(Self { rings })
    }

    fn build_entry(request: &IoRequest, fd: i32, token: u64) -> io::Result<squeue::Entry> {
        let len = u32::try_from(request.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "request too large for one native transfer",
            )
        })?;
        let entry = match request.op {
            IoOp::Read => opcode::Read::new(types::Fd(fd), request.buf.as_ptr(), len)
                .offset(request.offset)
                .build(),
            IoOp::Write => opcode::Write::new(types::Fd(fd), request.buf.as_ptr(), len)
                .offset(request.offset)
                .build(),
        };
        Ok(entry.user_data(token))
    }

    /// One synchronous transfer of a whole request.
    fn transfer_sync(core: &IoCore, request: &IoRequest) -> io::Result<()> {
        // SAFETY: the slot carrying `request` is Issued and owned by the caller.
        let result = match request.op {
            IoOp::Read => request
                .file
                .read_exact_at(unsafe { request.buf.as_mut_slice() }, request.offset),
            IoOp::Write => request
                .file
                .write_all_at(unsafe { request.buf.as_slice() }, request.offset),
        };
        if result.is_ok() {
            match request.op {
                IoOp::Read => core.stats.record_read(request.len()),
                IoOp::Write => core.stats.record_write(request.len()),
            }
        }
        result
    }

    /// Resolves a completion token to its slot and finishes the request.
    /// Returns `None` for tokens that no longer match a slot.
    fn complete(
        &self,
        core: &IoCore,
        segment: SegmentId,
        token: u64,
        result: i32,
    ) -> Option<Completion> {
        let (array, _) = core.registry.segment(segment);
        let index = (token & 0xffff_ffff) as SlotIndex;
        if index >= array.n_slots() {
            warn!("segment {}: completion for unknown slot {}", segment, index);
            return None;
        }

        let mut state = array.lock();
        let slot = state.slot(index);
        if !slot.is_reserved() || slot.native_token() != token {
            debug!("segment {}: dropping stale completion {:#x}", segment, token);
            return None;
        }
        let handle = slot.handle();

        // Transferred synchronously at dispatch; the Nop only carries the token.
        if slot.status() == SlotStatus::Done {
            return Some(claim_and_free(array, &mut state, handle));
        }

        let request = slot.request()?.clone();
        let expected = request.len();
        if result >= 0 && result as usize == expected {
            match request.op {
                IoOp::Read => core.stats.record_read(expected),
                IoOp::Write => core.stats.record_write(expected),
            }
            state.checked_slot_mut(handle).mark_done(true);
            return Some(claim_and_free(array, &mut state, handle));
        }
        drop(state);

        let success = self.recover(core, segment, &request, result);

        let mut state = array.lock();
        state.checked_slot_mut(handle).mark_done(success);
        Some(claim_and_free(array, &mut state, handle))
    }

    /// Handles a failed or short native transfer: consult the retry policy,
    /// then make one synchronous attempt.
    fn recover(&self, core: &IoCore, segment: SegmentId, request: &IoRequest, result: i32) -> bool {
        let ctx = ErrorContext {
            file: &request.name,
            operation: request.op.syscall_name(),
            offset: request.offset,
        };

        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            if !core.errors.handle(&err, ctx) {
                return false;
            }
        } else {
            warn!(
                "segment {}: native {} of {} transferred {} of {} bytes at offset {}, retrying synchronously",
                segment,
                ctx.operation,
                ctx.file,
                result,
                request.len(),
                request.offset
            );
        }

        match Self::transfer_sync(core, request) {
            Ok(()) => true,
            Err(err) => {
                core.errors.handle(&err, ctx);
                error!(
                    "segment {}: synchronous fallback for {} on {} failed: {}",
                    segment, ctx.operation, ctx.file, err
                );
                false
            }
        }
    }

    /// Serves a request whose file has no descriptor. The transfer happens
    /// here; the ring only carries a `Nop` with the slot's token. The request
    /// is never rejected once the transfer ran, so it cannot be repeated.
    fn dispatch_sync(
        core: &IoCore,
        array: &RequestArray,
        ring: &SegmentRing,
        segment: SegmentId,
        handle: SlotHandle,
        request: &IoRequest,
        token: u64,
    ) -> io::Result<()> {
        let ctx = ErrorContext {
            file: &request.name,
            operation: request.op.syscall_name(),
            offset: request.offset,
        };
        let success = core
            .errors
            .retry(ctx, || Self::transfer_sync(core, request))
            .is_ok();
        array.lock().checked_slot_mut(handle).mark_done(success);

        let nop = opcode::Nop::new().build().user_data(token);
        // SAFETY: a Nop references no memory.
        if let Err(err) = unsafe { ring.push(&nop) } {
            warn!(
                "segment {}: could not queue completion for slot {} ({}), handler will scan for it",
                segment, handle.index, err
            );
            ring.orphaned_done.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Claims a `Done` slot of the segment that has no completion queued.
    fn claim_orphan(&self, core: &IoCore, segment: SegmentId) -> Option<Completion> {
        let (array, local) = core.registry.segment(segment);
        let mut state = array.lock();
        let mut done = state
            .segment_range(local)
            .filter(|&i| {
                let slot = state.slot(i);
                slot.is_reserved() && slot.status() == SlotStatus::Done
            })
            .map(|i| state.slot(i).handle());
        let handle = done.next()?;
        if done.next().is_some() {
            self.rings[segment].orphaned_done.store(true, Ordering::Release);
        }
        drop(done);
        Some(claim_and_free(array, &mut state, handle))
    }

    fn reap(
        &self,
        core: &IoCore,
        segment: SegmentId,
    ) -> Result<Option<Completion>, Stop> {
        while let Some((token, result)) = self.rings[segment].pop() {
            if token == SHUTDOWN_TOKEN {
                let ring = &self.rings[segment];
                if !ring.sentinel_reposted.swap(true, Ordering::AcqRel) {
                    if let Err(err) = ring.post_sentinel() {
                        warn!("segment {}: could not re-post shutdown sentinel: {}", segment, err);
                    }
                }
                return Err(Stop);
            }
            if let Some(completion) = self.complete(core, segment, token, result) {
                return Ok(Some(completion));
            }
        }
        if self.rings[segment].orphaned_done.swap(false, Ordering::AcqRel) {
            return Ok(self.claim_orphan(core, segment));
        }
        Ok(None)
    }
}

/// The shutdown sentinel was reaped.
struct Stop;

fn claim_and_free(array: &RequestArray, state: &mut ArrayState, handle: SlotHandle) -> Completion {
    let completion = state.checked_slot_mut(handle).claim();
    array.free_locked(state, handle);
    completion
}

impl AsyncIoBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn dispatch(
        &self,
        core: &IoCore,
        kind: ArrayKind,
        handle: SlotHandle,
        _wake_later: bool,
    ) -> io::Result<()> {
        let segment = core
            .registry
            .global_segment_of(kind, handle.index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "array has no segment"))?;
        let array = core.registry.array(kind);

        let (request, token) = {
            let mut state = array.lock();
            let slot = state.checked_slot_mut(handle);
            let request = slot
                .request()
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty slot"))?;
            slot.mark_issued();
            (request, slot.native_token())
        };

        let ring = &self.rings[segment];
        let Some(fd) = request.file.raw_fd() else {
            return Self::dispatch_sync(core, array, ring, segment, handle, &request, token);
        };
        let entry = Self::build_entry(&request, fd, token)?;

        // SAFETY: the caller keeps the buffer alive until the completion is
        // claimed, which happens only after the CQE is reaped.
        unsafe { ring.push(&entry) }
    }

    fn wait_for_completion(
        &self,
        core: &IoCore,
        segment: SegmentId,
        _scratch: &mut AlignedBuffer,
    ) -> Option<Completion> {
        loop {
            match self.reap(core, segment) {
                Ok(Some(completion)) => return Some(completion),
                Ok(None) => {}
                Err(Stop) => return None,
            }

            core.segment_states
                .set(segment, SegmentState::WaitingForCompletion);
            if let Err(err) = self.rings[segment].ring.submit_and_wait(1) {
                let ctx = ErrorContext {
                    file: "io_uring",
                    operation: "io_uring_enter",
                    offset: 0,
                };
                if !core.errors.handle(&err, ctx) {
                    error!("segment {}: giving up on completion retrieval: {}", segment, err);
                    return None;
                }
            }
        }
    }

    fn try_completion(
        &self,
        core: &IoCore,
        segment: SegmentId,
        _scratch: &mut AlignedBuffer,
    ) -> Option<Completion> {
        self.reap(core, segment).ok().flatten()
    }

    fn wake_segment(&self, _core: &IoCore, _segment: SegmentId) {}

    fn wake_all_segments(&self, _core: &IoCore) {}

    fn on_array_full(&self, _core: &IoCore) {}

    fn begin_shutdown(&self, _core: &IoCore) {
        for (segment, ring) in self.rings.iter().enumerate() {
            if let Err(err) = ring.post_sentinel() {
                error!("segment {}: could not post shutdown sentinel: {}", segment, err);
            }
        }
    }
}
