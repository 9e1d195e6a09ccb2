//! # Simulated Asynchronous I/O
//!
//! Asynchrony built from synchronous positioned I/O plus one handler thread
//! per segment. Each handler repeatedly runs [`SimulatedBackend::poll_segment`]
//! over its own slots:
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │ 1. a Done slot in the segment?            ──yes──► claim it, return  │
//!   │                      │ no                                            │
//!   │ 2. pick a NotIssued slot:                                            │
//!   │      oldest aged >= starvation_age (ties: lowest offset)             │
//!   │      else lowest offset                   ──none─► reset wake event, │
//!   │                      │                             sleep on it       │
//!   │ 3. extend the run: next slot starts where the run ends,              │
//!   │    same file, same direction, at most max_merge_run slots            │
//!   │    mark the run Issued, drop the array mutex                         │
//!   │                      │                                               │
//!   │ 4. one syscall                                                       │
//!   │      single slot : caller buffer directly                            │
//!   │      merged run  : scratch buffer, copy-in (write) / copy-out (read) │
//!   │    retake the mutex, mark the run Done                               │
//!   │                      │                                               │
//!   │ 5. claim the first slot of the run, free it, return its completion   │
//!   │    (the rest of the run is claimed by later calls through step 1)    │
//!   └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The wake event is reset while the array mutex is held and a submitter only
//! signals it after reserving under that same mutex, so a request can never
//! slip in between "found nothing" and "went to sleep".

use std::cmp::Reverse;
use std::io;
use std::ops::Range;
use std::thread;

use log::{debug, trace, warn};

use crate::common::config::{SegmentId, SlotIndex};
use crate::storage::disk::aio::array::{ArrayState, RequestArray};
use crate::storage::disk::aio::backend::{AsyncIoBackend, IoCore};
use crate::storage::disk::aio::registry::ArrayKind;
use crate::storage::disk::aio::retry::ErrorContext;
use crate::storage::disk::aio::slot::{Completion, IoOp, IoRequest, Slot, SlotHandle, SlotStatus};
use crate::storage::disk::aio::stats::SegmentState;
use crate::storage::disk::direct_io::AlignedBuffer;

#[derive(Debug, Default)]
pub struct SimulatedBackend;

impl SimulatedBackend {
    pub fn new() -> Self {
        Self
    }

    /// Runs one iteration of the completion loop for a global segment without
    /// blocking. Returns `None` when the segment has nothing to do, in which
    /// case its wake event has been reset.
    pub fn poll_segment(
        &self,
        core: &IoCore,
        segment: SegmentId,
        scratch: &mut AlignedBuffer,
    ) -> Option<Completion> {
        let (array, local) = core.registry.segment(segment);
        core.segment_states
            .set(segment, SegmentState::LookingForRequests);

        let mut state = array.lock();
        let range = state.segment_range(local);

        if let Some(done) = range.clone().find(|&i| {
            let slot = state.slot(i);
            slot.is_reserved() && slot.status() == SlotStatus::Done
        }) {
            return Some(claim_and_free(array, &mut state, done));
        }

        let Some(first) = select_slot(&state, range.clone(), core) else {
            core.segment_events[segment].reset();
            core.segment_states
                .set(segment, SegmentState::WaitingForRequest);
            return None;
        };

        let run = collect_run(&state, first, range, core.config.max_merge_run);
        for (index, _) in &run {
            state.slot_mut(*index).mark_issued();
        }
        drop(state);

        core.segment_states.set(segment, SegmentState::DoingFileIo);
        let success = execute_run(core, segment, &run, scratch);

        let mut state = array.lock();
        for (index, _) in &run {
            state.slot_mut(*index).mark_done(success);
        }
        core.segment_states.set(segment, SegmentState::FileIoDone);
        Some(claim_and_free(array, &mut state, run[0].0))
    }
}

/// Request of a slot that is waiting to be issued.
fn pending_request(slot: &Slot) -> Option<&IoRequest> {
    if slot.is_reserved() && slot.status() == SlotStatus::NotIssued {
        slot.request()
    } else {
        None
    }
}

/// Picks where the next run starts: the oldest starving request, or failing
/// that the lowest offset. Ages are compared in whole seconds, so requests
/// that starved for the same number of seconds fall back to offset order.
fn select_slot(state: &ArrayState, range: Range<SlotIndex>, core: &IoCore) -> Option<SlotIndex> {
    let now = core.clock.now();
    let starvation_age = core.config.starvation_age;

    let starving = range
        .clone()
        .filter_map(|i| {
            let slot = state.slot(i);
            let request = pending_request(slot)?;
            let age = now.saturating_duration_since(slot.reservation_time()?);
            (age >= starvation_age).then_some((i, age.as_secs(), request.offset))
        })
        .min_by_key(|&(_, age_secs, offset)| (Reverse(age_secs), offset));

    if let Some((index, age_secs, offset)) = starving {
        trace!(
            "slot {} at offset {} starved for {}s, serving it first",
            index,
            offset,
            age_secs
        );
        return Some(index);
    }

    range
        .filter_map(|i| pending_request(state.slot(i)).map(|r| (i, r.offset)))
        .min_by_key(|&(_, offset)| offset)
        .map(|(i, _)| i)
}

/// Builds the run of consecutive requests starting at `first`.
fn collect_run(
    state: &ArrayState,
    first: SlotIndex,
    range: Range<SlotIndex>,
    max_merge_run: usize,
) -> Vec<(SlotIndex, IoRequest)> {
    let head = match pending_request(state.slot(first)) {
        Some(request) => request.clone(),
        None => return Vec::new(),
    };
    let mut end = head.end_offset();
    let mut run = vec![(first, head)];

    while run.len() < max_merge_run {
        let Some(expected) = end else { break };
        let (op, file_id) = (run[0].1.op, run[0].1.file.id());

        let next = range.clone().find_map(|i| {
            pending_request(state.slot(i))
                .filter(|r| r.op == op && r.file.id() == file_id && r.offset == expected)
                .map(|r| (i, r.clone()))
        });

        match next {
            Some((index, request)) => {
                end = request.end_offset();
                run.push((index, request));
            }
            None => break,
        }
    }
    run
}

/// Performs the single syscall serving a run. Returns whether every request
/// in the run was transferred in full.
fn execute_run(
    core: &IoCore,
    segment: SegmentId,
    run: &[(SlotIndex, IoRequest)],
    scratch: &mut AlignedBuffer,
) -> bool {
    let head = &run[0].1;
    let total: usize = run.iter().map(|(_, r)| r.len()).sum();
    let ctx = ErrorContext {
        file: &head.name,
        operation: head.op.syscall_name(),
        offset: head.offset,
    };

    if core.config.print_debug || run.len() > 1 {
        debug!(
            "segment {}: {} of {} bytes at offset {} in {} ({} request{})",
            segment,
            head.op.syscall_name(),
            total,
            head.offset,
            head.name,
            run.len(),
            if run.len() == 1 { "" } else { "s" }
        );
    }

    let result = if run.len() == 1 {
        // SAFETY: the slot is Issued and owned by this handler until it is
        // marked Done; the caller does not touch the buffer until claim.
        match head.op {
            IoOp::Read => core.errors.retry(ctx, || {
                head.file
                    .read_exact_at(unsafe { head.buf.as_mut_slice() }, head.offset)
            }),
            IoOp::Write => core.errors.retry(ctx, || {
                head.file
                    .write_all_at(unsafe { head.buf.as_slice() }, head.offset)
            }),
        }
    } else {
        let window = scratch.window(total);
        match head.op {
            IoOp::Write => {
                let mut pos = 0;
                for (_, request) in run {
                    // SAFETY: see above.
                    let src = unsafe { request.buf.as_slice() };
                    window[pos..pos + src.len()].copy_from_slice(src);
                    pos += src.len();
                }
                core.errors
                    .retry(ctx, || head.file.write_all_at(window, head.offset))
            }
            IoOp::Read => {
                let result = core
                    .errors
                    .retry(ctx, || head.file.read_exact_at(window, head.offset));
                if result.is_ok() {
                    let mut pos = 0;
                    for (_, request) in run {
                        // SAFETY: see above.
                        let dst = unsafe { request.buf.as_mut_slice() };
                        dst.copy_from_slice(&window[pos..pos + dst.len()]);
                        pos += dst.len();
                    }
                }
                result
            }
        }
    };

    match head.op {
        IoOp::Read => core.stats.record_read(total),
        IoOp::Write => core.stats.record_write(total),
    }
    core.stats.record_merge(run.len());

    match result {
        Ok(()) => true,
        Err(err) => {
            warn!(
                "segment {}: {} request{} failed: {}",
                segment,
                run.len(),
                if run.len() == 1 { "" } else { "s" },
                err
            );
            false
        }
    }
}

fn claim_and_free(array: &RequestArray, state: &mut ArrayState, index: SlotIndex) -> Completion {
    let slot = state.slot_mut(index);
    let completion = slot.claim();
    let handle: SlotHandle = slot.handle();
    array.free_locked(state, handle);
    completion
}

impl AsyncIoBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn dispatch(
        &self,
        core: &IoCore,
        kind: ArrayKind,
        handle: SlotHandle,
        wake_later: bool,
    ) -> io::Result<()> {
        if wake_later {
            return Ok(());
        }
        if let Some(segment) = core.registry.global_segment_of(kind, handle.index) {
            core.wake_segment(segment);
        }
        Ok(())
    }

    fn wait_for_completion(
        &self,
        core: &IoCore,
        segment: SegmentId,
        scratch: &mut AlignedBuffer,
    ) -> Option<Completion> {
        let is_read_segment = core
            .registry
            .segment_map()
            .read_segment_range()
            .contains(&segment);

        loop {
            if let Some(completion) = self.poll_segment(core, segment, scratch) {
                return Some(completion);
            }
            if core.is_shutting_down() {
                return None;
            }

            core.segment_events[segment].wait();

            if is_read_segment && core.read_threads_should_sleep() {
                trace!("read segment {} pausing so read-ahead can batch", segment);
                thread::sleep(core.config.read_threads_sleep);
            }
        }
    }

    fn try_completion(
        &self,
        core: &IoCore,
        segment: SegmentId,
        scratch: &mut AlignedBuffer,
    ) -> Option<Completion> {
        self.poll_segment(core, segment, scratch)
    }

    fn wake_segment(&self, core: &IoCore, segment: SegmentId) {
        core.wake_segment(segment);
    }

    fn wake_all_segments(&self, core: &IoCore) {
        core.wake_all_segments();
    }

    fn on_array_full(&self, core: &IoCore) {
        // Deferred wakes may be holding back the very handlers that would
        // free a slot.
        core.wake_all_segments();
    }

    fn begin_shutdown(&self, core: &IoCore) {
        core.wake_all_segments();
    }
}
