//! # Backend Seam
//!
//! The subsystem runs on exactly one [`AsyncIoBackend`], chosen at init:
//!
//! ```text
//!                        ┌────────────────────────┐
//!   IoSubsystem ───────► │  dyn AsyncIoBackend    │
//!                        └───────────┬────────────┘
//!                   ┌────────────────┴────────────────┐
//!                   ▼                                 ▼
//!        ┌─────────────────────┐           ┌─────────────────────┐
//!        │  SimulatedBackend   │           │   NativeBackend     │
//!        │  wake events + sync │           │  io_uring per       │
//!        │  syscalls + merging │           │  global segment     │
//!        └─────────────────────┘           └─────────────────────┘
//! ```
//!
//! Both backends share an [`IoCore`]: the arrays, the per-segment wake events,
//! the error handler, the counters and the clock.

use std::fmt::Debug;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::common::config::SegmentId;
use crate::common::sync::Event;
use crate::common::time::TimeSource;
use crate::storage::disk::aio::config::AioConfig;
use crate::storage::disk::aio::registry::{ArrayKind, ArrayRegistry};
use crate::storage::disk::aio::retry::ErrorHandler;
use crate::storage::disk::aio::slot::{Completion, SlotHandle};
use crate::storage::disk::aio::stats::{IoStats, SegmentStates};
use crate::storage::disk::direct_io::AlignedBuffer;

/// State shared by the submission side, the handler threads and the backend.
#[derive(Debug)]
pub struct IoCore {
    pub config: AioConfig,
    pub registry: ArrayRegistry,
    /// One wake event per global segment. Only the simulated backend waits on them.
    pub segment_events: Vec<Event>,
    pub segment_states: SegmentStates,
    pub errors: ErrorHandler,
    pub stats: IoStats,
    pub clock: Arc<dyn TimeSource>,
    shutting_down: AtomicBool,
    read_threads_sleep: AtomicBool,
}

impl IoCore {
    pub fn new(config: AioConfig, clock: Arc<dyn TimeSource>) -> Self {
        let n_segments = config.total_segments();
        Self {
            registry: ArrayRegistry::new(&config),
            segment_events: (0..n_segments).map(|_| Event::new(false)).collect(),
            segment_states: SegmentStates::new(n_segments),
            errors: ErrorHandler::new(&config),
            stats: IoStats::new(clock.now()),
            clock,
            config,
            shutting_down: AtomicBool::new(false),
            read_threads_sleep: AtomicBool::new(false),
        }
    }

    pub fn n_segments(&self) -> usize {
        self.segment_events.len()
    }

    pub fn wake_segment(&self, segment: SegmentId) {
        self.segment_events[segment].set();
    }

    /// Signals every segment event and withdraws the read-thread sleep
    /// recommendation.
    pub fn wake_all_segments(&self) {
        self.read_threads_sleep.store(false, Ordering::Release);
        for event in &self.segment_events {
            event.set();
        }
    }

    /// Recommends that read handlers pause after waking, so read-ahead
    /// requests can pile up and be merged. Resets the wake event of every read
    /// segment that has nothing pending.
    pub fn put_read_threads_to_sleep(&self) {
        self.read_threads_sleep.store(true, Ordering::Release);
        let read = self.registry.array(ArrayKind::Read);
        let map = self.registry.segment_map();
        let state = read.lock();
        for local in 0..read.n_segments() {
            let idle = !state
                .segment_range(local)
                .any(|i| state.slot(i).is_reserved());
            if idle {
                if let Some(global) = map.to_global(ArrayKind::Read, local) {
                    self.segment_events[global].reset();
                }
            }
        }
    }

    pub fn read_threads_should_sleep(&self) -> bool {
        self.read_threads_sleep.load(Ordering::Acquire)
    }

    /// Flips the shutdown flag. Returns `false` if it was already set.
    pub fn begin_shutdown(&self) -> bool {
        let first = !self.shutting_down.swap(true, Ordering::AcqRel);
        if first {
            debug!("aio core entering shutdown");
        }
        first
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

/// Platform strategy for issuing requests and retrieving their completions.
pub trait AsyncIoBackend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Hands a freshly reserved slot to the backend. An error means the
    /// request was rejected before anything was issued; the caller frees the
    /// slot and consults the retry policy.
    fn dispatch(
        &self,
        core: &IoCore,
        kind: ArrayKind,
        handle: SlotHandle,
        wake_later: bool,
    ) -> io::Result<()>;

    /// Blocks until one request of `segment` is complete and claims it.
    /// Returns `None` once the subsystem is shutting down and the segment has
    /// nothing left to serve.
    fn wait_for_completion(
        &self,
        core: &IoCore,
        segment: SegmentId,
        scratch: &mut AlignedBuffer,
    ) -> Option<Completion>;

    /// Non-blocking variant of [`AsyncIoBackend::wait_for_completion`].
    fn try_completion(
        &self,
        core: &IoCore,
        segment: SegmentId,
        scratch: &mut AlignedBuffer,
    ) -> Option<Completion>;

    fn wake_segment(&self, core: &IoCore, segment: SegmentId);

    fn wake_all_segments(&self, core: &IoCore);

    /// Runs each time a submitter is about to block on a full array.
    fn on_array_full(&self, core: &IoCore);

    /// Releases every handler blocked in `wait_for_completion`.
    fn begin_shutdown(&self, core: &IoCore);
}
