//! # I/O Statistics and Status Reporting
//!
//! Lock-free counters updated by the handler threads, plus a per-segment state
//! label that tells an operator what each handler is doing right now.
//!
//! ```text
//!   handler thread                 IoStats                      print_status()
//!   ──────────────                 ───────                      ──────────────
//!   record_read(bytes)   ──►  n_reads, bytes_read    ──┐
//!   record_write(bytes)  ──►  n_writes, bytes_written ─┼──►  totals + rates since
//!   record_fsync()       ──►  n_fsyncs               ──┘      the previous call
//!   record_merge(n)      ──►  n_merged_runs, n_merged_slots
//! ```
//!
//! Rates are computed against a baseline snapshot that `print_status` and
//! `refresh` move forward.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use log::info;
use parking_lot::Mutex;

use crate::common::config::SegmentId;
use crate::storage::disk::aio::registry::{ArrayKind, ArrayRegistry};

/// What the handler thread of a segment is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentState {
    NotStarted = 0,
    WaitingForRequest,
    LookingForRequests,
    DoingFileIo,
    FileIoDone,
    WaitingForCompletion,
    Exited,
}

impl SegmentState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SegmentState::WaitingForRequest,
            2 => SegmentState::LookingForRequests,
            3 => SegmentState::DoingFileIo,
            4 => SegmentState::FileIoDone,
            5 => SegmentState::WaitingForCompletion,
            6 => SegmentState::Exited,
            _ => SegmentState::NotStarted,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SegmentState::NotStarted => "not started yet",
            SegmentState::WaitingForRequest => "waiting for i/o request",
            SegmentState::LookingForRequests => "looking for i/o requests",
            SegmentState::DoingFileIo => "doing file i/o",
            SegmentState::FileIoDone => "file i/o done",
            SegmentState::WaitingForCompletion => "waiting for completed aio requests",
            SegmentState::Exited => "exited",
        }
    }
}

/// One state cell per global segment.
#[derive(Debug)]
pub struct SegmentStates {
    states: Vec<AtomicU8>,
}

impl SegmentStates {
    pub fn new(n_segments: usize) -> Self {
        Self {
            states: (0..n_segments)
                .map(|_| AtomicU8::new(SegmentState::NotStarted as u8))
                .collect(),
        }
    }

    pub fn set(&self, segment: SegmentId, state: SegmentState) {
        self.states[segment].store(state as u8, Ordering::Relaxed);
    }

    pub fn get(&self, segment: SegmentId) -> SegmentState {
        SegmentState::from_u8(self.states[segment].load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    n_reads: u64,
    n_writes: u64,
    n_fsyncs: u64,
    at: Instant,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub n_reads: u64,
    pub n_writes: u64,
    pub n_fsyncs: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub n_merged_runs: u64,
    pub n_merged_slots: u64,
    pub reads_per_sec: f64,
    pub writes_per_sec: f64,
    pub fsyncs_per_sec: f64,
}

#[derive(Debug)]
pub struct IoStats {
    n_reads: AtomicU64,
    n_writes: AtomicU64,
    n_fsyncs: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    n_merged_runs: AtomicU64,
    n_merged_slots: AtomicU64,
    baseline: Mutex<Baseline>,
}

impl IoStats {
    pub fn new(now: Instant) -> Self {
        Self {
            n_reads: AtomicU64::new(0),
            n_writes: AtomicU64::new(0),
            n_fsyncs: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            n_merged_runs: AtomicU64::new(0),
            n_merged_slots: AtomicU64::new(0),
            baseline: Mutex::new(Baseline {
                n_reads: 0,
                n_writes: 0,
                n_fsyncs: 0,
                at: now,
            }),
        }
    }

    pub fn record_read(&self, bytes: usize) {
        self.n_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.n_writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_fsync(&self) {
        self.n_fsyncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one syscall that served `n_slots` requests.
    pub fn record_merge(&self, n_slots: usize) {
        self.n_merged_runs.fetch_add(1, Ordering::Relaxed);
        self.n_merged_slots
            .fetch_add(n_slots as u64, Ordering::Relaxed);
    }

    pub fn n_reads(&self) -> u64 {
        self.n_reads.load(Ordering::Relaxed)
    }

    pub fn n_writes(&self) -> u64 {
        self.n_writes.load(Ordering::Relaxed)
    }

    pub fn n_fsyncs(&self) -> u64 {
        self.n_fsyncs.load(Ordering::Relaxed)
    }

    /// Current totals and the per-second rates since the baseline. Does not
    /// move the baseline.
    pub fn snapshot(&self, now: Instant) -> StatsSnapshot {
        let baseline = *self.baseline.lock();
        self.snapshot_against(&baseline, now)
    }

    fn snapshot_against(&self, baseline: &Baseline, now: Instant) -> StatsSnapshot {
        let n_reads = self.n_reads();
        let n_writes = self.n_writes();
        let n_fsyncs = self.n_fsyncs();
        let elapsed = now.saturating_duration_since(baseline.at).as_secs_f64();
        let rate = |current: u64, base: u64| {
            if elapsed > 0.0 {
                current.saturating_sub(base) as f64 / elapsed
            } else {
                0.0
            }
        };

        StatsSnapshot {
            n_reads,
            n_writes,
            n_fsyncs,
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            n_merged_runs: self.n_merged_runs.load(Ordering::Relaxed),
            n_merged_slots: self.n_merged_slots.load(Ordering::Relaxed),
            reads_per_sec: rate(n_reads, baseline.n_reads),
            writes_per_sec: rate(n_writes, baseline.n_writes),
            fsyncs_per_sec: rate(n_fsyncs, baseline.n_fsyncs),
        }
    }

    /// Moves the "since last call" baseline to `now` and returns the snapshot
    /// measured against the old one.
    pub fn refresh(&self, now: Instant) -> StatsSnapshot {
        let mut baseline = self.baseline.lock();
        let snapshot = self.snapshot_against(&baseline, now);
        *baseline = Baseline {
            n_reads: snapshot.n_reads,
            n_writes: snapshot.n_writes,
            n_fsyncs: snapshot.n_fsyncs,
            at: now,
        };
        snapshot
    }
}

/// Renders a status report of every segment and array, logs it, and moves the
/// rate baseline forward.
pub fn print_status(
    registry: &ArrayRegistry,
    segments: &SegmentStates,
    stats: &IoStats,
    now: Instant,
) -> String {
    let mut out = String::new();

    for segment in 0..segments.len() {
        let _ = writeln!(
            out,
            "I/O thread {} state: {}",
            segment,
            segments.get(segment).label()
        );
    }

    let _ = write!(out, "Pending normal aio reads:");
    let read = registry.array(ArrayKind::Read);
    for local in 0..read.n_segments() {
        let state = read.lock();
        let pending = state
            .segment_range(local)
            .filter(|&i| state.slot(i).is_reserved())
            .count();
        drop(state);
        let _ = write!(out, " {}", pending);
    }
    let _ = writeln!(out);

    for array in registry.arrays() {
        let [not_issued, issued, done, claimed] = array.status_counts();
        let _ = writeln!(
            out,
            "{} array: {} reserved of {} (not issued {}, issued {}, done {}, claimed {})",
            array.kind(),
            array.n_reserved(),
            array.n_slots(),
            not_issued,
            issued,
            done,
            claimed
        );
    }

    let snapshot = stats.refresh(now);
    let _ = writeln!(
        out,
        "{} OS file reads, {} OS file writes, {} OS fsyncs",
        snapshot.n_reads, snapshot.n_writes, snapshot.n_fsyncs
    );
    let _ = writeln!(
        out,
        "{:.2} reads/s, {:.2} writes/s, {:.2} fsyncs/s",
        snapshot.reads_per_sec, snapshot.writes_per_sec, snapshot.fsyncs_per_sec
    );
    if snapshot.n_merged_runs > 0 {
        let _ = writeln!(
            out,
            "{:.2} requests per merged syscall",
            snapshot.n_merged_slots as f64 / snapshot.n_merged_runs as f64
        );
    }

    info!("{}", out.trim_end());
    out
}
