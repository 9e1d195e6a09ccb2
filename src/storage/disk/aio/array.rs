//! # Request Array
//!
//! A fixed-capacity pool of [`Slot`]s guarded by one mutex and partitioned into
//! equal segments. Each segment is served by one handler thread.
//!
//! ## Layout
//!
//! ```text
//!   RequestArray (n_slots = 8, n_segments = 2)
//!   ┌───────────────────────────────┬───────────────────────────────┐
//!   │          segment 0            │          segment 1            │
//!   │  slot0  slot1  slot2  slot3   │  slot4  slot5  slot6  slot7   │
//!   └───────────────────────────────┴───────────────────────────────┘
//!
//!   not_full  : signaled iff n_reserved < n_slots
//!   is_empty  : signaled iff n_reserved == 0
//! ```
//!
//! Both signals change only while the array mutex is held, in the same
//! critical section that changes `n_reserved`.
//!
//! ## Reservation
//!
//! A request prefers the segment `(offset >> (page_shift + 6)) % n_segments`
//! so that requests close together on disk land in the same segment, where
//! the merge engine can coalesce them. The scan starts at the preferred
//! segment's first slot and wraps around the whole array.
//!
//! When the array is full the caller blocks on `not_full`. This is the only
//! backpressure in the subsystem: a caller that keeps more requests in flight
//! than the array holds, without a handler draining it, hangs here.

use parking_lot::{Mutex, MutexGuard};

use crate::common::config::{SlotIndex, SEGMENT_LOCALITY_SHIFT};
use crate::common::sync::Event;
use crate::common::time::TimeSource;
use crate::storage::disk::aio::registry::ArrayKind;
use crate::storage::disk::aio::slot::{IoRequest, Slot, SlotHandle, SlotStatus};

#[derive(Debug)]
pub struct RequestArray {
    kind: ArrayKind,
    n_slots: usize,
    n_segments: usize,
    state: Mutex<ArrayState>,
    not_full: Event,
    is_empty: Event,
}

/// Slot storage and reservation count, only reachable under the array mutex.
#[derive(Debug)]
pub struct ArrayState {
    slots: Vec<Slot>,
    n_reserved: usize,
    slots_per_segment: usize,
}

impl ArrayState {
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, index: SlotIndex) -> &Slot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: SlotIndex) -> &mut Slot {
        &mut self.slots[index]
    }

    pub fn n_reserved(&self) -> usize {
        self.n_reserved
    }

    /// Slot indices belonging to a local segment.
    pub fn segment_range(&self, segment: usize) -> std::ops::Range<SlotIndex> {
        let start = segment * self.slots_per_segment;
        start..start + self.slots_per_segment
    }

    /// Resolves a handle to its slot, panicking if the handle is stale.
    pub fn checked_slot_mut(&mut self, handle: SlotHandle) -> &mut Slot {
        let slot = &mut self.slots[handle.index];
        assert!(
            slot.is_reserved() && slot.handle() == handle,
            "stale slot handle {:?}",
            handle
        );
        slot
    }
}

impl RequestArray {
    /// Creates an array with all slots free.
    ///
    /// # Panics
    ///
    /// If either count is zero or `n_slots` is not a multiple of `n_segments`.
    pub fn new(kind: ArrayKind, n_slots: usize, n_segments: usize) -> Self {
        assert!(n_slots > 0, "{:?} array needs at least one slot", kind);
        assert!(n_segments > 0, "{:?} array needs at least one segment", kind);
        assert_eq!(
            n_slots % n_segments,
            0,
            "{:?} array: {} slots cannot be split into {} segments",
            kind,
            n_slots,
            n_segments
        );

        let slots = (0..n_slots).map(Slot::new).collect();

        Self {
            kind,
            n_slots,
            n_segments,
            state: Mutex::new(ArrayState {
                slots,
                n_reserved: 0,
                slots_per_segment: n_slots / n_segments,
            }),
            not_full: Event::new(true),
            is_empty: Event::new(true),
        }
    }

    pub fn kind(&self) -> ArrayKind {
        self.kind
    }

    pub fn n_slots(&self) -> usize {
        self.n_slots
    }

    pub fn n_segments(&self) -> usize {
        self.n_segments
    }

    pub fn slots_per_segment(&self) -> usize {
        self.n_slots / self.n_segments
    }

    pub fn n_reserved(&self) -> usize {
        self.state.lock().n_reserved
    }

    pub fn not_full(&self) -> &Event {
        &self.not_full
    }

    pub fn is_empty(&self) -> &Event {
        &self.is_empty
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ArrayState> {
        self.state.lock()
    }

    /// Local segment a request at `offset` prefers.
    pub fn preferred_segment(&self, offset: u64, page_size_shift: u32) -> usize {
        ((offset >> (page_size_shift + SEGMENT_LOCALITY_SHIFT)) % self.n_segments as u64) as usize
    }

    /// Local segment that owns a slot.
    pub fn segment_of(&self, index: SlotIndex) -> usize {
        index / self.slots_per_segment()
    }

    /// Reserves a slot without blocking. Gives the request back if the array is full.
    pub fn try_reserve(
        &self,
        request: IoRequest,
        clock: &dyn TimeSource,
        page_size_shift: u32,
    ) -> Result<SlotHandle, IoRequest> {
        let preferred = self.preferred_segment(request.offset, page_size_shift);
        let mut state = self.state.lock();

        if state.n_reserved == self.n_slots {
            return Err(request);
        }

        let start = preferred * state.slots_per_segment;
        let index = (0..self.n_slots)
            .map(|i| (start + i) % self.n_slots)
            .find(|&i| !state.slots[i].is_reserved())
            .expect("n_reserved < n_slots implies a free slot");

        let handle = state.slots[index].reserve(request, clock.now());
        state.n_reserved += 1;

        if state.n_reserved == 1 {
            self.is_empty.reset();
        }
        if state.n_reserved == self.n_slots {
            self.not_full.reset();
        }

        Ok(handle)
    }

    /// Reserves a slot, blocking while the array is full. `on_full` runs each
    /// time the caller is about to block, outside the array mutex.
    pub fn reserve_slot(
        &self,
        mut request: IoRequest,
        clock: &dyn TimeSource,
        page_size_shift: u32,
        on_full: impl Fn(),
    ) -> SlotHandle {
        loop {
            match self.try_reserve(request, clock, page_size_shift) {
                Ok(handle) => return handle,
                Err(returned) => {
                    request = returned;
                    log::trace!("{:?} array full, waiting for a free slot", self.kind);
                    on_full();
                    self.not_full.wait();
                }
            }
        }
    }

    /// Frees a reserved slot.
    ///
    /// # Panics
    ///
    /// If the slot is not reserved or the handle is stale.
    pub fn free_slot(&self, handle: SlotHandle) {
        let mut state = self.state.lock();
        self.free_locked(&mut state, handle);
    }

    /// Frees a slot while the caller already holds the array mutex.
    pub(crate) fn free_locked(&self, state: &mut ArrayState, handle: SlotHandle) {
        state.checked_slot_mut(handle).release();
        state.n_reserved -= 1;

        if state.n_reserved == self.n_slots - 1 {
            self.not_full.set();
        }
        if state.n_reserved == 0 {
            self.is_empty.set();
        }
    }

    /// Number of reserved slots in each status, for diagnostics.
    pub fn status_counts(&self) -> [usize; 4] {
        let state = self.state.lock();
        let mut counts = [0usize; 4];
        for slot in state.slots.iter().filter(|s| s.is_reserved()) {
            let idx = match slot.status() {
                SlotStatus::NotIssued => 0,
                SlotStatus::Issued => 1,
                SlotStatus::Done => 2,
                SlotStatus::Claimed => 3,
            };
            counts[idx] += 1;
        }
        counts
    }

    /// Full consistency scan.
    ///
    /// # Panics
    ///
    /// If `n_reserved` disagrees with the slots, a reserved slot is empty, or a
    /// signal disagrees with the count.
    pub fn validate(&self) {
        let state = self.state.lock();
        let reserved = state.slots.iter().filter(|s| s.is_reserved()).count();
        assert_eq!(
            reserved, state.n_reserved,
            "{:?} array: n_reserved {} but {} slots reserved",
            self.kind, state.n_reserved, reserved
        );
        for slot in state.slots.iter().filter(|s| s.is_reserved()) {
            assert!(
                slot.len() > 0,
                "{:?} array: reserved slot {} has zero length",
                self.kind,
                slot.index()
            );
        }
        assert!(state.n_reserved <= self.n_slots);
        assert_eq!(self.not_full.is_set(), state.n_reserved < self.n_slots);
        assert_eq!(self.is_empty.is_set(), state.n_reserved == 0);
    }
}
