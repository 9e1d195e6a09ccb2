//! # Request Slots
//!
//! A [`Slot`] describes one in-flight I/O request. Slots are pre-allocated by
//! their [`RequestArray`] and never individually created or destroyed; a
//! reservation borrows a free slot and a claim hands it back.
//!
//! ## State Machine
//!
//! ```text
//!   ┌────────┐ reserve  ┌────────────┐ merge/submit ┌────────┐ syscall done ┌────────┐
//!   │  free  │ ───────► │ NotIssued  │ ───────────► │ Issued │ ───────────► │  Done  │
//!   └────────┘          └────────────┘              └────────┘              └────────┘
//!        ▲                                                                       │
//!        │                            free_slot        ┌─────────┐    claim      │
//!        └──────────────────────────────────────────── │ Claimed │ ◄─────────────┘
//!                                                      └─────────┘
//! ```
//!
//! Every transition moves exactly one step forward. Anything else is an
//! invariant violation and panics.
//!
//! [`RequestArray`]: super::array::RequestArray

use std::sync::Arc;
use std::time::Instant;

use crate::common::config::{Message, SlotIndex, SpaceId};
use crate::storage::disk::aio::buffer::IoBuf;
use crate::storage::disk::aio::file::FileHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoOp {
    Read,
    Write,
}

impl IoOp {
    pub fn is_read(self) -> bool {
        self == IoOp::Read
    }

    /// Syscall name used in diagnostics.
    pub fn syscall_name(self) -> &'static str {
        match self {
            IoOp::Read => "pread",
            IoOp::Write => "pwrite",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotStatus {
    NotIssued,
    Issued,
    Done,
    Claimed,
}

impl SlotStatus {
    fn next(self) -> Option<SlotStatus> {
        match self {
            SlotStatus::NotIssued => Some(SlotStatus::Issued),
            SlotStatus::Issued => Some(SlotStatus::Done),
            SlotStatus::Done => Some(SlotStatus::Claimed),
            SlotStatus::Claimed => None,
        }
    }
}

/// Everything a caller supplies for one request.
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub op: IoOp,
    pub file: FileHandle,
    /// Diagnostic file name.
    pub name: Arc<str>,
    pub buf: IoBuf,
    pub offset: u64,
    pub message1: Message,
    pub message2: Message,
    pub space_id: SpaceId,
}

impl IoRequest {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Low 32 bits of the file offset.
    pub fn offset_low(&self) -> u32 {
        self.offset as u32
    }

    /// High 32 bits of the file offset.
    pub fn offset_high(&self) -> u32 {
        (self.offset >> 32) as u32
    }

    /// First byte past the request, `None` if it would wrap.
    pub fn end_offset(&self) -> Option<u64> {
        self.offset.checked_add(self.len() as u64)
    }
}

/// Joins the two 32-bit halves of a file offset.
pub fn join_offset(low: u32, high: u32) -> u64 {
    ((high as u64) << 32) | low as u64
}

/// Checked reference to a reserved slot. The generation changes on every
/// reservation, so a stale handle cannot free somebody else's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    pub index: SlotIndex,
    pub generation: u64,
}

/// What a handler thread hands back to the page-cache layer once a request has
/// been claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub message1: Message,
    pub message2: Message,
    pub op: IoOp,
    pub space_id: SpaceId,
    pub offset: u64,
    pub len: usize,
    pub success: bool,
}

#[derive(Debug)]
pub struct Slot {
    index: SlotIndex,
    generation: u64,
    reserved: bool,
    status: SlotStatus,
    reservation_time: Option<Instant>,
    request: Option<IoRequest>,
    /// Token the native backend attaches to the submission (user data).
    native_token: u64,
    /// Outcome recorded when the slot reaches `Done`.
    success: bool,
}

impl Slot {
    pub(crate) fn new(index: SlotIndex) -> Self {
        Self {
            index,
            generation: 0,
            reserved: false,
            status: SlotStatus::NotIssued,
            reservation_time: None,
            request: None,
            native_token: 0,
            success: false,
        }
    }

    pub fn index(&self) -> SlotIndex {
        self.index
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    pub fn reservation_time(&self) -> Option<Instant> {
        self.reservation_time
    }

    pub fn handle(&self) -> SlotHandle {
        SlotHandle {
            index: self.index,
            generation: self.generation,
        }
    }

    pub fn request(&self) -> Option<&IoRequest> {
        self.request.as_ref()
    }

    pub fn native_token(&self) -> u64 {
        self.native_token
    }

    pub fn is_read(&self) -> bool {
        self.request.as_ref().is_some_and(|r| r.op.is_read())
    }

    pub fn len(&self) -> usize {
        self.request.as_ref().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn offset(&self) -> u64 {
        self.request.as_ref().map_or(0, |r| r.offset)
    }

    pub(crate) fn reserve(&mut self, request: IoRequest, now: Instant) -> SlotHandle {
        assert!(!self.reserved, "slot {} reserved twice", self.index);
        self.reserved = true;
        self.generation = self.generation.wrapping_add(1);
        self.status = SlotStatus::NotIssued;
        self.reservation_time = Some(now);
        self.request = Some(request);
        self.success = false;
        // Token layout: generation in the high half, index in the low half.
        self.native_token = (self.generation << 32) | self.index as u64;
        self.handle()
    }

    fn advance(&mut self, to: SlotStatus) {
        assert!(self.reserved, "slot {} is not reserved", self.index);
        assert_eq!(
            self.status.next(),
            Some(to),
            "illegal slot transition {:?} -> {:?} on slot {}",
            self.status,
            to,
            self.index
        );
        self.status = to;
    }

    pub(crate) fn mark_issued(&mut self) {
        self.advance(SlotStatus::Issued);
    }

    pub(crate) fn mark_done(&mut self, success: bool) {
        self.advance(SlotStatus::Done);
        self.success = success;
    }

    /// Moves a `Done` slot to `Claimed` and extracts what the caller needs.
    pub(crate) fn claim(&mut self) -> Completion {
        self.advance(SlotStatus::Claimed);
        let request = self
            .request
            .as_ref()
            .expect("reserved slot always carries a request");
        Completion {
            message1: request.message1,
            message2: request.message2,
            op: request.op,
            space_id: request.space_id,
            offset: request.offset,
            len: request.len(),
            success: self.success,
        }
    }

    pub(crate) fn release(&mut self) {
        assert!(self.reserved, "double free of slot {}", self.index);
        self.reserved = false;
        self.status = SlotStatus::NotIssued;
        self.request = None;
    }
}
