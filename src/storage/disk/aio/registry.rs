//! # Array Registry
//!
//! The fixed set of request arrays and the flat global segment numbering
//! handler threads are assigned by.
//!
//! ```text
//!   global segment:   0        1       2 .. 2+R-1        2+R .. 2+R+W-1
//!                  ┌──────┐ ┌─────┐ ┌───────────────┐ ┌──────────────────┐
//!   array:         │ ibuf │ │ log │ │  read (R seg) │ │  write (W seg)   │
//!                  └──────┘ └─────┘ └───────────────┘ └──────────────────┘
//!
//!   sync array: one segment, outside the global numbering
//! ```

use std::fmt;

use crate::common::config::{SegmentId, FIRST_READ_SEGMENT, IBUF_SEGMENT, LOG_SEGMENT};
use crate::storage::disk::aio::array::RequestArray;
use crate::storage::disk::aio::config::AioConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    Ibuf,
    Log,
    Read,
    Write,
    Sync,
}

impl ArrayKind {
    pub const ALL: [ArrayKind; 5] = [
        ArrayKind::Ibuf,
        ArrayKind::Log,
        ArrayKind::Read,
        ArrayKind::Write,
        ArrayKind::Sync,
    ];
}

impl fmt::Display for ArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArrayKind::Ibuf => "insert buffer",
            ArrayKind::Log => "log",
            ArrayKind::Read => "read",
            ArrayKind::Write => "write",
            ArrayKind::Sync => "sync",
        };
        f.write_str(name)
    }
}

/// Pure mapping between global segment numbers and (array, local segment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMap {
    read_segments: usize,
    write_segments: usize,
}

impl SegmentMap {
    pub fn new(read_segments: usize, write_segments: usize) -> Self {
        Self {
            read_segments,
            write_segments,
        }
    }

    pub fn total_segments(&self) -> usize {
        FIRST_READ_SEGMENT + self.read_segments + self.write_segments
    }

    fn first_write_segment(&self) -> SegmentId {
        FIRST_READ_SEGMENT + self.read_segments
    }

    /// Resolves a global segment to its array and local segment index.
    ///
    /// # Panics
    ///
    /// If `global` is out of range.
    pub fn to_local(&self, global: SegmentId) -> (ArrayKind, usize) {
        assert!(
            global < self.total_segments(),
            "global segment {} out of range (total {})",
            global,
            self.total_segments()
        );
        match global {
            IBUF_SEGMENT => (ArrayKind::Ibuf, 0),
            LOG_SEGMENT => (ArrayKind::Log, 0),
            g if g < self.first_write_segment() => (ArrayKind::Read, g - FIRST_READ_SEGMENT),
            g => (ArrayKind::Write, g - self.first_write_segment()),
        }
    }

    /// Global segment number of a local segment. The sync array has none.
    pub fn to_global(&self, kind: ArrayKind, local: usize) -> Option<SegmentId> {
        match kind {
            ArrayKind::Ibuf if local == 0 => Some(IBUF_SEGMENT),
            ArrayKind::Log if local == 0 => Some(LOG_SEGMENT),
            ArrayKind::Read if local < self.read_segments => Some(FIRST_READ_SEGMENT + local),
            ArrayKind::Write if local < self.write_segments => {
                Some(self.first_write_segment() + local)
            }
            _ => None,
        }
    }

    pub fn read_segment_range(&self) -> std::ops::Range<SegmentId> {
        FIRST_READ_SEGMENT..self.first_write_segment()
    }
}

#[derive(Debug)]
pub struct ArrayRegistry {
    map: SegmentMap,
    ibuf: RequestArray,
    log: RequestArray,
    read: RequestArray,
    write: RequestArray,
    sync: RequestArray,
}

impl ArrayRegistry {
    pub fn new(config: &AioConfig) -> Self {
        let n = config.slots_per_segment;
        Self {
            map: SegmentMap::new(config.read_segments, config.write_segments),
            ibuf: RequestArray::new(ArrayKind::Ibuf, n, 1),
            log: RequestArray::new(ArrayKind::Log, n, 1),
            read: RequestArray::new(
                ArrayKind::Read,
                n * config.read_segments,
                config.read_segments,
            ),
            write: RequestArray::new(
                ArrayKind::Write,
                n * config.write_segments,
                config.write_segments,
            ),
            sync: RequestArray::new(ArrayKind::Sync, config.sync_slots, 1),
        }
    }

    pub fn segment_map(&self) -> &SegmentMap {
        &self.map
    }

    pub fn array(&self, kind: ArrayKind) -> &RequestArray {
        match kind {
            ArrayKind::Ibuf => &self.ibuf,
            ArrayKind::Log => &self.log,
            ArrayKind::Read => &self.read,
            ArrayKind::Write => &self.write,
            ArrayKind::Sync => &self.sync,
        }
    }

    pub fn arrays(&self) -> impl Iterator<Item = &RequestArray> {
        ArrayKind::ALL.into_iter().map(move |kind| self.array(kind))
    }

    /// Array and local segment serving a global segment.
    pub fn segment(&self, global: SegmentId) -> (&RequestArray, usize) {
        let (kind, local) = self.map.to_local(global);
        (self.array(kind), local)
    }

    /// Global segment that owns a slot of a non-sync array.
    pub fn global_segment_of(&self, kind: ArrayKind, index: usize) -> Option<SegmentId> {
        let array = self.array(kind);
        self.map.to_global(kind, array.segment_of(index))
    }

    pub fn all_slots_free(&self) -> bool {
        self.arrays().all(|array| array.n_reserved() == 0)
    }

    pub fn validate(&self) {
        for array in self.arrays() {
            array.validate();
        }
    }
}
