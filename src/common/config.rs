use std::time::Duration;

/** Logical block size: offsets and lengths of every request must be a multiple of it. */
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/** log2 of the page size used for segment locality and scratch buffer alignment. */
pub const PAGE_SIZE_SHIFT: u32 = 14;
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_SHIFT; // 16KB data page

/** Requests within the same 2^(PAGE_SIZE_SHIFT + 6) byte window prefer the same segment. */
pub const SEGMENT_LOCALITY_SHIFT: u32 = 6;

/** Upper bound on the number of slots coalesced into one syscall. */
pub const MAX_MERGE_RUN: usize = 64;

/** Requests older than this are served before lower offsets. */
pub const STARVATION_AGE: Duration = Duration::from_secs(2);

pub const RETRY_DELAY: Duration = Duration::from_millis(100);
pub const LONG_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const READ_THREADS_SLEEP: Duration = Duration::from_millis(100);

/** Global segments 0 and 1 are reserved for the insert buffer and the log. */
pub const IBUF_SEGMENT: usize = 0;
pub const LOG_SEGMENT: usize = 1;
pub const FIRST_READ_SEGMENT: usize = 2;

pub type SpaceId = u32; // tablespace / owner tag
pub type Message = u64; // opaque caller correlation token
pub type SegmentId = usize; // global segment number
pub type SlotIndex = usize; // position of a slot inside its array
