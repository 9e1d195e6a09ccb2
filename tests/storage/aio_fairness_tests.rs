use std::sync::Arc;
use std::time::Duration;

use tkaio::common::time::ManualTimeSource;
use tkaio::storage::disk::aio::registry::SegmentMap;
use tkaio::storage::disk::aio::{AioConfig, AioMode, IoOp, IoSubsystem};
use tkaio::storage::disk::direct_io::AlignedBuffer;

use crate::common::files::{request, TestFiles};
use crate::common::logger::init_test_logger;

const READ_SEGMENT: usize = 2;

struct FairnessContext {
    files: TestFiles,
    clock: ManualTimeSource,
    aio: IoSubsystem,
}

impl FairnessContext {
    fn new() -> Self {
        init_test_logger();
        let clock = ManualTimeSource::new();
        let aio = IoSubsystem::with_time_source(
            AioConfig {
                slots_per_segment: 16,
                read_segments: 1,
                write_segments: 1,
                ..AioConfig::default()
            },
            Arc::new(clock.clone()),
        )
        .unwrap();
        Self {
            files: TestFiles::new(),
            clock,
            aio,
        }
    }
}

#[test]
fn lone_far_request_is_served_once_it_starves() {
    let ctx = FairnessContext::new();
    let file = ctx.files.open("fair.ibd");
    file.write_all_at(&vec![0u8; 2 << 20], 0).unwrap();
    let mut scratch = AlignedBuffer::with_page_alignment();

    let mut far = vec![0u8; 512];
    assert_ok!(ctx.aio.submit(
        AioMode::Normal,
        request(&file, "fair.ibd", IoOp::Read, &mut far, 1 << 20, 999)
    ));

    // A steady stream of lower offsets keeps arriving. Each one is served
    // ahead of the far request while it is young.
    let mut near = vec![vec![0u8; 512]; 8];
    let mut served = Vec::new();
    for (i, page) in near.iter_mut().enumerate() {
        assert_ok!(ctx.aio.submit(
            AioMode::Normal,
            request(&file, "fair.ibd", IoOp::Read, page, (i as u64) * 4096, i as u64)
        ));
        ctx.clock.advance(Duration::from_millis(500));
        served.push(ctx.aio.poll_completion(READ_SEGMENT, &mut scratch).unwrap().message1);
        if served.contains(&999) {
            break;
        }
    }

    // Three near requests go first; at two seconds the far one has starved.
    let position = served.iter().position(|&m| m == 999).unwrap();
    assert_eq!(position, 3);
    assert_eq!(&served[..3], &[0, 1, 2]);

    while ctx.aio.poll_completion(READ_SEGMENT, &mut scratch).is_some() {}
    assert!(ctx.aio.all_slots_free());
}

#[test]
fn equally_starved_requests_fall_back_to_offset_order() {
    let ctx = FairnessContext::new();
    let file = ctx.files.open("ties.ibd");
    file.write_all_at(&vec![0u8; 1 << 20], 0).unwrap();
    let mut scratch = AlignedBuffer::with_page_alignment();

    let mut high = vec![0u8; 512];
    let mut low = vec![0u8; 512];
    assert_ok!(ctx.aio.submit(
        AioMode::Normal,
        request(&file, "ties.ibd", IoOp::Read, &mut high, 65536, 2)
    ));
    ctx.clock.advance(Duration::from_millis(300));
    assert_ok!(ctx.aio.submit(
        AioMode::Normal,
        request(&file, "ties.ibd", IoOp::Read, &mut low, 8192, 1)
    ));
    ctx.clock.advance(Duration::from_secs(3));

    // Both aged three whole seconds: the lower offset goes first.
    assert_eq!(ctx.aio.poll_completion(READ_SEGMENT, &mut scratch).unwrap().message1, 1);
    assert_eq!(ctx.aio.poll_completion(READ_SEGMENT, &mut scratch).unwrap().message1, 2);
}

#[test]
fn segment_numbering_round_trips() {
    for read in 1..=16 {
        for write in 1..=16 {
            let map = SegmentMap::new(read, write);
            assert_eq!(map.total_segments(), 2 + read + write);
            let mut seen = vec![false; map.total_segments()];
            for global in 0..map.total_segments() {
                let (kind, local) = map.to_local(global);
                let back = map.to_global(kind, local).unwrap();
                assert_eq!(back, global);
                assert!(!seen[back]);
                seen[back] = true;
            }
            assert!(seen.iter().all(|&s| s));
        }
    }
}
