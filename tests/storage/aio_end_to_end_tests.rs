use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tkaio::storage::disk::aio::{
    AioConfig, AioMode, ArrayKind, ChannelCompletionHandler, CompletionTracker, IoHandlerPool,
    IoOp, IoRequest, IoSubsystem,
};
use tkaio::storage::disk::direct_io::AlignedBuffer;

use crate::common::files::{request, Syscall, TestFiles};
use crate::common::logger::init_test_logger;

const WRITE_SEGMENT: usize = 3;

fn one_segment_config() -> AioConfig {
    AioConfig {
        slots_per_segment: 4,
        read_segments: 1,
        write_segments: 1,
        sync_slots: 4,
        fatal_on_unknown_error: false,
        ..AioConfig::default()
    }
}

fn check_adjacent_writes_merge(wake_later: bool) {
    init_test_logger();
    let files = TestFiles::new();
    let (file, log) = files.open_counting("ibdata1");
    let aio = assert_ok!(IoSubsystem::init(one_segment_config()));

    let mut first = vec![0x11u8; 4096];
    let mut second = vec![0x22u8; 4096];
    let submit = |request: IoRequest| {
        if wake_later {
            aio.submit_wake_later(AioMode::Normal, request)
        } else {
            aio.submit(AioMode::Normal, request)
        }
    };
    assert_ok!(submit(request(&file, "ibdata1", IoOp::Write, &mut first, 0, 1)));
    assert_ok!(submit(request(&file, "ibdata1", IoOp::Write, &mut second, 4096, 2)));
    assert_eq!(aio.registry().array(ArrayKind::Write).n_reserved(), 2);

    let mut scratch = AlignedBuffer::with_page_alignment();
    let a = aio.poll_completion(WRITE_SEGMENT, &mut scratch).unwrap();
    let b = aio.poll_completion(WRITE_SEGMENT, &mut scratch).unwrap();
    assert!(aio.poll_completion(WRITE_SEGMENT, &mut scratch).is_none());

    assert_eq!(
        *log.lock(),
        vec![Syscall {
            op: IoOp::Write,
            offset: 0,
            len: 8192
        }]
    );
    assert_eq!((a.message1, b.message1), (1, 2));
    assert_eq!(a.message2, 1 ^ 0xffff);
    assert_eq!(a.space_id, 42);
    assert_eq!(a.op, IoOp::Write);
    assert!(a.success && b.success);
    assert!(aio.all_slots_free());
    aio.validate();

    let mut back = vec![0u8; 8192];
    file.read_exact_at(&mut back, 0).unwrap();
    assert_eq!(&back[..4096], &first[..]);
    assert_eq!(&back[4096..], &second[..]);
}

#[test]
fn adjacent_writes_become_one_syscall() {
    check_adjacent_writes_merge(false);
}

#[test]
fn adjacent_deferred_writes_become_one_syscall() {
    check_adjacent_writes_merge(true);
}

#[test]
fn merged_writes_read_back_through_handlers() {
    init_test_logger();
    let files = TestFiles::new();
    let file = files.open("data.ibd");
    let aio = Arc::new(assert_ok!(IoSubsystem::init(AioConfig {
        slots_per_segment: 8,
        read_segments: 2,
        write_segments: 2,
        ..AioConfig::default()
    })));
    let (tx, rx) = unbounded();
    let mut pool = assert_ok!(IoHandlerPool::start(
        Arc::clone(&aio),
        Arc::new(ChannelCompletionHandler::new(tx))
    ));

    const PAGES: usize = 48;
    const PAGE: usize = 1024;
    let mut rng = StdRng::seed_from_u64(7);
    let mut written: Vec<Vec<u8>> = (0..PAGES)
        .map(|_| (0..PAGE).map(|_| rng.gen()).collect())
        .collect();

    // More requests than the write array holds: submitters block until the
    // deferred handlers are nudged awake by the full array.
    for (i, page) in written.iter_mut().enumerate() {
        assert_ok!(aio.submit_wake_later(
            AioMode::Normal,
            request(&file, "data.ibd", IoOp::Write, page, (i * PAGE) as u64, i as u64)
        ));
    }
    aio.wake_all_segments();

    for _ in 0..PAGES {
        let (_, completion) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(completion.op, IoOp::Write);
        assert!(completion.success);
    }
    aio.wait_until_no_pending_writes();

    let mut read: Vec<Vec<u8>> = vec![vec![0u8; PAGE]; PAGES];
    for (i, page) in read.iter_mut().enumerate() {
        assert_ok!(aio.submit(
            AioMode::Normal,
            request(&file, "data.ibd", IoOp::Read, page, (i * PAGE) as u64, 1000 + i as u64)
        ));
    }
    let mut seen: Vec<u64> = (0..PAGES)
        .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap().1.message1)
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (1000..1000 + PAGES as u64).collect::<Vec<_>>());

    pool.shutdown();
    assert_eq!(read, written);
    assert!(aio.all_slots_free());
    assert!(aio.stats().n_writes() <= PAGES as u64);
    aio.validate();
}

#[tokio::test]
async fn tracker_lets_async_callers_await_requests() {
    init_test_logger();
    let files = TestFiles::new();
    let file = files.open("async.ibd");
    let aio = Arc::new(assert_ok!(IoSubsystem::init(one_segment_config())));
    let tracker = Arc::new(CompletionTracker::new());
    let mut pool = assert_ok!(IoHandlerPool::start(Arc::clone(&aio), tracker.clone()));

    let mut page = vec![0x5Au8; 2048];
    let (token, rx) = tracker.register();
    assert_ok!(aio.submit(
        AioMode::Log,
        request(&file, "async.ibd", IoOp::Write, &mut page, 512, token)
    ));

    let completion = tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("completion within timeout")
        .expect("tracker kept the sender");
    assert_eq!(completion.message1, token);
    assert_eq!(completion.len, 2048);
    assert_eq!(completion.offset, 512);
    assert!(completion.success);
    assert_eq!(tracker.pending_count(), 0);

    pool.shutdown();
    let mut back = vec![0u8; 2048];
    file.read_exact_at(&mut back, 512).unwrap();
    assert_eq!(back, page);
}

#[test]
fn config_file_drives_the_subsystem() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "slots_per_segment = 2\nread_segments = 3\nwrite_segments = 2\nsync_slots = 1"
    )
    .unwrap();
    let config = assert_ok!(AioConfig::load(file.path()));

    let aio = assert_ok!(IoSubsystem::init(config));
    assert_eq!(aio.n_segments(), 7);
    assert_eq!(aio.backend_name(), "simulated");
    assert_eq!(aio.registry().array(ArrayKind::Read).n_slots(), 6);
}
