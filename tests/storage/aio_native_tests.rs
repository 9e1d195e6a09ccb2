use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use tkaio::common::exception::AioError;
use tkaio::storage::disk::aio::{
    AioConfig, AioMode, ChannelCompletionHandler, FileHandle, IoFile, IoHandlerPool, IoOp,
    IoSubsystem,
};

use crate::common::files::{request, TestFiles};
use crate::common::logger::init_test_logger;

fn native_or_skip(config: AioConfig) -> Option<Arc<IoSubsystem>> {
    match IoSubsystem::init_native(config) {
        Ok(aio) => Some(Arc::new(aio)),
        Err(AioError::NativeUnavailable(reason)) => {
            eprintln!("skipping: io_uring unavailable ({})", reason);
            None
        }
        Err(e) => panic!("unexpected init failure: {}", e),
    }
}

fn small_config() -> AioConfig {
    AioConfig {
        slots_per_segment: 8,
        read_segments: 2,
        write_segments: 2,
        use_native_aio: true,
        fatal_on_unknown_error: false,
        retry_delay: Duration::from_millis(1),
        ..AioConfig::default()
    }
}

#[test]
fn native_writes_and_reads_round_trip() {
    init_test_logger();
    let Some(aio) = native_or_skip(small_config()) else {
        return;
    };
    assert_eq!(aio.backend_name(), "native");

    let files = TestFiles::new();
    let file = files.open("native.ibd");
    let (tx, rx) = unbounded();
    let mut pool =
        IoHandlerPool::start(Arc::clone(&aio), Arc::new(ChannelCompletionHandler::new(tx)))
            .unwrap();

    const PAGES: usize = 20;
    let mut pages: Vec<Vec<u8>> = (0..PAGES).map(|i| vec![i as u8 + 1; 4096]).collect();
    for (i, page) in pages.iter_mut().enumerate() {
        let offset = (i * 4096) as u64;
        aio.submit(
            AioMode::Normal,
            request(&file, "native.ibd", IoOp::Write, page, offset, i as u64),
        )
        .unwrap();
    }
    for _ in 0..PAGES {
        let (_, done) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(done.success);
        assert_eq!(done.op, IoOp::Write);
    }
    assert_eq!(aio.stats().n_writes(), PAGES as u64);

    let mut back = vec![vec![0u8; 4096]; PAGES];
    for (i, page) in back.iter_mut().enumerate() {
        let offset = (i * 4096) as u64;
        aio.submit(
            AioMode::Normal,
            request(&file, "native.ibd", IoOp::Read, page, offset, 1000 + i as u64),
        )
        .unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..PAGES {
        let (_, done) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(done.success);
        seen.push(done.message1);
    }
    seen.sort_unstable();
    assert_eq!(seen, (1000..1000 + PAGES as u64).collect::<Vec<_>>());
    for (i, page) in back.iter().enumerate() {
        assert!(page.iter().all(|&b| b == i as u8 + 1), "page {} differs", i);
    }

    pool.shutdown();
    assert!(aio.all_slots_free());
    assert!(rx.try_recv().is_err());
}

#[test]
fn files_without_descriptors_fall_back_to_synchronous_transfers() {
    init_test_logger();
    let Some(aio) = native_or_skip(small_config()) else {
        return;
    };

    let files = TestFiles::new();
    let (file, log) = files.open_counting("counted.ibd");
    let (tx, rx) = unbounded();
    let mut pool =
        IoHandlerPool::start(Arc::clone(&aio), Arc::new(ChannelCompletionHandler::new(tx)))
            .unwrap();

    let mut page = vec![0x5au8; 8192];
    aio.submit(
        AioMode::Log,
        request(&file, "counted.ibd", IoOp::Write, &mut page, 0, 7),
    )
    .unwrap();
    let (_, done) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(done.message1, 7);
    assert!(done.success);
    assert_eq!(log.lock().len(), 1);

    pool.shutdown();
}

#[test]
fn shutdown_stops_idle_native_handlers() {
    init_test_logger();
    let Some(aio) = native_or_skip(small_config()) else {
        return;
    };
    let (tx, _rx) = unbounded();
    let mut pool =
        IoHandlerPool::start(Arc::clone(&aio), Arc::new(ChannelCompletionHandler::new(tx)))
            .unwrap();
    assert_eq!(pool.n_handlers(), aio.n_segments());

    pool.shutdown();
    assert!(aio.is_shutting_down());
    assert!(aio.print_status().contains("state: exited"));
}

/// Descriptor-less file whose first `failures` writes are interrupted.
#[derive(Debug)]
struct InterruptedFile {
    failures: usize,
    attempts: AtomicUsize,
}

impl IoFile for InterruptedFile {
    fn read_exact_at(&self, buf: &mut [u8], _offset: u64) -> io::Result<()> {
        buf.fill(0);
        Ok(())
    }

    fn write_all_at(&self, _buf: &[u8], _offset: u64) -> io::Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            Err(io::Error::from_raw_os_error(libc::EINTR))
        } else {
            Ok(())
        }
    }

    fn sync_all(&self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn short_native_read_falls_back_once_and_fails() {
    init_test_logger();
    let Some(aio) = native_or_skip(small_config()) else {
        return;
    };

    let files = TestFiles::new();
    let file = files.open("short.ibd");
    file.write_all_at(&[7u8; 512], 0).unwrap();
    let (tx, rx) = unbounded();
    let mut pool =
        IoHandlerPool::start(Arc::clone(&aio), Arc::new(ChannelCompletionHandler::new(tx)))
            .unwrap();

    // The file ends 3584 bytes short of this read.
    let mut page = vec![0u8; 4096];
    aio.submit(
        AioMode::Normal,
        request(&file, "short.ibd", IoOp::Read, &mut page, 0, 55),
    )
    .unwrap();
    let (_, done) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(done.message1, 55);
    assert!(!done.success);
    assert!(aio.all_slots_free());

    let last = aio.last_error().unwrap();
    assert_eq!(last.file, "short.ibd");
    assert_eq!(last.operation, "pread");

    pool.shutdown();
}

#[test]
fn interrupted_descriptorless_write_is_retried_once_per_failure() {
    init_test_logger();
    let Some(aio) = native_or_skip(small_config()) else {
        return;
    };

    let flaky = Arc::new(InterruptedFile {
        failures: 2,
        attempts: AtomicUsize::new(0),
    });
    let file = FileHandle::from_arc(flaky.clone());
    let (tx, rx) = unbounded();
    let mut pool =
        IoHandlerPool::start(Arc::clone(&aio), Arc::new(ChannelCompletionHandler::new(tx)))
            .unwrap();

    let mut page = vec![1u8; 1024];
    aio.submit(
        AioMode::Normal,
        request(&file, "flaky.ibd", IoOp::Write, &mut page, 2048, 66),
    )
    .unwrap();
    let (_, done) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(done.message1, 66);
    assert!(done.success);
    // Two interruptions, then one write; never issued a second time.
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(aio.errors().retries(), 2);
    assert_eq!(aio.stats().n_writes(), 1);
    assert!(aio.all_slots_free());

    pool.shutdown();
}
