use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tkaio::common::exception::{AioError, RequestError};
use tkaio::storage::disk::aio::retry::ErrorClass;
use tkaio::storage::disk::aio::{
    AioConfig, AioMode, ArrayKind, FileHandle, IoFile, IoOp, IoSubsystem,
};
use tkaio::storage::disk::direct_io::AlignedBuffer;

use crate::common::files::{request, DiskFullFile, TestFiles};
use crate::common::logger::init_test_logger;

const WRITE_SEGMENT: usize = 3;

fn quick_retry_config() -> AioConfig {
    AioConfig {
        slots_per_segment: 8,
        read_segments: 1,
        write_segments: 1,
        fatal_on_unknown_error: false,
        retry_delay: Duration::from_millis(1),
        long_retry_delay: Duration::from_millis(2),
        ..AioConfig::default()
    }
}

/// Fails the first `failures` writes with EINTR, then behaves.
#[derive(Debug)]
struct FlakyFile {
    failures: usize,
    attempts: AtomicUsize,
}

impl IoFile for FlakyFile {
    fn read_exact_at(&self, buf: &mut [u8], _offset: u64) -> io::Result<()> {
        buf.fill(0);
        Ok(())
    }

    fn write_all_at(&self, _buf: &[u8], _offset: u64) -> io::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(io::Error::from(io::ErrorKind::Interrupted))
        } else {
            Ok(())
        }
    }

    fn sync_all(&self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn misaligned_requests_are_rejected_before_reserving() {
    init_test_logger();
    let files = TestFiles::new();
    let file = files.open("misaligned.ibd");
    let aio = IoSubsystem::init(quick_retry_config()).unwrap();

    let mut short = vec![0u8; 100];
    assert_err_matches!(
        aio.submit(
            AioMode::Normal,
            request(&file, "misaligned.ibd", IoOp::Write, &mut short, 0, 1)
        ),
        AioError::InvalidRequest(RequestError::MisalignedLength { len: 100, .. })
    );

    let mut page = vec![0u8; 512];
    assert_err_matches!(
        aio.submit(
            AioMode::Normal,
            request(&file, "misaligned.ibd", IoOp::Read, &mut page, 17, 2)
        ),
        AioError::InvalidRequest(RequestError::MisalignedOffset { offset: 17, .. })
    );

    let mut empty: Vec<u8> = Vec::new();
    assert_err_matches!(
        aio.submit(
            AioMode::Log,
            request(&file, "misaligned.ibd", IoOp::Write, &mut empty, 0, 3)
        ),
        AioError::InvalidRequest(RequestError::ZeroLength)
    );

    for kind in [ArrayKind::Read, ArrayKind::Write, ArrayKind::Log] {
        assert_eq!(aio.registry().array(kind).n_reserved(), 0);
    }
    assert!(aio.all_slots_free());
}

#[test]
fn full_disk_is_reported_once_but_fails_every_write() {
    init_test_logger();
    let file = FileHandle::new(DiskFullFile);
    let aio = IoSubsystem::init(quick_retry_config()).unwrap();
    let mut page = vec![1u8; 512];

    for attempt in 0..2u64 {
        assert_err_matches!(
            aio.submit(
                AioMode::Sync,
                request(&file, "full.ibd", IoOp::Write, &mut page, attempt * 512, attempt)
            ),
            AioError::DiskFull { .. }
        );
    }

    assert!(aio.errors().has_said_disk_full());
    assert_eq!(aio.errors().disk_full_reports(), 1);
    assert_eq!(aio.stats().n_writes(), 0);

    let last = aio.last_error().unwrap();
    assert_eq!(last.file, "full.ibd");
    assert_eq!(last.offset, 512);
    assert_eq!(last.class, ErrorClass::DiskFull);

    // Reads from the same device keep working.
    let mut back = vec![9u8; 512];
    assert_ok!(aio.submit(
        AioMode::Sync,
        request(&file, "full.ibd", IoOp::Read, &mut back, 0, 9)
    ));
    assert!(back.iter().all(|&b| b == 0));
}

#[test]
fn failed_async_write_completes_unsuccessfully() {
    init_test_logger();
    let file = FileHandle::new(DiskFullFile);
    let aio = IoSubsystem::init(quick_retry_config()).unwrap();
    let mut scratch = AlignedBuffer::with_page_alignment();

    let mut page = vec![3u8; 512];
    assert_ok!(aio.submit(
        AioMode::Normal,
        request(&file, "full.ibd", IoOp::Write, &mut page, 4096, 77)
    ));

    let done = aio.poll_completion(WRITE_SEGMENT, &mut scratch).unwrap();
    assert_eq!(done.message1, 77);
    assert_eq!(done.message2, 77 ^ 0xffff);
    assert!(!done.success);
    assert!(aio.all_slots_free());
    assert_eq!(aio.last_error().unwrap().operation, "pwrite");
}

#[test]
fn transient_errors_are_retried_until_the_write_lands() {
    init_test_logger();
    let flaky = Arc::new(FlakyFile {
        failures: 3,
        attempts: AtomicUsize::new(0),
    });
    let file = FileHandle::from_arc(flaky.clone());
    let aio = IoSubsystem::init(quick_retry_config()).unwrap();
    let mut scratch = AlignedBuffer::with_page_alignment();

    let mut page = vec![5u8; 1024];
    assert_ok!(aio.submit(
        AioMode::Normal,
        request(&file, "flaky.ibd", IoOp::Write, &mut page, 0, 5)
    ));

    let done = aio.poll_completion(WRITE_SEGMENT, &mut scratch).unwrap();
    assert!(done.success);
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(aio.errors().retries(), 3);
    assert_eq!(aio.stats().n_writes(), 1);
    assert_eq!(
        aio.last_error().unwrap().class,
        ErrorClass::RetryAfterDelay
    );
}

#[test]
fn requests_after_shutdown_are_refused() {
    init_test_logger();
    let files = TestFiles::new();
    let file = files.open("late.ibd");
    let aio = IoSubsystem::init(quick_retry_config()).unwrap();
    aio.shutdown();

    let mut page = vec![0u8; 512];
    assert_err_matches!(
        aio.submit(
            AioMode::Normal,
            request(&file, "late.ibd", IoOp::Read, &mut page, 0, 1)
        ),
        AioError::ShuttingDown
    );
    assert!(aio.is_shutting_down());
}
