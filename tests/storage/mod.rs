mod aio_end_to_end_tests;
mod aio_error_tests;
mod aio_fairness_tests;
#[cfg(target_os = "linux")]
mod aio_native_tests;
