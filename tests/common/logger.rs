use std::sync::Once;

use tkaio::common::logger::initialize_logger;

static INIT: Once = Once::new();

/// Installs the crate logger once per test binary. Defaults to `warn` so the
/// retry and disk-full paths exercised by the tests stay quiet unless
/// `RUST_LOG` asks for more.
pub fn init_test_logger() {
    INIT.call_once(|| {
        if std::env::var_os("RUST_LOG").is_none() {
            std::env::set_var("RUST_LOG", "warn");
        }
        initialize_logger();
    });
}
