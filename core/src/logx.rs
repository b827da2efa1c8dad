use tracing_subscriber::{fmt, EnvFilter};

/// Initialize `tracing` once. `RUST_LOG` wins over `default_level`; a
/// malformed directive falls back to `info` instead of failing startup.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Like [`init`], but writes through the test harness's captured output.
pub fn init_for_tests() {
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}
