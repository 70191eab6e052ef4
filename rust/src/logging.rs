/// Initialize logging for the Rust components.
///
/// Must be called at least once before any logging is performed;
/// otherwise, no log output will be produced.
/// Subsequent calls are no-ops.
///
/// Verbosity is taken from `RUST_LOG`, e.g. `RUST_LOG=myo_bridge::dispatch=trace`.
pub(crate) fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        // `try_init` so that a host process (or a test harness) that already
        // installed a global subscriber keeps it.
        let _ = tracing_subscriber::fmt::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .without_time()
            .try_init();
    });
}
