use once_cell::sync::Lazy;

static INIT: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
});

/// Call at the top of every integration test that wants to see `tracing` output
/// under `RUST_LOG` (mirrors the teacher crate's test-tracing setup).
pub fn init_tracing() {
    Lazy::force(&INIT);
}
