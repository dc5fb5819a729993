use tracing_subscriber::EnvFilter;

/// Initialize JSON logging once per process. Safe to call again (e.g. from
/// multiple entry points); later calls are no-ops.
pub fn init(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let initialized = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_target(false)
        .try_init()
        .is_ok();

    if initialized {
        tracing::info!(service = service_name, "logging initialized");
    }
}
