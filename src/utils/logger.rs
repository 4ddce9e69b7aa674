use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "TASKLETS_LOG";

/// Installs the global fmt subscriber. The filter comes from `TASKLETS_LOG`
/// and defaults to `warn`. Calling this more than once is harmless.
pub fn init_logging() {
    init_logging_with(None);
}

/// Like [`init_logging`], but `directive` takes precedence over the
/// environment.
pub fn init_logging_with(directive: Option<&str>) {
    let filter = match directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
