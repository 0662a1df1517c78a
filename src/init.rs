use tracing_subscriber::EnvFilter;

/// Log to stderr so the supervised application owns stdout.
pub(crate) fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    tracing::trace!("Tracing initialized");
}
