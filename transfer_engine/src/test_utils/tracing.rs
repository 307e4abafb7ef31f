use tracing::Level;

/// Installs a plain `fmt` subscriber that prints events at `level` and above.
///
/// Meant for tests and demos that want to see scheduler and poller logs without
/// the glog formatting of [`crate::logging::initialize_logging`]. Only the first
/// call in a process takes effect.
pub fn set_tracing_env_filter(level: Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level.as_str()))
        .with_test_writer()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global subscriber already set");
    }
}
