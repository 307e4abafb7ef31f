//! Process-wide logging setup.
use std::io::IsTerminal;
use std::str::FromStr;

use tracing_glog::Glog;
use tracing_glog::GlogFields;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Level used when `RUST_LOG` is unset or not a plain level name.
const DEFAULT_LOG_LEVEL: tracing::Level = tracing::Level::INFO;

/// Installs a glog-formatted stderr layer filtered by `RUST_LOG` (`info` by default).
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn initialize_logging() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| tracing::Level::from_str(&level).ok())
        .unwrap_or(DEFAULT_LOG_LEVEL);

    let glog = fmt::Layer::default()
        .with_writer(std::io::stderr)
        .event_format(Glog::default())
        .fmt_fields(GlogFields::default().compact())
        .with_ansi(std::io::stderr().is_terminal())
        .with_filter(LevelFilter::from_level(level));

    if let Err(err) = Registry::default().with(glog).try_init() {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}
