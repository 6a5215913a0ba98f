use clap::ValueEnum;
use serde::Deserialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    /// Compact, colored, human readable output.
    #[default]
    Compact,
    /// Key value pairs in logfmt.
    Logfmt,
    /// Human readable output without colors.
    Plain,
}

/// The filter used when `RUST_LOG` is not set.
fn default_directives(silent: bool, debug: bool) -> String {
    let level = if silent {
        "error"
    } else if debug {
        "debug"
    } else {
        "info"
    };

    format!("tuntap={level},tuntapd={level}")
}

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over `silent` and `debug`.
pub fn init(silent: bool, debug: bool, format: LoggingFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(silent, debug)));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LoggingFormat::Compact => registry.with(fmt::layer().compact()).init(),
        LoggingFormat::Logfmt => registry.with(tracing_logfmt::layer()).init(),
        LoggingFormat::Plain => registry.with(fmt::layer().with_ansi(false)).init(),
    }
}
