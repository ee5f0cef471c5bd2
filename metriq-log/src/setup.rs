use std::env;

use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::{Level, LogConfig, LogFormat};

// Import CRATE_NAMES, which lists all crates in the workspace.
include!(concat!(env!("OUT_DIR"), "/constants.gen.rs"));

/// Builds the filter used when `RUST_LOG` is not set.
///
/// Third-party crates log at `INFO`, all metriq crates at the configured level.
fn default_filter(level: Level) -> EnvFilter {
    let mut filter = EnvFilter::new(Level::Info.as_str());

    for name in CRATE_NAMES {
        match format!("{name}={level}").parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(error) => crate::ensure_error(&error),
        }
    }

    filter
}

fn format_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match (format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => fmt::layer()
            .with_target(true)
            .with_ansi(true)
            .compact()
            .boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .boxed(),
        (LogFormat::Json, _) => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .boxed(),
    }
}

/// Initialize the logging system.
///
/// If `RUST_LOG` is set, it takes precedence over the configured level. Calling this function more
/// than once has no effect.
///
/// # Example
///
/// ```
/// let log_config = metriq_log::LogConfig {
///     enable_backtraces: true,
///     ..Default::default()
/// };
///
/// metriq_log::init(&log_config);
/// ```
pub fn init(config: &LogConfig) {
    if config.enable_backtraces {
        env::set_var("RUST_BACKTRACE", "full");
    }

    let filter = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => default_filter(config.level),
    };

    tracing_subscriber::registry()
        .with(format_layer(config.format))
        .with(filter)
        .try_init()
        .ok();
}
