use std::str::FromStr;

use serde::Deserialize;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Traffic leaving the process, e.g. requests to the regulator.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

/// Traffic arriving from outside, e.g. regulator responses.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

/// The `logging` section of the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Maximum level; `LOG_LEVEL` takes precedence when set.
    #[serde(default)]
    pub level: Option<String>,

    /// Target prefixes whose events are emitted.
    #[serde(default = "defaults::targets")]
    pub targets: Vec<String>,

    #[serde(default = "defaults::ansi")]
    pub ansi: bool,

    /// Include the source file and line of each event.
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            targets: defaults::targets(),
            ansi: defaults::ansi(),
            source_location: false,
        }
    }
}

mod defaults {
    pub fn targets() -> Vec<String> {
        vec!["taxpoynt".to_string()]
    }

    pub const fn ansi() -> bool {
        true
    }
}

impl LoggingConfig {
    /// Resolve the level from `from_env`, then the configured level, then the
    /// build default (TRACE in debug builds, INFO in release).
    ///
    /// Unparseable values are reported on stderr and skipped.
    #[must_use]
    pub fn level_filter(&self, from_env: Option<&str>) -> LevelFilter {
        let default = if cfg!(debug_assertions) {
            LevelFilter::TRACE
        } else {
            LevelFilter::INFO
        };

        [from_env, self.level.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|level| {
                LevelFilter::from_str(level)
                    .inspect_err(|_| eprintln!("Invalid log level specified {level}, ignoring"))
                    .ok()
            })
            .unwrap_or(default)
    }

    #[must_use]
    pub fn is_target_enabled(&self, target: &str) -> bool {
        self.targets.iter().any(|prefix| target.starts_with(prefix.as_str()))
    }
}

/// Install the global subscriber.
///
/// Does nothing, apart from a note on stderr, if a subscriber is already
/// installed.
pub fn init(config: &LoggingConfig) {
    let level = config.level_filter(std::env::var("LOG_LEVEL").ok().as_deref());
    let targets = config.clone();

    let installed = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(config.source_location)
                .with_line_number(config.source_location)
                .compact()
                .with_ansi(config.ansi)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(move |metadata| {
                    targets.is_target_enabled(metadata.target())
                })),
        )
        .try_init();

    if let Err(e) = installed {
        eprintln!("Logging already initialised: {e}");
    }
}
