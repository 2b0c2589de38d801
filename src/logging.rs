//! Structured logging infrastructure.
//!
//! Uses the `tracing` and `tracing-subscriber` crates to provide structured
//! logging with environment-based filtering. The level and format come from
//! the loaded [`Settings`](crate::config::Settings); `RUST_LOG` overrides
//! the configured level when set.

use crate::config::Settings;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development).
    Pretty,
    /// Compact single-line format (for production).
    Compact,
}

impl OutputFormat {
    fn from_name(name: &str) -> Self {
        match name {
            "compact" => OutputFormat::Compact,
            _ => OutputFormat::Pretty,
        }
    }
}

/// Initialize the global tracing subscriber from settings.
///
/// Safe to call more than once; subsequent calls are no-ops because a global
/// subscriber can only be installed once per process.
pub fn init_from_settings(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));

    let builder = fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false);

    let result = match OutputFormat::from_name(&settings.log_format) {
        OutputFormat::Pretty => builder.try_init(),
        OutputFormat::Compact => builder.compact().with_ansi(false).try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names() {
        assert_eq!(OutputFormat::from_name("compact"), OutputFormat::Compact);
        assert_eq!(OutputFormat::from_name("pretty"), OutputFormat::Pretty);
        assert_eq!(OutputFormat::from_name("anything"), OutputFormat::Pretty);
    }

    #[test]
    fn test_init_twice_is_safe() {
        let settings = Settings::default();
        init_from_settings(&settings);
        init_from_settings(&settings);
    }
}
