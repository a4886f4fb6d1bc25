//! Logging configuration for the ingestion engine.
//!
//! # Basic Logging
//!
//! ```rust,no_run
//! use tributary::telemetry::{LogFormat, init_logging};
//!
//! // Initialize pretty logging (default)
//! init_logging(LogFormat::Pretty).expect("Failed to init logging");
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: Set to `compact` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: Control log levels (default: `info`)
//!
//! Ingestion components log with structured fields (`topic`, `partition`,
//! `offset`, `role`) so a single partition's lifecycle can be filtered out
//! of a busy server log.

use std::time::Duration;

use moka::sync::Cache;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty-print format (default).
    #[default]
    Pretty,
    /// Single-line compact format for log aggregators.
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        })
    }
}

impl LogFormat {
    /// Read from the LOG_FORMAT environment variable.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Initialize logging with the specified format.
///
/// Log levels are controlled via the `RUST_LOG` environment variable and
/// default to `info`. Returns an error if a global subscriber was already
/// installed.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()?;
        }
        LogFormat::Compact => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .compact()
                .try_init()?;
        }
    }
    Ok(())
}

/// Initialize logging from environment variables, ignoring double-init.
///
/// Convenience for tests and examples where several entry points race to
/// install a subscriber; only the first wins.
pub fn init_logging_from_env() {
    let _ = init_logging(LogFormat::from_env());
}

/// Default suppression window for [`RedundantLogFilter`].
pub const DEFAULT_REDUNDANT_LOG_WINDOW: Duration = Duration::from_secs(60);

/// Suppresses repeats of high-frequency per-record log messages.
///
/// Some ingestion conditions repeat for every polled record (a leader
/// receiving records for a topic it no longer consumes, post-EndOfPush skips
/// on a remote feed). Logging each occurrence would drown the log, so a
/// message key is only allowed through once per window.
pub struct RedundantLogFilter {
    seen: Cache<String, ()>,
}

impl Default for RedundantLogFilter {
    fn default() -> Self {
        Self::new(DEFAULT_REDUNDANT_LOG_WINDOW)
    }
}

impl RedundantLogFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(window)
                .build(),
        }
    }

    /// True if this message key was already logged within the window.
    ///
    /// A `false` return registers the key, so the caller should log exactly
    /// when this returns `false`.
    pub fn is_redundant(&self, message_key: &str) -> bool {
        if self.seen.contains_key(message_key) {
            return true;
        }
        self.seen.insert(message_key.to_string(), ());
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("COMPACT".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        // Unknown values fall back to pretty.
        assert_eq!("yaml".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    }

    #[test]
    fn test_double_init_is_tolerated() {
        init_logging_from_env();
        init_logging_from_env();
    }

    #[test]
    fn test_redundant_log_filter_suppresses_repeats() {
        let filter = RedundantLogFilter::new(Duration::from_secs(60));
        assert!(!filter.is_redundant("leader topic mismatch p3"));
        assert!(filter.is_redundant("leader topic mismatch p3"));
        assert!(filter.is_redundant("leader topic mismatch p3"));
        // Different keys are tracked independently.
        assert!(!filter.is_redundant("leader topic mismatch p4"));
    }

    #[test]
    fn test_redundant_log_filter_expires() {
        let filter = RedundantLogFilter::new(Duration::from_millis(10));
        assert!(!filter.is_redundant("skip after eop"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!filter.is_redundant("skip after eop"));
    }
}
