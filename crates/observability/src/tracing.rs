//! Tracing/logging initialization.
//!
//! Output is JSON by default; `FORGEORM_LOG_FORMAT=pretty` switches to human-readable
//! lines. Filtering follows `RUST_LOG` (default `info`).

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// `EnvFilter` directives, e.g. `info,forgeorm_core=debug`.
    pub filter: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let filter = std::env::var("RUST_LOG")
            .ok()
            .filter(|directives| !directives.trim().is_empty())
            .unwrap_or(defaults.filter);
        let json = match std::env::var("FORGEORM_LOG_FORMAT") {
            Ok(format) => parse_format(&format).unwrap_or(defaults.json),
            Err(_) => defaults.json,
        };
        Self { filter, json }
    }
}

fn parse_format(format: &str) -> Option<bool> {
    match format.trim().to_ascii_lowercase().as_str() {
        "json" => Some(true),
        "pretty" | "text" => Some(false),
        _ => None,
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(&TracingConfig::from_env());
}

/// Initialize tracing with explicit settings; invalid filter directives fall back to `info`.
pub fn init_with(config: &TracingConfig) {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = if config.json {
        builder.json().with_target(false).try_init()
    } else {
        builder.with_target(true).try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_names() {
        assert_eq!(parse_format("json"), Some(true));
        assert_eq!(parse_format(" Pretty "), Some(false));
        assert_eq!(parse_format("xml"), None);
    }

    #[test]
    fn repeated_init_is_a_no_op() {
        let config = TracingConfig {
            filter: "not a [valid filter".to_string(),
            json: false,
        };
        init_with(&config);
        init_with(&TracingConfig::default());
    }
}
