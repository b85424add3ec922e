//! Tracing/logging initialization.
//!
//! `RUST_LOG` always wins over the configured level so operators can turn up
//! a single module without a redeploy.

use tracing_subscriber::EnvFilter;

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (production).
    #[default]
    Json,
    /// Human-readable, colored output (local development).
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset (e.g. `"info"`).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// Pretty output for `development`, JSON everywhere else.
    pub fn for_environment(environment: &str, level: impl Into<String>) -> Self {
        let format = if environment.eq_ignore_ascii_case("development") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        };
        Self {
            level: level.into(),
            format,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(config: &LogConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match config.format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().with_target(true).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_selects_format() {
        assert_eq!(LogConfig::for_environment("development", "debug").format, LogFormat::Pretty);
        assert_eq!(LogConfig::for_environment("production", "info").format, LogFormat::Json);
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = LogConfig::default();
        init(&config);
        init(&config);
        ::tracing::info!("still alive");
    }
}
