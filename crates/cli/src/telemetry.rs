// Tracing setup for the CLI
//
// Filter precedence: RUST_LOG, then LOG_LEVEL, then "info" ("warn" with --quiet).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration read from the environment
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, e.g. "taskline=debug"
    pub log_filter: Option<String>,
    /// Fallback level when no filter is set
    pub default_level: &'static str,
}

impl LogConfig {
    pub fn from_env(quiet: bool) -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            default_level: if quiet { "warn" } else { "info" },
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(self.default_level))
    }
}

/// Install the global subscriber
pub fn init(config: LogConfig) {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(config.filter());

    tracing_subscriber::registry().with(console_layer).init();
}
