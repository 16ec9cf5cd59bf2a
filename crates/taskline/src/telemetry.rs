//! Logging setup
//!
//! Components log through `tracing` and never install a subscriber
//! themselves. Hosts call [`init_telemetry`] once at startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, `info` when unset or unparsable
    pub log_filter: Option<String>,
    /// Include the event target in each line
    pub with_target: bool,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            with_target: true,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Read `RUST_LOG` (falling back to `LOG_LEVEL`) and `LOG_FORMAT`
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            with_target: true,
            json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global subscriber
///
/// Returns `false` when a subscriber was already installed, which happens
/// when tests or the host set one up first.
pub fn init_telemetry(config: TelemetryConfig) -> bool {
    let filter = config.filter();
    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(filter = ?config.log_filter, json = config.json, "Telemetry initialized");
    }
    installed
}
