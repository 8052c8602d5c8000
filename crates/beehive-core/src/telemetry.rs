//! Logging setup
//!
//! TigerStyle: One explicit subscriber, installed once per process.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and an fmt
//! layer. `RUST_LOG` takes precedence over the configured level.

use crate::config::NodeConfig;
use crate::error::{Error, Result};

const LOG_LEVEL_DEFAULT: &str = "info";
const SERVICE_NAME_DEFAULT: &str = "beehive";

/// How a hive process logs
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Name attached to the startup event
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset
    pub log_level: String,
    pub with_target: bool,
    /// Route output through the test harness capture
    pub test_writer: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME_DEFAULT.to_string(),
            log_level: LOG_LEVEL_DEFAULT.to_string(),
            with_target: true,
            test_writer: false,
        }
    }
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Name the process after the hive's listen address
    pub fn for_hive(node: &NodeConfig) -> Self {
        Self::new(format!("{}@{}", SERVICE_NAME_DEFAULT, node.addr))
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn without_target(mut self) -> Self {
        self.with_target = false;
        self
    }

    /// Quiet defaults for integration tests
    pub fn for_tests() -> Self {
        Self {
            service_name: format!("{}-tests", SERVICE_NAME_DEFAULT),
            log_level: "warn".to_string(),
            with_target: false,
            test_writer: true,
        }
    }

    /// Read `BEEHIVE_SERVICE_NAME` and `RUST_LOG`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("BEEHIVE_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            ..defaults
        }
    }
}

/// Install the global tracing subscriber
///
/// # Errors
/// `Fatal` when a global subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let fmt = tracing_subscriber::fmt::layer().with_target(config.with_target);

    let installed = if config.test_writer {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt.with_test_writer())
            .try_init()
    } else {
        tracing_subscriber::registry().with(filter).with(fmt).try_init()
    };
    installed.map_err(|e| Error::Fatal {
        reason: format!("failed to initialize tracing subscriber: {}", e),
    })?;

    tracing::info!(service = %config.service_name, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "beehive");
        assert_eq!(config.log_level, "info");
        assert!(!config.test_writer);
    }

    #[test]
    fn test_telemetry_config_for_hive() {
        let node = NodeConfig {
            addr: "h2:7767".into(),
            ..NodeConfig::default()
        };
        let config = TelemetryConfig::for_hive(&node)
            .with_log_level("debug")
            .without_target();

        assert_eq!(config.service_name, "beehive@h2:7767");
        assert_eq!(config.log_level, "debug");
        assert!(!config.with_target);
    }

    #[test]
    fn test_second_install_fails() {
        // Whichever test installs first wins; a repeat must report it.
        let _ = init_telemetry(TelemetryConfig::for_tests());
        assert!(matches!(
            init_telemetry(TelemetryConfig::for_tests()),
            Err(Error::Fatal { .. })
        ));
    }
}
