//! # Logging
//!
//! Tracing subscriber setup. `RUST_LOG` takes precedence over `LOG_LEVEL`.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::config::ControllerConfig;

/// Filter used when `RUST_LOG` is unset
pub fn default_filter(log_level: &str) -> String {
    format!("encryption_key_controller={log_level}")
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &ControllerConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.log_level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.log_format.eq_ignore_ascii_case("json") {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_targets_crate() {
        assert_eq!(default_filter("debug"), "encryption_key_controller=debug");
    }
}
