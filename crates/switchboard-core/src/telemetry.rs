//! Structured logging bootstrap.

use crate::config::TelemetryConfig;
use crate::error::{SwitchboardError, SwitchboardResult};
use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured filter. Returns an error (instead of
/// panicking) when a subscriber is already installed, so embedding hosts
/// and tests can call this repeatedly.
pub fn init_tracing(config: &TelemetryConfig) -> SwitchboardResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| SwitchboardError::Config(format!("invalid log filter: {e}")))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| SwitchboardError::Config(format!("tracing already initialised: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let config = TelemetryConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
