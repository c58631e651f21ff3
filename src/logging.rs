//! Log output setup.

use crate::config::LoggingConfig;
use crate::error::{Result, VoicepipeError};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
fn default_directive(config: &LoggingConfig) -> String {
    format!("voicepipe={}", config.level)
}

/// Installs the global subscriber. Logs go to stderr so stdout stays free for output.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(config)))
        .map_err(|e| VoicepipeError::ConfigInvalidValue {
            key: "logging.level".to_string(),
            message: e.to_string(),
        })?;

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| VoicepipeError::Other(format!("logging already initialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_scopes_to_crate() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json: false,
        };
        assert_eq!(default_directive(&config), "voicepipe=debug");
    }

    #[test]
    fn test_init_twice_fails() {
        let config = LoggingConfig::default();
        // The first call may already have happened in another test.
        init(&config).ok();
        assert!(init(&config).is_err());
    }
}
