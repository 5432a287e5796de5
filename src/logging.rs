//! Process-wide logging setup

use mtds_types::{MtdsError, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber filtered at `level` and formatted as `json`
/// or `pretty`. `RUST_LOG` directives are honoured on top of `level`.
///
/// Fails with a configuration error if a global subscriber is already set.
pub fn init_logging(level: &str, format: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        other => {
            return Err(MtdsError::config(format!("Unknown log level: {}", other)));
        }
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format.to_lowercase().as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
        other => {
            return Err(MtdsError::config(format!("Unknown log format: {}", other)));
        }
    };
    installed.map_err(|e| MtdsError::config(format!("Logging already initialized: {}", e)))?;

    info!("Logging initialized with level: {} and format: {}", level, format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_settings() {
        assert!(init_logging("loud", "pretty").is_err());
        assert!(init_logging("info", "xml").is_err());
    }

    #[test]
    fn test_second_init_is_an_error() {
        // Whichever call wins, at most one can install the global subscriber
        let first = init_logging("debug", "json");
        let second = init_logging("info", "pretty");
        assert!(first.is_err() || second.is_err());
        if let Err(e) = second {
            assert!(e.is_fatal());
        }
    }
}
