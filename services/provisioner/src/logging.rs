//! Logging initialization for drivers embedding the provisioner.
//!
//! The engine itself never touches the global subscriber; it logs through
//! the span handed to it in [`crate::ProvisionerInput`].

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ProvisionerConfig;

/// Install a global subscriber. `RUST_LOG` overrides `level` when set.
pub fn init(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().compact().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Install a global subscriber from provisioner configuration.
pub fn init_from_config(config: &ProvisionerConfig) -> anyhow::Result<()> {
    init(&config.log_level, config.log_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_fails_cleanly() {
        let first = init("debug", false);
        let second = init("debug", true);
        // Only one global subscriber can be installed per process.
        assert!(first.is_err() || second.is_err());
    }
}
