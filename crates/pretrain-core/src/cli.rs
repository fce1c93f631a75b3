//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Install a `tracing` subscriber; `RUST_LOG` wins over the verbosity flag.
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path).map_err(|e| {
        Error::InvalidConfig(format!("Failed to read config {}: {e}", path.display()))
    })?;

    let config = toml::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!("Failed to parse config {}: {e}", path.display()))
    })?;

    debug!("Loaded configuration from {:?}", path);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FineTuneConfig, OptimizerKind};
    use std::io::Write;

    #[test]
    fn test_load_toml_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[model]\ndepth = 34\nnum_classes = 5\n\n[training]\nlr = 0.1\noptim = \"sgd\"\nweight_decay = 0.0\nfrozen_until = 7"
        )
        .unwrap();

        let config: FineTuneConfig = load_toml_config(file.path()).unwrap();
        assert_eq!(config.model.depth, 34);
        assert_eq!(config.training.optim, OptimizerKind::Sgd);
        assert_eq!(config.training.frozen_until, 7);
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/finetune.toml");
        let config: FineTuneConfig = load_toml_config(&path).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.training.frozen_until, crate::DEFAULT_FROZEN_UNTIL);
    }

    #[test]
    fn test_load_missing_config() {
        let result: Result<FineTuneConfig> = load_toml_config(Path::new("does/not/exist.toml"));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
