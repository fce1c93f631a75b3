//! Configuration structures for classifier construction and fine-tuning.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Backbone children with index `<=` this value are frozen by default
/// (`conv1` through `layer2`).
pub const DEFAULT_FROZEN_UNTIL: usize = 5;

/// Momentum used whenever SGD is selected for fine-tuning.
pub const SGD_MOMENTUM: f64 = 0.9;

/// Backbone depths with published ImageNet weights that the classifier accepts.
pub const SUPPORTED_DEPTHS: [usize; 4] = [18, 34, 50, 152];

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FineTuneConfig {
    /// Classifier construction settings
    pub model: ModelSettings,
    /// Optimizer and freezing settings
    #[serde(default)]
    pub training: TrainingArgs,
}

impl FineTuneConfig {
    /// Checks everything that can be checked without building the model
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()
    }
}

/// Classifier construction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Backbone depth (18, 34, 50 or 152)
    pub depth: usize,
    /// Number of output classes of the new head
    pub num_classes: usize,
    /// Torchvision checkpoint to initialise the backbone from
    #[serde(default)]
    pub weights: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            depth: 18,
            num_classes: 38,
            weights: None,
        }
    }
}

impl ModelSettings {
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_DEPTHS.contains(&self.depth) {
            return Err(Error::invalid_config(format!(
                "unsupported ResNet depth {}, expected one of {:?}",
                self.depth, SUPPORTED_DEPTHS
            )));
        }
        if self.num_classes == 0 {
            return Err(Error::invalid_config("num_classes must be greater than 0"));
        }
        Ok(())
    }
}

/// Training arguments consumed by the optimizer construction utility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArgs {
    /// Learning rate
    pub lr: f64,
    /// Optimizer kind
    pub optim: OptimizerKind,
    /// Weight decay (L2 regularization)
    pub weight_decay: f64,
    /// Last backbone child index to freeze
    #[serde(default = "default_frozen_until")]
    pub frozen_until: usize,
}

fn default_frozen_until() -> usize {
    DEFAULT_FROZEN_UNTIL
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            lr: 0.001,
            optim: OptimizerKind::Sgd,
            weight_decay: 1e-4,
            frozen_until: DEFAULT_FROZEN_UNTIL,
        }
    }
}

impl TrainingArgs {
    /// Create training arguments with the default freezing threshold
    pub fn new(lr: f64, optim: OptimizerKind, weight_decay: f64) -> Self {
        Self {
            lr,
            optim,
            weight_decay,
            frozen_until: DEFAULT_FROZEN_UNTIL,
        }
    }

    /// Override the freezing threshold
    pub fn with_frozen_until(mut self, frozen_until: usize) -> Self {
        self.frozen_until = frozen_until;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::invalid_config(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(Error::invalid_config(format!(
                "weight decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Optimizer kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Adam with weight decay
    Adam,
    /// SGD with weight decay and momentum
    Sgd,
}

impl std::fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerKind::Adam => write!(f, "adam"),
            OptimizerKind::Sgd => write!(f, "sgd"),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "sgd" => Ok(OptimizerKind::Sgd),
            other => Err(Error::invalid_config(format!(
                "unsupported optimizer kind '{other}', expected 'adam' or 'sgd'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_training_args() {
        let args = TrainingArgs::default();
        assert_eq!(args.frozen_until, DEFAULT_FROZEN_UNTIL);
        assert_eq!(args.optim, OptimizerKind::Sgd);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_optimizer_kind_parse() {
        assert_eq!("adam".parse::<OptimizerKind>().unwrap(), OptimizerKind::Adam);
        assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);

        let err = "rmsprop".parse::<OptimizerKind>().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_optimizer_display() {
        assert_eq!(OptimizerKind::Adam.to_string(), "adam");
        assert_eq!(OptimizerKind::Sgd.to_string(), "sgd");
    }

    #[test]
    fn test_training_args_validation() {
        let args = TrainingArgs::new(0.0, OptimizerKind::Adam, 0.0);
        assert!(args.validate().is_err());

        let args = TrainingArgs::new(0.01, OptimizerKind::Adam, -1.0);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_model_settings_validation() {
        assert!(ModelSettings::default().validate().is_ok());

        let settings = ModelSettings {
            depth: 101,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(Error::InvalidConfig(_))));

        let settings = ModelSettings {
            num_classes: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let config: FineTuneConfig = toml::from_str(
            r#"
            [model]
            depth = 50
            num_classes = 10

            [training]
            lr = 0.01
            optim = "adam"
            weight_decay = 0.0005
            "#,
        )
        .unwrap();

        assert_eq!(config.model.depth, 50);
        assert!(config.model.weights.is_none());
        assert_eq!(config.training.optim, OptimizerKind::Adam);
        assert_eq!(config.training.frozen_until, DEFAULT_FROZEN_UNTIL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_optimizer_in_toml() {
        let parsed: std::result::Result<TrainingArgs, toml::de::Error> = toml::from_str(
            r#"
            lr = 0.01
            optim = "lbfgs"
            weight_decay = 0.0
            "#,
        );
        let err: Error = parsed.unwrap_err().into();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
