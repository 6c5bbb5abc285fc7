use crate::{error::ConfigError, network::Checkpoints, optimizer::Sgd, picture::Distortion};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

/// Options of a training run.
///
/// Missing fields take their default values when deserialized.
///
/// ```
/// # use sparsecnn::config::TrainConfig;
/// let config: TrainConfig = serde_json::from_str(r#"{ "batch_size": 50 }"#).unwrap();
/// assert_eq!(config.batch_size, 50);
/// assert_eq!(config.queue_capacity, 20);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub learning_rate: f32,
    /// Weight of the new gradient in the momentum.
    pub momentum_decay_rate: f32,
    pub weight_decay_rate: f32,
    /// Exponential decay of the learning rate per completed batch.
    pub learning_rate_decay_rate: f32,
    pub batch_size: usize,
    pub producer_threads: usize,
    /// Maximum number of batches waiting for the consumer.
    pub queue_capacity: usize,
    /// Batches between checkpoints, 0 to disable.
    pub checkpoint_interval: usize,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_name: String,
    /// Resume from the checkpoint of this epoch if greater than 0.
    pub start_epoch: usize,
    pub seed: u64,
    /// Batches between training reports.
    pub report_interval: usize,
    /// Batches between test passes.
    pub test_interval: usize,
    /// Pictures codified to estimate the regularizing constants.
    pub regularizing_samples: usize,
    /// Applied to training pictures.
    pub distortion: Distortion,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.003,
            momentum_decay_rate: 0.1,
            weight_decay_rate: 0.,
            learning_rate_decay_rate: 0.,
            batch_size: 100,
            producer_threads: 8,
            queue_capacity: 20,
            checkpoint_interval: 1000,
            checkpoint_dir: PathBuf::from("weights"),
            checkpoint_name: "sparsecnn".into(),
            start_epoch: 0,
            seed: 0,
            report_interval: 1000,
            test_interval: 10_000,
            regularizing_samples: 10_000,
            distortion: Distortion::Identity,
        }
    }
}

impl TrainConfig {
    /// Reads a JSON config and validates it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
    pub fn with_learning_rate(self, learning_rate: f32) -> Self {
        Self {
            learning_rate,
            ..self
        }
    }
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }
    pub fn with_start_epoch(self, start_epoch: usize) -> Self {
        Self {
            start_epoch,
            ..self
        }
    }
    pub fn with_checkpoint_dir(self, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            ..self
        }
    }
    pub fn with_distortion(self, distortion: Distortion) -> Self {
        Self { distortion, ..self }
    }
    /// Checks the rates and sizes.
    ///
    /// **Errors**
    ///
    /// [`ConfigError::InvalidRate`] if a rate is out of range or a size is 0.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (what, value) in [
            ("learning_rate", self.learning_rate),
            ("momentum_decay_rate", self.momentum_decay_rate),
            ("weight_decay_rate", self.weight_decay_rate),
            ("learning_rate_decay_rate", self.learning_rate_decay_rate),
        ] {
            if !value.is_finite() || value < 0. {
                return Err(ConfigError::InvalidRate { what, value });
            }
        }
        if self.momentum_decay_rate > 1. {
            return Err(ConfigError::InvalidRate {
                what: "momentum_decay_rate",
                value: self.momentum_decay_rate,
            });
        }
        for (what, value) in [
            ("batch_size", self.batch_size),
            ("producer_threads", self.producer_threads),
            ("queue_capacity", self.queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidRate {
                    what,
                    value: value as f32,
                });
            }
        }
        Ok(())
    }
    /// The optimizer of the run.
    pub fn sgd(&self) -> Result<Sgd> {
        Sgd::builder()
            .learning_rate(self.learning_rate)
            .learning_rate_decay(self.learning_rate_decay_rate)
            .momentum_decay_rate(self.momentum_decay_rate)
            .weight_decay_rate(self.weight_decay_rate)
            .build()
    }
    pub fn checkpoints(&self) -> Checkpoints {
        Checkpoints {
            dir: self.checkpoint_dir.clone(),
            name: self.checkpoint_name.clone(),
            interval: self.checkpoint_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainConfig::default()
            .with_batch_size(32)
            .with_distortion(Distortion::Jiggle { radius: 2 });
        config.to_json_file(&path).unwrap();
        assert_eq!(TrainConfig::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: TrainConfig =
            serde_json::from_str(r#"{ "learning_rate": 0.01, "start_epoch": 3 }"#).unwrap();
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.start_epoch, 3);
        assert_eq!(config.momentum_decay_rate, 0.1);
        assert_eq!(config.checkpoint_interval, 1000);
    }

    #[test]
    fn invalid_rates_are_rejected() {
        let config = TrainConfig::default().with_learning_rate(-1.);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidRate {
                what: "learning_rate",
                value: -1.
            })
        );
        assert!(TrainConfig::default().with_batch_size(0).validate().is_err());
        assert!(TrainConfig::default().sgd().is_ok());
    }
}
