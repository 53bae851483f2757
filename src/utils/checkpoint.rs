//! Training snapshot management
//!
//! A snapshot directory holds three files: the model weights (`model.pt`,
//! written through `tch::nn::VarStore`), the hyperparameters
//! (`hyperparams.json`) and the training metadata kept here
//! (`checkpoint.json`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::config::Hyperparameters;

/// File name for model weights inside a snapshot directory.
pub const WEIGHTS_FILE: &str = "model.pt";

/// File name for checkpoint metadata inside a snapshot directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Per-iteration training history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Mean loss per iteration
    pub train_losses: Vec<f64>,
    /// Mean log-likelihood per iteration
    pub log_likelihoods: Vec<f64>,
    /// Mean KL divergence per iteration
    pub klds: Vec<f64>,
    /// Learning rate at the end of each iteration
    pub learning_rates: Vec<f64>,
}

/// Checkpoint metadata saved next to the model weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Completed training iterations
    pub iteration: usize,
    /// Global training step (one per batch)
    pub training_step: usize,
    /// Best mean iteration loss seen so far
    pub best_loss: f64,
    /// Whether actnorm layers received their data-dependent initialization
    pub actnorm_initialized: bool,
    /// Hyperparameters the weights were trained with
    pub hyperparams: Hyperparameters,
    /// Training history
    pub history: TrainingHistory,
}

impl Checkpoint {
    /// Create a fresh checkpoint for a new training run
    pub fn new(hyperparams: Hyperparameters) -> Self {
        Self {
            iteration: 0,
            training_step: 0,
            best_loss: f64::INFINITY,
            actnorm_initialized: false,
            hyperparams,
            history: TrainingHistory::default(),
        }
    }

    /// Record one completed iteration
    pub fn update(
        &mut self,
        iteration: usize,
        training_step: usize,
        loss: f64,
        log_likelihood: f64,
        kld: f64,
        learning_rate: f64,
    ) {
        self.iteration = iteration;
        self.training_step = training_step;
        self.history.train_losses.push(loss);
        self.history.log_likelihoods.push(log_likelihood);
        self.history.klds.push(kld);
        self.history.learning_rates.push(learning_rate);

        if loss < self.best_loss {
            self.best_loss = loss;
        }
    }

    /// Save checkpoint metadata into a snapshot directory
    pub fn save<P: AsRef<Path>>(&self, snapshot_dir: P) -> Result<()> {
        let path = snapshot_dir.as_ref().join(CHECKPOINT_FILE);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Load checkpoint metadata from a snapshot directory
    pub fn load<P: AsRef<Path>>(snapshot_dir: P) -> Result<Self> {
        let path = snapshot_dir.as_ref().join(CHECKPOINT_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let checkpoint = serde_json::from_str(&content)?;
        Ok(checkpoint)
    }

    /// Whether a snapshot directory contains a resumable checkpoint
    pub fn exists<P: AsRef<Path>>(snapshot_dir: P) -> bool {
        let dir = snapshot_dir.as_ref();
        dir.join(CHECKPOINT_FILE).is_file() && dir.join(WEIGHTS_FILE).is_file()
    }
}
