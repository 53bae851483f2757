//! Training loop
//!
//! One iteration walks every batch of the loader: add dequantization
//! noise, encode, compute the likelihood objective, backpropagate and take
//! a scheduled optimizer step. Snapshots are written on a batch cadence
//! and at the end of every iteration.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

use crate::data::{dequantization_noise, DataLoader};
use crate::model::Glow;
use crate::training::loss::FlowLoss;
use crate::training::optimizer::{CyclicalAdam, CyclicalLrConfig};
use crate::utils::{Checkpoint, WEIGHTS_FILE};

/// Training configuration
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Number of iterations (full passes over the dataset)
    pub iterations: usize,
    /// Snapshot directory
    pub snapshot_dir: PathBuf,
    /// Snapshot cadence in batches
    pub checkpoint_interval: usize,
    /// Add the KL-divergence regularizer on the latent priors
    pub regularize_z: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            snapshot_dir: PathBuf::from("snapshot"),
            checkpoint_interval: 100,
            regularize_z: false,
        }
    }
}

/// Trainer driving a [`Glow`] model
pub struct Trainer {
    model: Glow,
    optimizer: CyclicalAdam,
    config: TrainerConfig,
    checkpoint: Checkpoint,
    training_step: usize,
    start_iteration: usize,
}

impl Trainer {
    /// Create a trainer for a fresh run
    pub fn new(
        model: Glow,
        optimizer_config: CyclicalLrConfig,
        config: TrainerConfig,
    ) -> Result<Self> {
        let optimizer = CyclicalAdam::new(model.vs(), optimizer_config)?;
        let checkpoint = Checkpoint::new(model.hyperparams().clone());

        Ok(Self {
            model,
            optimizer,
            config,
            checkpoint,
            training_step: 0,
            start_iteration: 0,
        })
    }

    /// Create a trainer that continues a checkpointed run
    pub fn resume(
        model: Glow,
        optimizer_config: CyclicalLrConfig,
        config: TrainerConfig,
        checkpoint: Checkpoint,
    ) -> Result<Self> {
        let mut optimizer = CyclicalAdam::new(model.vs(), optimizer_config)?;
        optimizer.anneal_learning_rate(checkpoint.training_step);

        if checkpoint.actnorm_initialized {
            model.set_initialized();
        }

        let training_step = checkpoint.training_step;
        let start_iteration = checkpoint.iteration;

        Ok(Self {
            model,
            optimizer,
            config,
            checkpoint,
            training_step,
            start_iteration,
        })
    }

    /// The trained model
    pub fn model(&self) -> &Glow {
        &self.model
    }

    /// Run the training loop, returning the mean loss per iteration.
    pub fn train(&mut self, loader: &mut DataLoader) -> Result<Vec<f64>> {
        let hyperparams = self.model.hyperparams().clone();
        let num_bins_x = hyperparams.num_bins_x();
        let num_pixels = hyperparams.num_pixels();
        let device = self.model.device();

        std::fs::create_dir_all(&self.config.snapshot_dir).with_context(|| {
            format!(
                "failed to create snapshot directory {}",
                self.config.snapshot_dir.display()
            )
        })?;

        // Data-dependent initialization from the first batch.
        if self.model.needs_init() {
            loader.reset();
            if let Some(batch) = loader.next() {
                let x = batch.to_device(device);
                self.model.initialize_actnorm_weights(&x);
                debug!("initialized actnorm weights from a batch of {}", x.size()[0]);
            }
            self.checkpoint.actnorm_initialized = true;
        }

        let num_batches = loader.num_batches();
        let mut iteration_losses = Vec::new();

        let pb = ProgressBar::new(self.config.iterations as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );

        for iteration in self.start_iteration..self.start_iteration + self.config.iterations {
            loader.reset();

            let mut sum_loss = 0.0;
            let mut sum_nll = 0.0;
            let mut sum_kld = 0.0;
            let start_time = Instant::now();

            for (batch_index, batch) in loader.by_ref().enumerate() {
                let x = batch.to_device(device);
                let batch_size = x.size()[0];
                let x = &x + dequantization_noise(&x, num_bins_x);

                let (factorized, log_det) = self.model.forward(&x);
                let loss = FlowLoss::compute(
                    &factorized,
                    &log_det,
                    batch_size,
                    num_pixels,
                    num_bins_x,
                    self.config.regularize_z,
                );

                self.optimizer.zero_grad();
                loss.loss.backward();
                self.optimizer.update(self.training_step);
                self.training_step += 1;

                sum_loss += loss.loss_value();
                sum_nll += loss.nll.double_value(&[]) / batch_size as f64;
                sum_kld += loss.kld_value(batch_size);

                debug!(
                    "iteration {}: batch {} / {} - loss: {:.8} - nll: {:.8} - kld: {:.8} - log_det: {:.8}",
                    iteration + 1,
                    batch_index + 1,
                    num_batches,
                    loss.loss_value(),
                    loss.nll_bits(batch_size),
                    loss.kld_value(batch_size),
                    loss.log_det_bits(),
                );

                if self.config.checkpoint_interval > 0
                    && (batch_index + 1) % self.config.checkpoint_interval == 0
                {
                    self.save_snapshot()?;
                }
            }

            let mean_loss = sum_loss / num_batches as f64;
            let mean_log_likelihood = -sum_nll / num_batches as f64;
            let mean_kld = sum_kld / num_batches as f64;
            let elapsed = start_time.elapsed().as_secs_f64();

            iteration_losses.push(mean_loss);
            self.checkpoint.update(
                iteration + 1,
                self.training_step,
                mean_loss,
                mean_log_likelihood,
                mean_kld,
                self.optimizer.learning_rate(),
            );

            info!(
                "iteration {} - loss: {:.5} - log_likelihood: {:.5} - kld: {:.5} - elapsed_time: {:.3} min",
                iteration + 1,
                mean_loss,
                mean_log_likelihood,
                mean_kld,
                elapsed / 60.0,
            );

            self.save_snapshot()?;

            pb.set_message(format!("loss: {:.5} lr: {:.2e}", mean_loss, self.optimizer.learning_rate()));
            pb.inc(1);
        }

        pb.finish_with_message(format!("best loss: {:.5}", self.checkpoint.best_loss));

        Ok(iteration_losses)
    }

    fn save_snapshot(&self) -> Result<()> {
        self.model
            .save(self.config.snapshot_dir.join(WEIGHTS_FILE))?;
        self.checkpoint.save(&self.config.snapshot_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DatasetFormat, ImageDataset};
    use crate::utils::Hyperparameters;
    use tch::Device;
    use tempfile::tempdir;

    fn write_dataset(dir: &std::path::Path, count: usize, size: u32) {
        for i in 0..count {
            let img = image::RgbImage::from_fn(size, size, |x, y| {
                image::Rgb([(x * 31 + i as u32 * 3) as u8, (y * 17) as u8, 90])
            });
            img.save(dir.join(format!("img_{:02}.png", i))).unwrap();
        }
    }

    fn small_hyperparams() -> Hyperparameters {
        Hyperparameters {
            levels: 2,
            depth_per_level: 1,
            nn_hidden_channels: 8,
            image_size: (8, 8),
            num_bits_x: 8,
            squeeze_factor: 2,
            lu_decomposition: false,
        }
    }

    #[test]
    fn test_training_runs_and_snapshots() {
        let data_dir = tempdir().unwrap();
        write_dataset(data_dir.path(), 8, 8);

        let snapshot_dir = tempdir().unwrap();
        let hp = small_hyperparams();

        let dataset = ImageDataset::load(data_dir.path(), DatasetFormat::Png, hp.num_bits_x).unwrap();
        let mut loader = DataLoader::new(dataset, 4, true);

        let model = Glow::new(&hp, Device::Cpu).unwrap();
        let config = TrainerConfig {
            iterations: 2,
            snapshot_dir: snapshot_dir.path().to_path_buf(),
            checkpoint_interval: 100,
            regularize_z: true,
        };

        let mut trainer = Trainer::new(model, CyclicalLrConfig::default(), config).unwrap();
        let losses = trainer.train(&mut loader).unwrap();

        assert_eq!(losses.len(), 2);
        assert!(losses.iter().all(|l| l.is_finite()));
        assert!(snapshot_dir.path().join(WEIGHTS_FILE).is_file());
        assert!(Checkpoint::exists(snapshot_dir.path()));

        let checkpoint = Checkpoint::load(snapshot_dir.path()).unwrap();
        assert_eq!(checkpoint.iteration, 2);
        assert!(checkpoint.actnorm_initialized);
        assert_eq!(checkpoint.history.train_losses.len(), 2);
    }

    #[test]
    fn test_resume_continues_step_count() {
        let data_dir = tempdir().unwrap();
        write_dataset(data_dir.path(), 4, 8);

        let snapshot_dir = tempdir().unwrap();
        let hp = small_hyperparams();

        let dataset = ImageDataset::load(data_dir.path(), DatasetFormat::Png, hp.num_bits_x).unwrap();
        let mut loader = DataLoader::new(dataset, 4, false);

        let config = TrainerConfig {
            iterations: 1,
            snapshot_dir: snapshot_dir.path().to_path_buf(),
            checkpoint_interval: 100,
            regularize_z: false,
        };

        let model = Glow::new(&hp, Device::Cpu).unwrap();
        let mut trainer = Trainer::new(model, CyclicalLrConfig::default(), config.clone()).unwrap();
        trainer.train(&mut loader).unwrap();

        let checkpoint = Checkpoint::load(snapshot_dir.path()).unwrap();
        let step_after_first = checkpoint.training_step;
        assert!(step_after_first > 0);

        let mut model = Glow::new(&hp, Device::Cpu).unwrap();
        model.load(snapshot_dir.path().join(WEIGHTS_FILE)).unwrap();
        let mut trainer =
            Trainer::resume(model, CyclicalLrConfig::default(), config, checkpoint).unwrap();
        trainer.train(&mut loader).unwrap();

        let resumed = Checkpoint::load(snapshot_dir.path()).unwrap();
        assert_eq!(resumed.training_step, step_after_first * 2);
        assert_eq!(resumed.iteration, 2);
    }
}
