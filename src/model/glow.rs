//! Multi-scale flow model
//!
//! The model stacks `levels` scales. Each scale squeezes space into
//! channels, runs `depth_per_level` flow steps, and factors half of the
//! channels out as a latent with a learned Gaussian prior. The last scale
//! factors everything out. `forward` is the encoding direction used for
//! likelihood training; `reverse` and `sample` run the flow backwards.

use anyhow::{bail, Context, Result};
use std::cell::Cell;
use std::path::Path;
use tch::nn::Module;
use tch::{nn, Device, Kind, Tensor};

use super::layers::{squeeze, unsqueeze, FlowStep};
use crate::utils::{Hyperparameters, IMAGE_CHANNELS};

/// One factored-out latent with its learned prior parameters
#[derive(Debug)]
pub struct FactorizedZ {
    pub z: Tensor,
    pub mean: Tensor,
    pub ln_var: Tensor,
}

/// One scale of the model
#[derive(Debug)]
struct Level {
    steps: Vec<FlowStep>,
    prior: nn::Conv2D,
    is_last: bool,
    /// Channels entering the flow steps (after the squeeze)
    channels: i64,
    /// Spatial size at this scale
    spatial: (i64, i64),
}

impl Level {
    /// Prior parameters for the factored-out half given the kept half
    /// (or a zero tensor on the last level).
    fn prior_params(&self, conditioner: &Tensor) -> (Tensor, Tensor) {
        let out = self.prior.forward(conditioner);
        let half = out.size()[1] / 2;
        let mean = out.narrow(1, 0, half);
        let ln_var = out.narrow(1, half, half);
        (mean, ln_var)
    }
}

/// Glow encoder with multi-scale factorization
pub struct Glow {
    vs: nn::VarStore,
    levels: Vec<Level>,
    hyperparams: Hyperparameters,
    needs_init: Cell<bool>,
}

impl Glow {
    /// Build a model for the given hyperparameters on `device`
    pub fn new(hyperparams: &Hyperparameters, device: Device) -> Result<Self> {
        hyperparams.validate()?;

        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let factor = hyperparams.squeeze_factor;
        let (mut height, mut width) = hyperparams.image_size;
        let mut channels = IMAGE_CHANNELS;
        let mut levels = Vec::with_capacity(hyperparams.levels);

        for index in 0..hyperparams.levels {
            let level_vs = &root / format!("level_{}", index);
            let is_last = index + 1 == hyperparams.levels;

            height /= factor;
            width /= factor;
            channels *= factor * factor;

            let steps = (0..hyperparams.depth_per_level)
                .map(|step| {
                    FlowStep::new(
                        &(&level_vs / format!("step_{}", step)),
                        channels,
                        hyperparams.nn_hidden_channels,
                        hyperparams.lu_decomposition,
                    )
                })
                .collect();

            // Zero-initialized conv producing (mean, ln_var); on the last
            // level it is applied to zeros so the prior is a learned constant.
            let (prior_in, prior_out) = if is_last {
                (channels, channels * 2)
            } else {
                (channels / 2, channels)
            };
            let prior = nn::conv2d(
                &level_vs / "prior",
                prior_in,
                prior_out,
                3,
                nn::ConvConfig {
                    padding: 1,
                    ws_init: nn::Init::Const(0.0),
                    bs_init: nn::Init::Const(0.0),
                    ..Default::default()
                },
            );

            levels.push(Level {
                steps,
                prior,
                is_last,
                channels,
                spatial: (height, width),
            });

            if !is_last {
                channels /= 2;
            }
        }

        Ok(Self {
            vs,
            levels,
            hyperparams: hyperparams.clone(),
            needs_init: Cell::new(true),
        })
    }

    /// The variable store holding every parameter
    pub fn vs(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Device the model lives on
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Hyperparameters the model was built with
    pub fn hyperparams(&self) -> &Hyperparameters {
        &self.hyperparams
    }

    /// Whether the actnorm layers still need data-dependent initialization
    pub fn needs_init(&self) -> bool {
        self.needs_init.get()
    }

    /// Mark actnorm layers as initialized (used when restoring weights)
    pub fn set_initialized(&self) {
        self.needs_init.set(false);
    }

    /// Data-dependent actnorm initialization from one batch
    pub fn initialize_actnorm_weights(&self, x: &Tensor) {
        let mut h = x.shallow_clone();
        for level in &self.levels {
            h = squeeze(&h, self.hyperparams.squeeze_factor);
            for step in &level.steps {
                step.actnorm.initialize(&h);
                let (out, _) = step.forward(&h);
                h = out;
            }
            if !level.is_last {
                h = h.narrow(1, 0, level.channels / 2);
            }
        }
        self.needs_init.set(false);
    }

    /// Encode a batch into factorized latents.
    ///
    /// Returns one `(z, mean, ln_var)` triple per level and the per-sample
    /// log-determinant of the full transform.
    pub fn forward(&self, x: &Tensor) -> (Vec<FactorizedZ>, Tensor) {
        let mut h = x.shallow_clone();
        let mut log_det = Tensor::from(0f32).to_device(self.device());
        let mut factorized = Vec::with_capacity(self.levels.len());

        for level in &self.levels {
            h = squeeze(&h, self.hyperparams.squeeze_factor);

            for step in &level.steps {
                let (out, step_log_det) = step.forward(&h);
                h = out;
                log_det = log_det + step_log_det;
            }

            if level.is_last {
                let (mean, ln_var) = level.prior_params(&Tensor::zeros_like(&h));
                factorized.push(FactorizedZ {
                    z: h.shallow_clone(),
                    mean,
                    ln_var,
                });
            } else {
                let half = level.channels / 2;
                let keep = h.narrow(1, 0, half);
                let z = h.narrow(1, half, half);
                let (mean, ln_var) = level.prior_params(&keep);
                factorized.push(FactorizedZ { z, mean, ln_var });
                h = keep;
            }
        }

        (factorized, log_det)
    }

    /// Invert the flow from a full set of per-level latents
    pub fn reverse(&self, latents: &[Tensor]) -> Result<Tensor> {
        if latents.len() != self.levels.len() {
            bail!(
                "expected {} latents, got {}",
                self.levels.len(),
                latents.len()
            );
        }

        let mut h: Option<Tensor> = None;
        for (level, z) in self.levels.iter().zip(latents.iter()).rev() {
            let mut t = match h {
                None => z.shallow_clone(),
                Some(keep) => Tensor::cat(&[keep, z.shallow_clone()], 1),
            };

            for step in level.steps.iter().rev() {
                let (out, _) = step.inverse(&t);
                t = out;
            }

            h = Some(unsqueeze(&t, self.hyperparams.squeeze_factor));
        }

        Ok(h.expect("at least one level"))
    }

    /// Draw samples from the learned priors and invert the flow.
    ///
    /// `temperature` scales the prior standard deviation.
    pub fn sample(&self, num_samples: i64, temperature: f64) -> Tensor {
        let device = self.device();

        let mut h: Option<Tensor> = None;
        for level in self.levels.iter().rev() {
            let (height, width) = level.spatial;

            let t = match h {
                None => {
                    let zeros = Tensor::zeros(
                        &[num_samples, level.channels, height, width],
                        (Kind::Float, device),
                    );
                    let (mean, ln_var) = level.prior_params(&zeros);
                    sample_gaussian(&mean, &ln_var, temperature)
                }
                Some(keep) => {
                    let (mean, ln_var) = level.prior_params(&keep);
                    let z = sample_gaussian(&mean, &ln_var, temperature);
                    Tensor::cat(&[keep, z], 1)
                }
            };

            let mut t = t;
            for step in level.steps.iter().rev() {
                let (out, _) = step.inverse(&t);
                t = out;
            }

            h = Some(unsqueeze(&t, self.hyperparams.squeeze_factor));
        }

        h.expect("at least one level")
    }

    /// Save model weights
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.vs
            .save(path.as_ref())
            .with_context(|| format!("failed to save weights to {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Load model weights; the actnorm layers are assumed initialized.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.vs
            .load(path.as_ref())
            .with_context(|| format!("failed to load weights from {}", path.as_ref().display()))?;
        self.needs_init.set(false);
        Ok(())
    }
}

fn sample_gaussian(mean: &Tensor, ln_var: &Tensor, temperature: f64) -> Tensor {
    let std = (ln_var * 0.5).exp();
    mean + std * temperature * Tensor::randn_like(mean)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_hyperparams() -> Hyperparameters {
        Hyperparameters {
            levels: 2,
            depth_per_level: 2,
            nn_hidden_channels: 16,
            image_size: (8, 8),
            num_bits_x: 8,
            squeeze_factor: 2,
            lu_decomposition: false,
        }
    }

    fn test_batch(hp: &Hyperparameters) -> Tensor {
        let (h, w) = hp.image_size;
        Tensor::rand(&[2, 3, h, w], (Kind::Float, Device::Cpu)) - 0.5
    }

    #[test]
    fn test_forward_shapes() {
        let hp = small_hyperparams();
        let model = Glow::new(&hp, Device::Cpu).unwrap();
        let x = test_batch(&hp);
        model.initialize_actnorm_weights(&x);

        let (factorized, log_det) = model.forward(&x);

        assert_eq!(factorized.len(), 2);
        // Level 0: squeeze 3x8x8 -> 12x4x4, split -> 6x4x4 out.
        assert_eq!(factorized[0].z.size(), vec![2, 6, 4, 4]);
        // Level 1: squeeze 6x4x4 -> 24x2x2, all factored out.
        assert_eq!(factorized[1].z.size(), vec![2, 24, 2, 2]);
        assert_eq!(log_det.size(), Vec::<i64>::new());

        for fz in &factorized {
            assert_eq!(fz.mean.size(), fz.z.size());
            assert_eq!(fz.ln_var.size(), fz.z.size());
        }

        // Latent dimensions add up to the input dimensions.
        let total: i64 = factorized
            .iter()
            .map(|fz| fz.z.size()[1] * fz.z.size()[2] * fz.z.size()[3])
            .sum();
        assert_eq!(total, 3 * 8 * 8);
    }

    #[test]
    fn test_forward_reverse_roundtrip() {
        let hp = small_hyperparams();
        let model = Glow::new(&hp, Device::Cpu).unwrap();
        let x = test_batch(&hp);
        model.initialize_actnorm_weights(&x);

        let (factorized, _) = model.forward(&x);
        let latents: Vec<Tensor> = factorized.iter().map(|fz| fz.z.shallow_clone()).collect();
        let restored = model.reverse(&latents).unwrap();

        assert_eq!(restored.size(), x.size());
        let diff = (&restored - &x).abs().max().double_value(&[]);
        assert!(diff < 1e-3, "reconstruction error {}", diff);
    }

    #[test]
    fn test_reverse_rejects_wrong_latent_count() {
        let hp = small_hyperparams();
        let model = Glow::new(&hp, Device::Cpu).unwrap();
        let z = Tensor::zeros(&[1, 24, 2, 2], (Kind::Float, Device::Cpu));
        assert!(model.reverse(&[z]).is_err());
    }

    #[test]
    fn test_sample_shape() {
        let hp = small_hyperparams();
        let model = Glow::new(&hp, Device::Cpu).unwrap();
        // Actnorm defaults are identity, so sampling works untrained.
        let samples = model.sample(3, 0.7);
        assert_eq!(samples.size(), vec![3, 3, 8, 8]);
    }

    #[test]
    fn test_needs_init_lifecycle() {
        let hp = small_hyperparams();
        let model = Glow::new(&hp, Device::Cpu).unwrap();
        assert!(model.needs_init());

        let x = test_batch(&hp);
        model.initialize_actnorm_weights(&x);
        assert!(!model.needs_init());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let hp = small_hyperparams();
        let model = Glow::new(&hp, Device::Cpu).unwrap();
        let x = test_batch(&hp);
        model.initialize_actnorm_weights(&x);
        let (factorized, _) = model.forward(&x);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pt");
        model.save(&path).unwrap();

        let mut restored = Glow::new(&hp, Device::Cpu).unwrap();
        restored.load(&path).unwrap();
        assert!(!restored.needs_init());

        let (factorized_restored, _) = restored.forward(&x);
        let diff = (&factorized[1].z - &factorized_restored[1].z)
            .abs()
            .max()
            .double_value(&[]);
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_lu_model_roundtrip() {
        let hp = Hyperparameters {
            lu_decomposition: true,
            ..small_hyperparams()
        };
        let model = Glow::new(&hp, Device::Cpu).unwrap();
        let x = test_batch(&hp);
        model.initialize_actnorm_weights(&x);

        let (factorized, _) = model.forward(&x);
        let latents: Vec<Tensor> = factorized.iter().map(|fz| fz.z.shallow_clone()).collect();
        let restored = model.reverse(&latents).unwrap();

        let diff = (&restored - &x).abs().max().double_value(&[]);
        assert!(diff < 1e-3, "reconstruction error {}", diff);
    }
}
