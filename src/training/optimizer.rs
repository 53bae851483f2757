//! Adam optimizer with a cyclical learning rate
//!
//! The learning rate follows a triangular wave: starting from the floor
//! `mu_f` it climbs linearly to the peak `mu_i` over the first half of a
//! cycle and descends back over the second half. One cycle spans
//! `cycle_steps` training steps.

use anyhow::Result;
use tch::nn;
use tch::nn::OptimizerConfig;

/// Schedule and Adam settings
#[derive(Debug, Clone)]
pub struct CyclicalLrConfig {
    /// Peak learning rate
    pub mu_i: f64,
    /// Floor learning rate
    pub mu_f: f64,
    /// Steps per cycle
    pub cycle_steps: usize,
    /// Adam first-moment decay
    pub beta_1: f64,
    /// Adam second-moment decay
    pub beta_2: f64,
}

impl Default for CyclicalLrConfig {
    fn default() -> Self {
        Self {
            mu_i: 3.0e-3,
            mu_f: 1.0e-4,
            cycle_steps: 10_000,
            beta_1: 0.9,
            beta_2: 0.99,
        }
    }
}

impl CyclicalLrConfig {
    /// Learning rate at a training step
    pub fn learning_rate_at(&self, training_step: usize) -> f64 {
        let n = self.cycle_steps as f64;
        let step_in_cycle = (training_step % self.cycle_steps) as f64;

        if step_in_cycle < n / 2.0 {
            self.mu_f + (self.mu_i - self.mu_f) * 2.0 * (step_in_cycle / n)
        } else {
            self.mu_f + (self.mu_i - self.mu_f) * 2.0 * (1.0 - step_in_cycle / n)
        }
    }
}

/// Adam wrapper that anneals its learning rate after every step
pub struct CyclicalAdam {
    optimizer: nn::Optimizer,
    config: CyclicalLrConfig,
    learning_rate: f64,
}

impl CyclicalAdam {
    /// Build the optimizer over a model's variable store
    pub fn new(vs: &nn::VarStore, config: CyclicalLrConfig) -> Result<Self> {
        let learning_rate = config.learning_rate_at(0);
        let optimizer = nn::Adam {
            beta1: config.beta_1,
            beta2: config.beta_2,
            ..Default::default()
        }
        .build(vs, learning_rate)?;

        Ok(Self {
            optimizer,
            config,
            learning_rate,
        })
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Schedule configuration
    pub fn config(&self) -> &CyclicalLrConfig {
        &self.config
    }

    /// Clear accumulated gradients
    pub fn zero_grad(&mut self) {
        self.optimizer.zero_grad();
    }

    /// Apply the accumulated gradients, then anneal the learning rate for
    /// the given training step.
    pub fn update(&mut self, training_step: usize) {
        self.optimizer.step();
        self.anneal_learning_rate(training_step);
    }

    /// Set the learning rate to the schedule value for `training_step`
    pub fn anneal_learning_rate(&mut self, training_step: usize) {
        let lr = self.config.learning_rate_at(training_step);
        self.optimizer.set_lr(lr);
        self.learning_rate = lr;
    }
}
