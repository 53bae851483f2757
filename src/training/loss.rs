//! Flow training objective
//!
//! The model is trained by maximum likelihood. Each factored-out latent
//! contributes a Gaussian negative log-likelihood under its learned prior;
//! the flow's log-determinant converts that density back to image space.
//! Everything is reported in bits per pixel value, so the loss is divided
//! by `ln(2) * num_pixels`.

use tch::{Kind, Tensor};

use crate::model::FactorizedZ;

/// Negative log-likelihood of `x` under `N(mean, exp(ln_var))`, summed over
/// batch and dimensions.
pub fn gaussian_nll(x: &Tensor, mean: &Tensor, ln_var: &Tensor) -> Tensor {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let squared = (x - mean).pow_tensor_scalar(2);
    (0.5f64 * (squared * (-ln_var).exp() + ln_var + ln_2pi)).sum(Kind::Float)
}

/// KL divergence of `N(mean, exp(ln_var))` against the standard normal,
/// summed over batch and dimensions.
pub fn gaussian_kl_divergence(mean: &Tensor, ln_var: &Tensor) -> Tensor {
    let squared = mean.pow_tensor_scalar(2);
    (-0.5f64 * (1.0f64 + ln_var - squared - ln_var.exp())).sum(Kind::Float)
}

/// Scalar terms of one training batch
#[derive(Debug)]
pub struct FlowLoss {
    /// Loss to backpropagate, in bits per pixel value
    pub loss: Tensor,
    /// Total negative log-likelihood, summed over the batch
    pub nll: Tensor,
    /// Total KL divergence, summed over the batch
    pub kld: Tensor,
    /// Per-sample log-determinant after the quantization correction
    pub log_det: Tensor,
    /// Normalizer `ln(2) * num_pixels`
    pub denom: f64,
}

impl FlowLoss {
    /// Assemble the objective from the factorized latents.
    ///
    /// `log_det` is the per-sample log-determinant returned by the model;
    /// the discretization of the input into `num_bins_x` bins is folded in
    /// here.
    pub fn compute(
        factorized: &[FactorizedZ],
        log_det: &Tensor,
        batch_size: i64,
        num_pixels: i64,
        num_bins_x: f64,
        regularize_z: bool,
    ) -> Self {
        let denom = std::f64::consts::LN_2 * num_pixels as f64;

        let log_det = log_det - num_bins_x.ln() * num_pixels as f64;

        let mut nll = Tensor::from(0f32).to_device(log_det.device());
        let mut kld = Tensor::from(0f32).to_device(log_det.device());
        for fz in factorized {
            nll = nll + gaussian_nll(&fz.z, &fz.mean, &fz.ln_var);
            if regularize_z {
                kld = kld + gaussian_kl_divergence(&fz.mean, &fz.ln_var);
            }
        }

        let loss = ((&nll + &kld) / batch_size as f64 - &log_det) / denom;

        Self {
            loss,
            nll,
            kld,
            log_det,
            denom,
        }
    }

    /// Loss value as a float
    pub fn loss_value(&self) -> f64 {
        self.loss.double_value(&[])
    }

    /// Per-sample negative log-likelihood in bits per pixel value
    pub fn nll_bits(&self, batch_size: i64) -> f64 {
        self.nll.double_value(&[]) / batch_size as f64 / self.denom
    }

    /// Per-sample KL divergence
    pub fn kld_value(&self, batch_size: i64) -> f64 {
        self.kld.double_value(&[]) / batch_size as f64
    }

    /// Log-determinant in bits per pixel value
    pub fn log_det_bits(&self) -> f64 {
        self.log_det.double_value(&[]) / self.denom
    }
}
