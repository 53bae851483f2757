//! Hyperparameter management
//!
//! Hyperparameters are saved alongside model weights in the snapshot
//! directory so that a model can always be rebuilt from its snapshot.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// File name used for hyperparameters inside a snapshot directory.
pub const HYPERPARAMS_FILE: &str = "hyperparams.json";

/// Number of image channels. The pipeline is RGB end to end.
pub const IMAGE_CHANNELS: i64 = 3;

/// Model and preprocessing hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// Number of multi-scale levels
    pub levels: usize,
    /// Flow steps per level
    pub depth_per_level: usize,
    /// Hidden channels of the coupling networks
    pub nn_hidden_channels: i64,
    /// Image size as (height, width)
    pub image_size: (i64, i64),
    /// Bit depth of the input images after quantization
    pub num_bits_x: u32,
    /// Spatial squeeze factor applied at each level
    pub squeeze_factor: i64,
    /// Use the LU parameterization for the invertible 1x1 convolutions
    pub lu_decomposition: bool,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            levels: 5,
            depth_per_level: 32,
            nn_hidden_channels: 512,
            image_size: (64, 64),
            num_bits_x: 8,
            squeeze_factor: 2,
            lu_decomposition: false,
        }
    }
}

impl Hyperparameters {
    /// Number of quantization bins implied by `num_bits_x`
    pub fn num_bins_x(&self) -> f64 {
        2f64.powi(self.num_bits_x as i32)
    }

    /// Total number of pixel values per image
    pub fn num_pixels(&self) -> i64 {
        let (h, w) = self.image_size;
        IMAGE_CHANNELS * h * w
    }

    /// Check that the multi-scale layout is realizable for the image size
    pub fn validate(&self) -> Result<()> {
        if self.levels == 0 {
            bail!("levels must be at least 1");
        }
        if self.depth_per_level == 0 {
            bail!("depth_per_level must be at least 1");
        }
        if self.squeeze_factor < 2 {
            bail!("squeeze_factor must be at least 2");
        }
        if self.num_bits_x == 0 || self.num_bits_x > 8 {
            bail!("num_bits_x must be in 1..=8");
        }

        let (mut h, mut w) = self.image_size;
        let mut channels = IMAGE_CHANNELS;
        let f = self.squeeze_factor;

        for level in 0..self.levels {
            if h % f != 0 || w % f != 0 {
                bail!(
                    "image size {}x{} is not divisible by squeeze factor {} at level {}",
                    h,
                    w,
                    f,
                    level
                );
            }
            h /= f;
            w /= f;
            channels *= f * f;

            if channels % 2 != 0 {
                bail!("channel count {} is odd at level {}", channels, level);
            }
            // Every level but the last factors half the channels out.
            if level + 1 < self.levels {
                channels /= 2;
            }
        }

        Ok(())
    }

    /// Load hyperparameters from a snapshot directory
    pub fn load<P: AsRef<Path>>(snapshot_dir: P) -> Result<Self> {
        let path = snapshot_dir.as_ref().join(HYPERPARAMS_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let hyperparams = serde_json::from_str(&content)?;
        Ok(hyperparams)
    }

    /// Save hyperparameters into a snapshot directory
    pub fn save<P: AsRef<Path>>(&self, snapshot_dir: P) -> Result<()> {
        let path = snapshot_dir.as_ref().join(HYPERPARAMS_FILE);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Log every hyperparameter as a key/value line
    pub fn log(&self) {
        info!("levels: {}", self.levels);
        info!("depth_per_level: {}", self.depth_per_level);
        info!("nn_hidden_channels: {}", self.nn_hidden_channels);
        info!("image_size: {}x{}", self.image_size.0, self.image_size.1);
        info!("num_bits_x: {}", self.num_bits_x);
        info!("squeeze_factor: {}", self.squeeze_factor);
        info!("lu_decomposition: {}", self.lu_decomposition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let hp = Hyperparameters::default();
        hp.validate().unwrap();
        assert_eq!(hp.num_bins_x(), 256.0);
        assert_eq!(hp.num_pixels(), 3 * 64 * 64);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let hp = Hyperparameters {
            levels: 3,
            depth_per_level: 8,
            nn_hidden_channels: 128,
            image_size: (32, 32),
            num_bits_x: 5,
            squeeze_factor: 2,
            lu_decomposition: true,
        };

        let dir = tempdir().unwrap();
        hp.save(dir.path()).unwrap();
        let loaded = Hyperparameters::load(dir.path()).unwrap();

        assert_eq!(loaded.levels, hp.levels);
        assert_eq!(loaded.image_size, hp.image_size);
        assert_eq!(loaded.num_bits_x, hp.num_bits_x);
        assert!(loaded.lu_decomposition);
    }

    #[test]
    fn test_validate_rejects_indivisible_image() {
        let hp = Hyperparameters {
            levels: 4,
            image_size: (24, 24),
            ..Default::default()
        };
        // 24 -> 12 -> 6 -> 3, which the fourth squeeze cannot divide.
        assert!(hp.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_bits() {
        let hp = Hyperparameters {
            num_bits_x: 0,
            ..Default::default()
        };
        assert!(hp.validate().is_err());
    }
}
