//! # Glow image model training
//!
//! This library trains a Glow-style normalizing flow on image datasets,
//! featuring:
//!
//! - PNG and NPY dataset ingestion with bit-depth quantization
//! - A multi-scale invertible model built on `tch` autograd
//! - Exact likelihood training with optional prior regularization
//! - A cyclical (triangular) learning-rate Adam optimizer
//! - Snapshotting with full resume support
//!
//! ## Example
//!
//! ```rust,no_run
//! use glow_image::{
//!     data::{DataLoader, DatasetFormat, ImageDataset},
//!     model::Glow,
//!     training::{CyclicalLrConfig, Trainer, TrainerConfig},
//!     utils::Hyperparameters,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let hyperparams = Hyperparameters {
//!         image_size: (64, 64),
//!         ..Default::default()
//!     };
//!
//!     let dataset = ImageDataset::load("data", DatasetFormat::Png, hyperparams.num_bits_x)?;
//!     let mut loader = DataLoader::new(dataset, 32, true);
//!
//!     let model = Glow::new(&hyperparams, tch::Device::Cpu)?;
//!     let mut trainer = Trainer::new(
//!         model,
//!         CyclicalLrConfig::default(),
//!         TrainerConfig::default(),
//!     )?;
//!     trainer.train(&mut loader)?;
//!
//!     Ok(())
//! }
//! ```

pub mod data;
pub mod model;
pub mod training;
pub mod utils;

pub use data::{DataLoader, DatasetFormat, ImageDataset};
pub use model::{FactorizedZ, Glow};
pub use training::{CyclicalAdam, CyclicalLrConfig, Trainer, TrainerConfig};
pub use utils::{Checkpoint, Hyperparameters};
