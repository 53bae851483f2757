//! Dataset loading and preprocessing

mod dataset;
mod preprocessing;

pub use dataset::{DataLoader, DatasetFormat, ImageDataset};
pub use preprocessing::{dequantization_noise, make_uint8, preprocess};
