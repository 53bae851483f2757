//! Configuration and snapshot utilities

mod checkpoint;
mod config;

pub use checkpoint::{Checkpoint, TrainingHistory, CHECKPOINT_FILE, WEIGHTS_FILE};
pub use config::{Hyperparameters, HYPERPARAMS_FILE, IMAGE_CHANNELS};
