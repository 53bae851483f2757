//! Command-line interface for training and sampling the flow model.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use glow_image::{
    data::{make_uint8, DataLoader, DatasetFormat, ImageDataset},
    model::Glow,
    training::{CyclicalLrConfig, Trainer, TrainerConfig},
    utils::{Checkpoint, Hyperparameters, WEIGHTS_FILE},
};

#[derive(Parser)]
#[command(name = "glow-image")]
#[command(about = "Train a Glow normalizing flow on image data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default hyperparameters file
    Init {
        /// Directory the hyperparameters are written into
        #[arg(short, long, default_value = "snapshot")]
        output: PathBuf,
    },

    /// Train the model
    Train {
        /// Dataset directory
        #[arg(short, long)]
        dataset_path: PathBuf,

        /// Dataset format (png or npy)
        #[arg(short = 'f', long, default_value = "png")]
        dataset_format: String,

        /// Snapshot directory
        #[arg(short, long, default_value = "snapshot")]
        snapshot_path: PathBuf,

        /// Batch size
        #[arg(short, long, default_value = "32")]
        batch_size: usize,

        /// Number of training iterations
        #[arg(short, long, default_value = "1000")]
        total_iteration: usize,

        /// Number of multi-scale levels
        #[arg(long, default_value = "5")]
        levels: usize,

        /// Flow steps per level
        #[arg(long, default_value = "32")]
        depth_per_level: usize,

        /// Hidden channels of the coupling networks
        #[arg(long, default_value = "512")]
        nn_hidden_channels: i64,

        /// Bit depth of the input images
        #[arg(long, default_value = "8")]
        num_bits_x: u32,

        /// Spatial squeeze factor
        #[arg(long, default_value = "2")]
        squeeze_factor: i64,

        /// Use the LU parameterization for the 1x1 convolutions
        #[arg(long)]
        lu_decomposition: bool,

        /// Regularize the latent priors towards the standard normal
        #[arg(long)]
        regularize_z: bool,

        /// Snapshot cadence in batches
        #[arg(long, default_value = "100")]
        checkpoint_interval: usize,

        /// Use GPU if available
        #[arg(long)]
        gpu: bool,
    },

    /// Sample images from a trained model
    Sample {
        /// Snapshot directory of the trained model
        #[arg(short, long, default_value = "snapshot")]
        snapshot_path: PathBuf,

        /// Number of images to generate
        #[arg(short, long, default_value = "16")]
        num: i64,

        /// Prior temperature
        #[arg(short, long, default_value = "0.7")]
        temperature: f64,

        /// Output directory
        #[arg(short, long, default_value = "samples")]
        output: PathBuf,

        /// Use GPU if available
        #[arg(long)]
        gpu: bool,
    },
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output } => {
            std::fs::create_dir_all(&output)?;
            let hyperparams = Hyperparameters::default();
            hyperparams.save(&output)?;
            info!("hyperparameters written to {}", output.display());
        }

        Commands::Train {
            dataset_path,
            dataset_format,
            snapshot_path,
            batch_size,
            total_iteration,
            levels,
            depth_per_level,
            nn_hidden_channels,
            num_bits_x,
            squeeze_factor,
            lu_decomposition,
            regularize_z,
            checkpoint_interval,
            gpu,
        } => {
            let format: DatasetFormat = dataset_format.parse()?;
            let device = select_device(gpu);

            let resume = Checkpoint::exists(&snapshot_path);

            let hyperparams = if resume {
                let checkpoint = Checkpoint::load(&snapshot_path)?;
                warn!(
                    "resuming from snapshot {} at iteration {}",
                    snapshot_path.display(),
                    checkpoint.iteration
                );
                checkpoint.hyperparams
            } else {
                Hyperparameters {
                    levels,
                    depth_per_level,
                    nn_hidden_channels,
                    image_size: (0, 0),
                    num_bits_x,
                    squeeze_factor,
                    lu_decomposition,
                }
            };

            info!("loading dataset from {}", dataset_path.display());
            let dataset = ImageDataset::load(&dataset_path, format, hyperparams.num_bits_x)?;
            info!("#: {}", dataset.len());
            info!("mean: {:.6}", dataset.mean());
            info!("var: {:.6}", dataset.variance());

            let hyperparams = Hyperparameters {
                image_size: dataset.image_size(),
                ..hyperparams
            };
            hyperparams.validate()?;
            hyperparams.log();

            std::fs::create_dir_all(&snapshot_path)?;
            hyperparams.save(&snapshot_path)?;

            let mut model = Glow::new(&hyperparams, device)?;

            let trainer_config = TrainerConfig {
                iterations: total_iteration,
                snapshot_dir: snapshot_path.clone(),
                checkpoint_interval,
                regularize_z,
            };

            let mut trainer = if resume {
                model.load(snapshot_path.join(WEIGHTS_FILE))?;
                let checkpoint = Checkpoint::load(&snapshot_path)?;
                Trainer::resume(model, CyclicalLrConfig::default(), trainer_config, checkpoint)?
            } else {
                Trainer::new(model, CyclicalLrConfig::default(), trainer_config)?
            };

            let mut loader = DataLoader::new(dataset, batch_size, true);
            info!(
                "training for {} iterations ({} batches each)",
                total_iteration,
                loader.num_batches()
            );

            let losses = trainer.train(&mut loader)?;
            if let Some(final_loss) = losses.last() {
                info!("final loss: {:.5}", final_loss);
            }
        }

        Commands::Sample {
            snapshot_path,
            num,
            temperature,
            output,
            gpu,
        } => {
            let device = select_device(gpu);

            let hyperparams = Hyperparameters::load(&snapshot_path)
                .with_context(|| format!("no hyperparameters in {}", snapshot_path.display()))?;
            hyperparams.log();

            let mut model = Glow::new(&hyperparams, device)?;
            model.load(snapshot_path.join(WEIGHTS_FILE))?;

            info!("sampling {} images at temperature {}", num, temperature);
            let samples = model.sample(num, temperature);

            std::fs::create_dir_all(&output)?;
            for i in 0..num {
                let image = make_uint8(&samples.get(i), hyperparams.num_bins_x())?;
                let path = output.join(format!("sample_{:04}.png", i));
                image.save(&path)?;
            }
            info!("{} samples written to {}", num, output.display());
        }
    }

    Ok(())
}

fn select_device(gpu: bool) -> tch::Device {
    if gpu && tch::Cuda::is_available() {
        info!("using CUDA GPU");
        tch::Device::Cuda(0)
    } else {
        info!("using CPU");
        tch::Device::Cpu
    }
}
