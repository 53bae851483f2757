//! Image dataset loading and batching
//!
//! A dataset is a directory of `.png` images or `.npy` arrays. Every image
//! is preprocessed once at load time and kept in a single CPU tensor;
//! batches are gathered by index and moved to the training device by the
//! caller.

use anyhow::{bail, Context, Result};
use ndarray::{Array3, Array4};
use ndarray_npy::ReadNpyExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tch::{Kind, Tensor};

use super::preprocessing::preprocess;
use crate::utils::IMAGE_CHANNELS;

/// On-disk format of a dataset directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    /// One RGB image per `.png` file
    Png,
    /// One `[N, H, W, C]` f32 or u8 array per `.npy` file
    Npy,
}

impl DatasetFormat {
    fn extension(&self) -> &'static str {
        match self {
            DatasetFormat::Png => "png",
            DatasetFormat::Npy => "npy",
        }
    }
}

impl FromStr for DatasetFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "png" => Ok(DatasetFormat::Png),
            "npy" => Ok(DatasetFormat::Npy),
            other => bail!("unknown dataset format: {} (expected png or npy)", other),
        }
    }
}

/// Preprocessed image dataset backed by one CPU tensor
pub struct ImageDataset {
    images: Tensor,
    image_size: (i64, i64),
    mean: f64,
    variance: f64,
}

impl ImageDataset {
    /// Load and preprocess every matching file in `dir`.
    pub fn load<P: AsRef<Path>>(dir: P, format: DatasetFormat, num_bits_x: u32) -> Result<Self> {
        let dir = dir.as_ref();
        let files = list_files(dir, format.extension())?;
        if files.is_empty() {
            bail!(
                "no .{} files found in {}",
                format.extension(),
                dir.display()
            );
        }

        let mut images: Vec<Array3<f32>> = Vec::new();
        for path in &files {
            match format {
                DatasetFormat::Png => {
                    images.push(load_png(path, num_bits_x)?);
                }
                DatasetFormat::Npy => {
                    images.extend(load_npy(path, num_bits_x)?);
                }
            }
        }

        let shape = images[0].dim();
        for (i, image) in images.iter().enumerate() {
            if image.dim() != shape {
                bail!(
                    "image {} has size {:?}, expected {:?}",
                    i,
                    image.dim(),
                    shape
                );
            }
        }

        let (channels, height, width) = shape;
        let n = images.len();
        let mut flat = Vec::with_capacity(n * channels * height * width);
        for image in &images {
            flat.extend(image.iter().cloned());
        }

        let tensor = Tensor::from_slice(&flat).reshape(&[
            n as i64,
            channels as i64,
            height as i64,
            width as i64,
        ]);

        let mean = tensor.mean(Kind::Float).double_value(&[]);
        let centered = &tensor - mean;
        let variance = (&centered * &centered)
            .mean(Kind::Float)
            .double_value(&[]);

        Ok(Self {
            images: tensor,
            image_size: (height as i64, width as i64),
            mean,
            variance,
        })
    }

    /// Number of images
    pub fn len(&self) -> i64 {
        self.images.size()[0]
    }

    /// Whether the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Image size as (height, width)
    pub fn image_size(&self) -> (i64, i64) {
        self.image_size
    }

    /// Mean over every preprocessed pixel
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Variance over every preprocessed pixel
    pub fn variance(&self) -> f64 {
        self.variance
    }

    /// Gather a batch of images by index
    pub fn get_batch(&self, indices: &[i64]) -> Tensor {
        let idx = Tensor::from_slice(indices);
        self.images.index_select(0, &idx)
    }
}

fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read dataset directory {}", dir.display()))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn load_png(path: &Path, num_bits_x: u32) -> Result<Array3<f32>> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();

    let (width, height) = decoded.dimensions();
    let raw: Vec<f32> = decoded.into_raw().into_iter().map(f32::from).collect();
    let array = Array3::from_shape_vec((height as usize, width as usize, 3), raw)?;

    Ok(preprocess(&array, num_bits_x))
}

fn load_npy(path: &Path, num_bits_x: u32) -> Result<Vec<Array3<f32>>> {
    let array = read_npy_f32(path)?;

    let (n, _h, _w, c) = array.dim();
    if c != IMAGE_CHANNELS as usize {
        bail!(
            "{}: expected {} channels in the last axis, got {}",
            path.display(),
            IMAGE_CHANNELS,
            c
        );
    }

    let mut images = Vec::with_capacity(n);
    for i in 0..n {
        let view = array.index_axis(ndarray::Axis(0), i).to_owned();
        images.push(preprocess(&view, num_bits_x));
    }
    Ok(images)
}

fn read_npy_f32(path: &Path) -> Result<Array4<f32>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    if let Ok(array) = Array4::<f32>::read_npy(file) {
        return Ok(array);
    }

    // Image dumps are commonly stored as u8.
    let file = File::open(path)?;
    let array = Array4::<u8>::read_npy(file)
        .with_context(|| format!("{}: expected a rank-4 f32 or u8 array", path.display()))?;
    Ok(array.mapv(f32::from))
}

/// Shuffled index batcher over an [`ImageDataset`]
pub struct DataLoader {
    dataset: ImageDataset,
    batch_size: usize,
    shuffle: bool,
    indices: Vec<i64>,
    current_idx: usize,
}

impl DataLoader {
    /// Create a new data loader
    pub fn new(dataset: ImageDataset, batch_size: usize, shuffle: bool) -> Self {
        let n = dataset.len();
        let indices: Vec<i64> = (0..n).collect();

        Self {
            dataset,
            batch_size,
            shuffle,
            indices,
            current_idx: 0,
        }
    }

    /// Reset the loader for a new epoch
    pub fn reset(&mut self) {
        self.current_idx = 0;

        if self.shuffle {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            self.indices.shuffle(&mut rng);
        }
    }

    /// Number of batches per epoch
    pub fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    /// The wrapped dataset
    pub fn dataset(&self) -> &ImageDataset {
        &self.dataset
    }
}

impl Iterator for DataLoader {
    type Item = Tensor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.indices.len() {
            return None;
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.current_idx..end_idx];
        self.current_idx = end_idx;

        Some(self.dataset.get_batch(batch_indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_test_pngs(dir: &Path, count: usize, size: u32) {
        for i in 0..count {
            let img = image::RgbImage::from_fn(size, size, |x, y| {
                image::Rgb([(x * 7 + i as u32) as u8, (y * 11) as u8, 128])
            });
            img.save(dir.join(format!("img_{:03}.png", i))).unwrap();
        }
    }

    #[test]
    fn test_dataset_format_parsing() {
        assert_eq!("png".parse::<DatasetFormat>().unwrap(), DatasetFormat::Png);
        assert_eq!("npy".parse::<DatasetFormat>().unwrap(), DatasetFormat::Npy);
        assert!("jpeg".parse::<DatasetFormat>().is_err());
    }

    #[test]
    fn test_load_png_dataset() {
        let dir = tempdir().unwrap();
        write_test_pngs(dir.path(), 5, 8);

        let dataset = ImageDataset::load(dir.path(), DatasetFormat::Png, 8).unwrap();

        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.image_size(), (8, 8));
        assert!(dataset.mean() > -0.5 && dataset.mean() < 0.5);
        assert!(dataset.variance() >= 0.0);

        let batch = dataset.get_batch(&[0, 2, 4]);
        assert_eq!(batch.size(), vec![3, 3, 8, 8]);
    }

    #[test]
    fn test_load_npy_dataset() {
        use ndarray_npy::WriteNpyExt;

        let dir = tempdir().unwrap();
        let array = Array4::<f32>::from_shape_fn((4, 8, 8, 3), |(n, h, w, _)| {
            ((n + h + w) % 256) as f32
        });
        let file = File::create(dir.path().join("batch.npy")).unwrap();
        array.write_npy(file).unwrap();

        let dataset = ImageDataset::load(dir.path(), DatasetFormat::Npy, 8).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.image_size(), (8, 8));
    }

    #[test]
    fn test_empty_directory_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(ImageDataset::load(dir.path(), DatasetFormat::Png, 8).is_err());
    }

    #[test]
    fn test_dataloader_batching() {
        let dir = tempdir().unwrap();
        write_test_pngs(dir.path(), 10, 8);

        let dataset = ImageDataset::load(dir.path(), DatasetFormat::Png, 8).unwrap();
        let mut loader = DataLoader::new(dataset, 4, false);

        assert_eq!(loader.num_batches(), 3);

        loader.reset();
        let sizes: Vec<i64> = loader.by_ref().map(|batch| batch.size()[0]).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        // A reset starts a fresh epoch.
        loader.reset();
        assert_eq!(loader.by_ref().count(), 3);
    }
}
