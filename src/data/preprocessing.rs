//! Image preprocessing
//!
//! Raw images arrive as 8-bit HWC pixel arrays. Training consumes CHW
//! float tensors quantized to `num_bits_x` bits and centered on zero, so a
//! pixel value ends up in `[-0.5, 0.5)`. `make_uint8` is the display-side
//! inverse used when writing generated samples back to disk.

use anyhow::{bail, Result};
use ndarray::Array3;
use tch::{Kind, Tensor};

/// Quantize an HWC pixel array to `num_bits_x` bits and rescale to a
/// zero-centered CHW array.
pub fn preprocess(image: &Array3<f32>, num_bits_x: u32) -> Array3<f32> {
    let num_bins_x = 2f32.powi(num_bits_x as i32);

    let mut scaled = image.clone();
    if num_bits_x < 8 {
        let shift = 2f32.powi((8 - num_bits_x) as i32);
        scaled.mapv_inplace(|v| (v / shift).floor());
    }
    scaled.mapv_inplace(|v| v / num_bins_x - 0.5);

    // HWC -> CHW
    let transposed = scaled.permuted_axes([2, 0, 1]);
    transposed.as_standard_layout().to_owned()
}

/// Map a zero-centered CHW tensor back to an 8-bit RGB image.
///
/// Values are snapped to their quantization bin before rescaling so a
/// round trip through `preprocess` reproduces the quantized pixels.
pub fn make_uint8(image: &Tensor, num_bins_x: f64) -> Result<image::RgbImage> {
    let image = if image.dim() == 4 {
        image.get(0)
    } else {
        image.shallow_clone()
    };

    let size = image.size();
    if size.len() != 3 || size[0] != 3 {
        bail!("expected a [3, H, W] tensor, got {:?}", size);
    }
    let (height, width) = (size[1], size[2]);

    let pixels = ((image + 0.5) * num_bins_x).floor() * (255.0 / num_bins_x);
    let pixels = pixels
        .clamp(0.0, 255.0)
        .permute(&[1, 2, 0])
        .contiguous()
        .to_kind(Kind::Uint8)
        .flatten(0, -1);

    let raw = Vec::<u8>::try_from(&pixels)?;
    image::RgbImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| anyhow::anyhow!("image buffer size mismatch"))
}

/// Uniform dequantization noise in `[0, 1/num_bins_x)`, shaped like `x`.
pub fn dequantization_noise(x: &Tensor, num_bins_x: f64) -> Tensor {
    Tensor::rand_like(x) * (1.0 / num_bins_x)
}
