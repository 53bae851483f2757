//! Flow layer implementations
//!
//! The invertible building blocks of the model:
//! - `ActNorm`: data-dependent activation normalization
//! - `Invertible1x1Conv`: invertible 1x1 convolution, dense weight
//! - `LuInvertible1x1Conv`: invertible 1x1 convolution, LU parameterization
//! - `AffineCoupling`: affine coupling layer
//! - `FlowStep`: actnorm -> 1x1 conv -> coupling
//!
//! Every `forward` returns the transformed tensor together with the
//! per-sample log-determinant of the transform's Jacobian; `inverse`
//! returns the negated log-determinant.

use tch::nn::Module;
use tch::{nn, Kind, Tensor};

/// Activation normalization
///
/// `y = (x + bias) * scale` with per-channel parameters. The parameters are
/// filled from the statistics of the first training batch, after which both
/// are learned by gradient descent.
#[derive(Debug)]
pub struct ActNorm {
    scale: Tensor,
    bias: Tensor,
}

impl ActNorm {
    pub fn new(vs: &nn::Path, num_channels: i64) -> Self {
        Self {
            scale: vs.ones("scale", &[1, num_channels, 1, 1]),
            bias: vs.zeros("bias", &[1, num_channels, 1, 1]),
        }
    }

    /// Data-dependent initialization: the first batch comes out with
    /// zero mean and unit variance per channel.
    pub fn initialize(&self, x: &Tensor) {
        tch::no_grad(|| {
            let mean = x.mean_dim(Some([0i64, 2, 3].as_slice()), true, Kind::Float);
            let centered = x - &mean;
            let variance =
                (&centered * &centered).mean_dim(Some([0i64, 2, 3].as_slice()), true, Kind::Float);
            let std = variance.sqrt();

            let mut bias = self.bias.shallow_clone();
            bias.copy_(&mean.neg());
            let mut scale = self.scale.shallow_clone();
            scale.copy_(&(std + 1e-6).reciprocal());
        });
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, Tensor) {
        let size = x.size();
        let pixels = (size[2] * size[3]) as f64;

        let y = (x + &self.bias) * &self.scale;
        let log_det = pixels * self.scale.abs().log().sum(Kind::Float);

        (y, log_det)
    }

    pub fn inverse(&self, y: &Tensor) -> (Tensor, Tensor) {
        let size = y.size();
        let pixels = (size[2] * size[3]) as f64;

        let x = y / &self.scale - &self.bias;
        let log_det = -pixels * self.scale.abs().log().sum(Kind::Float);

        (x, log_det)
    }
}

/// Invertible 1x1 convolution with a dense weight matrix
///
/// The weight is initialized to a random rotation so the transform starts
/// volume-preserving.
#[derive(Debug)]
pub struct Invertible1x1Conv {
    weight: Tensor,
    num_channels: i64,
}

impl Invertible1x1Conv {
    pub fn new(vs: &nn::Path, num_channels: i64) -> Self {
        let init = Tensor::randn(&[num_channels, num_channels], (Kind::Float, vs.device()));
        let (q, _) = Tensor::linalg_qr(&init, "reduced");

        Self {
            weight: vs.var_copy("weight", &q),
            num_channels,
        }
    }

    fn apply_kernel(&self, x: &Tensor, weight: &Tensor) -> Tensor {
        let kernel = weight.reshape(&[self.num_channels, self.num_channels, 1, 1]);
        x.conv2d(&kernel, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], 1)
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, Tensor) {
        let size = x.size();
        let pixels = (size[2] * size[3]) as f64;

        let y = self.apply_kernel(x, &self.weight);
        let (_, log_abs_det) = self.weight.slogdet();
        let log_det = pixels * log_abs_det;

        (y, log_det)
    }

    pub fn inverse(&self, y: &Tensor) -> (Tensor, Tensor) {
        let size = y.size();
        let pixels = (size[2] * size[3]) as f64;

        let x = self.apply_kernel(y, &self.weight.inverse());
        let (_, log_abs_det) = self.weight.slogdet();
        let log_det = -pixels * log_abs_det;

        (x, log_det)
    }
}

/// Invertible 1x1 convolution parameterized through its LU decomposition
///
/// `W = P (L + I) (U + diag(sign * exp(log_s)))` with a fixed permutation
/// `P` and sign vector. The log-determinant reduces to `sum(log_s)`, which
/// avoids the dense determinant of the plain variant.
#[derive(Debug)]
pub struct LuInvertible1x1Conv {
    perm: Tensor,
    lower: Tensor,
    upper: Tensor,
    log_s: Tensor,
    sign_s: Tensor,
    num_channels: i64,
}

impl LuInvertible1x1Conv {
    pub fn new(vs: &nn::Path, num_channels: i64) -> Self {
        let device = vs.device();

        // The permutation is drawn once and kept fixed; it is registered as
        // a non-trainable variable so snapshots restore it.
        let mut perm = vs.zeros_no_train("perm", &[num_channels, num_channels]);
        tch::no_grad(|| {
            let order = Tensor::randperm(num_channels, (Kind::Int64, device));
            let matrix = Tensor::eye(num_channels, (Kind::Float, device)).index_select(0, &order);
            perm.copy_(&matrix);
        });

        Self {
            perm,
            lower: vs.zeros("lower", &[num_channels, num_channels]),
            upper: vs.zeros("upper", &[num_channels, num_channels]),
            log_s: vs.zeros("log_s", &[num_channels]),
            sign_s: vs.ones_no_train("sign_s", &[num_channels]),
            num_channels,
        }
    }

    fn weight(&self) -> Tensor {
        let device = self.log_s.device();
        let eye = Tensor::eye(self.num_channels, (Kind::Float, device));

        let lower = self.lower.tril(-1) + &eye;
        let diagonal = (&self.sign_s * self.log_s.exp()).diag(0);
        let upper = self.upper.triu(1) + diagonal;

        self.perm.matmul(&lower).matmul(&upper)
    }

    fn apply_kernel(&self, x: &Tensor, weight: &Tensor) -> Tensor {
        let kernel = weight.reshape(&[self.num_channels, self.num_channels, 1, 1]);
        x.conv2d(&kernel, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], 1)
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, Tensor) {
        let size = x.size();
        let pixels = (size[2] * size[3]) as f64;

        let y = self.apply_kernel(x, &self.weight());
        let log_det = pixels * self.log_s.sum(Kind::Float);

        (y, log_det)
    }

    pub fn inverse(&self, y: &Tensor) -> (Tensor, Tensor) {
        let size = y.size();
        let pixels = (size[2] * size[3]) as f64;

        let x = self.apply_kernel(y, &self.weight().inverse());
        let log_det = -pixels * self.log_s.sum(Kind::Float);

        (x, log_det)
    }
}

/// Either parameterization of the invertible 1x1 convolution
#[derive(Debug)]
pub enum InvertibleConv {
    Plain(Invertible1x1Conv),
    Lu(LuInvertible1x1Conv),
}

impl InvertibleConv {
    pub fn new(vs: &nn::Path, num_channels: i64, lu_decomposition: bool) -> Self {
        if lu_decomposition {
            InvertibleConv::Lu(LuInvertible1x1Conv::new(vs, num_channels))
        } else {
            InvertibleConv::Plain(Invertible1x1Conv::new(vs, num_channels))
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, Tensor) {
        match self {
            InvertibleConv::Plain(conv) => conv.forward(x),
            InvertibleConv::Lu(conv) => conv.forward(x),
        }
    }

    pub fn inverse(&self, y: &Tensor) -> (Tensor, Tensor) {
        match self {
            InvertibleConv::Plain(conv) => conv.inverse(y),
            InvertibleConv::Lu(conv) => conv.inverse(y),
        }
    }
}

/// Affine coupling layer
///
/// The input splits into channel halves `(x_a, x_b)`. A small conv net maps
/// `x_a` to a scale and translation applied to `x_b`:
///
/// `y_b = (x_b + t) * sigmoid(log_s + 2)`
///
/// The final conv is zero-initialized so the layer starts as the identity.
#[derive(Debug)]
pub struct AffineCoupling {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    conv3: nn::Conv2D,
    split_channels: i64,
}

impl AffineCoupling {
    pub fn new(vs: &nn::Path, num_channels: i64, hidden_channels: i64) -> Self {
        let half = num_channels / 2;

        let conv1 = nn::conv2d(
            vs / "conv1",
            half,
            hidden_channels,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );
        let conv2 = nn::conv2d(
            vs / "conv2",
            hidden_channels,
            hidden_channels,
            1,
            Default::default(),
        );
        let conv3 = nn::conv2d(
            vs / "conv3",
            hidden_channels,
            num_channels,
            3,
            nn::ConvConfig {
                padding: 1,
                ws_init: nn::Init::Const(0.0),
                bs_init: nn::Init::Const(0.0),
                ..Default::default()
            },
        );

        Self {
            conv1,
            conv2,
            conv3,
            split_channels: half,
        }
    }

    /// Scale and translation computed from the conditioning half
    fn scale_translation(&self, x_a: &Tensor) -> (Tensor, Tensor) {
        let h = self.conv1.forward(x_a).relu();
        let h = self.conv2.forward(&h).relu();
        let out = self.conv3.forward(&h);

        let log_s = out.narrow(1, 0, self.split_channels);
        let t = out.narrow(1, self.split_channels, self.split_channels);

        let scale = (log_s + 2.0).sigmoid();
        (scale, t)
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, Tensor) {
        let batch_size = x.size()[0] as f64;
        let x_a = x.narrow(1, 0, self.split_channels);
        let x_b = x.narrow(1, self.split_channels, self.split_channels);

        let (scale, t) = self.scale_translation(&x_a);
        let y_b = (x_b + &t) * &scale;

        let y = Tensor::cat(&[x_a, y_b], 1);
        let log_det = scale.log().sum(Kind::Float) / batch_size;

        (y, log_det)
    }

    pub fn inverse(&self, y: &Tensor) -> (Tensor, Tensor) {
        let batch_size = y.size()[0] as f64;
        let y_a = y.narrow(1, 0, self.split_channels);
        let y_b = y.narrow(1, self.split_channels, self.split_channels);

        let (scale, t) = self.scale_translation(&y_a);
        let x_b = y_b / &scale - &t;

        let x = Tensor::cat(&[y_a, x_b], 1);
        let log_det = -scale.log().sum(Kind::Float) / batch_size;

        (x, log_det)
    }
}

/// One flow step: actnorm -> invertible 1x1 conv -> affine coupling
#[derive(Debug)]
pub struct FlowStep {
    pub actnorm: ActNorm,
    pub conv: InvertibleConv,
    pub coupling: AffineCoupling,
}

impl FlowStep {
    pub fn new(
        vs: &nn::Path,
        num_channels: i64,
        hidden_channels: i64,
        lu_decomposition: bool,
    ) -> Self {
        Self {
            actnorm: ActNorm::new(&(vs / "actnorm"), num_channels),
            conv: InvertibleConv::new(&(vs / "conv1x1"), num_channels, lu_decomposition),
            coupling: AffineCoupling::new(&(vs / "coupling"), num_channels, hidden_channels),
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, Tensor) {
        let (h, log_det_1) = self.actnorm.forward(x);
        let (h, log_det_2) = self.conv.forward(&h);
        let (y, log_det_3) = self.coupling.forward(&h);

        (y, log_det_1 + log_det_2 + log_det_3)
    }

    pub fn inverse(&self, y: &Tensor) -> (Tensor, Tensor) {
        let (h, log_det_1) = self.coupling.inverse(y);
        let (h, log_det_2) = self.conv.inverse(&h);
        let (x, log_det_3) = self.actnorm.inverse(&h);

        (x, log_det_1 + log_det_2 + log_det_3)
    }
}

/// Trade spatial extent for channels: `[B, C, H, W] -> [B, C*f*f, H/f, W/f]`
pub fn squeeze(x: &Tensor, factor: i64) -> Tensor {
    let (b, c, h, w) = {
        let size = x.size();
        (size[0], size[1], size[2], size[3])
    };

    x.reshape(&[b, c, h / factor, factor, w / factor, factor])
        .permute(&[0, 1, 3, 5, 2, 4])
        .reshape(&[b, c * factor * factor, h / factor, w / factor])
}

/// Inverse of [`squeeze`]
pub fn unsqueeze(x: &Tensor, factor: i64) -> Tensor {
    let (b, c, h, w) = {
        let size = x.size();
        (size[0], size[1], size[2], size[3])
    };
    let c_out = c / (factor * factor);

    x.reshape(&[b, c_out, factor, factor, h, w])
        .permute(&[0, 1, 4, 2, 5, 3])
        .reshape(&[b, c_out, h * factor, w * factor])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn test_input(channels: i64) -> Tensor {
        Tensor::randn(&[4, channels, 8, 8], (Kind::Float, Device::Cpu))
    }

    fn assert_close(a: &Tensor, b: &Tensor, tolerance: f64) {
        let diff = (a - b).abs().max().double_value(&[]);
        assert!(diff < tolerance, "max difference {} above {}", diff, tolerance);
    }

    #[test]
    fn test_actnorm_invertibility() {
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm::new(&vs.root(), 6);
        let x = test_input(6);
        actnorm.initialize(&x);

        let (y, log_det_fwd) = actnorm.forward(&x);
        let (x_recovered, log_det_inv) = actnorm.inverse(&y);

        assert_close(&x, &x_recovered, 1e-5);
        let sum = log_det_fwd.double_value(&[]) + log_det_inv.double_value(&[]);
        assert!(sum.abs() < 1e-4);
    }

    #[test]
    fn test_actnorm_initialization_normalizes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm::new(&vs.root(), 6);
        let x = test_input(6) * 3.0 + 1.5;
        actnorm.initialize(&x);

        let (y, _) = actnorm.forward(&x);
        let mean = y.mean(Kind::Float).double_value(&[]);
        let variance = (&y * &y).mean(Kind::Float).double_value(&[]) - mean * mean;

        assert!(mean.abs() < 1e-3);
        assert!((variance - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_conv1x1_invertibility() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = Invertible1x1Conv::new(&vs.root(), 6);
        let x = test_input(6);

        let (y, log_det_fwd) = conv.forward(&x);
        let (x_recovered, log_det_inv) = conv.inverse(&y);

        assert_close(&x, &x_recovered, 1e-4);
        let sum = log_det_fwd.double_value(&[]) + log_det_inv.double_value(&[]);
        assert!(sum.abs() < 1e-4);
    }

    #[test]
    fn test_conv1x1_rotation_init_is_volume_preserving() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = Invertible1x1Conv::new(&vs.root(), 6);
        let x = test_input(6);

        let (_, log_det) = conv.forward(&x);
        assert!(log_det.double_value(&[]).abs() < 1e-3);
    }

    #[test]
    fn test_lu_conv1x1_invertibility() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = LuInvertible1x1Conv::new(&vs.root(), 6);
        let x = test_input(6);

        let (y, log_det_fwd) = conv.forward(&x);
        let (x_recovered, log_det_inv) = conv.inverse(&y);

        assert_close(&x, &x_recovered, 1e-4);
        let sum = log_det_fwd.double_value(&[]) + log_det_inv.double_value(&[]);
        assert!(sum.abs() < 1e-4);
    }

    #[test]
    fn test_lu_conv1x1_permutes_at_init() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = LuInvertible1x1Conv::new(&vs.root(), 6);
        let x = test_input(6);

        // At initialization W = P, so the transform only reorders channels.
        let (y, log_det) = conv.forward(&x);
        assert!(log_det.double_value(&[]).abs() < 1e-6);

        let x_sorted = x.sort(1, false).0;
        let y_sorted = y.sort(1, false).0;
        assert_close(&x_sorted, &y_sorted, 1e-6);
    }

    #[test]
    fn test_coupling_invertibility() {
        let vs = nn::VarStore::new(Device::Cpu);
        let coupling = AffineCoupling::new(&vs.root(), 6, 32);
        let x = test_input(6);

        let (y, log_det_fwd) = coupling.forward(&x);
        let (x_recovered, log_det_inv) = coupling.inverse(&y);

        assert_close(&x, &x_recovered, 1e-5);
        let sum = log_det_fwd.double_value(&[]) + log_det_inv.double_value(&[]);
        assert!(sum.abs() < 1e-4);
    }

    #[test]
    fn test_coupling_starts_as_identity() {
        let vs = nn::VarStore::new(Device::Cpu);
        let coupling = AffineCoupling::new(&vs.root(), 6, 32);
        let x = test_input(6);

        // Zero-initialized final conv: scale = sigmoid(2), t = 0, so the
        // transformed half is just x_b * sigmoid(2).
        let (y, _) = coupling.forward(&x);
        let x_b = x.narrow(1, 3, 3);
        let y_b = y.narrow(1, 3, 3);
        let expected = x_b * (2.0f64.exp() / (1.0 + 2.0f64.exp()));

        assert_close(&expected, &y_b, 1e-5);
    }

    #[test]
    fn test_flow_step_invertibility() {
        let vs = nn::VarStore::new(Device::Cpu);
        let step = FlowStep::new(&vs.root(), 6, 32, true);
        let x = test_input(6);
        step.actnorm.initialize(&x);

        let (y, log_det_fwd) = step.forward(&x);
        let (x_recovered, log_det_inv) = step.inverse(&y);

        assert_close(&x, &x_recovered, 1e-4);
        let sum = log_det_fwd.double_value(&[]) + log_det_inv.double_value(&[]);
        assert!(sum.abs() < 1e-3);
    }

    #[test]
    fn test_squeeze_unsqueeze_roundtrip() {
        let x = Tensor::randn(&[2, 3, 8, 8], (Kind::Float, Device::Cpu));

        let squeezed = squeeze(&x, 2);
        assert_eq!(squeezed.size(), vec![2, 12, 4, 4]);

        let restored = unsqueeze(&squeezed, 2);
        assert_eq!(restored.size(), x.size());
        let diff = (&restored - &x).abs().max().double_value(&[]);
        assert!(diff < 1e-7);
    }

    #[test]
    fn test_squeeze_factor_four() {
        let x = Tensor::randn(&[1, 3, 16, 16], (Kind::Float, Device::Cpu));

        let squeezed = squeeze(&x, 4);
        assert_eq!(squeezed.size(), vec![1, 48, 4, 4]);

        let restored = unsqueeze(&squeezed, 4);
        let diff = (&restored - &x).abs().max().double_value(&[]);
        assert!(diff < 1e-7);
    }
}
