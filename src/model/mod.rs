//! Flow model implementation
//!
//! This module provides:
//! - `ActNorm`: data-dependent activation normalization
//! - `Invertible1x1Conv` / `LuInvertible1x1Conv`: invertible 1x1 convolutions
//! - `AffineCoupling`: affine coupling layer
//! - `FlowStep`: complete flow step (actnorm + 1x1 conv + coupling)
//! - `Glow`: full model with multi-scale factorization

mod glow;
mod layers;

pub use glow::{FactorizedZ, Glow};
pub use layers::{
    squeeze, unsqueeze, ActNorm, AffineCoupling, FlowStep, Invertible1x1Conv, InvertibleConv,
    LuInvertible1x1Conv,
};
