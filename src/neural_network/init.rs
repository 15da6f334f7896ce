//! Weight initialization.
//!
//! Defaults follow PyTorch's Kaiming initialization expressed as a variance scaling
//! initializer, see [`pytorch_kaiming_weight_factor`].
use crate::tensor::ArcTensorD;
use anyhow::{ensure, Result};
use ndarray::{Array, IxDyn};
use rand::RngCore;
use rand_distr::{Distribution as _, StandardNormal, Uniform};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Standard deviation of a unit normal truncated to (-2, 2).
const TRUNCATED_NORMAL_STDDEV: f32 = 0.879_625_66;

/// Initializes tensors.
pub trait Initializer: Debug {
    /// Creates a tensor of `shape`, drawing from `rng`.
    fn init(&self, shape: &[usize], rng: &mut dyn RngCore) -> Result<ArcTensorD>;
}

fn sample(shape: &[usize], mut f: impl FnMut() -> f32) -> Result<ArcTensorD> {
    let data = (0..shape.iter().product::<usize>()).map(|_| f()).collect();
    Ok(Array::from_shape_vec(IxDyn(shape), data)?.into_shared())
}

/// Fills with a constant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Constant(pub f32);

impl Initializer for Constant {
    fn init(&self, shape: &[usize], _rng: &mut dyn RngCore) -> Result<ArcTensorD> {
        Ok(Array::from_elem(IxDyn(shape), self.0).into_shared())
    }
}

/// Normal distribution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RandomNormal {
    mean: f32,
    stddev: f32,
}

impl RandomNormal {
    /// Creates a normal initializer.
    ///
    /// **Errors**
    ///
    /// `stddev` is negative or not finite.
    pub fn new(mean: f32, stddev: f32) -> Result<Self> {
        ensure!(
            stddev.is_finite() && stddev >= 0.,
            "RandomNormal: invalid stddev {stddev}"
        );
        Ok(Self { mean, stddev })
    }
}

impl Initializer for RandomNormal {
    fn init(&self, shape: &[usize], rng: &mut dyn RngCore) -> Result<ArcTensorD> {
        sample(shape, || {
            let z: f32 = StandardNormal.sample(&mut *rng);
            self.mean + self.stddev * z
        })
    }
}

/// How the number of units is computed from the kernel shape.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FanMode {
    /// Number of input units.
    #[default]
    FanIn,
    /// Number of output units.
    FanOut,
    /// Average of input and output units.
    FanAvg,
}

/// Distribution of [`VarianceScaling`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Distribution {
    /// Normal truncated to 2 standard deviations, rescaled to the target variance.
    #[default]
    TruncatedNormal,
    /// Normal.
    UntruncatedNormal,
    /// Uniform in `[-limit, limit)` with `limit = sqrt(3 * scale / n)`.
    Uniform,
}

/// `(fan_in, fan_out)` of a kernel.
///
/// Convolution kernels are HWIO, the leading dims form the receptive field.
pub fn compute_fans(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [inputs, outputs] => (*inputs, *outputs),
        [receptive @ .., inputs, outputs] => {
            let receptive: usize = receptive.iter().product();
            (inputs * receptive, outputs * receptive)
        }
    }
}

/// Scales the variance of the distribution to the number of units.
///
/// The variance is `scale / n`, where `n` is determined by the [`FanMode`].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VarianceScaling {
    scale: f32,
    mode: FanMode,
    distribution: Distribution,
}

impl VarianceScaling {
    /// Creates a variance scaling initializer.
    ///
    /// **Errors**
    ///
    /// `scale` is not positive.
    pub fn new(scale: f32, mode: FanMode, distribution: Distribution) -> Result<Self> {
        ensure!(scale > 0., "VarianceScaling: scale must be positive, found {scale}");
        Ok(Self {
            scale,
            mode,
            distribution,
        })
    }
    /// The scale.
    pub fn scale(&self) -> f32 {
        self.scale
    }
    /// The fan mode.
    pub fn mode(&self) -> FanMode {
        self.mode
    }
    /// The distribution.
    pub fn distribution(&self) -> Distribution {
        self.distribution
    }
}

impl Initializer for VarianceScaling {
    fn init(&self, shape: &[usize], rng: &mut dyn RngCore) -> Result<ArcTensorD> {
        let (fan_in, fan_out) = compute_fans(shape);
        let n = match self.mode {
            FanMode::FanIn => fan_in as f32,
            FanMode::FanOut => fan_out as f32,
            FanMode::FanAvg => (fan_in + fan_out) as f32 / 2.,
        };
        let variance = self.scale / n.max(1.);
        match self.distribution {
            Distribution::TruncatedNormal => {
                let stddev = variance.sqrt() / TRUNCATED_NORMAL_STDDEV;
                sample(shape, || loop {
                    let z: f32 = StandardNormal.sample(&mut *rng);
                    if z.abs() <= 2. {
                        break z * stddev;
                    }
                })
            }
            Distribution::UntruncatedNormal => {
                let stddev = variance.sqrt();
                sample(shape, || {
                    let z: f32 = StandardNormal.sample(&mut *rng);
                    z * stddev
                })
            }
            Distribution::Uniform => {
                let limit = (3. * variance).sqrt();
                ensure!(
                    limit.is_finite() && limit > 0.,
                    "VarianceScaling: invalid uniform limit {limit}"
                );
                let uniform = Uniform::new(-limit, limit);
                sample(shape, || uniform.sample(&mut *rng))
            }
        }
    }
}

/// Kaiming parameters expressed as a variance scaling factor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KaimingFactor {
    /// `2 / (1 + a²)`
    pub factor: f32,
    /// Always [`FanMode::FanIn`].
    pub mode: FanMode,
    /// Whether to draw from a uniform distribution.
    pub uniform: bool,
}

impl KaimingFactor {
    /// The [`VarianceScaling`] configured by the factor.
    pub fn initializer(&self) -> VarianceScaling {
        VarianceScaling {
            scale: self.factor,
            mode: self.mode,
            distribution: if self.uniform {
                Distribution::Uniform
            } else {
                Distribution::TruncatedNormal
            },
        }
    }
}

/// The variance scaling factor of PyTorch's Kaiming initialization with negative slope `a`.
pub fn pytorch_kaiming_weight_factor(a: f32, uniform: bool) -> KaimingFactor {
    KaimingFactor {
        factor: 2. / (1. + a * a),
        mode: FanMode::FanIn,
        uniform,
    }
}

/// The default weight initializer, Kaiming with `a = 0` and a truncated normal.
pub fn default_initializer() -> VarianceScaling {
    pytorch_kaiming_weight_factor(0., false).initializer()
}
