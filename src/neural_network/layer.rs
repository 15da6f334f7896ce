/*!
Layers of MUNIT style networks.

Every function takes the [`GraphBuilder`] explicitly. Layers with parameters open a scope
named by their `scope` argument, so a residual block called `resblock_0` owns
`resblock_0/res1/conv/kernel`, `resblock_0/res1/instance_norm/gamma` and so on.

# Example
```
# use anyhow::Result;
# fn main() -> Result<()> {
use munit_nn::neural_network::{
    autograd::Variable4,
    graph::{GraphBuilder, GraphOptions},
    layer::{conv, relu, resblock, ConvOptions, PadType},
};
use ndarray::Array4;

let mut graph = GraphBuilder::new(GraphOptions::default().with_seed(0));
let x = Variable4::from(Array4::<f32>::zeros([1, 16, 16, 3]));
let y = graph.scope("encoder", |graph| {
    let x = conv(
        graph,
        &x,
        &ConvOptions::new(8)
            .with_kernel(7)
            .with_stride(1)
            .with_pad(3)
            .with_pad_type(PadType::Reflect),
        "conv_0",
    )?;
    resblock(graph, &relu(&x), 8, true, "resblock_0")
})?;
assert_eq!(y.shape(), &[1, 16, 16, 8]);
# Ok(())
# }
```
*/
use super::{
    autograd::{Variable, Variable2, Variable4},
    graph::{GraphBuilder, Role},
    init::{default_initializer, Constant, Distribution, FanMode, Initializer, RandomNormal, VarianceScaling},
};
use crate::error::ShapeMismatch;
use anyhow::{ensure, Result};
use ndarray::{linalg::Dot, Dimension};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

mod conv_direct;
use conv_direct::{conv2_direct, pad2};

mod pool;
use pool::{avg_pool2_same, upsample_nearest};

/// Epsilon of [`instance_norm`].
pub const INSTANCE_NORM_EPSILON: f32 = 1e-5;
/// Default epsilon of [`adaptive_instance_norm`].
pub const DEFAULT_ADAIN_EPSILON: f32 = 1e-5;
/// Epsilon of [`layer_norm`].
pub const LAYER_NORM_EPSILON: f32 = 1e-12;
/// Default negative slope of [`lrelu`], matching PyTorch.
pub const DEFAULT_LRELU_ALPHA: f32 = 0.01;
/// Standard deviation of discriminator convolution kernels.
pub const DISCRIMINATOR_STDDEV: f32 = 0.02;

/// How [`conv`] fills padding.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum PadType {
    /// Zeros.
    #[default]
    Zero,
    /// Mirrors the input, excluding the edge.
    Reflect,
}

/// Options for [`conv`].
///
/// Defaults:
/// - kernel: 4
/// - stride: 2
/// - pad: 0
/// - pad_type: [`PadType::Zero`]
/// - use_bias: true
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvOptions {
    /// Output channels.
    pub channels: usize,
    /// Height and width of the filter.
    pub kernel: usize,
    /// Step of the filter.
    pub stride: usize,
    /// Requested padding per side, see [`conv_padding`].
    pub pad: usize,
    /// Padding mode.
    pub pad_type: PadType,
    /// Whether to add a learned bias.
    pub use_bias: bool,
}

impl ConvOptions {
    /// Options for `channels` outputs with the defaults.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            kernel: 4,
            stride: 2,
            pad: 0,
            pad_type: PadType::Zero,
            use_bias: true,
        }
    }
    /// Sets the filter size.
    pub fn with_kernel(mut self, kernel: usize) -> Self {
        self.kernel = kernel;
        self
    }
    /// Sets the stride.
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }
    /// Sets the padding.
    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad = pad;
        self
    }
    /// Sets the padding mode.
    pub fn with_pad_type(mut self, pad_type: PadType) -> Self {
        self.pad_type = pad_type;
        self
    }
    /// Adds / removes the bias.
    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }
}

/// `[before, after]` padding of an axis of length `h`.
///
/// If `h` is divisible by `stride` the total is `2 * pad`, otherwise it is
/// `max(kernel - h % stride, 0)`. The extra cell of an odd total goes after.
pub fn conv_padding(h: usize, stride: usize, kernel: usize, pad: usize) -> [usize; 2] {
    let total = if h % stride == 0 {
        pad * 2
    } else {
        kernel.saturating_sub(h % stride)
    };
    let before = total / 2;
    [before, total - before]
}

fn conv_initializer(role: Role) -> Result<Box<dyn Initializer>> {
    Ok(match role {
        Role::Discriminator => Box::new(RandomNormal::new(0., DISCRIMINATOR_STDDEV)?),
        Role::Generator => Box::new(VarianceScaling::new(
            2.,
            FanMode::FanIn,
            Distribution::TruncatedNormal,
        )?),
    })
}

/// 2D convolution of an NHWC `x`.
///
/// Creates `kernel` `[k, k, inputs, channels]` and optionally `bias` `[channels]` in `scope`.
/// The kernel is drawn according to the [`Role`] of the graph and registered for L2
/// regularization.
///
/// If `pad > 0`, `x` is padded by [`conv_padding`] computed from its height, on both axes.
///
/// **Errors**
///
/// - The stride or kernel is 0.
/// - The padded input is smaller than the kernel.
/// - Reflect padding is not smaller than the input.
/// - The input channels differ from a previous call in `scope`.
pub fn conv(graph: &mut GraphBuilder, x: &Variable4, options: &ConvOptions, scope: &str) -> Result<Variable4> {
    let ConvOptions {
        channels,
        kernel,
        stride,
        pad,
        pad_type,
        use_bias,
    } = *options;
    ensure!(kernel > 0 && stride > 0, "conv: kernel and stride must be positive");
    graph.scope(scope, |graph| {
        let (_bs, h, _w, inputs) = x.dim();
        let x = if pad > 0 {
            let padding = conv_padding(h, stride, kernel, pad);
            pad2(x, padding, padding, pad_type)?
        } else {
            x.clone()
        };
        let init = conv_initializer(graph.role())?;
        let weight = graph.parameter("kernel", [kernel, kernel, inputs, channels], init.as_ref())?;
        graph.regularize("kernel")?;
        let y = conv2_direct(&x, &weight.to_variable(), stride)?;
        if use_bias {
            let bias = graph.parameter("bias", [channels], &Constant(0.))?;
            y.add(&bias.to_variable())
        } else {
            Ok(y)
        }
    })
}

/// Flattens `x` into `[batch, features]`.
pub fn flatten<D: Dimension + 'static>(x: &Variable<D>) -> Result<Variable2> {
    x.clone().flatten()
}

/// Dense layer, `flatten(x) · kernel + bias`.
///
/// Creates `kernel` `[features, units]` with the default Kaiming initializer (regardless of the
/// [`Role`]) and optionally `bias` `[units]` in `scope`. The kernel is registered for L2
/// regularization.
pub fn fully_connected<D: Dimension + 'static>(
    graph: &mut GraphBuilder,
    x: &Variable<D>,
    units: usize,
    use_bias: bool,
    scope: &str,
) -> Result<Variable2> {
    graph.scope(scope, |graph| {
        let x = flatten(x)?;
        let features = x.dim().1;
        let weight = graph.parameter("kernel", [features, units], &default_initializer())?;
        graph.regularize("kernel")?;
        let y = x.dot(&weight.to_variable())?;
        if use_bias {
            let bias = graph.parameter("bias", [units], &Constant(0.))?;
            y.add(&bias.to_variable())
        } else {
            Ok(y)
        }
    })
}

/// `(x - mean) / sqrt(var + epsilon)` with statistics over `axes`.
fn standardize<D: Dimension + 'static>(x: &Variable<D>, axes: &[usize], epsilon: f32) -> Result<Variable<D>> {
    let centered = x.sub(&x.mean_axes(axes)?)?;
    let std = centered.square().mean_axes(axes)?.add_scalar(epsilon).sqrt();
    centered.div(&std)
}

/// Instance normalization with learned per channel `gamma` and `beta`.
///
/// Statistics are computed over height and width for each sample and channel.
pub fn instance_norm(graph: &mut GraphBuilder, x: &Variable4, scope: &str) -> Result<Variable4> {
    graph.scope(scope, |graph| {
        let channels = x.dim().3;
        let gamma = graph.parameter("gamma", [channels], &Constant(1.))?;
        let beta = graph.parameter("beta", [channels], &Constant(0.))?;
        standardize(x, &[1, 2], INSTANCE_NORM_EPSILON)?
            .mul(&gamma.to_variable())?
            .add(&beta.to_variable())
    })
}

/// Adaptive instance normalization.
///
/// Normalizes `content` like [`instance_norm`], then applies the externally computed
/// `gamma * x + beta`. `gamma` and `beta` are broadcast into `content`, so they may be
/// `[channels]` or, per sample, `[batch, 1, 1, channels]`.
pub fn adaptive_instance_norm<D1, D2>(
    content: &Variable4,
    gamma: &Variable<D1>,
    beta: &Variable<D2>,
    epsilon: f32,
) -> Result<Variable4>
where
    D1: Dimension + 'static,
    D2: Dimension + 'static,
{
    standardize(content, &[1, 2], epsilon)?.mul(gamma)?.add(beta)
}

/// Layer normalization over the last axis with learned `gamma` and `beta`.
pub fn layer_norm<D: Dimension + 'static>(graph: &mut GraphBuilder, x: &Variable<D>, scope: &str) -> Result<Variable<D>> {
    let ndim = x.shape().len();
    ensure!(ndim > 0, "layer_norm: scalar input");
    graph.scope(scope, |graph| {
        let features = x.shape()[ndim - 1];
        let gamma = graph.parameter("gamma", [features], &Constant(1.))?;
        let beta = graph.parameter("beta", [features], &Constant(0.))?;
        standardize(x, &[ndim - 1], LAYER_NORM_EPSILON)?
            .mul(&gamma.to_variable())?
            .add(&beta.to_variable())
    })
}

fn resblock_conv(channels: usize, use_bias: bool) -> ConvOptions {
    ConvOptions::new(channels)
        .with_kernel(3)
        .with_stride(1)
        .with_pad(1)
        .with_pad_type(PadType::Reflect)
        .with_bias(use_bias)
}

fn ensure_channels(op: &'static str, x: &Variable4, channels: usize) -> Result<()> {
    let (bs, h, w, c) = x.dim();
    ensure!(
        c == channels,
        ShapeMismatch::new(op, &[bs, h, w, c], &[bs, h, w, channels])
    );
    Ok(())
}

/// Residual block, `x + norm(conv(relu(norm(conv(x)))))`.
///
/// The convolutions are 3x3 with stride 1 and reflect padding, in `scope/res1` and
/// `scope/res2`.
///
/// **Errors**
///
/// `channels` is not the number of channels of `x`.
pub fn resblock(
    graph: &mut GraphBuilder,
    x_init: &Variable4,
    channels: usize,
    use_bias: bool,
    scope: &str,
) -> Result<Variable4> {
    ensure_channels("resblock", x_init, channels)?;
    let options = resblock_conv(channels, use_bias);
    graph.scope(scope, |graph| {
        let x = graph.scope("res1", |graph| {
            let x = conv(graph, x_init, &options, "conv")?;
            let x = instance_norm(graph, &x, "instance_norm")?;
            Ok(relu(&x))
        })?;
        let x = graph.scope("res2", |graph| {
            let x = conv(graph, &x, &options, "conv")?;
            instance_norm(graph, &x, "instance_norm")
        })?;
        x.add(x_init)
    })
}

/// Residual block with [`adaptive_instance_norm`].
///
/// Like [`resblock`], with `(gamma1, beta1)` applied after the first convolution and
/// `(gamma2, beta2)` after the second.
#[allow(clippy::too_many_arguments)]
pub fn adaptive_resblock<D: Dimension + 'static>(
    graph: &mut GraphBuilder,
    x_init: &Variable4,
    channels: usize,
    gamma1: &Variable<D>,
    beta1: &Variable<D>,
    gamma2: &Variable<D>,
    beta2: &Variable<D>,
    use_bias: bool,
    scope: &str,
) -> Result<Variable4> {
    ensure_channels("adaptive_resblock", x_init, channels)?;
    let options = resblock_conv(channels, use_bias);
    graph.scope(scope, |graph| {
        let x = graph.scope("res1", |graph| {
            let x = conv(graph, x_init, &options, "conv")?;
            let x = adaptive_instance_norm(&x, gamma1, beta1, DEFAULT_ADAIN_EPSILON)?;
            Ok(relu(&x))
        })?;
        let x = graph.scope("res2", |graph| {
            let x = conv(graph, &x, &options, "conv")?;
            adaptive_instance_norm(&x, gamma2, beta2, DEFAULT_ADAIN_EPSILON)
        })?;
        x.add(x_init)
    })
}

/// 3x3 average pooling with stride 2 and SAME padding, the output is `ceil(h / 2)` by
/// `ceil(w / 2)`.
pub fn down_sample(x: &Variable4) -> Result<Variable4> {
    avg_pool2_same(x, 3, 2)
}

/// Nearest neighbor upsampling to `[h * scale_factor, w * scale_factor]`.
pub fn up_sample(x: &Variable4, scale_factor: usize) -> Result<Variable4> {
    upsample_nearest(x, scale_factor)
}

/// Global average pooling to `[batch, 1, 1, channels]`.
pub fn adaptive_avg_pooling(x: &Variable4) -> Result<Variable4> {
    x.mean_axes(&[1, 2])
}

/// `max(x, 0)`
pub fn relu<D: Dimension + 'static>(x: &Variable<D>) -> Variable<D> {
    x.relu()
}

/// `x` if positive, else `alpha * x`.
///
/// See [`DEFAULT_LRELU_ALPHA`].
pub fn lrelu<D: Dimension + 'static>(x: &Variable<D>, alpha: f32) -> Variable<D> {
    x.leaky_relu(alpha)
}

/// Hyperbolic tangent.
pub fn tanh<D: Dimension + 'static>(x: &Variable<D>) -> Variable<D> {
    x.tanh()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural_network::graph::GraphOptions;
    use approx::assert_relative_eq;
    use ndarray::{Array, Array1, Array2, Array3, Array4, Axis};

    fn graph() -> GraphBuilder {
        GraphBuilder::new(GraphOptions::default().with_seed(7))
    }

    fn input(shape: [usize; 4]) -> Variable4 {
        let n = shape.iter().product::<usize>();
        Array::from_shape_vec(shape, (0..n).map(|i| ((i * 7 % 11) as f32 - 5.) / 3.).collect())
            .unwrap()
            .into()
    }

    #[test]
    fn padding() {
        assert_eq!(conv_padding(10, 2, 3, 1), [1, 1]);
        assert_eq!(conv_padding(7, 2, 4, 1), [1, 2]);
        assert_eq!(conv_padding(7, 1, 7, 3), [3, 3]);
        assert_eq!(conv_padding(5, 4, 3, 1), [1, 1]);
        assert_eq!(conv_padding(3, 4, 2, 1), [0, 0]);
    }

    #[test]
    fn conv_shapes() -> Result<()> {
        let mut graph = graph();
        let x = input([2, 8, 8, 3]);
        let y = conv(&mut graph, &x, &ConvOptions::new(5), "conv")?;
        assert_eq!(y.shape(), &[2, 3, 3, 5]);
        let options = ConvOptions::new(6).with_kernel(4).with_stride(2).with_pad(1);
        let y = conv(&mut graph, &x, &options, "down")?;
        assert_eq!(y.shape(), &[2, 4, 4, 6]);
        let options = ConvOptions::new(4)
            .with_kernel(7)
            .with_stride(1)
            .with_pad(3)
            .with_pad_type(PadType::Reflect)
            .with_bias(false);
        let y = conv(&mut graph, &x, &options, "same")?;
        assert_eq!(y.shape(), &[2, 8, 8, 4]);
        assert!(graph.get("same/bias").is_none());
        assert_eq!(graph.get("same/kernel").unwrap().shape(), &[7, 7, 3, 4]);
        Ok(())
    }

    #[test]
    fn conv_initializer_by_role() -> Result<()> {
        let mut graph = graph();
        let x = input([1, 16, 16, 32]);
        let options = ConvOptions::new(64).with_kernel(3).with_stride(1);
        conv(&mut graph, &x, &options, "generator")?;
        graph.with_role(Role::Discriminator, |graph| {
            conv(graph, &x, &options, "discriminator").map(|_| ())
        })?;
        let stddev = |path: &str| {
            let w = graph.get(path).unwrap().value();
            w.mapv(|x| x * x).mean().unwrap().sqrt()
        };
        assert_relative_eq!(stddev("discriminator/kernel"), 0.02, max_relative = 0.1);
        assert_relative_eq!(
            stddev("generator/kernel"),
            (2f32 / (9. * 32.)).sqrt(),
            max_relative = 0.1
        );
        Ok(())
    }

    #[test]
    fn conv_reuses_scope() -> Result<()> {
        let mut graph = graph();
        let x = input([1, 6, 6, 2]);
        let options = ConvOptions::new(3).with_kernel(3).with_stride(1);
        let a = conv(&mut graph, &x, &options, "conv")?;
        let b = conv(&mut graph, &x, &options, "conv")?;
        assert_eq!(a.value(), b.value());
        assert_eq!(graph.parameters_len(), 2);
        assert!(conv(&mut graph, &input([1, 6, 6, 4]), &options, "conv").is_err());
        Ok(())
    }

    #[test]
    fn fully_connected_flattens() -> Result<()> {
        let mut graph = graph();
        let x = input([3, 2, 2, 4]);
        let y = fully_connected(&mut graph, &x, 8, true, "fc")?;
        assert_eq!(y.shape(), &[3, 8]);
        assert_eq!(graph.get("fc/kernel").unwrap().shape(), &[16, 8]);
        assert_eq!(graph.regularized().count(), 1);
        Ok(())
    }

    #[test]
    fn fully_connected_kaiming_for_discriminator() -> Result<()> {
        let mut graph = graph();
        let x = Variable::from(Array2::<f32>::zeros([1, 512]));
        graph.with_role(Role::Discriminator, |graph| {
            fully_connected(graph, &x, 256, false, "fc").map(|_| ())
        })?;
        let w = graph.get("fc/kernel").unwrap().value();
        let stddev = w.mapv(|x| x * x).mean().unwrap().sqrt();
        assert_relative_eq!(stddev, (2f32 / 512.).sqrt(), max_relative = 0.05);
        Ok(())
    }

    #[test]
    fn instance_norm_standardizes() -> Result<()> {
        let mut graph = graph();
        let x = input([2, 5, 5, 3]);
        let y = instance_norm(&mut graph, &x, "instance_norm")?;
        assert_eq!(y.shape(), x.shape());
        let mean = y.value().mean_axis(Axis(1)).unwrap().mean_axis(Axis(1)).unwrap();
        assert_relative_eq!(mean, Array2::<f32>::zeros([2, 3]), epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn adaptive_instance_norm_identity_affine() -> Result<()> {
        let x = input([2, 4, 4, 3]);
        let gamma = Variable::from(Array1::<f32>::ones(3));
        let beta = Variable::from(Array1::<f32>::zeros(3));
        let y = adaptive_instance_norm(&x, &gamma, &beta, DEFAULT_ADAIN_EPSILON)?;
        let mean = y.mean_axes(&[1, 2])?;
        let var = y.square().mean_axes(&[1, 2])?;
        assert_relative_eq!(*mean.value(), Array4::<f32>::zeros([2, 1, 1, 3]), epsilon = 1e-5);
        assert_relative_eq!(*var.value(), Array4::<f32>::ones([2, 1, 1, 3]), epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn adaptive_instance_norm_per_sample_affine() -> Result<()> {
        let x = input([2, 3, 3, 2]);
        let gamma = Variable::from(Array4::from_elem([2, 1, 1, 2], 2f32));
        let beta = Variable::from(Array::from_shape_vec([2, 1, 1, 2], vec![1f32, 2., 3., 4.])?);
        let y = adaptive_instance_norm(&x, &gamma, &beta, DEFAULT_ADAIN_EPSILON)?;
        let mean = y.mean_axes(&[1, 2])?;
        assert_relative_eq!(mean.value()[[1, 0, 0, 1]], 4., epsilon = 1e-4);
        let bad = Variable::from(Array1::<f32>::ones(5));
        assert!(adaptive_instance_norm(&x, &bad, &beta, DEFAULT_ADAIN_EPSILON).is_err());
        Ok(())
    }

    #[test]
    fn layer_norm_last_axis() -> Result<()> {
        let mut graph = graph();
        let x = input([2, 3, 3, 6]);
        let y = layer_norm(&mut graph, &x, "layer_norm")?;
        let mean = y.value().mean_axis(Axis(3)).unwrap();
        assert_relative_eq!(mean, Array3::<f32>::zeros([2, 3, 3]), epsilon = 1e-5);
        assert_eq!(graph.get("layer_norm/gamma").unwrap().shape(), &[6]);
        Ok(())
    }

    #[test]
    fn resblock_preserves_shape() -> Result<()> {
        let mut graph = graph();
        let x = input([1, 6, 6, 4]);
        let y = resblock(&mut graph, &x, 4, true, "resblock")?;
        assert_eq!(y.shape(), x.shape());
        let paths: Vec<_> = graph.parameters().map(|(path, _)| path.to_string()).collect();
        assert!(paths.contains(&"resblock/res1/conv/kernel".to_string()));
        assert!(paths.contains(&"resblock/res2/instance_norm/beta".to_string()));
        assert_eq!(paths.len(), 8);
        let error = resblock(&mut graph, &x, 5, true, "resblock_5").unwrap_err();
        assert!(error.downcast_ref::<ShapeMismatch>().is_some());
        Ok(())
    }

    #[test]
    fn adaptive_resblock_gradients() -> Result<()> {
        let mut graph = GraphBuilder::new(GraphOptions::default().with_seed(3).with_training(true));
        let x = input([2, 4, 4, 3]);
        let style = |v: f32| Variable::builder().node().build(Array4::from_elem([2, 1, 1, 3], v).into_shared());
        let (gamma1, beta1, gamma2, beta2) = (style(1.), style(0.), style(1.), style(0.));
        let y = adaptive_resblock(&mut graph, &x, 3, &gamma1, &beta1, &gamma2, &beta2, false, "adaptive_resblock")?;
        assert_eq!(y.shape(), x.shape());
        assert_eq!(graph.parameters_len(), 2);
        y.square().mean().backward()?;
        assert_eq!(gamma1.grad().unwrap().shape(), &[2, 1, 1, 3]);
        assert!(beta2.grad().is_some());
        for (path, parameter) in graph.parameters() {
            assert!(parameter.grad().is_some(), "{path}");
        }
        Ok(())
    }

    #[test]
    fn sampling_shapes() -> Result<()> {
        let x = input([2, 5, 7, 3]);
        assert_eq!(down_sample(&x)?.shape(), &[2, 3, 4, 3]);
        assert_eq!(up_sample(&x, 2)?.shape(), &[2, 10, 14, 3]);
        let gap = adaptive_avg_pooling(&x)?;
        assert_eq!(gap.shape(), &[2, 1, 1, 3]);
        assert_relative_eq!(
            gap.value()[[1, 0, 0, 2]],
            x.value().index_axis(Axis(0), 1).index_axis(Axis(2), 2).mean().unwrap(),
            epsilon = 1e-5
        );
        Ok(())
    }

    #[test]
    fn activations() {
        let x = Variable::from(Array1::from(vec![-2f32, 0., 3.]));
        assert_eq!(relu(&x).value().to_vec(), vec![0., 0., 3.]);
        assert_eq!(lrelu(&x, DEFAULT_LRELU_ALPHA).value().to_vec(), vec![-0.02, 0., 3.]);
        assert_relative_eq!(tanh(&x).value()[2], 3f32.tanh());
    }
}
