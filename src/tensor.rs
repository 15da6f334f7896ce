//! Tensors are shared, reference counted [`ndarray`] arrays of `f32`.
//!
//! Image tensors are channel last: `[batch, height, width, channels]`.
use ndarray::{ArcArray, Array, Dimension, Ix0, Ix1, Ix2, Ix3, Ix4, IxDyn};

/// Owned tensor.
pub type Tensor<D> = Array<f32, D>;
/// Owned tensor with 1 element.
pub type Tensor0 = Tensor<Ix0>;
/// Owned tensor with 1 dimension.
pub type Tensor1 = Tensor<Ix1>;
/// Owned tensor with 2 dimensions.
pub type Tensor2 = Tensor<Ix2>;
/// Owned tensor with 4 dimensions.
pub type Tensor4 = Tensor<Ix4>;
/// Owned tensor with dynamic dimensions.
pub type TensorD = Tensor<IxDyn>;

/// Shared tensor.
///
/// Cloning is cheap, mutation copies the data if it is not exclusive.
pub type ArcTensor<D> = ArcArray<f32, D>;
/// Shared tensor with 1 element.
pub type ArcTensor0 = ArcTensor<Ix0>;
/// Shared tensor with 1 dimension.
pub type ArcTensor1 = ArcTensor<Ix1>;
/// Shared tensor with 2 dimensions.
pub type ArcTensor2 = ArcTensor<Ix2>;
/// Shared tensor with 3 dimensions.
pub type ArcTensor3 = ArcTensor<Ix3>;
/// Shared tensor with 4 dimensions.
pub type ArcTensor4 = ArcTensor<Ix4>;
/// Shared tensor with dynamic dimensions.
pub type ArcTensorD = ArcTensor<IxDyn>;

/// The 2 dimensional `[batch, features]` shape of `shape`.
///
/// A scalar is flattened to `[1, 1]`.
pub(crate) fn flatten(shape: &[usize]) -> [usize; 2] {
    match shape {
        [] => [1, 1],
        [batch, rest @ ..] => [*batch, rest.iter().product()],
    }
}

/// Converts to standard (row major) layout, copying only if necessary.
pub(crate) fn into_standard_layout<D: Dimension>(tensor: ArcTensor<D>) -> ArcTensor<D> {
    if tensor.is_standard_layout() {
        tensor
    } else {
        tensor.as_standard_layout().to_shared()
    }
}
