/*!
# munit-nn
Building blocks of MUNIT style image translation networks, on top of a small reverse mode
autograd for [`ndarray`].

Layers are plain functions that take a [`GraphBuilder`](neural_network::graph::GraphBuilder),
which owns the parameters of the model keyed by scope path, and return [`Variable`]s.
Losses for adversarial, reconstruction and regularization terms are in
[`criterion`](neural_network::criterion).

Images are channel last, `[batch, height, width, channels]`, and kernels are
`[height, width, inputs, outputs]`.

# Features
- serde: Serialize / Deserialize options and parameters.

[`Variable`]: neural_network::autograd::Variable
*/
#![warn(missing_docs)]

/// Errors.
pub mod error;
/// Neural networks.
pub mod neural_network;
/// Tensors.
pub mod tensor;
