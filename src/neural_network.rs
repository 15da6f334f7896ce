/*!
Neural networks.

- [`autograd`]: variables, parameters and the backward pass.
- [`init`]: weight initializers.
- [`graph`]: the [`GraphBuilder`](graph::GraphBuilder) that scopes and owns parameters.
- [`layer`]: convolution, normalization, residual and sampling layers.
- [`criterion`]: losses.
*/

/// Autograd.
pub mod autograd;
pub mod criterion;
pub mod graph;
pub mod init;
pub mod layer;
