use thiserror::Error;

/// An unrecognized adversarial loss name.
///
/// Returned when parsing a [`GanLoss`](crate::neural_network::criterion::GanLoss) from a string.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("unknown GAN loss {0:?}, expected \"lsgan\" or \"gan\"")]
pub struct ParseGanLossError(pub String);

/// Two shapes that were required to agree did not.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{op}: shape {lhs:?} is not compatible with {rhs:?}")]
pub struct ShapeMismatch {
    /// The operation that was attempted.
    pub op: &'static str,
    /// The shape of the left-hand (or target) operand.
    pub lhs: Vec<usize>,
    /// The shape of the right-hand (or offending) operand.
    pub rhs: Vec<usize>,
}

impl ShapeMismatch {
    pub(crate) fn new(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Self {
        Self {
            op,
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        }
    }
}
