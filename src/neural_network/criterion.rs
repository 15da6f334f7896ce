//! Losses.
use super::{
    autograd::{Variable, Variable0},
    graph::GraphBuilder,
};
use crate::error::{ParseGanLossError, ShapeMismatch};
use anyhow::{ensure, Result};
use ndarray::Dimension;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Adversarial loss.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "lowercase"))]
pub enum GanLoss {
    /// Least squares, `(x - label)²`.
    #[default]
    Lsgan,
    /// Sigmoid cross entropy on logits.
    Gan,
}

impl GanLoss {
    /// The loss of `logits` against the constant `label`, averaged over all elements.
    fn loss<D: Dimension + 'static>(self, logits: &Variable<D>, label: f32) -> Variable0 {
        match self {
            Self::Lsgan => logits.add_scalar(-label).square().mean(),
            Self::Gan => logits.sigmoid_cross_entropy_with_logits(label).mean(),
        }
    }
}

impl FromStr for GanLoss {
    type Err = ParseGanLossError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lsgan" => Ok(Self::Lsgan),
            "gan" => Ok(Self::Gan),
            _ => Err(ParseGanLossError(s.to_string())),
        }
    }
}

impl fmt::Display for GanLoss {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Lsgan => f.write_str("lsgan"),
            Self::Gan => f.write_str("gan"),
        }
    }
}

/// Sums `losses`, 0 if empty.
fn sum_losses(losses: impl IntoIterator<Item = Result<Variable0>>) -> Result<Variable0> {
    let mut total: Option<Variable0> = None;
    for loss in losses {
        let loss = loss?;
        total = Some(match total {
            Some(total) => total.add(&loss)?,
            None => loss,
        });
    }
    Ok(total.unwrap_or_else(Variable0::zero))
}

/// Discriminator loss over multi scale outputs.
///
/// For each scale, the real logits are pushed towards 1 and the fake logits towards 0. The
/// per scale losses are summed.
///
/// **Errors**
///
/// `real` and `fake` have different lengths.
pub fn discriminator_loss<D: Dimension + 'static>(
    kind: GanLoss,
    real: &[Variable<D>],
    fake: &[Variable<D>],
) -> Result<Variable0> {
    ensure!(
        real.len() == fake.len(),
        ShapeMismatch::new("discriminator_loss", &[real.len()], &[fake.len()])
    );
    sum_losses(
        real.iter()
            .zip(fake)
            .map(|(real, fake)| kind.loss(real, 1.).add(&kind.loss(fake, 0.))),
    )
}

/// Generator loss over multi scale discriminator outputs of fakes.
///
/// The fake logits are pushed towards 1, the per scale losses are summed.
pub fn generator_loss<D: Dimension + 'static>(kind: GanLoss, fake: &[Variable<D>]) -> Result<Variable0> {
    sum_losses(fake.iter().map(|fake| Ok(kind.loss(fake, 1.))))
}

/// Mean absolute error.
///
/// **Errors**
///
/// The shapes differ.
pub fn l1_loss<D: Dimension + 'static>(x: &Variable<D>, y: &Variable<D>) -> Result<Variable0> {
    ensure!(
        x.shape() == y.shape(),
        ShapeMismatch::new("l1_loss", x.shape(), y.shape())
    );
    Ok(x.sub(y)?.abs().mean())
}

/// L2 regularization of the parameters registered in `graph` whose path contains `scope_name`.
///
/// Each kernel contributes `coefficient * Σ w²`. Returns 0 if nothing matches.
pub fn regularization_loss(graph: &GraphBuilder, scope_name: &str) -> Result<Variable0> {
    sum_losses(
        graph
            .regularized()
            .filter(|(path, _, _)| path.contains(scope_name))
            .map(|(path, parameter, coefficient)| {
                log::trace!("regularization_loss: {path} * {coefficient}");
                Ok(parameter.to_variable().square().sum().mul_scalar(coefficient))
            }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural_network::{graph::GraphOptions, init::Constant};
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array4, Ix4};

    fn constant(shape: [usize; 4], value: f32) -> Variable<Ix4> {
        Array4::from_elem(shape, value).into()
    }

    #[test]
    fn parse_gan_loss() {
        assert_eq!("lsgan".parse::<GanLoss>().unwrap(), GanLoss::Lsgan);
        assert_eq!("gan".parse::<GanLoss>().unwrap(), GanLoss::Gan);
        assert_eq!(GanLoss::Gan.to_string(), "gan");
        let error = "wgan".parse::<GanLoss>().unwrap_err();
        assert_eq!(error, ParseGanLossError("wgan".to_string()));
    }

    #[test]
    fn lsgan_discriminator() -> Result<()> {
        let real = [constant([1, 2, 2, 1], 0.), constant([1, 1, 1, 1], 0.)];
        let fake = [constant([1, 2, 2, 1], 0.), constant([1, 1, 1, 1], 0.)];
        let loss = discriminator_loss(GanLoss::Lsgan, &real[..1], &fake[..1])?;
        assert_relative_eq!(loss.item(), 1.);
        let loss = discriminator_loss(GanLoss::Lsgan, &real, &fake)?;
        assert_relative_eq!(loss.item(), 2.);
        let real = [constant([1, 2, 2, 1], 1.)];
        let loss = discriminator_loss(GanLoss::Lsgan, &real, &fake[..1])?;
        assert_relative_eq!(loss.item(), 0.);
        assert!(discriminator_loss(GanLoss::Lsgan, &real, &fake).is_err());
        Ok(())
    }

    #[test]
    fn gan_discriminator_is_stable() -> Result<()> {
        let real = [constant([1, 2, 2, 1], 100.)];
        let fake = [constant([1, 2, 2, 1], -100.)];
        let loss = discriminator_loss(GanLoss::Gan, &real, &fake)?;
        assert!(loss.item().is_finite());
        assert_relative_eq!(loss.item(), 0., epsilon = 1e-6);
        let loss = discriminator_loss(GanLoss::Gan, &fake, &real)?;
        assert_relative_eq!(loss.item(), 200., max_relative = 1e-5);
        let zero = [constant([1, 1, 1, 1], 0.)];
        let loss = discriminator_loss(GanLoss::Gan, &zero, &zero)?;
        assert_relative_eq!(loss.item(), 2. * 2f32.ln(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn generator() -> Result<()> {
        let fake = [constant([2, 2, 2, 1], 0.), constant([2, 1, 1, 1], 1.)];
        assert_relative_eq!(generator_loss(GanLoss::Lsgan, &fake)?.item(), 1.);
        let fake = [constant([1, 1, 1, 1], 0.)];
        assert_relative_eq!(
            generator_loss(GanLoss::Gan, &fake)?.item(),
            2f32.ln(),
            epsilon = 1e-6
        );
        let empty: [Variable<Ix4>; 0] = [];
        assert_eq!(generator_loss(GanLoss::Gan, &empty)?.item(), 0.);
        Ok(())
    }

    #[test]
    fn generator_gradient() -> Result<()> {
        let fake = Variable::builder()
            .node()
            .build(Array4::<f32>::zeros([1, 1, 2, 1]).into_shared());
        generator_loss(GanLoss::Lsgan, &[fake.clone()])?.backward()?;
        // d/dx mean((x - 1)²) = 2 (x - 1) / n
        assert_eq!(fake.grad().unwrap().iter().copied().collect::<Vec<_>>(), vec![-1., -1.]);
        Ok(())
    }

    #[test]
    fn l1() -> Result<()> {
        let x = Variable::from(Array1::from(vec![1f32, -2., 3.]));
        let y = Variable::from(Array1::from(vec![0f32, 0., 3.]));
        assert_eq!(l1_loss(&x, &x)?.item(), 0.);
        assert_relative_eq!(l1_loss(&x, &y)?.item(), 1.);
        let z = Variable::from(Array1::<f32>::zeros(2));
        assert!(l1_loss(&x, &z).is_err());
        Ok(())
    }

    #[test]
    fn regularization_filters_by_scope() -> Result<()> {
        let mut graph = GraphBuilder::new(GraphOptions::default().with_weight_decay(0.5));
        graph.scope("generator_a", |graph| {
            graph.parameter("kernel", [2usize], &Constant(1.))?;
            graph.parameter("bias", [2usize], &Constant(5.))?;
            graph.regularize("kernel")
        })?;
        graph.scope("discriminator_a", |graph| {
            graph.parameter("kernel", [3usize], &Constant(2.))?;
            graph.regularize("kernel")
        })?;
        assert_relative_eq!(regularization_loss(&graph, "generator")?.item(), 1.);
        assert_relative_eq!(regularization_loss(&graph, "discriminator")?.item(), 6.);
        assert_relative_eq!(regularization_loss(&graph, "_a")?.item(), 7.);
        assert_eq!(regularization_loss(&graph, "encoder")?.item(), 0.);
        Ok(())
    }
}
