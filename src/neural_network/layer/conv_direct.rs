use super::PadType;
use crate::{
    error::ShapeMismatch,
    neural_network::autograd::{Variable, Variable4},
    tensor::{into_standard_layout, ArcTensor4},
};
use anyhow::{bail, ensure, Result};
use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, Axis};
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};

/// Output extent of a VALID convolution / pooling window.
fn output_len(input: usize, kernel: usize, stride: usize) -> usize {
    (input - kernel) / stride + 1
}

/// Gathers `[batch, oh * ow, fh * fw * ic]` patches from `[batch, ih, iw, ic]`.
///
/// The patch axis is ordered `(fh, fw, ic)` to match an HWIO kernel flattened to
/// `[fh * fw * ic, oc]`.
fn im2col(x: ArrayView4<f32>, [fh, fw]: [usize; 2], stride: usize, [oh, ow]: [usize; 2]) -> Array3<f32> {
    let (bs, _ih, _iw, ic) = x.dim();
    let mut patches = Array3::zeros([bs, oh * ow, fh * fw * ic]);
    patches
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(x.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut patches, x)| {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut row = patches.row_mut(oy * ow + ox);
                    let mut col = 0;
                    for ky in 0..fh {
                        for kx in 0..fw {
                            let pixel = x.slice(s![oy * stride + ky, ox * stride + kx, ..]);
                            row.slice_mut(s![col..col + ic]).assign(&pixel);
                            col += ic;
                        }
                    }
                }
            }
        });
    patches
}

/// Scatters patch gradients back into `[batch, ih, iw, ic]`, summing overlaps.
fn col2im(
    patches: ArrayView3<f32>,
    [ih, iw, ic]: [usize; 3],
    [fh, fw]: [usize; 2],
    stride: usize,
    [oh, ow]: [usize; 2],
) -> Array4<f32> {
    let bs = patches.dim().0;
    let mut x = Array4::zeros([bs, ih, iw, ic]);
    x.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(patches.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut x, patches)| {
            for oy in 0..oh {
                for ox in 0..ow {
                    let row = patches.row(oy * ow + ox);
                    let mut col = 0;
                    for ky in 0..fh {
                        for kx in 0..fw {
                            let mut pixel =
                                x.slice_mut(s![oy * stride + ky, ox * stride + kx, ..]);
                            pixel += &row.slice(s![col..col + ic]);
                            col += ic;
                        }
                    }
                }
            }
        });
    x
}

/// 2D convolution of an NHWC `input` with an HWIO `weight`, without padding.
///
/// **Errors**
///
/// - The input channels do not match the weight.
/// - The filter is larger than the input.
/// - The stride is 0.
pub(super) fn conv2_direct(input: &Variable4, weight: &Variable4, stride: usize) -> Result<Variable4> {
    let (bs, ih, iw, ic) = input.dim();
    let (fh, fw, _ic, oc) = weight.dim();
    ensure!(stride > 0, "conv2: stride must be positive");
    ensure!(
        ic == _ic,
        ShapeMismatch::new("conv2", input.shape(), weight.shape())
    );
    if fh > ih || fw > iw {
        bail!(ShapeMismatch::new("conv2", input.shape(), weight.shape()));
    }
    let oh = output_len(ih, fh, stride);
    let ow = output_len(iw, fw, stride);
    let patches = im2col(input.value().view(), [fh, fw], stride, [oh, ow])
        .into_shape([bs * oh * ow, fh * fw * ic])?
        .into_shared();
    let weight_matrix = into_standard_layout(weight.value().clone()).into_shape([fh * fw * ic, oc])?;
    let output = patches
        .dot(&weight_matrix)
        .into_shape([bs, oh, ow, oc])?
        .into_shared();
    let mut builder = Variable::builder();
    if let Some(node) = input.node() {
        let weight_matrix = weight_matrix.clone();
        builder.edge(node, move |output_grad: ArcTensor4| {
            let output_grad = into_standard_layout(output_grad).into_shape([bs * oh * ow, oc])?;
            let patches_grad = output_grad
                .dot(&weight_matrix.t())
                .into_shape([bs, oh * ow, fh * fw * ic])?;
            Ok(col2im(patches_grad.view(), [ih, iw, ic], [fh, fw], stride, [oh, ow]).into_shared())
        });
    }
    if let Some(node) = weight.node() {
        builder.edge(node, move |output_grad: ArcTensor4| {
            let output_grad = into_standard_layout(output_grad).into_shape([bs * oh * ow, oc])?;
            Ok(patches
                .t()
                .dot(&output_grad)
                .into_shape([fh, fw, ic, oc])?
                .into_shared())
        });
    }
    Ok(builder.build(output))
}

/// For each padded position along an axis of length `len`, the source index, if any.
fn pad_indices(len: usize, [before, after]: [usize; 2], pad_type: PadType) -> Vec<Option<usize>> {
    (0..before + len + after)
        .map(|i| {
            let j = i as isize - before as isize;
            let last = len as isize - 1;
            match pad_type {
                _ if (0..=last).contains(&j) => Some(j as usize),
                PadType::Zero => None,
                PadType::Reflect if j < 0 => Some((-j) as usize),
                PadType::Reflect => Some((2 * last - j) as usize),
            }
        })
        .collect()
}

/// Pads the height and width of an NHWC `input`.
///
/// Reflect padding mirrors without repeating the edge, so each side must be smaller than the
/// padded axis.
pub(super) fn pad2(
    input: &Variable4,
    rows: [usize; 2],
    cols: [usize; 2],
    pad_type: PadType,
) -> Result<Variable4> {
    let (bs, ih, iw, ic) = input.dim();
    if pad_type == PadType::Reflect {
        ensure!(
            rows.iter().all(|p| *p < ih) && cols.iter().all(|p| *p < iw),
            "pad2: reflect padding {rows:?} x {cols:?} too large for {:?}",
            input.shape()
        );
    }
    let row_indices = pad_indices(ih, rows, pad_type);
    let col_indices = pad_indices(iw, cols, pad_type);
    let (oh, ow) = (row_indices.len(), col_indices.len());
    let mut output = Array4::<f32>::zeros([bs, oh, ow, ic]);
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(input.value().axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut y, x)| {
            for (oy, iy) in row_indices.iter().copied().enumerate() {
                for (ox, ix) in col_indices.iter().copied().enumerate() {
                    if let Some((iy, ix)) = iy.zip(ix) {
                        y.slice_mut(s![oy, ox, ..])
                            .assign(&x.slice(s![iy, ix, ..]));
                    }
                }
            }
        });
    let mut builder = Variable::builder();
    if let Some(node) = input.node() {
        builder.edge(node, move |output_grad: ArcTensor4| {
            let mut input_grad = Array4::<f32>::zeros([bs, ih, iw, ic]);
            input_grad
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .zip(output_grad.axis_iter(Axis(0)).into_par_iter())
                .for_each(|(mut dx, dy)| {
                    for (oy, iy) in row_indices.iter().copied().enumerate() {
                        for (ox, ix) in col_indices.iter().copied().enumerate() {
                            if let Some((iy, ix)) = iy.zip(ix) {
                                let mut dx = dx.slice_mut(s![iy, ix, ..]);
                                dx += &dy.slice(s![oy, ox, ..]);
                            }
                        }
                    }
                });
            Ok(input_grad.into_shared())
        });
    }
    Ok(builder.build(output.into_shared()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array;

    fn arange4(shape: [usize; 4]) -> Array4<f32> {
        Array::from_shape_vec(shape, (0..shape.iter().product::<usize>()).map(|x| x as f32).collect())
            .unwrap()
    }

    fn conv2_naive(x: &Array4<f32>, w: &Array4<f32>, stride: usize) -> Array4<f32> {
        let (bs, ih, iw, ic) = x.dim();
        let (fh, fw, _, oc) = w.dim();
        let (oh, ow) = (output_len(ih, fh, stride), output_len(iw, fw, stride));
        let mut y = Array4::zeros([bs, oh, ow, oc]);
        for ((b, oy, ox, o), y) in y.indexed_iter_mut() {
            for ky in 0..fh {
                for kx in 0..fw {
                    for c in 0..ic {
                        *y += x[[b, oy * stride + ky, ox * stride + kx, c]] * w[[ky, kx, c, o]];
                    }
                }
            }
        }
        y
    }

    #[test]
    fn conv2_matches_naive() -> Result<()> {
        let x = arange4([2, 5, 6, 3]).mapv(|x| (x * 0.37).sin());
        let w = arange4([3, 3, 3, 4]).mapv(|x| (x * 0.11).cos());
        for stride in [1, 2] {
            let y = conv2_direct(&x.clone().into(), &w.clone().into(), stride)?;
            assert_relative_eq!(y.value().view(), conv2_naive(&x, &w, stride), epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn conv2_backward_shapes_and_values() -> Result<()> {
        let x = Variable::builder().node().build(Array4::<f32>::ones([1, 3, 3, 1]).into_shared());
        let w = Variable::builder().node().build(Array4::<f32>::ones([2, 2, 1, 1]).into_shared());
        let y = conv2_direct(&x, &w, 1)?;
        assert_eq!(y.shape(), &[1, 2, 2, 1]);
        y.sum().backward()?;
        // each input pixel is counted once per window covering it
        assert_eq!(
            x.grad().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![1., 2., 1., 2., 4., 2., 1., 2., 1.]
        );
        assert_eq!(w.grad().unwrap(), Array4::from_elem([2, 2, 1, 1], 4.));
        Ok(())
    }

    #[test]
    fn conv2_rejects_mismatched_channels() {
        let x = Variable4::from(Array4::<f32>::zeros([1, 4, 4, 3]));
        let w = Variable4::from(Array4::<f32>::zeros([3, 3, 2, 8]));
        assert!(conv2_direct(&x, &w, 1).is_err());
    }

    #[test]
    fn reflect_pad_indices() {
        let indices = pad_indices(4, [2, 1], PadType::Reflect);
        assert_eq!(
            indices,
            vec![Some(2), Some(1), Some(0), Some(1), Some(2), Some(3), Some(2)]
        );
        let indices = pad_indices(2, [1, 1], PadType::Zero);
        assert_eq!(indices, vec![None, Some(0), Some(1), None]);
    }

    #[test]
    fn pad2_backward_sums_mirrors() -> Result<()> {
        let x = Variable::builder().node().build(arange4([1, 3, 3, 1]).into_shared());
        let y = pad2(&x, [1, 1], [1, 1], PadType::Reflect)?;
        assert_eq!(y.shape(), &[1, 5, 5, 1]);
        assert_eq!(y.value()[[0, 0, 0, 0]], 4.);
        y.sum().backward()?;
        // the center is mirrored into all four corners and four edges
        assert_eq!(x.grad().unwrap()[[0, 1, 1, 0]], 9.);
        assert_eq!(x.grad().unwrap()[[0, 0, 0, 0]], 1.);
        let z = pad2(&x, [1, 2], [0, 0], PadType::Zero)?;
        assert_eq!(z.shape(), &[1, 6, 3, 1]);
        assert_eq!(z.value().sum(), x.value().sum());
        assert!(pad2(&x, [3, 0], [0, 0], PadType::Reflect).is_err());
        Ok(())
    }
}
