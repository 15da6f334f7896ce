use crate::{
    neural_network::autograd::{Variable, Variable4},
    tensor::ArcTensor4,
};
use anyhow::{anyhow, ensure, Result};
use ndarray::{s, Array4, Axis};
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use std::ops::Range;

/// The input window of each output position along an axis, clipped to the input.
///
/// SAME padding: the output length is `ceil(len / stride)` and the padding is split with the
/// extra cell after.
fn same_windows(len: usize, kernel: usize, stride: usize) -> Vec<Range<usize>> {
    let output_len = (len + stride - 1) / stride;
    let total = ((output_len.max(1) - 1) * stride + kernel).saturating_sub(len);
    let before = total / 2;
    (0..output_len)
        .map(|o| {
            let start = (o * stride).saturating_sub(before);
            let end = (o * stride + kernel).saturating_sub(before).min(len);
            start..end
        })
        .collect()
}

/// Average pooling with SAME padding over the height and width of an NHWC `input`.
///
/// Padded cells are excluded from the average.
pub(super) fn avg_pool2_same(input: &Variable4, kernel: usize, stride: usize) -> Result<Variable4> {
    ensure!(kernel > 0 && stride > 0, "avg_pool2: kernel and stride must be positive");
    let (bs, ih, iw, ic) = input.dim();
    let rows = same_windows(ih, kernel, stride);
    let cols = same_windows(iw, kernel, stride);
    let mut output = Array4::<f32>::zeros([bs, rows.len(), cols.len(), ic]);
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(input.value().axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut y, x)| {
            for (oy, r) in rows.iter().enumerate() {
                for (ox, c) in cols.iter().enumerate() {
                    let count = (r.len() * c.len()) as f32;
                    let window = x.slice(s![r.clone(), c.clone(), ..]);
                    let mut pixel = y.slice_mut(s![oy, ox, ..]);
                    pixel.assign(&window.sum_axis(Axis(0)).sum_axis(Axis(0)));
                    pixel.mapv_inplace(|x| x / count);
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
                    for (oy, r) in rows.iter().enumerate() {
                        for (ox, c) in cols.iter().enumerate() {
                            let count = (r.len() * c.len()) as f32;
                            let dy = dy.slice(s![oy, ox, ..]).mapv(|dy| dy / count);
                            let mut window = dx.slice_mut(s![r.clone(), c.clone(), ..]);
                            window += &dy;
                        }
                    }
                });
            Ok(input_grad.into_shared())
        });
    }
    Ok(builder.build(output.into_shared()))
}

/// Nearest neighbor upsampling of the height and width of an NHWC `input` by `scale`.
pub(super) fn upsample_nearest(input: &Variable4, scale: usize) -> Result<Variable4> {
    ensure!(scale > 0, "upsample: scale factor must be positive");
    let (bs, ih, iw, ic) = input.dim();
    let (oh, ow) = ih
        .checked_mul(scale)
        .zip(iw.checked_mul(scale))
        .ok_or_else(|| anyhow!("upsample: scale factor {scale} overflows {:?}", input.shape()))?;
    let mut output = Array4::<f32>::zeros([bs, oh, ow, ic]);
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(input.value().axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut y, x)| {
            for ((oy, ox, c), y) in y.indexed_iter_mut() {
                *y = x[[oy / scale, ox / scale, c]];
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
                    for ((oy, ox, c), dy) in dy.indexed_iter() {
                        dx[[oy / scale, ox / scale, c]] += *dy;
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

    #[test]
    fn same_windows_match_tensorflow() {
        // 5 -> 3, total padding 2
        assert_eq!(same_windows(5, 3, 2), vec![0..2, 1..4, 3..5]);
        // 4 -> 2, total padding 1 after
        assert_eq!(same_windows(4, 3, 2), vec![0..3, 2..4]);
        assert_eq!(same_windows(1, 3, 2), vec![0..1]);
    }

    #[test]
    fn avg_pool_excludes_padding() -> Result<()> {
        let x = Array::from_shape_vec([1, 4, 4, 1], (0..16).map(|x| x as f32).collect())?;
        let x = Variable::builder().node().build(x.into_shared());
        let y = avg_pool2_same(&x, 3, 2)?;
        assert_eq!(y.shape(), &[1, 2, 2, 1]);
        // rows 0..3, cols 0..3
        assert_relative_eq!(y.value()[[0, 0, 0, 0]], 5.);
        // rows 2..4, cols 2..4 => 10, 11, 14, 15
        assert_relative_eq!(y.value()[[0, 1, 1, 0]], 12.5);
        y.sum().backward()?;
        let grad = x.grad().unwrap();
        assert_relative_eq!(grad.sum(), 4.);
        assert_relative_eq!(grad[[0, 0, 0, 0]], 1. / 9.);
        assert_relative_eq!(grad[[0, 3, 3, 0]], 1. / 4.);
        Ok(())
    }

    #[test]
    fn upsample_repeats_pixels() -> Result<()> {
        let x = Array::from_shape_vec([1, 2, 2, 1], vec![1f32, 2., 3., 4.])?;
        let x = Variable::builder().node().build(x.into_shared());
        let y = upsample_nearest(&x, 2)?;
        assert_eq!(y.shape(), &[1, 4, 4, 1]);
        assert_eq!(y.value()[[0, 1, 1, 0]], 1.);
        assert_eq!(y.value()[[0, 0, 3, 0]], 2.);
        assert_eq!(y.value()[[0, 3, 0, 0]], 3.);
        y.sum().backward()?;
        assert_eq!(x.grad().unwrap(), Array::from_elem([1, 2, 2, 1], 4f32));
        assert!(upsample_nearest(&x, 0).is_err());
        assert!(upsample_nearest(&x, usize::MAX).is_err());
        Ok(())
    }
}
