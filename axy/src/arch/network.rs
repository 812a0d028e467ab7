use std::mem;

use ndarray::{linalg, prelude::*};

use super::{InplaceReshape, SoftHinge};
use crate::{
    config::NetLayout,
    error::{AxyErr, Result},
};

/// Views a flat parameter block as a row-major `rows × cols` matrix.
pub(crate) fn matrix(values: &[f32], rows: usize, cols: usize) -> Result<ArrayView2<'_, f32>> {
    ArrayView2::from_shape((rows, cols), values).map_err(|_| AxyErr::SizeMismatch {
        a: "parameter block",
        b: "layout",
        got: values.len(),
        expected: rows * cols,
    })
}

/// Views a flat gradient block as a row-major `rows × cols` matrix.
pub(crate) fn matrix_mut(
    values: &mut [f32],
    rows: usize,
    cols: usize,
) -> Result<ArrayViewMut2<'_, f32>> {
    let got = values.len();
    ArrayViewMut2::from_shape((rows, cols), values).map_err(|_| AxyErr::SizeMismatch {
        a: "gradient block",
        b: "layout",
        got,
        expected: rows * cols,
    })
}

/// Forward metadata of one network over one block of rows.
///
/// `z[l]` holds the pre-activations of internal layer `l`, `a[l]` its activations.
#[derive(Debug, Clone, Default)]
pub struct NetCache {
    pub z: Vec<Array2<f32>>,
    pub a: Vec<Array2<f32>>,
    pub out: Array2<f32>,

    delta: Array2<f32>,
    delta_prev: Array2<f32>,
}

impl NetCache {
    /// The values entering internal layer `l`, or the output layer when `l == layers`.
    pub fn input_of<'s>(&'s self, x: &'s ArrayView2<'_, f32>, l: usize) -> ArrayView2<'s, f32> {
        if l == 0 { x.view() } else { self.a[l - 1].view() }
    }
}

/// Evaluates a piecewise linear network.
///
/// # Arguments
/// * `net` - The network's offsets.
/// * `params` - The whole model vector.
/// * `act` - The hinge activation of the internal layers.
/// * `x` - One input per row.
/// * `cache` - Receives every intermediate value and the output.
pub fn forward(
    net: &NetLayout,
    params: &[f32],
    act: SoftHinge,
    x: ArrayView2<f32>,
    cache: &mut NetCache,
) -> Result<()> {
    let n = x.nrows();
    cache.z.resize_with(net.layers, Default::default);
    cache.a.resize_with(net.layers, Default::default);

    if n == 0 {
        for l in 0..net.layers {
            cache.z[l] = Array2::zeros((0, net.state));
            cache.a[l] = Array2::zeros((0, net.state));
        }
        cache.out = Array2::zeros((0, net.output));
        return Ok(());
    }

    for l in 0..net.layers {
        let w = matrix(&params[net.layer_weights(l)], net.width_into(l), net.state)?;
        let s = ArrayView1::from(&params[net.layer_shifts(l)]);

        let mut z = mem::take(&mut cache.z[l]).into_reshape((n, net.state));
        linalg::general_mat_mul(1., &cache.input_of(&x, l), &w, 0., &mut z);
        z += &s;

        let mut a = mem::take(&mut cache.a[l]).into_reshape((n, net.state));
        a.zip_mut_with(&z, |a, &z| *a = act.f(z));

        cache.z[l] = z;
        cache.a[l] = a;
    }

    let w_out = matrix(
        &params[net.out_w.clone()],
        net.width_into(net.layers),
        net.output,
    )?;
    let mut out = mem::take(&mut cache.out).into_reshape((n, net.output));
    linalg::general_mat_mul(1., &cache.input_of(&x, net.layers), &w_out, 0., &mut out);
    cache.out = out;

    Ok(())
}

/// Back propagates an output gradient through a network evaluated by `forward`.
///
/// Parameter gradients are added onto `grad`, which shares the model's layout.
///
/// # Arguments
/// * `net` - The network's offsets.
/// * `params` - The whole model vector.
/// * `act` - The hinge activation of the internal layers.
/// * `x` - The inputs given to `forward`.
/// * `cache` - The forward metadata of those inputs.
/// * `d_out` - Gradient of the loss with respect to every output.
/// * `grad` - The gradient accumulator.
/// * `active` - Per neuron counters of rows with a non-zero activation slope.
/// * `d_x` - When given, receives the gradient with respect to the inputs.
#[allow(clippy::too_many_arguments)]
pub fn backward(
    net: &NetLayout,
    params: &[f32],
    act: SoftHinge,
    x: ArrayView2<f32>,
    cache: &mut NetCache,
    d_out: ArrayView2<f32>,
    grad: &mut [f32],
    active: &mut [u32],
    mut d_x: Option<&mut Array2<f32>>,
) -> Result<()> {
    let n = x.nrows();
    let last = net.width_into(net.layers);
    if n == 0 {
        if let Some(d_x) = d_x {
            *d_x = Array2::zeros((0, net.input));
        }
        return Ok(());
    }

    let mut gw = matrix_mut(&mut grad[net.out_w.clone()], last, net.output)?;
    linalg::general_mat_mul(1., &cache.input_of(&x, net.layers).t(), &d_out, 1., &mut gw);

    let w_out = matrix(&params[net.out_w.clone()], last, net.output)?;
    if net.layers == 0 {
        if let Some(d_x) = d_x {
            *d_x = mem::take(d_x).into_reshape((n, net.input));
            linalg::general_mat_mul(1., &d_out, &w_out.t(), 0., d_x);
        }
        return Ok(());
    }

    let mut delta = mem::take(&mut cache.delta).into_reshape((n, net.state));
    linalg::general_mat_mul(1., &d_out, &w_out.t(), 0., &mut delta);

    for l in (0..net.layers).rev() {
        let z = &cache.z[l];
        delta.zip_mut_with(z, |d, &z| *d *= act.df(z));

        let counts = &mut active[l * net.state..(l + 1) * net.state];
        for row in z.rows() {
            for (count, &z) in counts.iter_mut().zip(row) {
                if act.is_active(z) {
                    *count += 1;
                }
            }
        }

        let width = net.width_into(l);
        let mut gw = matrix_mut(&mut grad[net.layer_weights(l)], width, net.state)?;
        linalg::general_mat_mul(1., &cache.input_of(&x, l).t(), &delta, 1., &mut gw);
        let mut gs = ArrayViewMut1::from(&mut grad[net.layer_shifts(l)]);
        gs += &delta.sum_axis(Axis(0));

        let w = matrix(&params[net.layer_weights(l)], width, net.state)?;
        if l > 0 {
            let mut prev = mem::take(&mut cache.delta_prev).into_reshape((n, width));
            linalg::general_mat_mul(1., &delta, &w.t(), 0., &mut prev);
            cache.delta_prev = mem::replace(&mut delta, prev);
        } else if let Some(d_x) = d_x.take() {
            *d_x = mem::take(d_x).into_reshape((n, width));
            linalg::general_mat_mul(1., &delta, &w.t(), 0., d_x);
        }
    }

    cache.delta = delta;
    Ok(())
}
