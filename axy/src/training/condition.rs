//! Maintenance of the internal layers between steps.
//!
//! Every internal layer is checked over the activations of a batch. Neurons whose
//! activation column is (numerically) a combination of the others are folded into the
//! next layer and restarted on a direction the layer does not cover yet. With a plain
//! rectifier, neurons whose activation scale drifted are also brought back to unit
//! size. None of these moves changes what the network computes on the batch.

use std::ops::Range;

use log::{debug, warn};
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    arch::{Evaluation, NetCache, SoftHinge, network},
    config::{ModelConfig, NetLayout},
    data::InputsView,
    error::Result,
    linalg::{RANK_TOLERANCE, pivoted_qr},
    model::Model,
};

/// Candidate directions tried per restarted neuron.
const MAX_ATTEMPTS: usize = 16;
/// Activation RMS range neurons are kept within when the activation is homogeneous.
const RMS_RANGE: (f32, f32) = (0.5, 2.);

/// Neurons changed by one conditioning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionReport {
    /// Restarted neurons of every internal layer, aggregator layers first.
    pub repaired: Vec<usize>,
    /// Neurons rescaled back into the activation range.
    pub rescaled: usize,
    /// Model vector indices of the incoming weights, shifts and outgoing weights of every
    /// restarted neuron.
    pub restarted: Vec<usize>,
}

impl ConditionReport {
    /// Total restarted neurons.
    pub fn total(&self) -> usize {
        self.repaired.iter().sum()
    }
}

fn norm(v: ArrayView1<f32>) -> f32 {
    v.dot(&v).sqrt()
}

/// Activation columns of every internal layer that depend on the other columns.
pub(crate) fn rank_loss(cache: &NetCache) -> usize {
    cache
        .a
        .iter()
        .map(|a| {
            let (n, w) = a.dim();
            let full = n.min(w);
            if full == 0 {
                return 0;
            }
            full.saturating_sub(pivoted_qr(a.view(), RANK_TOLERANCE).rank())
        })
        .sum()
}

/// Indices touched when neuron `j` of layer `l` starts over.
fn neuron_indices(net: &NetLayout, l: usize, j: usize, out: &mut Vec<usize>) {
    let weights = net.layer_weights(l);
    out.extend((0..net.width_into(l)).map(|i| weights.start + i * net.state + j));
    out.push(net.layer_shifts(l).start + j);
    let (next, cols) = outgoing(net, l);
    let row = next.start + j * cols;
    out.extend(row..row + cols);
}

/// The weight block consuming the activations of layer `l` and its column count.
fn outgoing(net: &NetLayout, l: usize) -> (Range<usize>, usize) {
    if l + 1 < net.layers {
        (net.layer_weights(l + 1), net.state)
    } else {
        (net.out_w.clone(), net.output)
    }
}

/// Scales neuron `j` of layer `l` by `1 / alpha`, compensating in the next layer.
fn scale_neuron(
    net: &NetLayout,
    params: &mut [f32],
    cache: &mut NetCache,
    l: usize,
    j: usize,
    alpha: f32,
) -> Result<()> {
    let width = net.width_into(l);
    let mut w = network::matrix_mut(&mut params[net.layer_weights(l)], width, net.state)?;
    w.column_mut(j).mapv_inplace(|v| v / alpha);
    params[net.layer_shifts(l).start + j] /= alpha;

    let (range, cols) = outgoing(net, l);
    let mut next = network::matrix_mut(&mut params[range], net.state, cols)?;
    next.row_mut(j).mapv_inplace(|v| v * alpha);

    cache.z[l].column_mut(j).mapv_inplace(|v| v / alpha);
    cache.a[l].column_mut(j).mapv_inplace(|v| v / alpha);
    Ok(())
}

/// Brings every live neuron of layer `l` whose activation RMS leaves `RMS_RANGE` to unit RMS.
fn rescale_layer(
    net: &NetLayout,
    params: &mut [f32],
    cache: &mut NetCache,
    l: usize,
) -> Result<usize> {
    let n = cache.a[l].nrows() as f32;
    let mut count = 0;
    for j in 0..net.state {
        let rms = norm(cache.a[l].column(j)) / n.sqrt();
        if rms > 0. && !(RMS_RANGE.0..=RMS_RANGE.1).contains(&rms) {
            scale_neuron(net, params, cache, l, j, rms)?;
            count += 1;
        }
    }
    Ok(count)
}

/// Folds the dependent neurons of layer `l` into the next layer and restarts them.
#[allow(clippy::too_many_arguments)]
fn repair_layer<R: Rng>(
    net: &NetLayout,
    params: &mut [f32],
    act: SoftHinge,
    x: ArrayView2<f32>,
    cache: &mut NetCache,
    l: usize,
    rng: &mut R,
    restarted: &mut Vec<usize>,
) -> Result<usize> {
    let (n, w) = cache.a[l].dim();
    let target = w.min(n);
    let mut qr = pivoted_qr(cache.a[l].view(), RANK_TOLERANCE);
    if qr.rank() >= target {
        return Ok(0);
    }

    let broken: Vec<usize> = qr.dependent.iter().copied().take(target - qr.rank()).collect();
    let (range, cols) = outgoing(net, l);
    {
        let mut next = network::matrix_mut(&mut params[range], w, cols)?;
        for &j in &broken {
            let c = qr.coefficients(j);
            let row = next.row(j).to_owned();
            for (&p, &c) in qr.pivots.iter().zip(&c) {
                next.row_mut(p).scaled_add(c, &row);
            }
            next.row_mut(j).fill(0.);
        }
    }

    let input = cache.input_of(&x, l).to_owned();
    let width = net.width_into(l);
    let reference = qr.scale;
    let limit = 2. * RANK_TOLERANCE * reference;
    let mut repaired = 0;

    for &j in &broken {
        for _ in 0..MAX_ATTEMPTS {
            let mut u: Array1<f32> = (0..width).map(|_| rng.sample(StandardNormal)).collect();
            let len = norm(u.view());
            if len == 0. {
                continue;
            }
            u /= len;

            let row = rng.random_range(0..n);
            let mut shift = -input.row(row).dot(&u);
            let mut z = input.dot(&u) + shift;
            let mut a = z.mapv(|v| act.f(v));
            let a_len = norm(a.view());
            if a_len == 0. {
                continue;
            }

            if act.delta() == 0. {
                let size = (n as f32).sqrt();
                let target_len = if reference > 0. { reference.min(size) } else { size };
                let scale = target_len / a_len;
                u *= scale;
                shift *= scale;
                z *= scale;
                a *= scale;
            } else if reference > 0. && a_len > reference {
                continue;
            }

            let residual = qr.residual(a.view());
            if norm(residual.view()) <= limit {
                continue;
            }

            let mut weights =
                network::matrix_mut(&mut params[net.layer_weights(l)], width, net.state)?;
            weights.column_mut(j).assign(&u);
            params[net.layer_shifts(l).start + j] = shift;
            cache.z[l].column_mut(j).assign(&z);
            cache.a[l].column_mut(j).assign(&a);
            qr.push(residual);
            neuron_indices(net, l, j, restarted);
            repaired += 1;
            break;
        }
    }

    if repaired < broken.len() {
        warn!(layer = l, failed = broken.len() - repaired; "neurons left without a new direction");
    }
    Ok(repaired)
}

/// Conditions every internal layer of one network, first to last.
#[allow(clippy::too_many_arguments)]
fn condition_net<R: Rng>(
    net: &NetLayout,
    params: &mut [f32],
    act: SoftHinge,
    replace: bool,
    x: ArrayView2<f32>,
    cache: &mut NetCache,
    rng: &mut R,
    report: &mut ConditionReport,
) -> Result<()> {
    for l in 0..net.layers {
        network::forward(net, params, act, x, cache)?;
        if cache.a[l].nrows() == 0 || !(replace || act.delta() == 0.) {
            report.repaired.push(0);
            continue;
        }

        if act.delta() == 0. {
            report.rescaled += rescale_layer(net, params, cache, l)?;
        }
        let repaired = if replace {
            repair_layer(net, params, act, x, cache, l, rng, &mut report.restarted)?
        } else {
            0
        };
        report.repaired.push(repaired);
    }
    Ok(())
}

/// Repairs rank deficient and badly scaled internal neurons of a model.
///
/// Without `basis_replacement` dependent neurons are left alone and only rescaled.
/// The pass leaves the model's outputs on `inputs` unchanged up to the rank tolerance
/// and running it twice on the same batch changes nothing the second time.
///
/// # Arguments
/// * `config` - The model configuration.
/// * `model` - The model to condition.
/// * `inputs` - The batch the activations are measured on.
/// * `rng` - A random number generator for the restarted directions.
///
/// # Returns
/// The amount of neurons repaired per layer.
pub fn condition_model<R: Rng>(
    config: &ModelConfig,
    model: &mut Model,
    inputs: InputsView,
    rng: &mut R,
) -> Result<ConditionReport> {
    let layout = config.layout();
    let params = config.params();
    let act = SoftHinge::new(params.discontinuity);
    let replace = params.basis_replacement;
    let mut report = ConditionReport::default();
    let mut ev = Evaluation::default();

    if config.dims().has_aggregator() {
        ev.aggregate(config, model.as_slice(), inputs)?;
        let (rows, agg, ..) = ev.networks_mut();
        condition_net(
            &layout.agg,
            model.as_mut_slice(),
            act,
            replace,
            rows,
            agg,
            rng,
            &mut report,
        )?;
    }

    ev.forward(config, model.as_slice(), inputs)?;
    let (_, _, main_input, main) = ev.networks_mut();
    condition_net(
        &layout.main,
        model.as_mut_slice(),
        act,
        replace,
        main_input,
        main,
        rng,
        &mut report,
    )?;

    debug!(repaired = report.total(), rescaled = report.rescaled; "model conditioned");
    Ok(report)
}
