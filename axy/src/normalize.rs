//! Shift and rescale statistics of the data a model is fit on.
//!
//! Numeric columns get `(v - mean) / std`. Embedding tables are whitened as a whole so the
//! embedded vectors of the data have zero mean and identity covariance, which keeps them
//! radially symmetric instead of stretching single coordinates.
//!
//! During a fit the aggregator output scales and the embedding spreads drift. They are
//! measured again on a batch now and then, blended into the model, and every change is
//! folded into the weights that read the changed values.

use std::ops::Range;

use log::{debug, warn};
use ndarray::prelude::*;

use crate::{
    arch::{Evaluation, embed_rows, network::matrix_mut},
    config::ModelConfig,
    data::{DatasetView, InputsView},
    error::{AxyErr, Notice, Result},
    linalg::symmetric_eigen,
    model::Model,
};

/// Spreads below this are treated as constant columns.
pub const MIN_SPREAD: f64 = 1e-6;

const EIGEN_ITERATIONS: usize = 1000;

/// Per column shift and rescale of a block of values.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub shift: Vec<f32>,
    pub rescale: Vec<f32>,
    /// Columns whose spread fell under `MIN_SPREAD`, their rescale is `1`.
    pub degenerate: Vec<usize>,
}

impl ColumnStats {
    /// Computes the mean and inverse standard deviation of every column in one pass.
    pub fn from_rows(values: ArrayView2<f32>) -> Self {
        let cols = values.ncols();
        let mut mean = vec![0f64; cols];
        let mut m2 = vec![0f64; cols];
        let mut n = 0f64;

        for row in values.rows() {
            n += 1.;
            for ((&v, mean), m2) in row.iter().zip(&mut mean).zip(&mut m2) {
                let v = v as f64;
                let delta = v - *mean;
                *mean += delta / n;
                *m2 += delta * (v - *mean);
            }
        }

        let mut degenerate = Vec::new();
        let rescale = m2
            .iter()
            .enumerate()
            .map(|(j, &m2)| {
                let spread = if n > 0. { (m2 / n).sqrt() } else { 0. };
                if spread < MIN_SPREAD {
                    if n > 0. {
                        degenerate.push(j);
                    }
                    1.
                } else {
                    (1. / spread) as f32
                }
            })
            .collect();

        Self {
            shift: mean.into_iter().map(|m| m as f32).collect(),
            rescale,
            degenerate,
        }
    }

    /// Replaces every value by `(v - shift) · rescale`.
    pub fn apply(&self, mut values: ArrayViewMut2<f32>) {
        for mut row in values.rows_mut() {
            for ((v, s), r) in row.iter_mut().zip(&self.shift).zip(&self.rescale) {
                *v = (*v - s) * r;
            }
        }
    }

    /// Undoes `apply`.
    pub fn invert(&self, mut values: ArrayViewMut2<f32>) {
        for mut row in values.rows_mut() {
            for ((v, s), r) in row.iter_mut().zip(&self.shift).zip(&self.rescale) {
                *v = *v / r + s;
            }
        }
    }

    fn store(&self, model: &mut Model, shift: &Range<usize>, rescale: &Range<usize>) {
        model.block_mut(shift).copy_from_slice(&self.shift);
        model.block_mut(rescale).copy_from_slice(&self.rescale);
    }

    fn notices(&self, what: &'static str, notices: &mut Vec<Notice>) {
        for &column in &self.degenerate {
            warn!(what = what, column = column; "column has no spread, keeping identity rescale");
            notices.push(Notice::DegenerateData { what, column });
        }
    }
}

/// The non-fatal conditions met while normalizing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeReport {
    pub notices: Vec<Notice>,
}

/// Whitens an embedding table against the vectors it produces.
///
/// `E ← (E - μ) · W` where `W = Σ v vᵀ / √λ` over the eigenpairs of the covariance of
/// `samples`. Directions without spread are left unscaled.
fn whiten_table(
    what: &'static str,
    mut table: ArrayViewMut2<f32>,
    samples: ArrayView2<f32>,
    notices: &mut Vec<Notice>,
) {
    let (n, d) = samples.dim();
    if n == 0 || d == 0 {
        return;
    }

    let samples = samples.mapv(|v| v as f64);
    let mean = samples.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(d));
    let centered = &samples - &mean;
    let cov = centered.t().dot(&centered) / n as f64;

    let mut whitening = Array2::<f64>::zeros((d, d));
    let pairs = symmetric_eigen(cov.view(), EIGEN_ITERATIONS);
    for (k, (lambda, v)) in pairs.into_iter().enumerate() {
        let spread = lambda.sqrt();
        let scale = if spread < MIN_SPREAD {
            warn!(what = what, direction = k; "embedding direction has no spread");
            notices.push(Notice::DegenerateData { what, column: k });
            1.
        } else {
            1. / spread
        };
        let v = v.insert_axis(Axis(1));
        whitening.scaled_add(scale, &v.dot(&v.t()));
    }

    let rows = table.mapv(|v| v as f64) - &mean;
    table.assign(&rows.dot(&whitening).mapv(|v| v as f32));
}

/// Embeds every row holding at least one index.
fn embedded_rows(table: ArrayView2<f32>, indices: ArrayView2<i64>) -> Array2<f32> {
    let keep: Vec<usize> = indices
        .rows()
        .into_iter()
        .enumerate()
        .filter(|(_, row)| row.iter().any(|&i| i > 0))
        .map(|(r, _)| r)
        .collect();
    let indices = indices.select(Axis(0), &keep);
    let mut out = Array2::zeros((keep.len(), table.ncols()));
    embed_rows(table, indices.view(), out.view_mut());
    out
}

/// Fits every shift and rescale of a model to a dataset and whitens its embedding tables.
///
/// Numeric statistics are written into the model's normalization block, the aggregator
/// output statistics are measured after the inputs are normalized.
///
/// # Arguments
/// * `config` - The model configuration.
/// * `model` - The model to update.
/// * `data` - The dataset to measure.
///
/// # Returns
/// The degenerate columns and empty aggregate sets found.
pub fn normalize_data(
    config: &ModelConfig,
    model: &mut Model,
    data: DatasetView,
) -> Result<NormalizeReport> {
    let dims = config.dims();
    let layout = config.layout();
    let mut notices = Vec::new();

    if dims.has_aggregator() && dims.adn > 0 {
        let stats = ColumnStats::from_rows(data.inputs.ax);
        stats.store(model, &layout.ax_shift, &layout.ax_rescale);
        stats.notices("ax", &mut notices);
    }
    if dims.mdn > 0 {
        let stats = ColumnStats::from_rows(data.inputs.x);
        stats.store(model, &layout.x_shift, &layout.x_rescale);
        stats.notices("x", &mut notices);
    }
    if dims.mdo > 0 {
        let stats = ColumnStats::from_rows(data.y);
        stats.store(model, &layout.y_shift, &layout.y_rescale);
        stats.notices("y", &mut notices);
    }

    let params = model.as_mut_slice();
    if dims.ade > 0 && data.inputs.na() > 0 {
        let table = table_of(params, &layout.a_emb, dims.ade)?.to_owned();
        let samples = embedded_rows(table.view(), data.inputs.axi);
        whiten_table(
            "a_emb",
            table_of(params, &layout.a_emb, dims.ade)?,
            samples.view(),
            &mut notices,
        );
    }
    if dims.mde > 0 {
        let table = table_of(params, &layout.m_emb, dims.mde)?.to_owned();
        let samples = embedded_rows(table.view(), data.inputs.xi);
        whiten_table(
            "m_emb",
            table_of(params, &layout.m_emb, dims.mde)?,
            samples.view(),
            &mut notices,
        );
    }
    if dims.doe > 0 {
        let table = table_of(params, &layout.o_emb, dims.doe)?.to_owned();
        whiten_table(
            "o_emb",
            table_of(params, &layout.o_emb, dims.doe)?,
            table.view(),
            &mut notices,
        );
    }

    if dims.has_aggregator() {
        for (i, _) in data.inputs.sizes.iter().enumerate().filter(|(_, s)| **s == 0) {
            warn!(sample = i; "empty aggregate set");
            notices.push(Notice::EmptyAggregate { sample: i });
        }

        model.block_mut(&layout.ay_shift).fill(0.);
        model.block_mut(&layout.ay_rescale).fill(1.);
        if data.inputs.na() > 0 {
            let mut ev = Evaluation::default();
            ev.aggregate(config, model.as_slice(), data.inputs)?;
            let stats = ColumnStats::from_rows(ev.aggregator_output());
            stats.store(model, &layout.ay_shift, &layout.ay_rescale);
            stats.notices("ay", &mut notices);
        }
    }

    Ok(NormalizeReport { notices })
}

/// The linear map moving the spread of `samples` a share `rate` of the way to identity,
/// and its inverse.
///
/// `W = I + Σ (σ_k - 1) v vᵀ` with `σ_k = 1 - rate + rate / √λ_k` over the eigenpairs of
/// the covariance of `samples`. Directions without spread keep `σ_k = 1`.
fn blended_whitening(samples: ArrayView2<f32>, rate: f32) -> Option<(Array2<f64>, Array2<f64>)> {
    let (n, d) = samples.dim();
    if n < 2 || d == 0 {
        return None;
    }

    let samples = samples.mapv(|v| v as f64);
    let mean = samples.mean_axis(Axis(0))?;
    let centered = &samples - &mean;
    let cov = centered.t().dot(&centered) / n as f64;

    let rate = rate as f64;
    let mut w = Array2::<f64>::eye(d);
    let mut w_inv = Array2::<f64>::eye(d);
    for (lambda, v) in symmetric_eigen(cov.view(), EIGEN_ITERATIONS) {
        let spread = lambda.max(0.).sqrt();
        if spread < MIN_SPREAD {
            continue;
        }
        let scale = 1. - rate + rate / spread;
        let v = v.insert_axis(Axis(1));
        let vv = v.dot(&v.t());
        w.scaled_add(scale - 1., &vv);
        w_inv.scaled_add(1. / scale - 1., &vv);
    }
    Some((w, w_inv))
}

/// Replaces `E` by `E · W`.
fn transform_table(mut table: ArrayViewMut2<f32>, w: &Array2<f64>) {
    let moved = table.mapv(|v| v as f64).dot(w);
    table.assign(&moved.mapv(|v| v as f32));
}

/// Replaces rows `rows` of a `? × cols` weight block by `W⁻¹ ·` those rows.
fn fold_rows(
    params: &mut [f32],
    block: (Range<usize>, usize),
    rows: Range<usize>,
    w_inv: &Array2<f64>,
) -> Result<()> {
    let (range, cols) = block;
    let n = if cols == 0 { 0 } else { range.len() / cols };
    let mut m = matrix_mut(&mut params[range], n, cols)?;
    let mut part = m.slice_mut(s![rows, ..]);
    let folded = w_inv.dot(&part.mapv(|v| v as f64));
    part.assign(&folded.mapv(|v| v as f32));
    Ok(())
}

/// Re-measures the aggregator output scales and embedding spreads on a batch.
///
/// Each rescale moves a share `step_ay_change` toward `1 / σ` of the batch and each
/// embedding table a share `step_emb_change` toward white, compensated in the consuming
/// weights so the model computes the same outputs before and after. Shifts are left
/// where the first normalization put them.
///
/// # Arguments
/// * `config` - The model configuration.
/// * `model` - The model to update.
/// * `inputs` - The batch to measure.
pub fn renormalize(config: &ModelConfig, model: &mut Model, inputs: InputsView) -> Result<()> {
    let dims = config.dims();
    let layout = config.layout();
    let params = config.params();
    let agg_in = layout.agg.input_weights();
    let main_in = layout.main.input_weights();

    if dims.has_aggregator() && inputs.na() > 0 {
        let mut ev = Evaluation::default();
        ev.aggregate(config, model.as_slice(), inputs)?;
        let fresh = ColumnStats::from_rows(ev.aggregator_output());
        let rate = params.step_ay_change;
        let (range, cols) = main_in.clone();

        for j in (0..dims.ado).filter(|j| !fresh.degenerate.contains(j)) {
            let at = layout.ay_rescale.start + j;
            let old = model.as_slice()[at];
            let new = (1. - rate) * old + rate * fresh.rescale[j];
            let row = range.start + (dims.mdn + dims.mde + j) * cols;
            model
                .block_mut(&(row..row + cols))
                .iter_mut()
                .for_each(|w| *w *= old / new);
            model.as_mut_slice()[at] = new;
        }
    }

    let rate = params.step_emb_change;
    let values = model.as_mut_slice();
    if dims.ade > 0 && inputs.na() > 0 {
        let table = table_of(values, &layout.a_emb, dims.ade)?.to_owned();
        let samples = embedded_rows(table.view(), inputs.axi);
        if let Some((w, w_inv)) = blended_whitening(samples.view(), rate) {
            transform_table(table_of(values, &layout.a_emb, dims.ade)?, &w);
            fold_rows(values, agg_in, dims.adn..dims.adi, &w_inv)?;
        }
    }
    if dims.mde > 0 {
        let table = table_of(values, &layout.m_emb, dims.mde)?.to_owned();
        let samples = embedded_rows(table.view(), inputs.xi);
        if let Some((w, w_inv)) = blended_whitening(samples.view(), rate) {
            transform_table(table_of(values, &layout.m_emb, dims.mde)?, &w);
            fold_rows(values, main_in, dims.mdn..dims.mdn + dims.mde, &w_inv)?;
        }
    }
    if dims.doe > 0 {
        let table = table_of(values, &layout.o_emb, dims.doe)?.to_owned();
        if let Some((w, w_inv)) = blended_whitening(table.view(), rate) {
            transform_table(table_of(values, &layout.o_emb, dims.doe)?, &w);

            // Scores are `o · E_k`, so output block `B` becomes `B · W⁻¹` (W is symmetric).
            let main = &layout.main;
            let last = main.width_into(main.layers);
            let mut out = matrix_mut(&mut values[main.out_w.clone()], last, main.output)?;
            for c in 0..dims.noc {
                let start = dims.mdo + c * dims.doe;
                let mut block = out.slice_mut(s![.., start..start + dims.doe]);
                let folded = block.mapv(|v| v as f64).dot(&w_inv);
                block.assign(&folded.mapv(|v| v as f32));
            }
        }
    }

    debug!(rows = inputs.na(), samples = inputs.nm(); "statistics refreshed");
    Ok(())
}

/// Views an embedding table of the model vector.
fn table_of<'a>(
    params: &'a mut [f32],
    range: &Range<usize>,
    width: usize,
) -> Result<ArrayViewMut2<'a, f32>> {
    let len = range.len();
    ArrayViewMut2::from_shape((len / width, width), &mut params[range.clone()]).map_err(|_| {
        AxyErr::SizeMismatch {
            a: "embedding table",
            b: "layout",
            got: len,
            expected: len / width * width,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ModelDims, TrainingParams, new_model_config},
        data::{Dataset, Inputs},
        model::init_model,
    };

    #[test]
    fn normalized_values_round_trip() {
        let values = array![[1., 200., -3.], [2., 180., -3.5], [4., 260., 9.], [8., 210., 0.]];
        let stats = ColumnStats::from_rows(values.view());

        let mut work = values.clone();
        stats.apply(work.view_mut());
        for col in work.columns() {
            assert!(col.mean().unwrap().abs() < 1e-5);
            assert!((col.mapv(|v| v * v).mean().unwrap() - 1.).abs() < 1e-4);
        }

        stats.invert(work.view_mut());
        for (a, b) in work.iter().zip(&values) {
            assert!((a - b).abs() <= 1e-5 * b.abs().max(1.));
        }
    }

    #[test]
    fn constant_columns_keep_identity_rescale() {
        let values = array![[3., 1.], [3., 2.], [3., 3.]];
        let stats = ColumnStats::from_rows(values.view());

        assert_eq!(stats.degenerate, vec![0]);
        assert_eq!(stats.rescale[0], 1.);
        assert_eq!(stats.shift[0], 3.);
    }

    #[test]
    fn embeddings_are_whitened_over_the_data() {
        let dims = ModelDims {
            mdn: 1,
            mdo: 1,
            mne: Some(4),
            mde: Some(2),
            mns: Some(0),
            ..Default::default()
        };
        let config = new_model_config(&dims, TrainingParams::default()).unwrap();
        let mut model = init_model(&config, Some(9), None, None).unwrap();
        let inputs = Inputs::new(
            Array2::zeros((0, 0)),
            Array2::zeros((0, 0)),
            vec![0; 8],
            Array2::from_shape_fn((8, 1), |(i, _)| i as f32),
            array![[1], [2], [3], [4], [1], [2], [3], [0]],
        );
        let data = Dataset::new(inputs, Array2::from_shape_fn((8, 1), |(i, _)| 2. * i as f32));

        let report = normalize_data(&config, &mut model, data.view()).unwrap();
        assert!(report.notices.is_empty());

        let table = ArrayView2::from_shape((4, 2), model.block(&config.layout().m_emb)).unwrap();
        let samples = embedded_rows(table, data.inputs.xi.view());
        assert_eq!(samples.nrows(), 7);
        let mean = samples.mean_axis(Axis(0)).unwrap();
        assert!(mean.iter().all(|m| m.abs() < 1e-4));
        let centered = &samples - &mean;
        let cov = centered.t().dot(&centered) / 7.;
        for ((i, j), &c) in cov.indexed_iter() {
            let expected = if i == j { 1. } else { 0. };
            assert!((c - expected).abs() < 1e-3, "cov[{i}, {j}] = {c}");
        }

        let layout = config.layout();
        assert!((model.block(&layout.y_shift)[0] - 7.).abs() < 1e-6);
    }

    fn categorical_config(params: TrainingParams) -> ModelConfig {
        let dims = ModelDims {
            adn: 1,
            mdn: 1,
            mdo: 1,
            noe: 3,
            ane: Some(3),
            ade: Some(2),
            ado: Some(2),
            mne: Some(4),
            mde: Some(2),
            doe: Some(2),
            noc: Some(1),
            ..Default::default()
        };
        new_model_config(&dims, params).unwrap()
    }

    fn ragged_inputs() -> Inputs {
        let sizes = vec![2, 1, 3, 0, 2, 1];
        let na: usize = sizes.iter().sum();
        Inputs::new(
            Array2::from_shape_fn((na, 1), |(i, _)| (i as f32 * 0.7).sin() * 3.),
            Array2::from_shape_fn((na, 1), |(i, _)| (i % 4) as i64),
            sizes,
            Array2::from_shape_fn((6, 1), |(i, _)| i as f32 - 2.),
            Array2::from_shape_fn((6, 1), |(i, _)| (i % 5) as i64),
        )
    }

    /// Numeric outputs followed by every categorical score.
    fn scores(config: &ModelConfig, model: &Model, inputs: &Inputs) -> Vec<f32> {
        let dims = config.dims();
        let mut ev = Evaluation::default();
        ev.forward(config, model.as_slice(), inputs.view()).unwrap();
        let table =
            ArrayView2::from_shape((dims.noe, dims.doe), model.block(&config.layout().o_emb))
                .unwrap();

        let mut out = Vec::new();
        for row in ev.output().rows() {
            out.push(row[0]);
            out.extend(table.dot(&row.slice(s![dims.mdo..])));
        }
        out
    }

    #[test]
    fn renormalizing_keeps_every_output() {
        let params = TrainingParams {
            step_ay_change: 1.,
            step_emb_change: 0.5,
            ..Default::default()
        };
        let config = categorical_config(params);
        let mut model = init_model(&config, Some(21), None, None).unwrap();
        let inputs = ragged_inputs();
        let before = scores(&config, &model, &inputs);
        let original = model.clone();

        renormalize(&config, &mut model, inputs.view()).unwrap();

        let layout = config.layout();
        assert_ne!(model.block(&layout.ay_rescale), original.block(&layout.ay_rescale));
        assert_ne!(model.block(&layout.m_emb), original.block(&layout.m_emb));
        assert_ne!(model.block(&layout.o_emb), original.block(&layout.o_emb));
        assert_eq!(model.block(&layout.ay_shift), original.block(&layout.ay_shift));

        let after = scores(&config, &model, &inputs);
        for (a, b) in after.iter().zip(&before) {
            assert!((a - b).abs() < 1e-3 * (1. + b.abs()), "{a} vs {b}");
        }
    }

    #[test]
    fn full_rate_whitens_the_batch_embeddings() {
        let params = TrainingParams {
            step_emb_change: 1.,
            ..Default::default()
        };
        let config = categorical_config(params);
        let mut model = init_model(&config, Some(22), None, None).unwrap();
        let inputs = ragged_inputs();
        renormalize(&config, &mut model, inputs.view()).unwrap();

        let table = ArrayView2::from_shape((4, 2), model.block(&config.layout().m_emb)).unwrap();
        let samples = embedded_rows(table, inputs.xi.view());
        let n = samples.nrows() as f32;
        let mean = samples.mean_axis(Axis(0)).unwrap();
        let centered = &samples - &mean;
        let cov = centered.t().dot(&centered) / n;
        for ((i, j), &c) in cov.indexed_iter() {
            let expected = if i == j { 1. } else { 0. };
            assert!((c - expected).abs() < 1e-3, "cov[{i}, {j}] = {c}");
        }
    }
}
