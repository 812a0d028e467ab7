use ndarray::prelude::*;

use super::network::{matrix, matrix_mut};
use crate::{config::ModelConfig, data::DatasetView, error::Result};

/// Weighted squared error over normalized numeric targets.
#[derive(Default, Clone, Copy)]
pub struct SquaredError;

impl SquaredError {
    /// Returns `Σ w_ij (p_ij - ŷ_ij)²` where `ŷ = (y - shift) · rescale`.
    ///
    /// # Arguments
    /// * `pred` - Normalized predictions, one row per sample.
    /// * `targets` - The samples the predictions belong to.
    /// * `shift`, `rescale` - The target normalization.
    /// * `d` - When given, receives the gradient with respect to `pred`.
    pub fn loss(
        &self,
        pred: ArrayView2<f32>,
        targets: &DatasetView,
        shift: &[f32],
        rescale: &[f32],
        mut d: Option<ArrayViewMut2<f32>>,
    ) -> f64 {
        let mut loss = 0.;
        for ((i, j), &p) in pred.indexed_iter() {
            let w = targets.weight(i, j);
            let err = p - (targets.y[[i, j]] - shift[j]) * rescale[j];
            loss += (w * err * err) as f64;
            if let Some(d) = d.as_mut() {
                d[[i, j]] = 2. * w * err;
            }
        }
        loss
    }
}

/// Gradient sinks of the categorical output terms.
pub struct CategoryGrads<'a> {
    pub d_o: ArrayViewMut2<'a, f32>,
    pub table: ArrayViewMut2<'a, f32>,
    pub usage: &'a mut [u32],
}

/// Squared hinge requiring the true category to outscore every other one by `gap`.
#[derive(Clone, Copy)]
pub struct CategoryMargin {
    gap: f32,
}

impl CategoryMargin {
    pub fn new(gap: f32) -> Self {
        Self { gap }
    }

    /// Returns `Σ w · max(0, s_k - s_t + gap)²` over every labelled column and every
    /// category `k` other than the true one `t`, with scores `s_k = o · E_k`.
    ///
    /// # Arguments
    /// * `o` - One `doe` wide output vector per categorical column, side by side.
    /// * `targets` - The samples the outputs belong to, `yi` holds 1-based labels.
    /// * `table` - The output embedding table.
    /// * `grads` - When given, receives gradients for `o` and `table`.
    pub fn loss(
        &self,
        o: ArrayView2<f32>,
        targets: &DatasetView,
        table: ArrayView2<f32>,
        mut grads: Option<CategoryGrads<'_>>,
    ) -> f64 {
        let doe = table.ncols();
        let mut loss = 0.;
        let mut scores = Array1::<f32>::zeros(table.nrows());

        for (i, labels) in targets.yi.rows().into_iter().enumerate() {
            let w = targets.sample_weight(i);
            for (c, &label) in labels.iter().enumerate() {
                if label <= 0 {
                    continue;
                }
                let t = label as usize - 1;
                let cols = c * doe..(c + 1) * doe;
                let oc = o.slice(s![i, cols.clone()]);
                scores.assign(&table.dot(&oc));

                if let Some(g) = grads.as_mut() {
                    g.usage[t] += 1;
                }
                for k in (0..scores.len()).filter(|&k| k != t) {
                    let margin = scores[k] - scores[t] + self.gap;
                    if margin <= 0. {
                        continue;
                    }
                    loss += (w * margin * margin) as f64;

                    if let Some(g) = grads.as_mut() {
                        let ds = 2. * w * margin;
                        let mut d_oc = g.d_o.slice_mut(s![i, cols.clone()]);
                        d_oc.scaled_add(ds, &table.row(k));
                        d_oc.scaled_add(-ds, &table.row(t));
                        g.table.row_mut(k).scaled_add(ds, &oc);
                        g.table.row_mut(t).scaled_add(-ds, &oc);
                        g.usage[k] += 1;
                    }
                }
            }
        }

        loss
    }

    /// The 1-based index of the best scoring category, `0` for an empty table.
    pub fn predict(o: ArrayView1<f32>, table: ArrayView2<f32>) -> i64 {
        table
            .dot(&o)
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(k, _)| k as i64 + 1)
    }
}

/// Gradient sinks of the whole output layer.
pub struct OutputGrads<'a> {
    /// Gradient with respect to every main network output, `nm × mo`.
    pub d_out: &'a mut Array2<f32>,
    /// The model gradient accumulator.
    pub grad: &'a mut [f32],
    /// Occurrence counters of the output embedding rows.
    pub usage: &'a mut [u32],
}

/// Loss of a block of main network outputs against their targets.
///
/// # Arguments
/// * `config` - The model configuration.
/// * `params` - The whole model vector.
/// * `out` - Main network outputs, `nm × mo`.
/// * `targets` - The samples the outputs belong to.
/// * `grads` - When given, receives the output gradient and output embedding gradient.
pub fn output_loss(
    config: &ModelConfig,
    params: &[f32],
    out: ArrayView2<f32>,
    targets: &DatasetView,
    mut grads: Option<OutputGrads<'_>>,
) -> Result<f64> {
    let dims = config.dims();
    let layout = config.layout();

    let mut loss = {
        let d = grads
            .as_mut()
            .map(|g| g.d_out.slice_mut(s![.., ..dims.mdo]));
        SquaredError.loss(
            out.slice(s![.., ..dims.mdo]),
            targets,
            &params[layout.y_shift.clone()],
            &params[layout.y_rescale.clone()],
            d,
        )
    };

    if dims.noc > 0 {
        let table = matrix(&params[layout.o_emb.clone()], dims.noe, dims.doe)?;
        let category_grads = match grads.as_mut() {
            Some(g) => Some(CategoryGrads {
                d_o: g.d_out.slice_mut(s![.., dims.mdo..]),
                table: matrix_mut(&mut g.grad[layout.o_emb.clone()], dims.noe, dims.doe)?,
                usage: &mut *g.usage,
            }),
            None => None,
        };
        loss += CategoryMargin::new(config.params().category_gap).loss(
            out.slice(s![.., dims.mdo..]),
            targets,
            table,
            category_grads,
        );
    }

    Ok(loss)
}
