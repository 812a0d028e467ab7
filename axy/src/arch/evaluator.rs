use std::mem;

use ndarray::prelude::*;

use super::{
    Aggregation, Expanded, InplaceReshape, NetCache, SoftHinge,
    embedding::{accumulate_rows, embed_rows},
    network::{self, matrix, matrix_mut},
    weighted_tree_sum,
};
use crate::{config::ModelConfig, data::InputsView, error::Result};

/// Selects the rows the aggregator network actually evaluates.
fn agg_rows<'a>(
    base: &'a Array2<f32>,
    pairs: &'a Array2<f32>,
    pairwise: bool,
) -> ArrayView2<'a, f32> {
    if pairwise { pairs.view() } else { base.view() }
}

/// Applies `(v - shift) · rescale` to every row of a block.
fn normalize_columns(mut block: ArrayViewMut2<f32>, shift: &[f32], rescale: &[f32]) {
    for mut row in block.rows_mut() {
        for ((v, s), r) in row.iter_mut().zip(shift).zip(rescale) {
            *v = (*v - s) * r;
        }
    }
}

/// Forward and backward metadata of a whole model over one block of samples.
///
/// Evaluation runs `embed → aggregate forward → aggregate reduce → main forward`, the
/// output embedding scores are left to the loss.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Normalized numeric aggregate inputs next to their embeddings, one row per aggregate row.
    base: Array2<f32>,
    expanded: Vec<Expanded>,
    pairs: Array2<f32>,
    coefficients: Vec<f32>,
    /// `set_starts[i]..set_starts[i + 1]` are the aggregator rows of sample `i`.
    set_starts: Vec<usize>,
    empty_sets: Vec<usize>,
    pairwise: bool,

    agg: NetCache,
    agg_y: Array2<f32>,
    main_input: Array2<f32>,
    main: NetCache,

    d_main_input: Array2<f32>,
    d_agg_y: Array2<f32>,
    d_agg_input: Array2<f32>,
    d_base: Array2<f32>,
}

impl Evaluation {
    /// Evaluates the aggregator network over every aggregate row of the block.
    ///
    /// # Arguments
    /// * `config` - The model configuration.
    /// * `params` - The whole model vector.
    /// * `inputs` - The samples to evaluate.
    pub fn aggregate(
        &mut self,
        config: &ModelConfig,
        params: &[f32],
        inputs: InputsView,
    ) -> Result<()> {
        let dims = config.dims();
        let layout = config.layout();
        let rules = Aggregation::from_params(config.params());

        self.pairwise = rules.pairwise;
        self.expanded.clear();
        self.coefficients.clear();
        self.empty_sets.clear();
        self.set_starts.clear();
        self.set_starts.push(0);

        if !dims.has_aggregator() {
            self.set_starts.resize(inputs.nm() + 1, 0);
            return Ok(());
        }

        let na = inputs.na();
        self.base = mem::take(&mut self.base).into_reshape((na, dims.adi));
        if na > 0 && dims.adn > 0 {
            let mut numeric = self.base.slice_mut(s![.., ..dims.adn]);
            numeric.assign(&inputs.ax);
            normalize_columns(
                numeric,
                &params[layout.ax_shift.clone()],
                &params[layout.ax_rescale.clone()],
            );
        }
        if na > 0 && dims.ade > 0 {
            let table = matrix(&params[layout.a_emb.clone()], dims.ane, dims.ade)?;
            embed_rows(table, inputs.axi, self.base.slice_mut(s![.., dims.adn..]));
        }

        let mut row = 0;
        let mut at = 0;
        for (i, &size) in inputs.sizes.iter().enumerate() {
            if size == 0 {
                self.empty_sets.push(i);
            }
            if rules.pairwise {
                rules.expand(row, size, &mut self.expanded);
            }
            rules.coefficients(size, &mut self.coefficients);
            row += size;
            at += rules.expanded_len(size);
            self.set_starts.push(at);
        }

        if rules.pairwise {
            self.pairs = mem::take(&mut self.pairs).into_reshape((self.expanded.len(), dims.adi));
            for (mut out, e) in self.pairs.rows_mut().into_iter().zip(&self.expanded) {
                out.assign(&self.base.row(e.plus));
                if let Some(minus) = e.minus {
                    out -= &self.base.row(minus);
                }
            }
        }

        let act = SoftHinge::new(config.params().discontinuity);
        let rows = agg_rows(&self.base, &self.pairs, self.pairwise);
        network::forward(&layout.agg, params, act, rows, &mut self.agg)?;

        self.agg_y = mem::take(&mut self.agg_y).into_reshape(self.agg.out.dim());
        self.agg_y.assign(&self.agg.out);
        normalize_columns(
            self.agg_y.view_mut(),
            &params[layout.ay_shift.clone()],
            &params[layout.ay_rescale.clone()],
        );

        Ok(())
    }

    /// Evaluates the whole model over a block of samples.
    ///
    /// # Arguments
    /// * `config` - The model configuration.
    /// * `params` - The whole model vector.
    /// * `inputs` - The samples to evaluate.
    pub fn forward(&mut self, config: &ModelConfig, params: &[f32], inputs: InputsView) -> Result<()> {
        self.aggregate(config, params, inputs)?;

        let dims = config.dims();
        let layout = config.layout();
        let nm = inputs.nm();
        let emb = dims.mdn..dims.mdn + dims.mde;

        self.main_input = mem::take(&mut self.main_input).into_reshape((nm, dims.mdi));
        if dims.mdn > 0 {
            let mut numeric = self.main_input.slice_mut(s![.., ..dims.mdn]);
            numeric.assign(&inputs.x);
            normalize_columns(
                numeric,
                &params[layout.x_shift.clone()],
                &params[layout.x_rescale.clone()],
            );
        }
        if dims.mde > 0 {
            let table = matrix(&params[layout.m_emb.clone()], dims.mne, dims.mde)?;
            embed_rows(table, inputs.xi, self.main_input.slice_mut(s![.., emb.clone()]));
        }
        if dims.ado > 0 {
            for i in 0..nm {
                let rows = self.set_starts[i]..self.set_starts[i + 1];
                weighted_tree_sum(
                    self.agg_y.slice(s![rows.clone(), ..]),
                    &self.coefficients[rows],
                    self.main_input.slice_mut(s![i, emb.end..]),
                );
            }
        }

        let act = SoftHinge::new(config.params().discontinuity);
        network::forward(
            &layout.main,
            params,
            act,
            self.main_input.view(),
            &mut self.main,
        )
    }

    /// Back propagates an output gradient through the last `forward` call.
    ///
    /// # Arguments
    /// * `config` - The model configuration.
    /// * `params` - The whole model vector.
    /// * `inputs` - The samples given to `forward`.
    /// * `d_out` - Gradient of the loss with respect to every main network output.
    /// * `grad` - The gradient accumulator, sharing the model's layout.
    /// * `usage` - Occurrence counters of the aggregator and main embedding rows, back to back.
    /// * `active` - Active row counters of the aggregator and main neurons, back to back.
    #[allow(clippy::too_many_arguments)]
    pub fn backward(
        &mut self,
        config: &ModelConfig,
        params: &[f32],
        inputs: InputsView,
        d_out: ArrayView2<f32>,
        grad: &mut [f32],
        usage: &mut [u32],
        active: &mut [u32],
    ) -> Result<()> {
        let dims = config.dims();
        let layout = config.layout();
        let act = SoftHinge::new(config.params().discontinuity);
        let (a_usage, m_usage) = usage.split_at_mut(dims.ane);
        let (a_active, m_active) = active.split_at_mut(layout.agg.neurons());

        network::backward(
            &layout.main,
            params,
            act,
            self.main_input.view(),
            &mut self.main,
            d_out,
            grad,
            m_active,
            Some(&mut self.d_main_input),
        )?;

        let emb = dims.mdn..dims.mdn + dims.mde;
        if dims.mde > 0 {
            let table_grad = matrix_mut(&mut grad[layout.m_emb.clone()], dims.mne, dims.mde)?;
            accumulate_rows(
                inputs.xi,
                self.d_main_input.slice(s![.., emb.clone()]),
                table_grad,
                &mut m_usage[..dims.mne],
            );
        }

        if !dims.has_aggregator() || self.agg.out.nrows() == 0 {
            return Ok(());
        }

        let d_summary = self.d_main_input.slice(s![.., emb.end..]);
        let ay_rescale = &params[layout.ay_rescale.clone()];
        self.d_agg_y = mem::take(&mut self.d_agg_y).into_reshape(self.agg.out.dim());
        for i in 0..inputs.nm() {
            for r in self.set_starts[i]..self.set_starts[i + 1] {
                let c = self.coefficients[r];
                for j in 0..dims.ado {
                    self.d_agg_y[[r, j]] = c * d_summary[[i, j]] * ay_rescale[j];
                }
            }
        }

        let rows = agg_rows(&self.base, &self.pairs, self.pairwise);
        let d_x = (dims.ade > 0).then_some(&mut self.d_agg_input);
        network::backward(
            &layout.agg,
            params,
            act,
            rows,
            &mut self.agg,
            self.d_agg_y.view(),
            grad,
            a_active,
            d_x,
        )?;

        if dims.ade > 0 {
            let d_base = if self.pairwise {
                self.d_base = mem::take(&mut self.d_base).into_reshape(self.base.dim());
                self.d_base.fill(0.);
                for (d, e) in self.d_agg_input.rows().into_iter().zip(&self.expanded) {
                    self.d_base.row_mut(e.plus).scaled_add(1., &d);
                    if let Some(minus) = e.minus {
                        self.d_base.row_mut(minus).scaled_add(-1., &d);
                    }
                }
                self.d_base.view()
            } else {
                self.d_agg_input.view()
            };
            let table_grad = matrix_mut(&mut grad[layout.a_emb.clone()], dims.ane, dims.ade)?;
            accumulate_rows(
                inputs.axi,
                d_base.slice(s![.., dims.adn..]),
                table_grad,
                a_usage,
            );
        }

        Ok(())
    }

    /// The main network outputs of the last `forward` call, `nm × mo`.
    pub fn output(&self) -> ArrayView2<'_, f32> {
        self.main.out.view()
    }

    /// Raw aggregator outputs before their normalization, one row per evaluated aggregate row.
    pub fn aggregator_output(&self) -> ArrayView2<'_, f32> {
        self.agg.out.view()
    }

    /// The per sample aggregate summaries of the last `forward` call.
    pub fn summaries(&self, config: &ModelConfig) -> ArrayView2<'_, f32> {
        let dims = config.dims();
        self.main_input.slice(s![.., dims.mdn + dims.mde..])
    }

    /// Samples of the last evaluation whose aggregate set was empty.
    pub fn empty_sets(&self) -> &[usize] {
        &self.empty_sets
    }

    /// The aggregator and main network caches of the last evaluation.
    pub(crate) fn caches(&self) -> (&NetCache, &NetCache) {
        (&self.agg, &self.main)
    }

    /// Network inputs and caches, for passes that inspect or adjust internal layers.
    pub(crate) fn networks_mut(
        &mut self,
    ) -> (ArrayView2<'_, f32>, &mut NetCache, ArrayView2<'_, f32>, &mut NetCache) {
        let rows = agg_rows(&self.base, &self.pairs, self.pairwise);
        (rows, &mut self.agg, self.main_input.view(), &mut self.main)
    }
}
