use std::mem;

use ndarray::Array2;
use rayon::prelude::*;

use super::condition::rank_loss;
use crate::{
    arch::{
        Evaluation, InplaceReshape,
        loss::{OutputGrads, output_loss},
    },
    config::{ModelConfig, embedding_rows, neurons},
    data::{BatchPlan, Dataset, DatasetView, check_shape},
    error::Result,
    model::Model,
};

/// Loss, gradient and occurrence counters summed over some samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Totals {
    /// Total loss in normalized target space.
    pub loss: f64,
    /// Gradient of `loss` over the trainable values.
    pub grad: Vec<f32>,
    /// Occurrences of every embedding row, aggregator, main and output tables back to back.
    pub usage: Vec<u32>,
    /// Rows with a non-zero slope of every internal neuron, aggregator then main network.
    pub active: Vec<u32>,
    /// Internal activation columns found dependent on the others, when ranks were checked.
    pub rank_loss: usize,
}

impl Totals {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            loss: 0.,
            grad: vec![0.; config.num_vars()],
            usage: vec![0; embedding_rows(config.dims())],
            active: vec![0; neurons(config.layout())],
            rank_loss: 0,
        }
    }

    pub fn clear(&mut self) {
        self.loss = 0.;
        self.grad.fill(0.);
        self.usage.fill(0);
        self.active.fill(0);
        self.rank_loss = 0;
    }

    /// Overwrites `self` with the sum of every given totals.
    ///
    /// Rank losses are measured per chunk, the largest one is kept.
    pub fn merge<'a>(&mut self, parts: impl IntoIterator<Item = &'a Totals>) {
        self.clear();
        for part in parts {
            self.loss += part.loss;
            self.grad.iter_mut().zip(&part.grad).for_each(|(a, b)| *a += b);
            self.usage.iter_mut().zip(&part.usage).for_each(|(a, b)| *a += b);
            self.active.iter_mut().zip(&part.active).for_each(|(a, b)| *a += b);
            self.rank_loss = self.rank_loss.max(part.rank_loss);
        }
    }

    /// Internal neurons that saw no active row.
    pub fn dead_neurons(&self) -> usize {
        self.active.iter().filter(|&&c| c == 0).count()
    }

    /// Number of integer counters held.
    pub fn counters(&self) -> usize {
        self.usage.len() + self.active.len()
    }
}

/// What one pass over a batch computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Loss,
    Gradient,
    /// The gradient plus the rank of every internal layer's activations.
    GradientAndRank,
}

/// The scratch one worker thread evaluates its chunk of a batch with.
#[derive(Debug, Clone, Default)]
pub struct Partial {
    pub totals: Totals,
    ev: Evaluation,
    d_out: Array2<f32>,
}

impl Partial {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            totals: Totals::new(config),
            ..Default::default()
        }
    }

    /// Adds the loss of a block of samples and whatever else `pass` asks for.
    pub fn accumulate(
        &mut self,
        config: &ModelConfig,
        params: &[f32],
        data: DatasetView,
        pass: Pass,
    ) -> Result<()> {
        self.ev.forward(config, params, data.inputs)?;
        match pass {
            Pass::Loss => {
                self.totals.loss += output_loss(config, params, self.ev.output(), &data, None)?;
                return Ok(());
            }
            Pass::GradientAndRank => {
                let (agg, main) = self.ev.caches();
                self.totals.rank_loss += rank_loss(agg) + rank_loss(main);
            }
            Pass::Gradient => {}
        }

        let dims = config.dims();
        self.d_out = mem::take(&mut self.d_out).into_reshape(self.ev.output().dim());
        self.d_out.fill(0.);

        let Totals {
            loss,
            grad,
            usage,
            active,
            ..
        } = &mut self.totals;
        let (inner_usage, out_usage) = usage.split_at_mut(dims.ane + dims.mne);

        *loss += output_loss(
            config,
            params,
            self.ev.output(),
            &data,
            Some(OutputGrads {
                d_out: &mut self.d_out,
                grad: &mut grad[..],
                usage: out_usage,
            }),
        )?;
        self.ev.backward(
            config,
            params,
            data.inputs,
            self.d_out.view(),
            &mut grad[..],
            inner_usage,
            &mut active[..],
        )
    }
}

/// Evaluates every chunk of a batch on its own thread of the current pool.
///
/// # Arguments
/// * `config` - The model configuration.
/// * `params` - The whole model vector, read only while the workers run.
/// * `data` - The batch.
/// * `plan` - The chunks of the batch.
/// * `partials` - One scratch per chunk at least, each is cleared first.
/// * `pass` - What to compute besides the loss.
pub fn batch_totals(
    config: &ModelConfig,
    params: &[f32],
    data: DatasetView,
    plan: &BatchPlan,
    partials: &mut [Partial],
    pass: Pass,
) -> Result<()> {
    plan.chunks()
        .par_iter()
        .zip(partials.par_iter_mut())
        .map(|(chunk, partial)| {
            partial.totals.clear();
            let block = data.slice(chunk.samples.clone(), chunk.rows.clone());
            partial.accumulate(config, params, block, pass)
        })
        .collect()
}

/// Total loss of a model over a dataset, in normalized target space.
///
/// # Returns
/// The summed weighted squared error plus the categorical terms.
pub fn model_loss(config: &ModelConfig, model: &Model, data: &Dataset) -> Result<f64> {
    check_shape(config, model, data)?;

    let mut partial = Partial::new(config);
    partial.accumulate(config, model.as_slice(), data.view(), Pass::Loss)?;
    Ok(partial.totals.loss)
}

/// Total loss of a model over a dataset and its gradient over the trainable values.
///
/// # Returns
/// The loss of `model_loss` and the unscaled gradient of it.
pub fn model_gradient(
    config: &ModelConfig,
    model: &Model,
    data: &Dataset,
) -> Result<(f64, Vec<f32>)> {
    check_shape(config, model, data)?;

    let mut partial = Partial::new(config);
    partial.accumulate(config, model.as_slice(), data.view(), Pass::Gradient)?;
    let Totals { loss, grad, .. } = partial.totals;
    Ok((loss, grad))
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::{
        config::{ModelDims, TrainingParams, new_model_config},
        data::{Inputs, plan_batches},
        model::init_model,
    };

    fn config() -> ModelConfig {
        let dims = ModelDims {
            adn: 1,
            mdn: 1,
            mdo: 1,
            ane: Some(3),
            ads: Some(4),
            ans: Some(1),
            ado: Some(2),
            mds: Some(4),
            mns: Some(1),
            ..Default::default()
        };
        new_model_config(&dims, TrainingParams::default()).unwrap()
    }

    fn dataset() -> Dataset {
        let inputs = Inputs::new(
            array![[0.5], [-1.], [2.], [0.], [1.5], [-0.5]],
            array![[1], [2], [3], [1], [0], [2]],
            vec![1, 2, 0, 3],
            array![[0.1], [0.2], [-0.3], [0.4]],
            Array2::zeros((4, 0)),
        );
        Dataset::new(inputs, array![[1.], [0.], [-1.], [2.]])
    }

    #[test]
    fn threaded_totals_match_a_single_pass() {
        let config = config();
        let model = init_model(&config, Some(5), None, None).unwrap();
        let data = dataset();
        let (loss, grad) = model_gradient(&config, &model, &data).unwrap();

        let plan = plan_batches(&data.inputs.sizes, 3);
        let mut partials = vec![Partial::new(&config); plan.len()];
        batch_totals(
            &config,
            model.as_slice(),
            data.view(),
            &plan,
            &mut partials,
            Pass::Gradient,
        )
        .unwrap();
        let mut merged = Totals::new(&config);
        merged.merge(partials.iter().map(|p| &p.totals));

        assert!((merged.loss - loss).abs() < 1e-5 * (1. + loss.abs()));
        for (a, b) in merged.grad.iter().zip(&grad) {
            assert!((a - b).abs() < 1e-4 * (1. + b.abs()));
        }
        assert_eq!(merged.usage[..3], [2, 2, 1]);
    }

    #[test]
    fn unused_embedding_rows_get_no_gradient() {
        let config = config();
        let model = init_model(&config, Some(5), None, None).unwrap();
        let mut data = dataset();
        data.inputs.axi.mapv_inplace(|i| if i == 3 { 0 } else { i });

        let (_, grad) = model_gradient(&config, &model, &data).unwrap();
        let table = config.layout().a_emb.clone();
        let width = config.dims().ade;
        let row = &grad[table.start + 2 * width..table.start + 3 * width];
        assert!(row.iter().all(|&g| g == 0.));
    }
}
