use log::debug;
use ndarray::{concatenate, prelude::*};
use rayon::{ThreadPoolBuilder, prelude::*};

use crate::{
    arch::{Evaluation, loss::CategoryMargin, network::matrix},
    config::ModelConfig,
    data::{Inputs, InputsView, check_inputs, plan_batches},
    error::{AxyErr, Result},
    model::Model,
};

/// Model outputs in the units of the training targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    /// Numeric outputs, `nm × mdo`.
    pub y: Array2<f32>,
    /// 1-based best scoring category of every categorical output, `nm × noc`.
    pub yi: Array2<i64>,
}

/// Decodes one block of main network outputs.
fn decode(config: &ModelConfig, params: &[f32], out: ArrayView2<f32>) -> Result<Predictions> {
    let dims = config.dims();
    let layout = config.layout();
    let shift = &params[layout.y_shift.clone()];
    let rescale = &params[layout.y_rescale.clone()];

    let mut y = out.slice(s![.., ..dims.mdo]).to_owned();
    for (mut col, (&shift, &rescale)) in y.columns_mut().into_iter().zip(shift.iter().zip(rescale)) {
        let inv = if rescale != 0. { 1. / rescale } else { 1. };
        col.mapv_inplace(|p| p * inv + shift);
    }

    let mut yi = Array2::zeros((out.nrows(), dims.noc));
    if dims.noc > 0 {
        let table = matrix(&params[layout.o_emb.clone()], dims.noe, dims.doe)?;
        for (o, mut labels) in out.rows().into_iter().zip(yi.rows_mut()) {
            for (c, label) in labels.iter_mut().enumerate() {
                let start = dims.mdo + c * dims.doe;
                *label = CategoryMargin::predict(o.slice(s![start..start + dims.doe]), table);
            }
        }
    }

    Ok(Predictions { y, yi })
}

fn evaluate_block(config: &ModelConfig, params: &[f32], inputs: InputsView) -> Result<Predictions> {
    let mut ev = Evaluation::default();
    ev.forward(config, params, inputs)?;
    decode(config, params, ev.output())
}

/// Evaluates a model over the given inputs.
///
/// Samples are split among `num_threads` workers the same way a fit splits its batches.
///
/// # Arguments
/// * `config` - The model configuration, a fit configuration isn't required.
/// * `model` - The model to evaluate.
/// * `inputs` - The samples, targets aren't needed.
///
/// # Returns
/// The predictions of every sample in input order.
pub fn evaluate(config: &ModelConfig, model: &Model, inputs: &Inputs) -> Result<Predictions> {
    check_inputs(config, model, inputs)?;
    let dims = config.dims();
    let nm = inputs.nm();
    if nm == 0 {
        return Ok(Predictions {
            y: Array2::zeros((0, dims.mdo)),
            yi: Array2::zeros((0, dims.noc)),
        });
    }

    let threads = dims.num_threads.min(nm).max(1);
    let plan = plan_batches(&inputs.sizes, threads);
    let pool = ThreadPoolBuilder::new().num_threads(threads).build()?;
    let view = inputs.view();
    let params = model.as_slice();

    let blocks = pool.install(|| {
        plan.chunks()
            .par_iter()
            .map(|chunk| {
                let block = view.slice(chunk.samples.clone(), chunk.rows.clone());
                evaluate_block(config, params, block)
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let ys: Vec<_> = blocks.iter().map(|b| b.y.view()).collect();
    let yis: Vec<_> = blocks.iter().map(|b| b.yi.view()).collect();
    let y = concatenate(Axis(0), &ys).map_err(|_| AxyErr::SizeMismatch {
        a: "prediction blocks",
        b: "mdo",
        got: ys.len(),
        expected: dims.mdo,
    })?;
    let yi = concatenate(Axis(0), &yis).map_err(|_| AxyErr::SizeMismatch {
        a: "category blocks",
        b: "noc",
        got: yis.len(),
        expected: dims.noc,
    })?;

    debug!(samples = nm, threads = threads; "model evaluated");
    Ok(Predictions { y, yi })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ModelDims, TrainingParams, new_model_config},
        model::init_model,
    };

    #[test]
    fn threads_do_not_change_predictions() {
        let dims = ModelDims {
            adn: 1,
            mdn: 2,
            mdo: 2,
            noe: 3,
            ane: Some(2),
            ads: Some(4),
            ans: Some(1),
            mds: Some(6),
            mns: Some(2),
            num_threads: Some(1),
            ..Default::default()
        };
        let single = new_model_config(&dims, TrainingParams::default()).unwrap();
        let many = new_model_config(
            &ModelDims {
                num_threads: Some(3),
                ..dims
            },
            TrainingParams::default(),
        )
        .unwrap();
        let model = init_model(&single, Some(9), None, None).unwrap();

        let inputs = Inputs::new(
            array![[1.], [2.], [-1.], [0.5], [0.], [3.]],
            array![[1], [2], [1], [0], [2], [1]],
            vec![2, 0, 3, 1],
            array![[0.1, 0.2], [0.3, -0.4], [1., 0.], [-2., 1.]],
            Array2::zeros((4, 0)),
        );

        let a = evaluate(&single, &model, &inputs).unwrap();
        let b = evaluate(&many, &model, &inputs).unwrap();

        assert_eq!(a.y.dim(), (4, 2));
        assert_eq!(a.yi.dim(), (4, 1));
        assert!(a.yi.iter().all(|&k| (1..=3).contains(&k)));
        assert_eq!(a.yi, b.yi);
        for (p, q) in a.y.iter().zip(&b.y) {
            assert!((p - q).abs() < 1e-5 * (1. + p.abs()));
        }
    }

    #[test]
    fn empty_inputs_give_empty_predictions() {
        let dims = ModelDims {
            mdn: 1,
            mdo: 1,
            ..Default::default()
        };
        let config = new_model_config(&dims, TrainingParams::default()).unwrap();
        let model = init_model(&config, Some(1), None, None).unwrap();
        let inputs = Inputs::from_x(Array2::zeros((0, 1)));

        let p = evaluate(&config, &model, &inputs).unwrap();
        assert_eq!(p.y.dim(), (0, 1));
    }
}
