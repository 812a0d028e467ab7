use log::debug;
use rand::{SeedableRng, rngs::StdRng};

use super::{EvenSpread, FixedValue, Model, ParamGen, Sampled};
use crate::{
    config::{ModelConfig, NetLayout},
    error::{AxyErr, Result},
};

/// Default half width of the interval the hinge shifts are spread over.
pub const DEFAULT_SHIFT_RANGE: f32 = 1.;
/// Default magnitude of the output layer weights.
pub const DEFAULT_OUTPUT_SCALE: f32 = 0.1;

/// Scales every column of a row-major `rows × cols` block to unit length.
fn unit_columns(block: &mut [f32], rows: usize, cols: usize) {
    for c in 0..cols {
        let norm = (0..rows)
            .map(|r| block[r * cols + c].powi(2))
            .sum::<f32>()
            .sqrt();
        if norm > 0. {
            (0..rows).for_each(|r| block[r * cols + c] /= norm);
        }
    }
}

fn init_net(
    params: &mut [f32],
    net: &NetLayout,
    rng: &mut StdRng,
    shift_range: f32,
    output_scale: f32,
) -> Result<()> {
    for l in 0..net.layers {
        let weights = &mut params[net.layer_weights(l)];
        Sampled::normal(rng, 0., 1.)?.fill(weights);
        unit_columns(weights, net.width_into(l), net.state);

        EvenSpread::new(-shift_range, shift_range, net.state)
            .fill(&mut params[net.layer_shifts(l)]);
    }

    let out_w = &mut params[net.out_w.clone()];
    if output_scale > 0. {
        Sampled::uniform(rng, -output_scale, output_scale)?.fill(out_w);
    } else {
        FixedValue(0.).fill(out_w);
    }

    Ok(())
}

/// Creates the initial parameters of a model.
///
/// Internal neurons get random unit directions with their hinges evenly spread over
/// `[-initial_shift_range, initial_shift_range]`, embeddings are uniform in `[-1, 1)` and
/// output weights uniform in `[-initial_output_scale, initial_output_scale)`. The
/// normalization block starts as the identity transform.
///
/// # Arguments
/// * `config` - The model configuration.
/// * `seed` - Seed of the random generator, drawn from the OS when absent.
/// * `initial_shift_range` - Defaults to `DEFAULT_SHIFT_RANGE`.
/// * `initial_output_scale` - Defaults to `DEFAULT_OUTPUT_SCALE`.
///
/// # Returns
/// The new model or a `Config` error for negative or non-finite knobs.
pub fn init_model(
    config: &ModelConfig,
    seed: Option<u64>,
    initial_shift_range: Option<f32>,
    initial_output_scale: Option<f32>,
) -> Result<Model> {
    let shift_range = initial_shift_range.unwrap_or(DEFAULT_SHIFT_RANGE);
    let output_scale = initial_output_scale.unwrap_or(DEFAULT_OUTPUT_SCALE);
    if !(shift_range.is_finite() && shift_range >= 0.) {
        return Err(AxyErr::config("initial_shift_range", format!("{shift_range}")));
    }
    if !(output_scale.is_finite() && output_scale >= 0.) {
        return Err(AxyErr::config("initial_output_scale", format!("{output_scale}")));
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut model = Model::zeros(config);
    let layout = config.layout();
    let params = model.as_mut_slice();

    for (table, _) in layout.embedding_tables(config.dims()) {
        if !table.is_empty() {
            Sampled::uniform(&mut rng, -1., 1.)?.fill(&mut params[table]);
        }
    }
    init_net(params, &layout.agg, &mut rng, shift_range, output_scale)?;
    init_net(params, &layout.main, &mut rng, shift_range, output_scale)?;

    debug!(total_size = model.len(); "model initialized");
    Ok(model)
}
