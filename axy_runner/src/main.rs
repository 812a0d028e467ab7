mod spec;

use std::{env, fs};

use anyhow::{Context, Result};
use axy::{
    FitRecord, StopReason, WorkBuffers, check_shape, evaluate, fit_model, init_model,
    new_fit_config, new_model_config, notice_mask,
};
use log::info;
use serde::Serialize;

use spec::RunSpec;

#[derive(Serialize)]
struct Summary {
    steps_run: usize,
    stop: StopReason,
    sse: f64,
    mse: f32,
    notices: Vec<i32>,
    notice_mask: u32,
    num_vars: usize,
    total_size: usize,
    predictions: Vec<Vec<f32>>,
    categories: Vec<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<FitRecord>,
}

fn main() -> Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .context("usage: axy_runner <run.json>")?;
    let text = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let run: RunSpec = serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;

    let data = run.data.to_dataset()?;
    let config = new_model_config(&run.dims, run.params)?;
    let config = new_fit_config(&config, data.nm(), data.na())?;
    let mut model = init_model(
        &config,
        run.model_seed,
        run.initial_shift_range,
        run.initial_output_scale,
    )?;
    check_shape(&config, &model, &data)?;
    info!(nm = data.nm(), na = data.na(); "dataset loaded from {path}");

    let mut work = WorkBuffers::new(&config)?;
    let outcome = fit_model(&config, &mut model, &mut work, &data, run.steps, run.record, false)?;
    let predictions = evaluate(&config, &model, &data.inputs)?;

    let summary = Summary {
        steps_run: outcome.steps_run,
        stop: outcome.stop,
        sse: outcome.sse,
        mse: outcome.mse,
        notices: outcome.notices.iter().map(|n| n.code()).collect(),
        notice_mask: notice_mask(&outcome.notices),
        num_vars: config.num_vars(),
        total_size: config.total_size(),
        predictions: predictions.y.rows().into_iter().map(|r| r.to_vec()).collect(),
        categories: predictions.yi.rows().into_iter().map(|r| r.to_vec()).collect(),
        record: outcome.record,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
