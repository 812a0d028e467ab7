use std::{
    ops::Range,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use rand::{SeedableRng, rngs::StdRng};
use rayon::ThreadPoolBuilder;
use serde::Serialize;

use super::{
    FitRecord, Optimizer, Pass, RecordEntry, WorkBuffers, batch_totals, condition_model,
};
use crate::{
    config::ModelConfig,
    data::{Dataset, check_shape, plan_batches, select_samples},
    error::{AxyErr, Notice, Result},
    model::Model,
    normalize::{normalize_data, renormalize},
};

/// Consecutive rejected steps tolerated before the fit is declared divergent.
pub const MAX_RETRIES: usize = 8;

/// Why a fit call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every requested step ran.
    Completed,
    /// The error stopped improving.
    EarlyStop,
    /// The wall clock deadline passed.
    Interrupted,
}

/// The result of one `fit_model` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    /// Total loss of the returned model over the whole dataset, in normalized target space.
    pub sse: f64,
    /// `sse` divided by the number of target values.
    pub mse: f32,
    pub record: Option<FitRecord>,
    pub notices: Vec<Notice>,
    pub steps_run: usize,
    pub stop: StopReason,
}

/// Target values per sample, the denominator of the mean squared error.
fn outputs_per_sample(config: &ModelConfig) -> usize {
    let dims = config.dims();
    (dims.mdo + dims.noc).max(1)
}

/// Whether a periodic task with the given frequency runs at `step`, 0 never runs.
fn due(frequency: usize, step: usize) -> bool {
    frequency > 0 && step % frequency == 0
}

/// Rows of the trainable vector belonging to embedding rows the batch never used.
fn unused_rows<'a>(
    config: &'a ModelConfig,
    usage: &'a [u32],
) -> impl Iterator<Item = Range<usize>> + 'a {
    let mut at = 0;
    config
        .layout()
        .embedding_tables(config.dims())
        .into_iter()
        .flat_map(move |(table, width)| {
            let rows = if width == 0 { 0 } else { table.len() / width };
            let first = at;
            at += rows;
            (0..rows)
                .filter(move |r| usage[first + r] == 0)
                .map(move |r| {
                    let start = table.start + r * width;
                    start..start + width
                })
        })
}

fn norm<'a>(values: impl IntoIterator<Item = &'a f32>) -> f32 {
    values
        .into_iter()
        .map(|&v| (v as f64).powi(2))
        .sum::<f64>()
        .sqrt() as f32
}

fn log_grad_norms(config: &ModelConfig, grad: &[f32], step: usize) {
    for (block, range) in config.layout().blocks() {
        if range.is_empty() || range.end > grad.len() {
            continue;
        }
        info!(step = step, block = block, norm = norm(&grad[range]); "gradient norm");
    }
}

/// Fits a model to a dataset.
///
/// Each step fetches a batch, refreshes the data statistics when due, evaluates the
/// batch's loss and gradient over a fixed pool of `num_threads` workers, adapts the step
/// factor and moves the model. Non-finite losses or gradients and exploding errors
/// restore the previous model and optimizer moments and halve the step factor.
///
/// # Arguments
/// * `config` - A configuration extended by `new_fit_config` for `data`.
/// * `model` - The model to fit, updated in place.
/// * `work` - The work buffers of `config`.
/// * `data` - The dataset.
/// * `steps` - Maximum number of steps.
/// * `record` - Whether to record the per step history.
/// * `continuing` - Resume from the state in `work` instead of starting over.
///
/// # Returns
/// The outcome of the fit, or a fatal error. A divergence leaves the last accepted model
/// in `model`.
pub fn fit_model(
    config: &ModelConfig,
    model: &mut Model,
    work: &mut WorkBuffers,
    data: &Dataset,
    steps: usize,
    record: bool,
    continuing: bool,
) -> Result<FitOutcome> {
    check_shape(config, model, data)?;
    let fit = *config.fit()?;
    if fit.nm != data.nm() {
        return Err(AxyErr::SizeMismatch {
            a: "dataset samples",
            b: "fit configuration",
            got: data.nm(),
            expected: fit.nm,
        });
    }
    if fit.na != data.na() {
        return Err(AxyErr::SizeMismatch {
            a: "dataset aggregate rows",
            b: "fit configuration",
            got: data.na(),
            expected: fit.na,
        });
    }
    work.check(&fit)?;

    let params = config.params();
    let mut notices = Vec::new();
    if !continuing {
        work.reset(params);
        if params.normalize {
            notices.extend(normalize_data(config, model, data.view())?.notices);
        } else if config.dims().has_aggregator() {
            for (sample, _) in data.inputs.sizes.iter().enumerate().filter(|(_, s)| **s == 0) {
                notices.push(Notice::EmptyAggregate { sample });
            }
        }
    }

    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(work.state.steps_taken as u64)),
        None => StdRng::from_os_rng(),
    };
    let pool = ThreadPoolBuilder::new()
        .num_threads(fit.num_threads)
        .build()?;

    let start = Instant::now();
    let deadline = params.interrupt_delay_sec.map(Duration::from_secs);
    let shuffle_sets = params.partial_aggregation && !params.ordered_aggregation;
    let outputs = outputs_per_sample(config);
    let nv = config.num_vars();
    let mut history = record.then(FitRecord::default);
    let mut stop = StopReason::Completed;
    let mut steps_run = 0;
    let mut deficient = 0;

    info!(steps = steps, nm = fit.nm, batch = fit.batch, continuing = continuing; "fit started");

    while steps_run < steps {
        let step = work.state.steps_taken;
        let batch: &Dataset = if fit.nm > fit.batch {
            let samples = select_samples(
                &mut work.samples,
                fit.batch,
                params.reshuffle,
                &mut work.state.cursor,
                &mut rng,
            );
            work.batch.gather(data, samples, shuffle_sets.then_some(&mut rng))
        } else if shuffle_sets {
            work.batch.gather(data, &work.samples, Some(&mut rng))
        } else {
            data
        };
        let view = batch.view();
        let nm = view.nm();

        if params.normalize && step > 0 && due(params.data_condition_frequency, step) {
            renormalize(config, model, view.inputs)?;
        }

        let pass = if due(params.rank_check_frequency, step) {
            Pass::GradientAndRank
        } else {
            Pass::Gradient
        };
        let plan = plan_batches(view.inputs.sizes, fit.num_threads);
        pool.install(|| {
            batch_totals(config, model.as_slice(), view, &plan, &mut work.partials, pass)
        })?;
        work.merged
            .merge(work.partials[..plan.len()].iter().map(|p| &p.totals));

        let mse = (work.merged.loss / (nm * outputs) as f64) as f32;
        let lost = work.merged.dead_neurons().max(work.merged.rank_loss);
        if lost > 0 {
            debug!(
                step = step,
                dead = work.merged.dead_neurons(),
                dependent = work.merged.rank_loss;
                "internal layers lost rank"
            );
            deficient = deficient.max(lost);
        }

        let finite = mse.is_finite() && work.merged.grad.iter().all(|g| g.is_finite());
        let state = &mut work.state;
        let rejected = !finite || (state.accepted && mse > params.mse_upper_limit);
        if rejected {
            if !state.accepted {
                return Err(AxyErr::Divergence {
                    step,
                    retries: state.retries,
                });
            }
            model.as_mut_slice().copy_from_slice(&work.previous);
            work.optimizer.restore(&work.saved);
            state.retries += 1;
            if state.retries > MAX_RETRIES {
                return Err(AxyErr::Divergence {
                    step,
                    retries: state.retries,
                });
            }
            state.step_factor = (state.step_factor * 0.5)
                .clamp(params.min_step_factor, params.max_step_factor);
            warn!(
                step = step,
                mse = mse,
                retries = state.retries,
                step_factor = state.step_factor;
                "step rejected, retrying from the previous model"
            );
        } else {
            state.retries = 0;
            if mse < state.best_mse {
                state.best_mse = mse;
                state.stall = 0;
                work.best.copy_from_slice(model.as_slice());
            } else {
                state.stall += 1;
            }

            if let Some(prev) = state.prev_mse {
                if mse < prev {
                    state.decreasing += 1;
                    if state.decreasing >= 2 {
                        state.step_factor *= params.faster_rate;
                    }
                    state.update_ratio = (state.update_ratio + params.update_ratio_step).min(1.);
                } else if mse > prev {
                    state.decreasing = 0;
                    state.step_factor *= params.slower_rate;
                    state.update_ratio = (state.update_ratio - params.update_ratio_step)
                        .max(params.min_update_ratio);
                }
            }
            state.step_factor = state
                .step_factor
                .clamp(params.min_step_factor, params.max_step_factor);
            state.prev_mse = Some(mse);

            let scale = 1. / nm as f32;
            work.merged.grad.iter_mut().for_each(|g| *g *= scale);
            if due(params.log_grad_norm_frequency, step) {
                log_grad_norms(config, &work.merged.grad, step);
            }

            work.previous.copy_from_slice(model.as_slice());
            work.saved.copy_from(work.optimizer.moments());
            let limit = ((state.update_ratio * nv as f32).ceil() as usize)
                .min(params.num_to_update.unwrap_or(nv));
            work.optimizer
                .freeze(unused_rows(config, &work.merged.usage));
            work.optimizer.set_step_factor(state.step_factor);
            work.optimizer.set_update_limit(limit);
            work.optimizer
                .update_params(&work.merged.grad, model.as_mut_slice())?;
            state.accepted = true;

            let frequency = params.model_condition_frequency;
            if frequency > 0 && (step + 1) % frequency == 0 {
                let report = condition_model(config, model, view.inputs, &mut rng)?;
                work.optimizer.restart(report.restarted.iter().copied());
                if report.total() > 0 {
                    warn!(step = step, repaired = report.total(); "neurons repaired");
                }
                state.last_repairs = report.total();
            }

            if let Some(history) = history.as_mut() {
                let layout = config.layout();
                let emb = [&layout.a_emb, &layout.m_emb, &layout.o_emb]
                    .into_iter()
                    .flat_map(|r| &work.merged.grad[r.clone()]);
                history.push(RecordEntry {
                    mse,
                    step_factor: state.step_factor,
                    grad_norm: norm(&work.merged.grad),
                    curvature: work.optimizer.curvature(),
                    emb_grad_norm: norm(emb),
                    repaired: state.last_repairs,
                });
            }

            debug!(
                step = step,
                mse = mse,
                step_factor = state.step_factor;
                "step"
            );
        }

        state.steps_taken += 1;
        steps_run += 1;

        if params.early_stop && state.stall >= params.min_steps_to_stability {
            info!(step = state.steps_taken, best_mse = state.best_mse; "error stopped improving");
            stop = StopReason::EarlyStop;
            break;
        }
        if deadline.is_some_and(|d| start.elapsed() >= d) {
            info!(step = state.steps_taken; "fit interrupted");
            stop = StopReason::Interrupted;
            break;
        }
    }

    if params.keep_best && work.state.best_mse.is_finite() {
        model.as_mut_slice().copy_from_slice(&work.best);
    }
    if deficient > 0 {
        warn!(neurons = deficient; "internal neurons inactive or dependent during the fit");
        notices.push(Notice::RankDeficiency {
            neurons: deficient,
        });
    }

    let plan = plan_batches(&data.inputs.sizes, fit.num_threads);
    pool.install(|| {
        batch_totals(config, model.as_slice(), data.view(), &plan, &mut work.partials, Pass::Loss)
    })?;
    let sse: f64 = work.partials[..plan.len()].iter().map(|p| p.totals.loss).sum();
    let mse = (sse / (fit.nm * outputs) as f64) as f32;

    info!(steps_run = steps_run, mse = mse; "fit finished: {stop:?}");
    Ok(FitOutcome {
        sse,
        mse,
        record: history,
        notices,
        steps_run,
        stop,
    })
}
