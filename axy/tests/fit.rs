use axy::{
    AxyErr, Dataset, Inputs, Model, ModelConfig, ModelDims, Notice, StopReason, TrainingParams,
    WorkBuffers, config::NetLayout, evaluate, fit_model, init_model, model_gradient, model_loss,
    new_fit_config, new_model_config, training::MAX_RETRIES,
};
use ndarray::{Array2, array};
use rand::{Rng, SeedableRng, rngs::StdRng};

fn fit_config(dims: &ModelDims, params: TrainingParams, data: &Dataset) -> ModelConfig {
    let config = new_model_config(dims, params).unwrap();
    new_fit_config(&config, data.nm(), data.na()).unwrap()
}

fn line(nm: usize) -> Dataset {
    let x = Array2::from_shape_fn((nm, 1), |(i, _)| -1. + 2. * i as f32 / (nm - 1) as f32);
    let y = x.mapv(|v| 2. * v);
    Dataset::new(Inputs::from_x(x), y)
}

#[test]
fn gradient_matches_finite_differences() {
    let dims = ModelDims {
        adn: 2,
        mdn: 2,
        mdo: 1,
        ane: Some(3),
        mne: Some(2),
        ads: Some(4),
        ans: Some(1),
        ado: Some(2),
        mds: Some(4),
        mns: Some(1),
        ..Default::default()
    };
    let params = TrainingParams {
        discontinuity: 0.5,
        ..Default::default()
    };
    let config = new_model_config(&dims, params).unwrap();
    let model = init_model(&config, Some(21), None, None).unwrap();

    let inputs = Inputs::new(
        array![[0.5, -1.], [1., 0.25], [-0.5, 2.], [0., 1.], [1.5, -0.5]],
        array![[1], [3], [2], [0], [1]],
        vec![2, 1, 2],
        array![[0.2, -0.1], [1., 0.5], [-0.7, 0.3]],
        array![[1], [2], [1]],
    );
    let data = Dataset::new(inputs, array![[1.], [-0.5], [0.25]]);

    let (loss, grad) = model_gradient(&config, &model, &data).unwrap();
    assert!((loss - model_loss(&config, &model, &data).unwrap()).abs() < 1e-9);

    let mut rng = StdRng::seed_from_u64(3);
    let eps = 1e-2f32;
    for _ in 0..4 {
        let dir: Vec<f32> = (0..config.num_vars())
            .map(|_| rng.random_range(-1f32..1.))
            .collect();
        let moved = |sign: f32| {
            let mut m = model.clone();
            for (p, d) in m.as_mut_slice().iter_mut().zip(&dir) {
                *p += sign * eps * d;
            }
            model_loss(&config, &m, &data).unwrap()
        };

        let numeric = (moved(1.) - moved(-1.)) / (2. * eps as f64);
        let analytic: f64 = grad.iter().zip(&dir).map(|(g, d)| (g * d) as f64).sum();
        let scale = numeric.abs().max(analytic.abs()).max(1e-3);
        assert!(
            (numeric - analytic).abs() / scale < 2e-2,
            "numeric {numeric} vs analytic {analytic}"
        );
    }
}

/// Moves the first layer hinges of `net` far enough that every neuron stays active for
/// inputs bounded by `bound`, returning the largest activation of each neuron.
fn keep_active(model: &mut Model, net: &NetLayout, bound: f32) -> Vec<f32> {
    let w = model.block(&net.in_w).to_vec();
    let shifts: Vec<f32> = (0..net.state)
        .map(|j| {
            let reach: f32 = (0..net.input).map(|i| w[i * net.state + j].abs()).sum();
            reach * bound + 1.
        })
        .collect();
    model.block_mut(&net.in_s).copy_from_slice(&shifts);
    shifts.iter().map(|s| 2. * s - 1.).collect()
}

#[test]
fn every_partial_derivative_matches_central_differences() {
    let dims = ModelDims {
        adn: 2,
        mdn: 2,
        mdo: 1,
        ads: Some(4),
        ans: Some(1),
        ado: Some(2),
        mds: Some(4),
        mns: Some(1),
        ..Default::default()
    };
    let config = new_model_config(&dims, TrainingParams::default()).unwrap();
    let layout = config.layout();
    let mut model = init_model(&config, Some(4), None, None).unwrap();

    let inputs = Inputs::new(
        array![[0.5, -1.], [1., 0.25], [-0.5, 2.], [0., 1.], [1.5, -0.5]],
        Array2::zeros((5, 0)),
        vec![2, 1, 2],
        array![[0.2, -0.1], [1., 0.5], [-0.7, 0.3]],
        Array2::zeros((3, 0)),
    );
    let ax_bound = inputs.ax.iter().fold(0f32, |m, v| m.max(v.abs()));
    let x_bound = inputs.x.iter().fold(0f32, |m, v| m.max(v.abs()));
    let data = Dataset::new(inputs, array![[1.], [-0.5], [0.25]]);

    // Every hinge sits on its linear side, so the loss is quadratic along each value.
    let peaks = keep_active(&mut model, &layout.agg, ax_bound);
    let out_w = model.block(&layout.agg.out_w);
    let summary_bound = (0..layout.agg.output)
        .map(|k| {
            peaks
                .iter()
                .enumerate()
                .map(|(j, p)| out_w[j * layout.agg.output + k].abs() * p)
                .sum::<f32>()
        })
        .fold(0f32, f32::max);
    keep_active(&mut model, &layout.main, x_bound.max(summary_bound));

    let (_, grad) = model_gradient(&config, &model, &data).unwrap();
    let h = 1e-2f32;
    let (mut err, mut size) = (0f64, 0f64);
    for p in 0..config.num_vars() {
        let v = model.as_slice()[p];
        let mut moved = model.clone();
        moved.as_mut_slice()[p] = v + h;
        let up = model_loss(&config, &moved, &data).unwrap();
        moved.as_mut_slice()[p] = v - h;
        let down = model_loss(&config, &moved, &data).unwrap();

        let numeric = (up - down) / ((v + h) as f64 - (v - h) as f64);
        err += (numeric - grad[p] as f64).powi(2);
        size += numeric.powi(2);
    }
    assert!(size > 0.);
    assert!(
        err.sqrt() < 1e-3 * size.sqrt(),
        "relative error {}",
        err.sqrt() / size.sqrt()
    );
}

#[test]
fn fits_four_points_on_a_line() {
    let x = array![[0.], [1.], [2.], [3.]];
    let y = x.mapv(|v: f32| 2. * v);
    let data = Dataset::new(Inputs::from_x(x), y);
    let dims = ModelDims {
        mdn: 1,
        mdo: 1,
        ..Default::default()
    };
    let params = TrainingParams {
        seed: Some(1),
        ..Default::default()
    };
    let config = fit_config(&dims, params, &data);
    let mut model = init_model(&config, Some(1), None, None).unwrap();
    let mut work = WorkBuffers::new(&config).unwrap();

    let outcome = fit_model(&config, &mut model, &mut work, &data, 500, false, false).unwrap();
    assert!(outcome.mse < 1e-2, "mse {}", outcome.mse);
}

#[test]
fn fits_a_line() {
    let data = line(64);
    let dims = ModelDims {
        mdn: 1,
        mdo: 1,
        num_threads: Some(2),
        ..Default::default()
    };
    let params = TrainingParams {
        seed: Some(7),
        early_stop: false,
        ..Default::default()
    };
    let config = fit_config(&dims, params, &data);
    let mut model = init_model(&config, Some(7), None, None).unwrap();
    let mut work = WorkBuffers::new(&config).unwrap();

    let outcome = fit_model(&config, &mut model, &mut work, &data, 500, true, false).unwrap();
    let record = outcome.record.as_ref().unwrap();

    assert_eq!(outcome.stop, StopReason::Completed);
    assert_eq!(outcome.steps_run, 500);
    assert_eq!(record.len(), 500);
    assert!(outcome.mse < 0.05, "mse {}", outcome.mse);
    assert!(outcome.mse < 0.1 * record.steps[0].mse);

    let predictions = evaluate(&config, &model, &data.inputs).unwrap();
    let mae = (&predictions.y - &data.y).mapv(f32::abs).mean().unwrap();
    assert!(mae < 0.5, "mean absolute error {mae}");
}

#[test]
fn interrupted_fits_continue_where_they_stopped() {
    let data = line(16);
    let dims = ModelDims {
        mdn: 1,
        mdo: 1,
        mds: Some(4),
        mns: Some(1),
        num_threads: Some(1),
        ..Default::default()
    };
    let params = TrainingParams {
        interrupt_delay_sec: Some(0),
        seed: Some(1),
        ..Default::default()
    };
    let config = fit_config(&dims, params, &data);
    let mut model = init_model(&config, Some(1), None, None).unwrap();
    let mut work = WorkBuffers::new(&config).unwrap();

    let first = fit_model(&config, &mut model, &mut work, &data, 100, false, false).unwrap();
    assert_eq!(first.stop, StopReason::Interrupted);
    assert_eq!(first.steps_run, 1);
    assert_eq!(work.state().steps_taken, 1);
    assert!(first.record.is_none());

    fit_model(&config, &mut model, &mut work, &data, 100, false, true).unwrap();
    assert_eq!(work.state().steps_taken, 2);

    fit_model(&config, &mut model, &mut work, &data, 100, false, false).unwrap();
    assert_eq!(work.state().steps_taken, 1);
}

#[test]
fn overflowing_loss_before_any_step_diverges() {
    let x = array![[0.], [1.], [2.]];
    let data = Dataset::new(Inputs::from_x(x), array![[1e30], [-1e30], [1e30]]);
    let dims = ModelDims {
        mdn: 1,
        mdo: 1,
        mds: Some(2),
        mns: Some(1),
        ..Default::default()
    };
    let params = TrainingParams {
        normalize: false,
        ..Default::default()
    };
    let config = fit_config(&dims, params, &data);
    let mut model = init_model(&config, Some(2), None, None).unwrap();
    let mut work = WorkBuffers::new(&config).unwrap();

    let err = fit_model(&config, &mut model, &mut work, &data, 10, false, false).unwrap_err();
    assert!(matches!(err, AxyErr::Divergence { step: 0, .. }));
    assert_eq!(err.info(), 6);
}

#[test]
fn mismatched_work_buffers_are_rejected() {
    let data = line(8);
    let dims = ModelDims {
        mdn: 1,
        mdo: 1,
        ..Default::default()
    };
    let config = fit_config(&dims, TrainingParams::default(), &data);
    let other = new_fit_config(&config, 4, 0).unwrap();
    let mut model = init_model(&config, Some(3), None, None).unwrap();
    let mut work = WorkBuffers::new(&other).unwrap();

    let err = fit_model(&config, &mut model, &mut work, &data, 1, false, false).unwrap_err();
    assert!(err.is_shape_error());

    let unfitted = new_model_config(&dims, TrainingParams::default()).unwrap();
    let err = fit_model(&unfitted, &mut model, &mut work, &data, 1, false, false).unwrap_err();
    assert_eq!(err, AxyErr::MissingFitConfig);
}

#[test]
fn continuing_matches_an_uninterrupted_fit() {
    let data = line(16);
    let dims = ModelDims {
        mdn: 1,
        mdo: 1,
        mds: Some(4),
        mns: Some(1),
        num_threads: Some(2),
        ..Default::default()
    };
    let params = TrainingParams {
        seed: Some(9),
        keep_best: false,
        early_stop: false,
        model_condition_frequency: 0,
        ..Default::default()
    };
    let config = fit_config(&dims, params, &data);
    let initial = init_model(&config, Some(9), None, None).unwrap();

    let mut straight = initial.clone();
    let mut straight_work = WorkBuffers::new(&config).unwrap();
    fit_model(&config, &mut straight, &mut straight_work, &data, 2, false, false).unwrap();

    let mut split = initial;
    let mut split_work = WorkBuffers::new(&config).unwrap();
    fit_model(&config, &mut split, &mut split_work, &data, 1, false, false).unwrap();
    fit_model(&config, &mut split, &mut split_work, &data, 1, false, true).unwrap();

    assert_eq!(split, straight);
    assert_eq!(split_work.state(), straight_work.state());
    assert_eq!(split_work.state().steps_taken, 2);
    assert_eq!(
        split_work.optimizer().moments(),
        straight_work.optimizer().moments()
    );
}

#[test]
fn overflowing_gradient_is_rejected() {
    let x = array![[1e38], [1e38]];
    let data = Dataset::new(Inputs::from_x(x), array![[4.], [4.]]);
    let dims = ModelDims {
        mdn: 1,
        mdo: 1,
        mns: Some(0),
        ..Default::default()
    };
    let params = TrainingParams {
        normalize: false,
        ..Default::default()
    };
    let config = fit_config(&dims, params, &data);
    let mut model = init_model(&config, Some(2), None, None).unwrap();
    let out_w = config.layout().main.out_w.clone();
    model.block_mut(&out_w).fill(0.);
    let before = model.clone();

    let loss = model_loss(&config, &model, &data).unwrap();
    assert!(loss.is_finite());

    let mut work = WorkBuffers::new(&config).unwrap();
    let err = fit_model(&config, &mut model, &mut work, &data, 5, false, false).unwrap_err();
    assert_eq!(err, AxyErr::Divergence { step: 0, retries: 0 });
    assert_eq!(model, before);
}

#[test]
fn exhausted_retries_restore_the_last_accepted_step() {
    let data = line(16);
    let dims = ModelDims {
        mdn: 1,
        mdo: 1,
        mds: Some(4),
        mns: Some(1),
        num_threads: Some(1),
        ..Default::default()
    };
    let defaults = TrainingParams::default();
    let params = TrainingParams {
        seed: Some(3),
        mse_upper_limit: 1e-30,
        step_factor: defaults.min_step_factor,
        early_stop: false,
        ..defaults
    };
    let config = fit_config(&dims, params, &data);
    let initial = init_model(&config, Some(3), None, None).unwrap();

    let mut normalized = initial.clone();
    let mut fresh = WorkBuffers::new(&config).unwrap();
    fit_model(&config, &mut normalized, &mut fresh, &data, 0, false, false).unwrap();

    let mut model = initial;
    let mut work = WorkBuffers::new(&config).unwrap();
    let err = fit_model(&config, &mut model, &mut work, &data, 50, false, false).unwrap_err();

    assert!(matches!(
        err,
        AxyErr::Divergence { retries, .. } if retries == MAX_RETRIES + 1
    ));
    assert_eq!(work.state().step_factor, config.params().min_step_factor);
    assert_eq!(model, normalized);
    assert_eq!(work.optimizer().moments(), fresh.optimizer().moments());
}

#[test]
fn dependent_neurons_raise_a_rank_notice() {
    let x = Array2::from_shape_fn((16, 2), |(i, j)| {
        if j == 0 {
            -2. + (i % 4) as f32 * 4. / 3.
        } else {
            -2. + (i / 4) as f32 * 4. / 3.
        }
    });
    let y = x.column(0).to_owned().insert_axis(ndarray::Axis(1));
    let data = Dataset::new(Inputs::from_x(x), y);
    let dims = ModelDims {
        mdn: 2,
        mdo: 1,
        mds: Some(4),
        mns: Some(1),
        num_threads: Some(1),
        ..Default::default()
    };

    let run = |rank_check_frequency: usize| {
        let params = TrainingParams {
            normalize: false,
            model_condition_frequency: 0,
            rank_check_frequency,
            seed: Some(5),
            ..Default::default()
        };
        let config = fit_config(&dims, params, &data);
        let mut model = init_model(&config, Some(5), None, None).unwrap();
        // Four always active neurons over two inputs span at most three directions.
        let shifts = config.layout().main.in_s.clone();
        model.block_mut(&shifts).fill(10.);
        let mut work = WorkBuffers::new(&config).unwrap();
        fit_model(&config, &mut model, &mut work, &data, 1, false, false)
            .unwrap()
            .notices
    };

    let checked = run(1);
    assert!(checked.iter().any(|n| matches!(n, Notice::RankDeficiency { neurons } if *neurons >= 1)));

    let unchecked = run(0);
    assert!(
        !unchecked
            .iter()
            .any(|n| matches!(n, Notice::RankDeficiency { .. }))
    );
}
