use std::ops::Range;

use crate::{
    config::TrainingParams,
    error::{AxyErr, Result},
};

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer {
    /// Updates the front of `params` using a gradient over it.
    ///
    /// # Arguments
    /// * `grad` - The mean gradient of the current batch.
    /// * `params` - The whole model vector, only its first `grad.len()` values change.
    ///
    /// # Returns
    /// An error if `grad` doesn't match the optimizer's size or exceeds `params`.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;

    /// Forgets every accumulated statistic.
    fn reset(&mut self);
}

/// Running means of the gradient and of its square, with their bias correction terms.
#[derive(Debug, Clone, PartialEq)]
pub struct Moments {
    pub mean: Box<[f32]>,
    pub curv: Box<[f32]>,
    mean_t: f32,
    curv_t: f32,
}

impl Moments {
    fn new(len: usize, initial_curv: f32) -> Self {
        Self {
            mean: vec![0.; len].into_boxed_slice(),
            curv: vec![initial_curv; len].into_boxed_slice(),
            mean_t: 1.,
            curv_t: 1.,
        }
    }

    /// Overwrites `self` with `other` without reallocating.
    pub fn copy_from(&mut self, other: &Moments) {
        self.mean.copy_from_slice(&other.mean);
        self.curv.copy_from_slice(&other.curv);
        self.mean_t = other.mean_t;
        self.curv_t = other.curv_t;
    }
}

/// A step controller tracking running means of the gradient and of its square.
///
/// Each update moves a value by `-step_factor · m̂ / √ĉ` where `m̂` and `ĉ` are the bias
/// corrected means. `ĉ` is clamped to `[min_curv, max_curv]` and each move to
/// `±max_component`. Frozen values keep both their parameter and their statistics.
/// With an update limit below the number of free values only the largest moves are
/// applied, the statistics of every free value still advance.
#[derive(Debug, Clone)]
pub struct AdaptiveStep {
    step_factor: f32,
    mean_rate: f32,
    curv_rate: f32,
    min_curv: f32,
    max_curv: f32,
    max_component: f32,
    initial_curv: f32,
    moments: Moments,
    frozen: Vec<bool>,
    update_limit: usize,
    steps: Box<[f32]>,
    magnitudes: Box<[f32]>,
    curvature: f32,
}

impl AdaptiveStep {
    /// Creates a new `AdaptiveStep` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `params` - The training hyperparameters it reads its rates and bounds from.
    pub fn new(len: usize, params: &TrainingParams) -> Self {
        Self {
            step_factor: params.step_factor,
            mean_rate: params.step_mean_change,
            curv_rate: params.step_curv_change,
            min_curv: params.min_curv_component,
            max_curv: params.max_curv_component,
            max_component: params.max_step_component,
            initial_curv: params.initial_curv_estimate,
            moments: Moments::new(len, params.initial_curv_estimate),
            frozen: vec![false; len],
            update_limit: len,
            steps: vec![0.; len].into_boxed_slice(),
            magnitudes: vec![0.; len].into_boxed_slice(),
            curvature: 0.,
        }
    }

    pub fn len(&self) -> usize {
        self.moments.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moments.mean.is_empty()
    }

    /// Floats held, the moments and the two per value step buffers.
    pub fn scratch_len(&self) -> usize {
        4 * self.len()
    }

    pub fn set_step_factor(&mut self, step_factor: f32) {
        self.step_factor = step_factor;
    }

    /// Caps the values moved by the next updates, at least one always moves.
    pub fn set_update_limit(&mut self, limit: usize) {
        self.update_limit = limit.clamp(1, self.len().max(1));
    }

    /// Excludes the given ranges from the next updates, every other value is released.
    pub fn freeze(&mut self, ranges: impl IntoIterator<Item = Range<usize>>) {
        self.frozen.fill(false);
        for range in ranges {
            self.frozen[range].fill(true);
        }
    }

    /// Mean corrected curvature over the free values of the last update.
    pub fn curvature(&self) -> f32 {
        self.curvature
    }

    pub fn moments(&self) -> &Moments {
        &self.moments
    }

    /// Puts back statistics saved before a rejected update.
    pub fn restore(&mut self, saved: &Moments) {
        self.moments.copy_from(saved);
    }

    /// Starts the statistics of the given values over, as for a fresh parameter.
    pub fn restart(&mut self, indices: impl IntoIterator<Item = usize>) {
        let len = self.len();
        for i in indices.into_iter().filter(|&i| i < len) {
            self.moments.mean[i] = 0.;
            self.moments.curv[i] = self.initial_curv;
        }
    }
}

impl Optimizer for AdaptiveStep {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        if grad.len() != self.len() || params.len() < grad.len() {
            return Err(AxyErr::SizeMismatch {
                a: "gradient",
                b: "optimizer state",
                got: grad.len(),
                expected: self.len(),
            });
        }

        let Self {
            step_factor: sf,
            mean_rate: a,
            curv_rate: b,
            min_curv,
            max_curv,
            max_component: max_step,
            initial_curv,
            ..
        } = *self;

        let m = &mut self.moments;
        m.mean_t *= 1. - a;
        m.curv_t *= 1. - b;
        let bc1 = 1. - m.mean_t;
        let bc2 = if initial_curv > 0. { 1. } else { 1. - m.curv_t };

        let mut curv_sum = 0f64;
        let mut free = 0usize;
        for ((((g, mean), curv), step), &frozen) in grad
            .iter()
            .zip(m.mean.iter_mut())
            .zip(m.curv.iter_mut())
            .zip(self.steps.iter_mut())
            .zip(&self.frozen)
        {
            if frozen {
                *step = 0.;
                continue;
            }
            *mean = (1. - a) * *mean + a * g;
            *curv = (1. - b) * *curv + b * g.powi(2);

            let c = (*curv / bc2).clamp(min_curv, max_curv);
            *step = (sf * (*mean / bc1) / c.sqrt()).clamp(-max_step, max_step);
            curv_sum += c as f64;
            free += 1;
        }
        self.curvature = if free > 0 {
            (curv_sum / free as f64) as f32
        } else {
            0.
        };

        let limit = self.update_limit.min(free);
        if limit == free {
            params
                .iter_mut()
                .zip(self.steps.iter())
                .zip(&self.frozen)
                .filter(|(_, frozen)| !**frozen)
                .for_each(|((p, step), _)| *p -= step);
            return Ok(());
        }

        // Threshold of the `limit` largest moves, frozen values sit at zero.
        let len = self.len();
        self.magnitudes
            .iter_mut()
            .zip(self.steps.iter())
            .for_each(|(mag, step)| *mag = step.abs());
        let (_, &mut threshold, _) =
            self.magnitudes.select_nth_unstable_by(len - limit, f32::total_cmp);

        let mut moved = 0;
        for ((p, step), &frozen) in params.iter_mut().zip(self.steps.iter()).zip(&self.frozen) {
            if moved == limit {
                break;
            }
            if !frozen && step.abs() >= threshold {
                *p -= step;
                moved += 1;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.moments = Moments::new(self.len(), self.initial_curv);
        self.frozen.fill(false);
        self.update_limit = self.len();
        self.curvature = 0.;
    }
}
