use super::{AdaptiveStep, Moments, Optimizer, Partial, Totals};
use crate::{
    config::{FitSizes, ModelConfig, TrainingParams},
    data::BatchBuffer,
    error::{AxyErr, Result},
};

/// Progress of a fit that survives between `fit_model` calls made with `continuing`.
#[derive(Debug, Clone, PartialEq)]
pub struct FitState {
    /// Steps run since the last reset.
    pub steps_taken: usize,
    pub step_factor: f32,
    /// Lowest batch error seen, the model it belongs to is kept aside.
    pub best_mse: f32,
    pub prev_mse: Option<f32>,
    /// Consecutive steps that lowered the error.
    pub decreasing: usize,
    /// Consecutive steps that did not improve on `best_mse`.
    pub stall: usize,
    /// Consecutive rejected steps.
    pub retries: usize,
    /// Start of the next batch window when batches are not reshuffled.
    pub cursor: usize,
    /// Neurons restarted by the most recent conditioning.
    pub last_repairs: usize,
    /// Whether a step has been applied, so a previous model exists.
    pub accepted: bool,
    /// Share of the trainable values the next step may move.
    pub update_ratio: f32,
}

impl FitState {
    pub fn new(params: &TrainingParams) -> Self {
        Self {
            steps_taken: 0,
            step_factor: params.step_factor,
            best_mse: f32::INFINITY,
            prev_mse: None,
            decreasing: 0,
            stall: 0,
            retries: 0,
            cursor: 0,
            last_repairs: 0,
            accepted: false,
            update_ratio: 1.,
        }
    }
}

/// Every buffer a fit needs, sized once by `new_fit_config`.
///
/// The float scratch is the optimizer's moments and step buffers, a copy of the moments
/// taken before every update, the merged gradient, two model copies (best seen and
/// previous) and one gradient per thread. The integer scratch is the embedding and neuron
/// counters of every thread plus the merged ones, and a sample order buffer. Gathered
/// batches live in a data sized buffer outside both.
#[derive(Debug, Clone)]
pub struct WorkBuffers {
    sizes: FitSizes,
    pub(crate) state: FitState,
    pub(crate) optimizer: AdaptiveStep,
    pub(crate) saved: Moments,
    pub(crate) merged: Totals,
    pub(crate) best: Vec<f32>,
    pub(crate) previous: Vec<f32>,
    pub(crate) partials: Vec<Partial>,
    pub(crate) samples: Vec<usize>,
    pub(crate) batch: BatchBuffer,
}

impl WorkBuffers {
    /// Allocates the buffers of a fit configuration.
    ///
    /// # Returns
    /// `MissingFitConfig` if `new_fit_config` was not applied to `config`.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let sizes = *config.fit()?;
        let params = config.params();
        let total = config.total_size();

        let optimizer = AdaptiveStep::new(config.num_vars(), params);
        Ok(Self {
            sizes,
            state: FitState::new(params),
            saved: optimizer.moments().clone(),
            optimizer,
            merged: Totals::new(config),
            best: vec![0.; total],
            previous: vec![0.; total],
            partials: vec![Partial::new(config); sizes.num_threads],
            samples: (0..sizes.nm).collect(),
            batch: BatchBuffer::default(),
        })
    }

    /// The progress kept between calls.
    pub fn state(&self) -> &FitState {
        &self.state
    }

    /// The step controller and its running statistics.
    pub fn optimizer(&self) -> &AdaptiveStep {
        &self.optimizer
    }

    /// The sizes these buffers were allocated for.
    pub fn sizes(&self) -> &FitSizes {
        &self.sizes
    }

    /// Length of the float scratch.
    pub fn rwork_len(&self) -> usize {
        self.optimizer.scratch_len()
            + self.saved.mean.len()
            + self.saved.curv.len()
            + self.merged.grad.len()
            + self.best.len()
            + self.previous.len()
            + self.partials.iter().map(|p| p.totals.grad.len()).sum::<usize>()
    }

    /// Length of the integer scratch.
    pub fn iwork_len(&self) -> usize {
        self.merged.counters()
            + self.partials.iter().map(|p| p.totals.counters()).sum::<usize>()
            + self.samples.len()
    }

    /// Checks that these buffers belong to a fit configuration.
    pub(crate) fn check(&self, sizes: &FitSizes) -> Result<()> {
        if self.sizes == *sizes {
            return Ok(());
        }
        Err(AxyErr::SizeMismatch {
            a: "work buffers",
            b: "fit configuration",
            got: self.rwork_len(),
            expected: sizes.rwork_size,
        })
    }

    /// Forgets the progress and optimizer statistics of previous calls.
    pub fn reset(&mut self, params: &TrainingParams) {
        self.state = FitState::new(params);
        self.optimizer.reset();
        self.saved.copy_from(self.optimizer.moments());
        self.samples
            .iter_mut()
            .enumerate()
            .for_each(|(i, s)| *s = i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelDims, new_fit_config, new_model_config};

    #[test]
    fn scratch_lengths_match_the_fit_sizes() {
        let dims = ModelDims {
            adn: 2,
            mdn: 1,
            mdo: 1,
            ane: Some(5),
            mne: Some(3),
            noe: 4,
            ads: Some(6),
            num_threads: Some(3),
            ..Default::default()
        };
        let config = new_model_config(&dims, TrainingParams::default()).unwrap();
        assert!(matches!(WorkBuffers::new(&config), Err(AxyErr::MissingFitConfig)));

        let config = new_fit_config(&config, 40, 90).unwrap();
        let work = WorkBuffers::new(&config).unwrap();
        let sizes = config.fit().unwrap();

        assert_eq!(work.rwork_len(), sizes.rwork_size);
        assert_eq!(work.iwork_len(), sizes.iwork_size);
        assert!(work.check(sizes).is_ok());
    }
}
