mod init;
mod param_gen;

pub use init::{DEFAULT_OUTPUT_SCALE, DEFAULT_SHIFT_RANGE, init_model};
pub use param_gen::{EvenSpread, FixedValue, ParamGen, Sampled};

use std::ops::Range;

use crate::config::ModelConfig;

/// The flat parameter vector of a model, addressed through the configuration's layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    params: Vec<f32>,
}

impl Model {
    /// Creates a model whose trainable values are zero and whose normalization is the
    /// identity transform.
    pub fn zeros(config: &ModelConfig) -> Self {
        let layout = config.layout();
        let mut params = vec![0.; config.total_size()];
        for range in [
            &layout.ax_rescale,
            &layout.ay_rescale,
            &layout.x_rescale,
            &layout.y_rescale,
        ] {
            params[range.clone()].fill(1.);
        }
        Self { params }
    }

    /// Wraps an existing parameter vector.
    pub fn from_vec(params: Vec<f32>) -> Self {
        Self { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.params
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.params
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.params
    }

    /// The values of one block of the layout.
    pub fn block(&self, range: &Range<usize>) -> &[f32] {
        &self.params[range.clone()]
    }

    /// The mutable values of one block of the layout.
    pub fn block_mut(&mut self, range: &Range<usize>) -> &mut [f32] {
        &mut self.params[range.clone()]
    }
}
