mod dims;
mod fit;
mod layout;
mod params;

pub use dims::{Dims, ModelDims, default_embedding_width};
pub use fit::{FitSizes, embedding_rows, neurons};
pub use layout::{ModelLayout, NetLayout};
pub use params::{Reduction, TrainingParams};

use log::debug;

use crate::error::{AxyErr, Result};

/// The immutable description of a model: resolved dimensions, the offset table of its
/// flat parameter vector and the training hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    dims: Dims,
    layout: ModelLayout,
    params: TrainingParams,
    fit: Option<FitSizes>,
}

impl ModelConfig {
    pub fn dims(&self) -> &Dims {
        &self.dims
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    pub fn params(&self) -> &TrainingParams {
        &self.params
    }

    /// The data size dependent fields.
    ///
    /// # Returns
    /// An error if `new_fit_config` was never applied to this configuration.
    pub fn fit(&self) -> Result<&FitSizes> {
        self.fit.as_ref().ok_or(AxyErr::MissingFitConfig)
    }

    /// Number of trainable values at the front of the model.
    pub fn num_vars(&self) -> usize {
        self.layout.num_vars
    }

    /// Length of the whole model vector, normalization block included.
    pub fn total_size(&self) -> usize {
        self.layout.total_size
    }
}

/// Builds a model configuration from declared dimensions and training parameters.
///
/// # Arguments
/// * `dims` - The declared dimensions, absent ones are derived.
/// * `params` - The training hyperparameters.
///
/// # Returns
/// A fully populated configuration or a `Config` error on contradicting values.
pub fn new_model_config(dims: &ModelDims, params: TrainingParams) -> Result<ModelConfig> {
    params.validate()?;
    let dims = dims.resolve()?;
    let layout = ModelLayout::new(&dims);

    debug!(
        num_vars = layout.num_vars,
        total_size = layout.total_size;
        "model configuration built"
    );

    Ok(ModelConfig {
        dims,
        layout,
        params,
        fit: None,
    })
}

/// Extends a configuration with the sizes of a dataset.
///
/// Applying it again with the same counts yields an equal configuration.
///
/// # Arguments
/// * `config` - A configuration built by `new_model_config`.
/// * `nm` - Number of samples to fit.
/// * `na` - Number of aggregate rows across all samples.
///
/// # Returns
/// The extended configuration or a `Config` error.
pub fn new_fit_config(config: &ModelConfig, nm: usize, na: usize) -> Result<ModelConfig> {
    if nm == 0 {
        return Err(AxyErr::config("nm", "at least one sample is needed to fit"));
    }
    if na > 0 && !config.dims.has_aggregator() {
        return Err(AxyErr::config(
            "na",
            format!("{na} aggregate rows given to a model without an aggregator"),
        ));
    }

    let fit = FitSizes::new(
        &config.dims,
        &config.layout,
        nm,
        na,
        config.params.max_batch,
    );

    Ok(ModelConfig {
        fit: Some(fit),
        ..config.clone()
    })
}
