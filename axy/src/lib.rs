//! Fitting core of fixed effects models with set valued inputs.
//!
//! A model is two piecewise linear networks stored in one flat parameter vector: an
//! aggregator evaluated on every row of a sample's aggregate set, whose outputs are
//! reduced into a fixed width summary, and a main network evaluated on the summary next
//! to the sample's own inputs.

pub mod arch;
pub mod config;
pub mod data;
pub mod error;
mod evaluate;
pub mod linalg;
pub mod model;
mod normalize;
pub mod training;

pub use config::{ModelConfig, ModelDims, Reduction, TrainingParams, new_fit_config, new_model_config};
pub use data::{Dataset, Inputs, check_inputs, check_shape, plan_batches};
pub use error::{AxyErr, Notice, Result, notice_mask};
pub use evaluate::{Predictions, evaluate};
pub use model::{Model, init_model};
pub use normalize::{ColumnStats, NormalizeReport, normalize_data, renormalize};
pub use training::{
    FitOutcome, FitRecord, RecordEntry, StopReason, WorkBuffers, condition_model, fit_model,
    model_gradient, model_loss,
};
