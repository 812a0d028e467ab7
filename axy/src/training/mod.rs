mod condition;
mod fit;
mod gradient;
mod optimizer;
mod record;
mod work;

pub use condition::{ConditionReport, condition_model};
pub use fit::{FitOutcome, MAX_RETRIES, StopReason, fit_model};
pub use gradient::{Partial, Pass, Totals, batch_totals, model_gradient, model_loss};
pub use optimizer::{AdaptiveStep, Moments, Optimizer};
pub use record::{FitRecord, RecordEntry};
pub use work::{FitState, WorkBuffers};
