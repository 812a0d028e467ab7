mod batch;
mod dataset;
mod fetch;
mod shape;

pub use batch::{BatchPlan, Chunk, plan_batches};
pub use dataset::{Dataset, DatasetView, Inputs, InputsView, offsets};
pub use fetch::{BatchBuffer, select_samples};
pub use shape::{check_inputs, check_shape};
