mod activation;
mod aggregate;
mod embedding;
mod evaluator;
pub mod loss;
pub mod network;
mod reshape;

pub use activation::SoftHinge;
pub use aggregate::{Aggregation, Expanded, weighted_tree_sum};
pub use embedding::{accumulate_rows, embed_rows};
pub use evaluator::Evaluation;
pub use network::NetCache;
pub use reshape::InplaceReshape;
