//! Vector access and vector similarity.

pub mod similarity;
pub mod source;

pub use similarity::{SimilarityFunction, VectorSimilarityFunction};
pub use source::{ListVectorSource, VectorSource};

/// Dense identifier of a vector and of its graph node.
pub type NodeId = u32;
