//! In-memory approximate nearest neighbor index over a hierarchical
//! proximity graph, with concurrent construction and lock-free search.

pub mod config;
pub mod error;
pub mod hnsw;
pub mod telemetry;
pub mod vector;

pub use config::IndexConfig;
pub use error::{IndexError, Result};
pub use hnsw::{
    AllLive, BitsetView, GraphIndexBuilder, GraphSearcher, LiveIds, NodeScore, OnHeapGraph,
    SearchParams, SearchResult, SearchScoreProvider,
};
pub use vector::{ListVectorSource, NodeId, VectorSimilarityFunction, VectorSource};
