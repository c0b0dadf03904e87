pub mod bits;
pub mod builder;
pub mod graph;
pub mod layer_distribution;
pub mod metrics;
pub mod score;
pub mod searcher;

pub use bits::{AllLive, BitsetView, LiveIds};
pub use builder::GraphIndexBuilder;
pub use graph::{EntryPoint, NodeArray, OnHeapGraph};
pub use score::{NodeScore, SearchScoreProvider};
pub use searcher::{GraphSearcher, SearchParams, SearchResult};
