pub mod layered_graph;
pub mod node_array;

pub use layered_graph::{EntryPoint, GraphLayer, GraphSnapshot, OnHeapGraph};
pub use node_array::NodeArray;
