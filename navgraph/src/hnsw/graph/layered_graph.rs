//! Concurrent in-memory storage of a hierarchical proximity graph.
//!
//! Each node owns one neighbor list per layer it belongs to. A list is an
//! immutable [`NodeArray`] snapshot published through an `ArcSwap`, so
//! readers never take a lock and never see a half-written list. Writers to
//! the same node serialize on a per-node mutex; writers to different nodes
//! proceed in parallel.

use super::node_array::NodeArray;
use crate::{config::IndexConfig, vector::NodeId};
use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::{mapref::entry::Entry, DashMap};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::Display,
    sync::{Arc, Mutex, PoisonError},
};

/// Representation of the entry point of search in a layered graph.
/// This is a node along with the layer of the graph at which search begins.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct EntryPoint {
    /// The node at which search begins
    pub node: NodeId,

    /// The highest layer containing `node`
    pub level: usize,
}

#[derive(Debug)]
struct NeighborCell {
    write: Mutex<()>,
    current: ArcSwap<NodeArray>,
}

impl NeighborCell {
    fn new(capacity: usize) -> Self {
        Self {
            write: Mutex::new(()),
            current: ArcSwap::from_pointee(NodeArray::new(capacity)),
        }
    }

    fn load(&self) -> Arc<NodeArray> {
        self.current.load_full()
    }

    fn update<R>(&self, f: impl FnOnce(&mut NodeArray) -> R) -> R {
        // A panicking writer never publishes, so the stored list is intact.
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current.load_full();
        let mut next = NodeArray::clone(&current);
        let out = f(&mut next);
        if next != *current {
            self.current.store(Arc::new(next));
        }
        out
    }
}

/// The neighbor lists of all nodes present in one layer.
#[derive(Debug)]
pub struct GraphLayer {
    max_degree: usize,
    nodes: DashMap<NodeId, Arc<NeighborCell>>,
}

impl GraphLayer {
    fn new(max_degree: usize) -> Self {
        Self {
            max_degree,
            nodes: DashMap::new(),
        }
    }

    // The cell is cloned out so that no map guard outlives this call.
    fn cell(&self, node: NodeId) -> Option<Arc<NeighborCell>> {
        self.nodes.get(&node).map(|cell| Arc::clone(cell.value()))
    }

    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn neighbors(&self, node: NodeId) -> Option<Arc<NodeArray>> {
        self.cell(node).map(|cell| cell.load())
    }

    /// Ids of the nodes in this layer, in increasing order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|entry| *entry.key()).sorted().collect()
    }
}

/// An in-memory hierarchical graph supporting concurrent insertion and
/// lock-free traversal.
///
/// The nodes of each layer are a subset of the nodes of the layer below, and
/// a node present in layer `L` is present in every layer `0..=L`.
#[derive(Debug)]
pub struct OnHeapGraph {
    max_degree: usize,
    base_layer_max_degree: usize,
    layers: ArcSwap<Vec<Arc<GraphLayer>>>,
    entry_point: ArcSwapOption<EntryPoint>,
}

impl OnHeapGraph {
    /// Empty graph with degree cap `max_degree` on upper layers and
    /// `base_layer_max_degree` on layer 0.
    pub fn new(max_degree: usize, base_layer_max_degree: usize) -> Self {
        Self {
            max_degree,
            base_layer_max_degree,
            layers: ArcSwap::from_pointee(vec![Arc::new(GraphLayer::new(
                base_layer_max_degree,
            ))]),
            entry_point: ArcSwapOption::empty(),
        }
    }

    pub fn from_config(config: &IndexConfig) -> Self {
        Self::new(config.max_degree, config.base_layer_max_degree())
    }

    pub fn max_degree_at(&self, lc: usize) -> usize {
        if lc == 0 {
            self.base_layer_max_degree
        } else {
            self.max_degree
        }
    }

    /// Number of nodes in the graph.
    pub fn size(&self) -> usize {
        self.layer(0).map_or(0, |layer| layer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of allocated layers, including any not yet reachable from the
    /// entry point.
    pub fn num_layers(&self) -> usize {
        self.layers.load().len()
    }

    /// The top layer of the graph, i.e. the level of the entry point.
    pub fn max_layer(&self) -> usize {
        self.entry_point().map_or(0, |ep| ep.level)
    }

    pub fn layer(&self, lc: usize) -> Option<Arc<GraphLayer>> {
        self.layers.load().get(lc).cloned()
    }

    pub fn layer_size(&self, lc: usize) -> usize {
        self.layer(lc).map_or(0, |layer| layer.len())
    }

    pub fn node_ids(&self, lc: usize) -> Vec<NodeId> {
        self.layer(lc).map_or_else(Vec::new, |layer| layer.node_ids())
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.contains_at(node, 0)
    }

    pub fn contains_at(&self, node: NodeId, lc: usize) -> bool {
        self.layer(lc).is_some_and(|layer| layer.contains(node))
    }

    /// The highest layer containing `node`.
    pub fn node_level(&self, node: NodeId) -> Option<usize> {
        let layers = self.layers.load();
        layers.iter().rposition(|layer| layer.contains(node))
    }

    /// Current neighbor list of `node` in layer `lc`, or `None` if the node
    /// is not in that layer.
    pub fn get_neighbors(&self, node: NodeId, lc: usize) -> Option<Arc<NodeArray>> {
        self.layer(lc)?.neighbors(node)
    }

    pub fn degree(&self, node: NodeId, lc: usize) -> Option<usize> {
        self.get_neighbors(node, lc).map(|neighbors| neighbors.len())
    }

    fn ensure_layers(&self, level: usize) {
        if self.layers.load().len() > level {
            return;
        }
        self.layers.rcu(|layers| {
            let mut layers = Vec::clone(layers);
            while layers.len() <= level {
                let max_degree = self.max_degree_at(layers.len());
                layers.push(Arc::new(GraphLayer::new(max_degree)));
            }
            layers
        });
    }

    /// Allocate empty neighbor lists for `node` in layers `0..=level`.
    ///
    /// Returns `false`, leaving the graph untouched, if `node` is already
    /// present.
    pub fn add_node(&self, node: NodeId, level: usize) -> bool {
        if self.contains(node) {
            return false;
        }
        self.ensure_layers(level);
        let layers = self.layers.load();
        let Some(base) = layers.first() else {
            return false;
        };
        match base.nodes.entry(node) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(NeighborCell::new(base.max_degree)));
            }
        }
        for layer in layers.iter().take(level + 1).skip(1) {
            layer
                .nodes
                .entry(node)
                .or_insert_with(|| Arc::new(NeighborCell::new(layer.max_degree)));
        }
        true
    }

    /// Replace the neighbor list of `node` in layer `lc`. Edges beyond the
    /// layer's degree cap are dropped. Returns `false` if the node is not in
    /// that layer.
    pub fn set_neighbors(&self, node: NodeId, lc: usize, neighbors: NodeArray) -> bool {
        self.update_neighbors(node, lc, |current| {
            *current = NodeArray::from_sorted(current.capacity(), neighbors.as_slice().to_vec());
        })
        .is_some()
    }

    /// Atomically modify the neighbor list of `node` in layer `lc`.
    ///
    /// Updates to the same node are serialized; readers observe either the
    /// list before or after `f`. Returns `None` if the node is not in that
    /// layer.
    pub fn update_neighbors<R>(
        &self,
        node: NodeId,
        lc: usize,
        f: impl FnOnce(&mut NodeArray) -> R,
    ) -> Option<R> {
        let cell = self.layer(lc)?.cell(node)?;
        Some(cell.update(f))
    }

    pub fn entry_point(&self) -> Option<EntryPoint> {
        self.entry_point.load().as_deref().copied()
    }

    /// Install `candidate` as the entry point if the graph has none, or if
    /// `candidate` sits on a strictly higher layer. Returns whether it was
    /// installed.
    pub fn try_update_entry_point(&self, candidate: EntryPoint) -> bool {
        let mut installed = false;
        self.entry_point.rcu(|current| match current.as_deref() {
            Some(ep) if ep.level >= candidate.level => {
                installed = false;
                current.clone()
            }
            _ => {
                installed = true;
                Some(Arc::new(candidate))
            }
        });
        installed
    }

    pub(crate) fn set_entry_point(&self, entry_point: Option<EntryPoint>) {
        self.entry_point.store(entry_point.map(Arc::new));
    }

    /// The node with minimal id in the top non-empty layer, or `None` if the
    /// graph is empty.
    pub fn top_layer_entry_point(&self) -> Option<EntryPoint> {
        let layers = self.layers.load();
        let (level, layer) = layers
            .iter()
            .enumerate()
            .rfind(|(_, layer)| !layer.is_empty())?;
        let node = layer.nodes.iter().map(|entry| *entry.key()).min()?;
        Some(EntryPoint { node, level })
    }

    /// Point-in-time copy of the graph structure with deterministic ordering.
    pub fn snapshot(&self) -> GraphSnapshot {
        let layers = self
            .layers
            .load()
            .iter()
            .map(|layer| {
                layer
                    .node_ids()
                    .into_iter()
                    .filter_map(|node| {
                        let neighbors = layer.neighbors(node)?;
                        Some((node, neighbors.nodes().collect()))
                    })
                    .collect()
            })
            .collect();
        GraphSnapshot {
            entry_point: self.entry_point(),
            layers,
        }
    }
}

/// Plain copy of the adjacency structure of an [`OnHeapGraph`].
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub entry_point: Option<EntryPoint>,
    pub layers: Vec<BTreeMap<NodeId, Vec<NodeId>>>,
}

impl Display for GraphSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "OnHeapGraph")?;
        match &self.entry_point {
            Some(ep) => writeln!(f, "entry_point: {}:l{}", ep.node, ep.level)?,
            None => writeln!(f, "entry_point: none")?,
        }
        for (lc, layer) in self.layers.iter().enumerate().rev() {
            writeln!(f, "layer: {lc}")?;
            for (node, neighbors) in layer {
                writeln!(f, "| {node} :: {}", neighbors.iter().join(", "))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::score::NodeScore;
    use rayon::prelude::*;

    #[test]
    fn test_add_node_populates_lower_layers() {
        let graph = OnHeapGraph::new(2, 4);
        assert!(graph.add_node(7, 2));
        assert!(graph.contains_at(7, 0));
        assert!(graph.contains_at(7, 1));
        assert!(graph.contains_at(7, 2));
        assert!(!graph.contains_at(7, 3));
        assert_eq!(graph.node_level(7), Some(2));
        assert_eq!(graph.num_layers(), 3);
        assert_eq!(graph.get_neighbors(7, 0).map(|n| n.capacity()), Some(4));
        assert_eq!(graph.get_neighbors(7, 2).map(|n| n.capacity()), Some(2));

        // Duplicates are rejected and do not change the level
        assert!(!graph.add_node(7, 4));
        assert_eq!(graph.node_level(7), Some(2));
        assert_eq!(graph.size(), 1);
    }

    #[test]
    fn test_update_neighbors() {
        let graph = OnHeapGraph::new(2, 2);
        graph.add_node(0, 0);
        graph.add_node(1, 0);
        graph.add_node(2, 0);

        let inserted = graph.update_neighbors(0, 0, |n| {
            n.insert(NodeScore::new(1, 0.5)) && n.insert(NodeScore::new(2, 0.7))
        });
        assert_eq!(inserted, Some(true));
        assert_eq!(graph.degree(0, 0), Some(2));
        assert_eq!(
            graph.get_neighbors(0, 0).map(|n| n.nodes().collect_vec()),
            Some(vec![2, 1])
        );
        assert_eq!(graph.update_neighbors(9, 0, |_| ()), None);
        assert_eq!(graph.update_neighbors(0, 1, |_| ()), None);
    }

    #[test]
    fn test_snapshot_is_stable_across_readers() {
        let graph = OnHeapGraph::new(2, 2);
        graph.add_node(0, 0);
        graph.add_node(1, 0);
        let before = graph.get_neighbors(0, 0).unwrap();
        graph.update_neighbors(0, 0, |n| n.insert(NodeScore::new(1, 0.5)));
        assert!(before.is_empty());
        assert_eq!(graph.degree(0, 0), Some(1));
    }

    #[test]
    fn test_entry_point_only_rises() {
        let graph = OnHeapGraph::new(2, 4);
        assert_eq!(graph.entry_point(), None);
        assert!(graph.try_update_entry_point(EntryPoint { node: 3, level: 1 }));
        assert!(!graph.try_update_entry_point(EntryPoint { node: 4, level: 1 }));
        assert!(!graph.try_update_entry_point(EntryPoint { node: 5, level: 0 }));
        assert!(graph.try_update_entry_point(EntryPoint { node: 6, level: 2 }));
        assert_eq!(graph.entry_point(), Some(EntryPoint { node: 6, level: 2 }));
        assert_eq!(graph.max_layer(), 2);
    }

    #[test]
    fn test_top_layer_entry_point() {
        let graph = OnHeapGraph::new(2, 4);
        assert_eq!(graph.top_layer_entry_point(), None);
        graph.add_node(9, 1);
        graph.add_node(4, 1);
        graph.add_node(1, 0);
        assert_eq!(
            graph.top_layer_entry_point(),
            Some(EntryPoint { node: 4, level: 1 })
        );
    }

    #[test]
    fn test_concurrent_add_and_update() {
        let graph = OnHeapGraph::new(8, 16);
        (0..200u32).into_par_iter().for_each(|node| {
            graph.add_node(node, (node % 3) as usize);
        });
        assert_eq!(graph.size(), 200);
        assert_eq!(graph.num_layers(), 3);

        (0..200u32).into_par_iter().for_each(|node| {
            graph.update_neighbors(0, 0, |n| n.insert(NodeScore::new(node, node as f32)));
        });
        let neighbors = graph.get_neighbors(0, 0).unwrap();
        assert_eq!(neighbors.nodes().collect_vec(), (184..200).rev().collect_vec());
    }

    #[test]
    fn test_snapshot_display() {
        let graph = OnHeapGraph::new(2, 2);
        graph.add_node(0, 0);
        graph.add_node(1, 0);
        graph.update_neighbors(0, 0, |n| n.insert(NodeScore::new(1, 0.5)));
        graph.try_update_entry_point(EntryPoint { node: 0, level: 0 });
        let snapshot = graph.snapshot();
        assert_eq!(snapshot.layers[0][&0], vec![1]);
        assert_eq!(snapshot.layers[0][&1], Vec::<NodeId>::new());
        let text = snapshot.to_string();
        assert!(text.contains("entry_point: 0:l0"));
        assert!(text.contains("| 0 :: 1"));
    }
}
