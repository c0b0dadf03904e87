use crate::{hnsw::score::NodeScore, vector::NodeId};
use serde::{Deserialize, Serialize};

/// Bounded neighbor list of a node in one layer, kept sorted best-first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeArray {
    capacity: usize,
    edges: Vec<NodeScore>,
}

impl NodeArray {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            edges: Vec::with_capacity(capacity),
        }
    }

    /// Build from edges already sorted best-first. Edges beyond `capacity`
    /// and repeated ids are dropped.
    pub fn from_sorted(capacity: usize, edges: impl IntoIterator<Item = NodeScore>) -> Self {
        let mut array = Self::new(capacity);
        for edge in edges {
            if array.is_full() {
                break;
            }
            if !array.contains(edge.node) {
                array.edges.push(edge);
            }
        }
        array
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.edges.len() >= self.capacity
    }

    pub fn as_slice(&self) -> &[NodeScore] {
        &self.edges
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeScore> {
        self.edges.iter()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.iter().map(|e| e.node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.edges.iter().any(|e| e.node == node)
    }

    /// The lowest-scoring edge.
    pub fn worst(&self) -> Option<NodeScore> {
        self.edges.last().copied()
    }

    /// Insert `edge` at its sorted position.
    ///
    /// When full, `edge` replaces the current worst edge only if it is better.
    /// Returns whether the edge was inserted.
    pub fn insert(&mut self, edge: NodeScore) -> bool {
        if self.capacity == 0 || self.contains(edge.node) {
            return false;
        }
        if self.is_full() {
            match self.worst() {
                Some(worst) if edge > worst => {
                    self.edges.pop();
                }
                _ => return false,
            }
        }
        self.insert_sorted(edge);
        true
    }

    /// Insert `edge` unconditionally, evicting the worst edge if full.
    /// Returns the evicted edge.
    pub fn insert_forced(&mut self, edge: NodeScore) -> Option<NodeScore> {
        if self.capacity == 0 || self.contains(edge.node) {
            return None;
        }
        let evicted = if self.is_full() { self.edges.pop() } else { None };
        self.insert_sorted(edge);
        evicted
    }

    fn insert_sorted(&mut self, edge: NodeScore) {
        let pos = self.edges.partition_point(|e| *e > edge);
        self.edges.insert(pos, edge);
    }

    pub fn remove(&mut self, node: NodeId) -> bool {
        let before = self.edges.len();
        self.edges.retain(|e| e.node != node);
        self.edges.len() != before
    }

    pub fn retain(&mut self, f: impl FnMut(&NodeScore) -> bool) {
        self.edges.retain(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(node: NodeId, score: f32) -> NodeScore {
        NodeScore::new(node, score)
    }

    #[test]
    fn test_insert_keeps_order_and_bound() {
        let mut array = NodeArray::new(3);
        assert!(array.insert(ns(1, 0.5)));
        assert!(array.insert(ns(2, 0.9)));
        assert!(array.insert(ns(3, 0.1)));
        assert!(array.is_full());

        // Worse than the current worst
        assert!(!array.insert(ns(4, 0.05)));
        // Better, evicts node 3
        assert!(array.insert(ns(5, 0.7)));
        assert_eq!(array.nodes().collect::<Vec<_>>(), vec![2, 5, 1]);
        // Duplicate id
        assert!(!array.insert(ns(2, 1.0)));
        assert_eq!(array.len(), 3);
    }

    #[test]
    fn test_ties_prefer_lower_id() {
        let mut array = NodeArray::new(4);
        array.insert(ns(9, 0.5));
        array.insert(ns(3, 0.5));
        array.insert(ns(6, 0.5));
        assert_eq!(array.nodes().collect::<Vec<_>>(), vec![3, 6, 9]);
    }

    #[test]
    fn test_insert_forced() {
        let mut array = NodeArray::from_sorted(2, [ns(1, 0.9), ns(2, 0.8)]);
        assert_eq!(array.insert_forced(ns(3, 0.1)), Some(ns(2, 0.8)));
        assert_eq!(array.nodes().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(array.insert_forced(ns(1, 0.0)), None);
    }

    #[test]
    fn test_from_sorted_truncates() {
        let array = NodeArray::from_sorted(2, [ns(1, 0.9), ns(1, 0.9), ns(2, 0.8), ns(3, 0.7)]);
        assert_eq!(array.nodes().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(array.capacity(), 2);
    }

    #[test]
    fn test_remove() {
        let mut array = NodeArray::from_sorted(4, [ns(1, 0.9), ns(2, 0.8)]);
        assert!(array.remove(1));
        assert!(!array.remove(1));
        assert_eq!(array.worst(), Some(ns(2, 0.8)));
    }
}
