//! Filters deciding which nodes may appear in search results.

use crate::vector::NodeId;
use std::collections::HashSet;

/// Predicate over node ids. Nodes that are not live may still be traversed
/// by search, but are never returned.
pub trait LiveIds: Sync {
    fn is_live(&self, node: NodeId) -> bool;
}

/// Every node is live.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllLive;

impl LiveIds for AllLive {
    #[inline]
    fn is_live(&self, _node: NodeId) -> bool {
        true
    }
}

impl<F> LiveIds for F
where
    F: Fn(NodeId) -> bool + Sync,
{
    fn is_live(&self, node: NodeId) -> bool {
        self(node)
    }
}

/// The set lists the live nodes.
impl LiveIds for HashSet<NodeId> {
    fn is_live(&self, node: NodeId) -> bool {
        self.contains(&node)
    }
}

/// Borrowed bitset where a set bit filters its node *out*.
///
/// Ids at or beyond `num_bits` count as filtered out, except that an empty
/// view filters nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct BitsetView<'a> {
    bits: &'a [u8],
    num_bits: usize,
}

impl<'a> BitsetView<'a> {
    /// `bits` must hold at least `num_bits` bits, least significant bit first.
    pub fn new(bits: &'a [u8], num_bits: usize) -> Self {
        debug_assert!(bits.len() * 8 >= num_bits);
        let num_bits = num_bits.min(bits.len() * 8);
        Self { bits, num_bits }
    }

    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Whether `index` is filtered out.
    pub fn test(&self, index: usize) -> bool {
        index >= self.num_bits || (self.bits[index >> 3] & (1 << (index & 7))) != 0
    }

    /// Number of filtered-out ids within `0..len()`.
    pub fn count(&self) -> usize {
        (0..self.num_bits).filter(|&i| self.test(i)).count()
    }

    pub fn filter_ratio(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            self.count() as f32 / self.num_bits as f32
        }
    }
}

impl LiveIds for BitsetView<'_> {
    fn is_live(&self, node: NodeId) -> bool {
        self.is_empty() || !self.test(node as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_view() {
        // nodes 1 and 9 filtered
        let bits = [0b0000_0010u8, 0b0000_0010];
        let view = BitsetView::new(&bits, 12);
        assert!(view.is_live(0));
        assert!(!view.is_live(1));
        assert!(!view.is_live(9));
        assert!(view.is_live(11));
        assert!(!view.is_live(12));
        assert_eq!(view.count(), 2);
        assert!((view.filter_ratio() - 2.0 / 12.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_bitset_filters_nothing() {
        let view = BitsetView::default();
        assert!(view.is_live(0));
        assert!(view.is_live(1_000));
    }

    #[test]
    fn test_closure_and_set_filters() {
        let even = |n: NodeId| n % 2 == 0;
        assert!(even.is_live(4));
        assert!(!even.is_live(5));

        let set: HashSet<NodeId> = [1, 2].into_iter().collect();
        assert!(set.is_live(1));
        assert!(!set.is_live(3));
        assert!(AllLive.is_live(42));
    }
}
