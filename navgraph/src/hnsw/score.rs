//! Scores attached to graph nodes, and the scoring closures used by search.

use crate::{
    error::{IndexError, Result},
    vector::{NodeId, SimilarityFunction, VectorSource},
};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt::Debug};

/// A node together with its similarity to some reference point.
///
/// `NodeScore` is totally ordered with *better* candidates comparing greater:
/// higher scores first, and on equal scores the lower node id. Sorting in
/// descending order therefore yields a deterministic ranking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeScore {
    pub node: NodeId,
    pub score: f32,
}

impl NodeScore {
    pub fn new(node: NodeId, score: f32) -> Self {
        Self { node, score }
    }
}

impl PartialEq for NodeScore {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for NodeScore {}

impl PartialOrd for NodeScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Sort best-first.
pub fn sort_best_first(scores: &mut [NodeScore]) {
    scores.sort_unstable_by(|a, b| b.cmp(a));
}

pub type ScoreFn<'a> = Box<dyn Fn(NodeId) -> f32 + Send + Sync + 'a>;

/// Scores candidate nodes against a query during search.
///
/// The approximate function orders the search frontier. If a reranker is
/// present, the final candidates are rescored with it before truncation to
/// `k`; otherwise approximate scores are final.
pub struct SearchScoreProvider<'a> {
    approximate: ScoreFn<'a>,
    reranker: Option<ScoreFn<'a>>,
}

impl<'a> SearchScoreProvider<'a> {
    /// A provider whose scores are exact.
    pub fn exact(score: impl Fn(NodeId) -> f32 + Send + Sync + 'a) -> Self {
        Self {
            approximate: Box::new(score),
            reranker: None,
        }
    }

    /// A provider ranking the frontier with `approximate` and rescoring the
    /// final candidates with `exact`.
    pub fn with_reranker(
        approximate: impl Fn(NodeId) -> f32 + Send + Sync + 'a,
        exact: impl Fn(NodeId) -> f32 + Send + Sync + 'a,
    ) -> Self {
        Self {
            approximate: Box::new(approximate),
            reranker: Some(Box::new(exact)),
        }
    }

    /// Exact scoring of `query` against the vectors of `source`.
    ///
    /// Nodes without a vector in `source` score negative infinity.
    pub fn for_query<V, S>(source: &'a V, similarity: &'a S, query: &'a [f32]) -> Result<Self>
    where
        V: VectorSource + ?Sized,
        S: SimilarityFunction + ?Sized,
    {
        IndexError::check_dimension(source.dimension(), query.len())?;
        Ok(Self::exact(move |node| {
            source
                .get_vector(node)
                .map(|v| similarity.compare(query, v))
                .unwrap_or(f32::NEG_INFINITY)
        }))
    }

    #[inline]
    pub fn score(&self, node: NodeId) -> f32 {
        (self.approximate)(node)
    }

    /// Final score of `node`: the reranker if present, else the approximate score.
    pub fn exact_score(&self, node: NodeId) -> f32 {
        match &self.reranker {
            Some(reranker) => reranker(node),
            None => self.score(node),
        }
    }

    pub fn has_reranker(&self) -> bool {
        self.reranker.is_some()
    }
}

impl Debug for SearchScoreProvider<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchScoreProvider")
            .field("reranker", &self.has_reranker())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{ListVectorSource, VectorSimilarityFunction};
    use std::collections::BinaryHeap;

    #[test]
    fn test_ordering_prefers_score_then_low_id() {
        let mut v = vec![
            NodeScore::new(3, 0.5),
            NodeScore::new(1, 0.9),
            NodeScore::new(2, 0.5),
            NodeScore::new(0, 0.1),
        ];
        sort_best_first(&mut v);
        let ids: Vec<_> = v.iter().map(|ns| ns.node).collect();
        assert_eq!(ids, vec![1, 2, 3, 0]);

        let mut heap: BinaryHeap<NodeScore> = v.into_iter().collect();
        assert_eq!(heap.pop().map(|ns| ns.node), Some(1));
        assert_eq!(heap.pop().map(|ns| ns.node), Some(2));
    }

    #[test]
    fn test_for_query_checks_dimension() -> eyre::Result<()> {
        let source = ListVectorSource::new(2, vec![vec![1.0, 0.0], vec![0.0, 1.0]])?;
        let sim = VectorSimilarityFunction::Cosine;
        let query = [1.0f32, 0.0];
        let provider = SearchScoreProvider::for_query(&source, &sim, &query)?;
        assert!(provider.score(0) > provider.score(1));
        assert_eq!(provider.score(7), f32::NEG_INFINITY);
        assert!(!provider.has_reranker());

        let bad_query = [1.0f32, 0.0, 0.0];
        assert!(matches!(
            SearchScoreProvider::for_query(&source, &sim, &bad_query),
            Err(IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        Ok(())
    }

    #[test]
    fn test_reranker_overrides_final_score() {
        let provider = SearchScoreProvider::with_reranker(|n| n as f32, |n| -(n as f32));
        assert_eq!(provider.score(2), 2.0);
        assert_eq!(provider.exact_score(2), -2.0);
    }
}
