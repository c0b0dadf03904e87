//! Search over an [`OnHeapGraph`].
//!
//! Search descends greedily from the entry point through the upper layers,
//! then runs a bounded beam search in layer 0. Filtered-out nodes are still
//! traversed so that a restrictive filter does not disconnect the search,
//! but only live nodes are collected as results.

use super::{
    bits::LiveIds,
    graph::OnHeapGraph,
    metrics::ops_counter::Operation,
    score::{sort_best_first, NodeScore, SearchScoreProvider},
};
use crate::{config::IndexConfig, vector::NodeId};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet},
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

/// Parameters of a single search.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchParams {
    /// Number of results to return
    pub k: usize,

    /// Size of the candidate pool kept during the layer 0 search. Raised to
    /// `k` and to the rerank depth if smaller.
    pub beam_width: usize,

    /// Number of approximate candidates rescored by the reranker, if the
    /// score provider has one. Defaults to `k`.
    pub rerank_k: Option<usize>,

    /// Minimum score of returned nodes
    pub threshold: f32,

    /// Stop expanding once this many similarities have been evaluated
    pub max_visited: Option<usize>,

    /// Stop expanding at this instant
    pub deadline: Option<Instant>,
}

impl SearchParams {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            beam_width: k,
            rerank_k: None,
            threshold: f32::NEG_INFINITY,
            max_visited: None,
            deadline: None,
        }
    }

    pub fn with_beam_width(mut self, beam_width: usize) -> Self {
        self.beam_width = beam_width;
        self
    }

    pub fn with_rerank_k(mut self, rerank_k: usize) -> Self {
        self.rerank_k = Some(rerank_k);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_max_visited(mut self, max_visited: usize) -> Self {
        self.max_visited = Some(max_visited);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn rerank_k(&self) -> usize {
        self.rerank_k.unwrap_or(self.k).max(self.k)
    }

    /// Capacity of the result pool in layer 0.
    pub fn ef(&self) -> usize {
        self.beam_width.max(self.k).max(self.rerank_k())
    }
}

/// Nodes found by a search, best first, with traversal statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub nodes: Vec<NodeScore>,

    /// Number of similarity evaluations performed
    pub visited_count: usize,

    /// Number of neighbor lists read, in all layers
    pub expanded_count: usize,

    /// Number of neighbor lists read in layer 0
    pub expanded_count_base_layer: usize,

    /// Whether the search stopped early on its visit budget or deadline
    pub exhausted: bool,
}

impl SearchResult {
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|ns| ns.node).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SearchStats {
    pub visited: usize,
    pub expanded: usize,
    pub expanded_base_layer: usize,
    pub exhausted: bool,
}

impl SearchStats {
    fn absorb(&mut self, other: SearchStats) {
        self.visited += other.visited;
        self.expanded += other.expanded;
        self.expanded_base_layer += other.expanded_base_layer;
        self.exhausted |= other.exhausted;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Budget {
    max_visited: Option<usize>,
    deadline: Option<Instant>,
}

impl Budget {
    pub fn unbounded() -> Self {
        Self::default()
    }

    fn is_spent(&self, stats: &SearchStats) -> bool {
        self.max_visited.is_some_and(|max| stats.visited >= max)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl From<&SearchParams> for Budget {
    fn from(params: &SearchParams) -> Self {
        Self {
            max_visited: params.max_visited,
            deadline: params.deadline,
        }
    }
}

/// Defaults applied by [`GraphSearcher::search`] and
/// [`GraphSearcher::range_search`].
#[derive(Clone, Copy, Debug)]
struct SearchDefaults {
    beam_width: Option<usize>,
    rerank_multiplier: usize,
    max_visited: Option<usize>,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            beam_width: None,
            rerank_multiplier: 1,
            max_visited: None,
        }
    }
}

/// Searches one graph, reusing its scratch state across queries.
///
/// A searcher borrows the graph for its whole lifetime and may run while
/// other threads insert into it. It is not shared between threads; each
/// thread creates its own.
pub struct GraphSearcher<'g> {
    graph: &'g OnHeapGraph,
    defaults: SearchDefaults,
    visited: HashSet<NodeId>,
    candidates: BinaryHeap<NodeScore>,
    results: BinaryHeap<Reverse<NodeScore>>,
}

impl<'g> GraphSearcher<'g> {
    pub fn new(graph: &'g OnHeapGraph) -> Self {
        Self {
            graph,
            defaults: SearchDefaults::default(),
            visited: HashSet::new(),
            candidates: BinaryHeap::new(),
            results: BinaryHeap::new(),
        }
    }

    /// Searcher using the search section of `config` for its defaults.
    pub fn from_config(graph: &'g OnHeapGraph, config: &IndexConfig) -> Self {
        let mut searcher = Self::new(graph);
        searcher.defaults = SearchDefaults {
            beam_width: Some(config.search_beam_width()),
            rerank_multiplier: config.search.rerank_multiplier,
            max_visited: config.search.max_visited,
        };
        searcher
    }

    pub fn with_beam_width(mut self, beam_width: usize) -> Self {
        self.defaults.beam_width = Some(beam_width);
        self
    }

    pub fn graph(&self) -> &'g OnHeapGraph {
        self.graph
    }

    fn default_params(&self, k: usize) -> SearchParams {
        let mut params = SearchParams::new(k)
            .with_beam_width(self.defaults.beam_width.unwrap_or(k))
            .with_rerank_k(k.saturating_mul(self.defaults.rerank_multiplier));
        params.max_visited = self.defaults.max_visited;
        params
    }

    /// The `k` live nodes best matching the query of `provider`.
    pub fn search<L: LiveIds + ?Sized>(
        &mut self,
        provider: &SearchScoreProvider<'_>,
        k: usize,
        live: &L,
    ) -> SearchResult {
        let params = self.default_params(k);
        self.search_with(provider, &params, live)
    }

    /// Live nodes scoring at least `threshold`.
    ///
    /// The result size doubles from the default beam width until a search
    /// returns fewer nodes than requested, so that all qualifying nodes near
    /// the query are found.
    pub fn range_search<L: LiveIds + ?Sized>(
        &mut self,
        provider: &SearchScoreProvider<'_>,
        threshold: f32,
        live: &L,
    ) -> SearchResult {
        let mut k = self.defaults.beam_width.unwrap_or(16).max(1);
        let mut stats = SearchStats::default();
        loop {
            let params = self.default_params(k).with_threshold(threshold);
            let result = self.search_with(provider, &params, live);
            stats.absorb(SearchStats {
                visited: result.visited_count,
                expanded: result.expanded_count,
                expanded_base_layer: result.expanded_count_base_layer,
                exhausted: result.exhausted,
            });
            if result.nodes.len() < k || k >= self.graph.size() || result.exhausted {
                debug!(k, found = result.nodes.len(), "Range search complete");
                return SearchResult {
                    nodes: result.nodes,
                    visited_count: stats.visited,
                    expanded_count: stats.expanded,
                    expanded_count_base_layer: stats.expanded_base_layer,
                    exhausted: stats.exhausted,
                };
            }
            k = k.saturating_mul(2);
        }
    }

    /// Search with explicit parameters.
    #[instrument(level = "trace", target = "searcher::cpu_time", skip_all, fields(k = params.k))]
    pub fn search_with<L: LiveIds + ?Sized>(
        &mut self,
        provider: &SearchScoreProvider<'_>,
        params: &SearchParams,
        live: &L,
    ) -> SearchResult {
        let Some(ep) = self.graph.entry_point() else {
            return SearchResult::default();
        };
        if params.k == 0 {
            return SearchResult::default();
        }

        let mut stats = SearchStats::default();
        let budget = Budget::from(params);

        let mut current = NodeScore::new(ep.node, evaluate(provider, ep.node, &mut stats));
        for lc in (1..=ep.level).rev() {
            current = self.search_layer_greedy(provider, current, lc, &mut stats);
        }

        let mut nodes = self.search_layer(
            provider,
            &[current],
            0,
            params.ef(),
            live,
            params.threshold,
            &budget,
            &mut stats,
        );

        if provider.has_reranker() {
            nodes.truncate(params.rerank_k());
            for ns in nodes.iter_mut() {
                ns.score = provider.exact_score(ns.node);
            }
            nodes.retain(|ns| ns.score >= params.threshold);
            sort_best_first(&mut nodes);
        }
        nodes.truncate(params.k);

        metrics::counter!("navgraph.search.count").increment(1);
        metrics::histogram!("navgraph.search.visited").record(stats.visited as f64);

        SearchResult {
            nodes,
            visited_count: stats.visited,
            expanded_count: stats.expanded,
            expanded_count_base_layer: stats.expanded_base_layer,
            exhausted: stats.exhausted,
        }
    }

    /// Variant of layer search using a beam of 1, moving to the best
    /// unvisited neighbor until no neighbor improves on the current node.
    pub(crate) fn search_layer_greedy(
        &mut self,
        provider: &SearchScoreProvider<'_>,
        start: NodeScore,
        lc: usize,
        stats: &mut SearchStats,
    ) -> NodeScore {
        self.visited.clear();
        self.visited.insert(start.node);

        let mut current = start;
        loop {
            let Some(neighbors) = self.graph.get_neighbors(current.node, lc) else {
                return current;
            };
            stats.expanded += 1;
            if lc == 0 {
                stats.expanded_base_layer += 1;
            }
            debug!(event_type = Operation::ExpandNode.id(), ef = 1u64, lc);

            let mut best = current;
            for node in neighbors.nodes() {
                if self.visited.insert(node) {
                    let candidate = NodeScore::new(node, evaluate(provider, node, stats));
                    if candidate > best {
                        best = candidate;
                    }
                }
            }

            if best == current {
                return current;
            }
            current = best;
        }
    }

    /// Beam search in layer `lc` starting from `entries`, whose scores are
    /// already counted in `stats`.
    ///
    /// Returns up to `ef` live nodes scoring at least `threshold`, best
    /// first. Search stops once the best unexpanded candidate is worse than
    /// the worst of `ef` collected results, or when `budget` is spent.
    #[allow(clippy::too_many_arguments)]
    #[instrument(
        level = "debug",
        skip(self, provider, entries, live, threshold, budget, stats),
        fields(event_type = Operation::LayerSearch.id())
    )]
    pub(crate) fn search_layer<L: LiveIds + ?Sized>(
        &mut self,
        provider: &SearchScoreProvider<'_>,
        entries: &[NodeScore],
        lc: usize,
        ef: usize,
        live: &L,
        threshold: f32,
        budget: &Budget,
        stats: &mut SearchStats,
    ) -> Vec<NodeScore> {
        self.visited.clear();
        self.candidates.clear();
        self.results.clear();
        if ef == 0 {
            return Vec::new();
        }

        for &entry in entries {
            if self.visited.insert(entry.node) {
                self.candidates.push(entry);
                self.offer(entry, ef, live, threshold);
            }
        }

        while let Some(candidate) = self.candidates.pop() {
            if self.results.len() >= ef && self.worst_result().is_some_and(|w| candidate < w) {
                break;
            }
            if budget.is_spent(stats) {
                stats.exhausted = true;
                break;
            }

            let Some(neighbors) = self.graph.get_neighbors(candidate.node, lc) else {
                continue;
            };
            stats.expanded += 1;
            if lc == 0 {
                stats.expanded_base_layer += 1;
            }
            debug!(event_type = Operation::ExpandNode.id(), ef, lc);

            for node in neighbors.nodes() {
                if !self.visited.insert(node) {
                    continue;
                }
                let neighbor = NodeScore::new(node, evaluate(provider, node, stats));
                let promising = self.results.len() < ef
                    || self.worst_result().is_some_and(|w| neighbor > w);
                if promising {
                    self.candidates.push(neighbor);
                }
                self.offer(neighbor, ef, live, threshold);
            }
        }

        let mut found = self
            .results
            .drain()
            .map(|Reverse(ns)| ns)
            .collect::<Vec<_>>();
        sort_best_first(&mut found);
        found
    }

    fn worst_result(&self) -> Option<NodeScore> {
        self.results.peek().map(|Reverse(ns)| *ns)
    }

    fn offer<L: LiveIds + ?Sized>(&mut self, ns: NodeScore, ef: usize, live: &L, threshold: f32) {
        if ns.score < threshold || !live.is_live(ns.node) {
            return;
        }
        self.results.push(Reverse(ns));
        if self.results.len() > ef {
            self.results.pop();
        }
    }
}

#[inline]
fn evaluate(provider: &SearchScoreProvider<'_>, node: NodeId, stats: &mut SearchStats) -> f32 {
    stats.visited += 1;
    debug!(event_type = Operation::EvaluateSimilarity.id());
    provider.score(node)
}
