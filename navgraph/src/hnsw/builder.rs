//! Concurrent construction of a hierarchical proximity graph.
//!
//! Insertion runs in the caller's thread and may proceed from many threads
//! at once. Each node picks a random top level, descends greedily to that
//! level, and in each layer below searches for candidates, keeps a diverse
//! subset as its neighbors, and links back from them. Nodes still being
//! inserted by other threads are offered as extra candidates so that
//! concurrent insertions can find each other.
//!
//! `cleanup` runs once insertion has quiesced and restores the structural
//! guarantees concurrent insertion can only approximate: symmetric edges and
//! reachability of every node from the entry point.

use super::{
    graph::{EntryPoint, NodeArray, OnHeapGraph},
    layer_distribution::{gen_layer_prf, prf_key_from_seed, LayerDistribution},
    metrics::ops_counter::Operation,
    score::{sort_best_first, NodeScore, SearchScoreProvider},
    searcher::{Budget, GraphSearcher, SearchResult, SearchStats},
    LiveIds,
};
use crate::{
    config::IndexConfig,
    error::{IndexError, Result},
    vector::{NodeId, SimilarityFunction, VectorSimilarityFunction, VectorSource},
};
use dashmap::DashMap;
use rand::RngCore;
use rayon::prelude::*;
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};

/// Decrement of the diversity threshold between selection passes.
const ALPHA_STEP: f32 = 0.2;

/// Bound on reachability repair passes per layer in `cleanup`.
const MAX_RECONNECT_ROUNDS: usize = 16;

/// Removes a node from the in-progress set when its insertion ends.
struct InProgressGuard<'a> {
    in_progress: &'a DashMap<NodeId, usize>,
    node: NodeId,
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.in_progress.remove(&self.node);
    }
}

/// Builds an [`OnHeapGraph`] over the vectors of a [`VectorSource`].
///
/// `add_node` takes `&self` and may be called from any number of threads,
/// as may searches over [`GraphIndexBuilder::graph`]. `cleanup` requires
/// exclusive access.
#[derive(Debug)]
pub struct GraphIndexBuilder<V, S = VectorSimilarityFunction> {
    config: IndexConfig,
    source: V,
    similarity: S,
    graph: Arc<OnHeapGraph>,
    layer_distribution: LayerDistribution,
    prf_key: [u8; 16],
    /// Nodes whose insertion is running, with their levels
    in_progress: DashMap<NodeId, usize>,
}

impl<V: VectorSource> GraphIndexBuilder<V> {
    /// Builder comparing vectors with the similarity named in `config`.
    pub fn new(config: IndexConfig, source: V) -> Result<Self> {
        let similarity = config.similarity;
        Self::with_similarity(config, source, similarity)
    }
}

impl<V: VectorSource, S: SimilarityFunction> GraphIndexBuilder<V, S> {
    /// Builder comparing vectors with `similarity`, which must be symmetric.
    pub fn with_similarity(config: IndexConfig, source: V, similarity: S) -> Result<Self> {
        config.validate()?;
        IndexError::check_dimension(config.dimension, source.dimension())?;
        let layer_distribution = LayerDistribution::from_config(&config)?;
        info!(
            dimension = config.dimension,
            max_degree = config.max_degree,
            beam_width = config.beam_width,
            alpha = config.alpha,
            beta = config.beta,
            hierarchical = config.hierarchical,
            "Created graph builder"
        );
        Ok(Self {
            graph: Arc::new(OnHeapGraph::from_config(&config)),
            prf_key: prf_key_from_seed(config.seed),
            layer_distribution,
            in_progress: DashMap::new(),
            config,
            source,
            similarity,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn source(&self) -> &V {
        &self.source
    }

    pub fn similarity(&self) -> &S {
        &self.similarity
    }

    pub fn graph(&self) -> &OnHeapGraph {
        &self.graph
    }

    /// Shared handle to the graph, e.g. for searching from other threads.
    /// `cleanup` fails while such handles are alive.
    pub fn shared_graph(&self) -> Arc<OnHeapGraph> {
        Arc::clone(&self.graph)
    }

    pub fn into_graph(self) -> Arc<OnHeapGraph> {
        self.graph
    }

    /// Searcher over the graph using the search settings of the config.
    pub fn searcher(&self) -> GraphSearcher<'_> {
        GraphSearcher::from_config(&self.graph, &self.config)
    }

    /// Search for the `k` live nodes most similar to `query`.
    pub fn search<L: LiveIds + ?Sized>(
        &self,
        query: &[f32],
        k: usize,
        live: &L,
    ) -> Result<SearchResult> {
        let provider = SearchScoreProvider::for_query(&self.source, &self.similarity, query)?;
        Ok(self.searcher().search(&provider, k, live))
    }

    /// Search for the `k` best live nodes of every query, in parallel.
    /// Results are in query order.
    pub fn search_batch<Q, L>(
        &self,
        queries: &[Q],
        k: usize,
        live: &L,
    ) -> Result<Vec<SearchResult>>
    where
        Q: AsRef<[f32]> + Sync,
        L: LiveIds + ?Sized,
    {
        queries
            .par_iter()
            .map_init(
                || self.searcher(),
                |searcher, query| -> Result<SearchResult> {
                    let provider = SearchScoreProvider::for_query(
                        &self.source,
                        &self.similarity,
                        query.as_ref(),
                    )?;
                    Ok(searcher.search(&provider, k, live))
                },
            )
            .collect()
    }

    /// Live nodes scoring at least `threshold` for every query, in parallel.
    /// Results are in query order.
    pub fn range_search_batch<Q, L>(
        &self,
        queries: &[Q],
        threshold: f32,
        live: &L,
    ) -> Result<Vec<SearchResult>>
    where
        Q: AsRef<[f32]> + Sync,
        L: LiveIds + ?Sized,
    {
        queries
            .par_iter()
            .map_init(
                || self.searcher(),
                |searcher, query| -> Result<SearchResult> {
                    let provider = SearchScoreProvider::for_query(
                        &self.source,
                        &self.similarity,
                        query.as_ref(),
                    )?;
                    Ok(searcher.range_search(&provider, threshold, live))
                },
            )
            .collect()
    }

    /// Draw a level from the configured distribution using `rng`.
    pub fn gen_layer_rng(&self, rng: &mut impl RngCore) -> usize {
        self.layer_distribution.gen_layer(rng)
    }

    /// Level of `node`, derived from the node id and the configured seed.
    pub fn gen_layer_prf(&self, node: NodeId) -> usize {
        gen_layer_prf(&self.layer_distribution, &self.prf_key, &node)
    }

    /// Insert `node` with its `vector`, choosing its level from its id.
    pub fn add_node(&self, node: NodeId, vector: &[f32]) -> Result<()> {
        let level = self.gen_layer_prf(node);
        self.add_node_at_level(node, vector, level)
    }

    /// Insert `node` with a level drawn from `rng`.
    pub fn add_node_with_rng(
        &self,
        node: NodeId,
        vector: &[f32],
        rng: &mut impl RngCore,
    ) -> Result<()> {
        let level = self.gen_layer_rng(rng);
        self.add_node_at_level(node, vector, level)
    }

    /// Insert `node` with top level `level`. Inserting an id already in the
    /// graph is a no-op. `vector` must be the vector the source holds for
    /// `node`.
    #[instrument(level = "debug", skip(self, vector))]
    pub fn add_node_at_level(&self, node: NodeId, vector: &[f32], level: usize) -> Result<()> {
        IndexError::check_dimension(self.config.dimension, vector.len())?;
        let level = if self.config.hierarchical { level } else { 0 };

        if !self.graph.add_node(node, level) {
            debug!(node, "Node already present, skipping insertion");
            return Ok(());
        }
        self.in_progress.insert(node, level);
        let _guard = InProgressGuard {
            in_progress: &self.in_progress,
            node,
        };

        self.connect(node, vector, level);
        metrics::counter!("navgraph.insert.count").increment(1);
        Ok(())
    }

    fn connect(&self, node: NodeId, vector: &[f32], level: usize) {
        let pending = (node, vector);
        let provider = SearchScoreProvider::exact(|other| {
            if other == node {
                return f32::NEG_INFINITY;
            }
            self.source
                .get_vector(other)
                .map_or(f32::NEG_INFINITY, |v| self.similarity.compare(vector, v))
        });

        let ep = loop {
            match self.graph.entry_point() {
                Some(ep) => break ep,
                None => {
                    if self.graph.try_update_entry_point(EntryPoint { node, level }) {
                        debug!(node, level, "Initialized entry point");
                        return;
                    }
                }
            }
        };

        let mut searcher = GraphSearcher::new(&self.graph);
        let mut stats = SearchStats::default();

        let mut current = NodeScore::new(ep.node, provider.score(ep.node));
        for lc in ((level + 1)..=ep.level).rev() {
            current = searcher.search_layer_greedy(&provider, current, lc, &mut stats);
        }

        let not_self = |other: NodeId| other != node;
        let mut entries = vec![current];
        for lc in (0..=level.min(ep.level)).rev() {
            let mut candidates = searcher.search_layer(
                &provider,
                &entries,
                lc,
                self.config.beam_width,
                &not_self,
                f32::NEG_INFINITY,
                &Budget::unbounded(),
                &mut stats,
            );
            self.add_in_progress_candidates(node, vector, lc, &mut candidates);

            let max_degree = self.graph.max_degree_at(lc);
            let thresholds = self.forward_thresholds();
            let selected = self.select_diverse(&candidates, max_degree, thresholds, pending);
            self.install_neighbors(node, lc, &selected, pending);
            self.add_back_edges(node, lc, pending);

            if !candidates.is_empty() {
                entries = candidates;
            }
        }

        if level > ep.level && self.graph.try_update_entry_point(EntryPoint { node, level }) {
            debug!(node, level, "Raised entry point");
        }
        debug!(
            node,
            level,
            visited = stats.visited,
            expanded = stats.expanded,
            "Inserted node"
        );
    }

    /// Offer nodes concurrently being inserted, which search may not reach
    /// yet, as candidates in layer `lc`. Keeps `candidates` sorted.
    fn add_in_progress_candidates(
        &self,
        node: NodeId,
        vector: &[f32],
        lc: usize,
        candidates: &mut Vec<NodeScore>,
    ) {
        let others = self
            .in_progress
            .iter()
            .filter(|entry| *entry.key() != node && *entry.value() >= lc)
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();
        for other in others {
            if candidates.iter().any(|c| c.node == other) || !self.graph.contains_at(other, lc) {
                continue;
            }
            if let Some(v) = self.source.get_vector(other) {
                candidates.push(NodeScore::new(other, self.similarity.compare(vector, v)));
            }
        }
        sort_best_first(candidates);
    }

    /// First and last diversity thresholds for a node's own neighbors.
    ///
    /// Selection always ends at `alpha`. An `alpha` below 1 is reached by
    /// relaxing from 1; otherwise selection is a single pass.
    fn forward_thresholds(&self) -> (f32, f32) {
        (self.config.alpha.max(1.0), self.config.alpha)
    }

    /// Thresholds for re-pruning a neighbor list that a back-edge overfills,
    /// relaxed by `beta`.
    fn backward_thresholds(&self) -> (f32, f32) {
        let (first, last) = self.forward_thresholds();
        (first / self.config.beta, last / self.config.beta)
    }

    fn vector_of<'a>(
        &'a self,
        node: NodeId,
        pending: (NodeId, &'a [f32]),
    ) -> Option<&'a [f32]> {
        if node == pending.0 {
            Some(pending.1)
        } else {
            self.source.get_vector(node)
        }
    }

    /// Select up to `max_degree` diverse neighbors among `candidates`, which
    /// are sorted best-first and scored against a common base node.
    ///
    /// A candidate `c` is dominated by an already selected `n` when
    /// `sim(c, n) * a > score(c)`, so a larger `a` gives fewer neighbors.
    /// Selection first runs with `a` at the first threshold, then lowers `a`
    /// by `ALPHA_STEP` down to the last threshold while the degree budget is
    /// not exhausted.
    fn select_diverse(
        &self,
        candidates: &[NodeScore],
        max_degree: usize,
        (first, last): (f32, f32),
        pending: (NodeId, &[f32]),
    ) -> Vec<NodeScore> {
        debug!(
            event_type = Operation::PruneNeighbors.id(),
            candidates = candidates.len(),
            max_degree
        );
        let mut selected: Vec<(NodeScore, &[f32])> = Vec::with_capacity(max_degree);
        let mut taken = vec![false; candidates.len()];
        let mut alpha = first;
        loop {
            for (idx, candidate) in candidates.iter().enumerate() {
                if selected.len() >= max_degree {
                    break;
                }
                if taken[idx] {
                    continue;
                }
                let Some(c_vec) = self.vector_of(candidate.node, pending) else {
                    taken[idx] = true;
                    continue;
                };
                let dominated = selected.iter().any(|(_, n_vec)| {
                    self.similarity.compare(c_vec, n_vec) * alpha > candidate.score
                });
                if !dominated {
                    taken[idx] = true;
                    selected.push((*candidate, c_vec));
                }
            }
            if selected.len() >= max_degree || alpha <= last {
                break;
            }
            alpha = (alpha - ALPHA_STEP).max(last);
        }

        let mut selected = selected.into_iter().map(|(ns, _)| ns).collect::<Vec<_>>();
        sort_best_first(&mut selected);
        selected
    }

    /// Publish the neighbors of `node` in layer `lc`, merging with back-edges
    /// concurrent insertions have already added.
    fn install_neighbors(
        &self,
        node: NodeId,
        lc: usize,
        selected: &[NodeScore],
        pending: (NodeId, &[f32]),
    ) {
        let dropped = self
            .graph
            .update_neighbors(node, lc, |current| {
                if current.is_empty() {
                    *current = NodeArray::from_sorted(current.capacity(), selected.iter().copied());
                    return Vec::new();
                }
                let mut merged = current.as_slice().to_vec();
                merged.extend(selected.iter().filter(|s| !current.contains(s.node)));
                sort_best_first(&mut merged);
                self.replace_pruned(current, merged, self.forward_thresholds(), pending)
            })
            .unwrap_or_default();
        for other in dropped {
            self.graph.update_neighbors(other, lc, |array| array.remove(node));
        }
    }

    /// Link every neighbor of `node` in layer `lc` back to `node`. A full
    /// neighbor list is re-pruned with the new edge included; any edge
    /// dropped that way is removed in both directions.
    fn add_back_edges(&self, node: NodeId, lc: usize, pending: (NodeId, &[f32])) {
        let Some(neighbors) = self.graph.get_neighbors(node, lc) else {
            return;
        };
        for edge in neighbors.iter() {
            let target = edge.node;
            let back_edge = NodeScore::new(node, edge.score);
            let dropped = self
                .graph
                .update_neighbors(target, lc, |current| {
                    if current.contains(node) {
                        return Vec::new();
                    }
                    if !current.is_full() {
                        current.insert(back_edge);
                        return Vec::new();
                    }
                    let mut merged = current.as_slice().to_vec();
                    merged.push(back_edge);
                    sort_best_first(&mut merged);
                    self.replace_pruned(current, merged, self.backward_thresholds(), pending)
                })
                .unwrap_or_default();
            for other in dropped {
                self.graph.update_neighbors(other, lc, |array| array.remove(target));
            }
        }
    }

    /// Replace `current` with `merged`, pruned if it exceeds the capacity.
    /// Returns the ids of dropped edges.
    fn replace_pruned(
        &self,
        current: &mut NodeArray,
        merged: Vec<NodeScore>,
        thresholds: (f32, f32),
        pending: (NodeId, &[f32]),
    ) -> Vec<NodeId> {
        let capacity = current.capacity();
        if merged.len() <= capacity {
            *current = NodeArray::from_sorted(capacity, merged);
            return Vec::new();
        }
        let kept = self.select_diverse(&merged, capacity, thresholds, pending);
        let dropped = merged
            .iter()
            .filter(|m| !kept.iter().any(|k| k.node == m.node))
            .map(|m| m.node)
            .collect();
        *current = NodeArray::from_sorted(capacity, kept);
        dropped
    }

    /// Insert every vector of the source, in parallel, then run `cleanup`.
    #[instrument(level = "info", skip(self))]
    pub fn build(&mut self) -> Result<()> {
        let size = self.source.size();
        let node_count = NodeId::try_from(size).map_err(|_| {
            IndexError::invalid_config(format!("{size} vectors exceed the node id range"))
        })?;
        let insert_all = || {
            (0..node_count).into_par_iter().try_for_each(|node| {
                match self.source.get_vector(node) {
                    Some(vector) => self.add_node(node, vector),
                    None => Ok(()),
                }
            })
        };
        match self.config.num_threads {
            Some(num_threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()?
                .install(insert_all)?,
            None => insert_all()?,
        }
        info!(size = self.graph.size(), "Inserted all vectors");
        self.cleanup()
    }

    /// Restore symmetric edges and reachability of every node from the entry
    /// point, in every layer.
    ///
    /// Fails with `ConcurrentStateViolation` if other handles to the graph
    /// are alive or insertions are in progress. Running it twice in a row
    /// leaves the graph unchanged the second time.
    #[instrument(level = "info", skip(self))]
    pub fn cleanup(&mut self) -> Result<()> {
        let handles = Arc::strong_count(&self.graph);
        if handles > 1 {
            return Err(IndexError::ConcurrentStateViolation(format!(
                "cleanup requires exclusive access, {} other graph handles are alive",
                handles - 1
            )));
        }
        if !self.in_progress.is_empty() {
            return Err(IndexError::ConcurrentStateViolation(format!(
                "{} insertions in progress",
                self.in_progress.len()
            )));
        }

        let Some(top) = self.graph.top_layer_entry_point() else {
            return Ok(());
        };
        let valid_entry_point = self
            .graph
            .entry_point()
            .is_some_and(|ep| ep.level >= top.level && self.graph.contains_at(ep.node, ep.level));
        if !valid_entry_point {
            warn!(node = top.node, level = top.level, "Replacing entry point");
            self.graph.set_entry_point(Some(top));
        }

        let mut removed = 0;
        let mut reconnected = 0;
        for lc in 0..self.graph.num_layers() {
            removed += self.repair_edges(lc);
            reconnected += self.reconnect_layer(lc);
        }

        metrics::counter!("navgraph.cleanup.count").increment(1);
        info!(
            size = self.graph.size(),
            removed, reconnected, "Graph cleanup complete"
        );
        Ok(())
    }

    /// Drop edges to nodes absent from layer `lc` and make every edge
    /// symmetric, adding the reverse edge where there is room and removing
    /// the edge otherwise. Returns the number of edges removed.
    fn repair_edges(&self, lc: usize) -> usize {
        let Some(layer) = self.graph.layer(lc) else {
            return 0;
        };
        let mut removed = 0;
        for node in layer.node_ids() {
            let Some(neighbors) = layer.neighbors(node) else {
                continue;
            };
            for edge in neighbors.iter() {
                let target = edge.node;
                let symmetric = target != node
                    && self
                        .graph
                        .update_neighbors(target, lc, |current| {
                            current.contains(node)
                                || (!current.is_full()
                                    && current.insert(NodeScore::new(node, edge.score)))
                        })
                        .unwrap_or(false);
                if !symmetric {
                    self.graph.update_neighbors(node, lc, |current| current.remove(target));
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Link nodes of layer `lc` unreachable from the entry point to their
    /// best reachable match. Returns the number of links made.
    fn reconnect_layer(&self, lc: usize) -> usize {
        let Some(ep) = self.graph.entry_point() else {
            return 0;
        };
        let ids = self.graph.node_ids(lc);
        if ids.is_empty() {
            return 0;
        }
        let mut reconnected = 0;
        for _ in 0..MAX_RECONNECT_ROUNDS {
            let mut reachable = HashSet::new();
            self.extend_reachable(&mut reachable, ep.node, lc);
            let orphans = ids
                .iter()
                .copied()
                .filter(|node| !reachable.contains(node))
                .collect::<Vec<_>>();
            if orphans.is_empty() {
                return reconnected;
            }
            debug!(lc, orphans = orphans.len(), "Reconnecting unreachable nodes");
            for orphan in orphans {
                if reachable.contains(&orphan) {
                    continue;
                }
                if self.link_to_reachable(orphan, ep, lc, &reachable) {
                    self.extend_reachable(&mut reachable, orphan, lc);
                    reconnected += 1;
                }
            }
        }
        warn!(lc, "Nodes remain unreachable after cleanup");
        reconnected
    }

    fn extend_reachable(&self, reachable: &mut HashSet<NodeId>, start: NodeId, lc: usize) {
        reachable.insert(start);
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            let Some(neighbors) = self.graph.get_neighbors(node, lc) else {
                continue;
            };
            for next in neighbors.nodes() {
                if reachable.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }

    /// Link `orphan` with the best node found by searching from `ep`,
    /// preferring one with a free slot. Returns whether a link was made.
    fn link_to_reachable(
        &self,
        orphan: NodeId,
        ep: EntryPoint,
        lc: usize,
        reachable: &HashSet<NodeId>,
    ) -> bool {
        let Some(vector) = self.source.get_vector(orphan) else {
            warn!(node = orphan, "Graph node has no vector in the source");
            return false;
        };
        let provider = SearchScoreProvider::exact(|other| {
            self.source
                .get_vector(other)
                .map_or(f32::NEG_INFINITY, |v| self.similarity.compare(vector, v))
        });
        let live = |other: NodeId| other != orphan && reachable.contains(&other);
        let mut searcher = GraphSearcher::new(&self.graph);
        let mut stats = SearchStats::default();
        let entry = NodeScore::new(ep.node, provider.score(ep.node));
        let found = searcher.search_layer(
            &provider,
            &[entry],
            lc,
            self.config.beam_width,
            &live,
            f32::NEG_INFINITY,
            &Budget::unbounded(),
            &mut stats,
        );
        let has_room = |candidate: &&NodeScore| {
            self.graph
                .get_neighbors(candidate.node, lc)
                .is_some_and(|neighbors| !neighbors.is_full())
        };
        let Some(partner) = found.iter().find(has_room).or(found.first()).copied() else {
            return false;
        };

        for (from, to) in [(orphan, partner.node), (partner.node, orphan)] {
            let evicted = self
                .graph
                .update_neighbors(from, lc, |current| {
                    current.insert_forced(NodeScore::new(to, partner.score))
                })
                .flatten();
            if let Some(evicted) = evicted {
                self.graph.update_neighbors(evicted.node, lc, |current| current.remove(from));
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hnsw::bits::AllLive,
        vector::{ListVectorSource, VectorSimilarityFunction},
    };
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rstest::rstest;
    use tracing_test::traced_test;

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen::<f32>()).collect())
            .collect()
    }

    fn builder(n: usize, dim: usize, config: IndexConfig) -> GraphIndexBuilder<ListVectorSource> {
        let source = ListVectorSource::new(dim, random_vectors(n, dim, 0)).unwrap();
        GraphIndexBuilder::new(config, source).unwrap()
    }

    fn euclidean(dim: usize, max_degree: usize, beam_width: usize, alpha: f32) -> IndexConfig {
        IndexConfig::new(dim, max_degree, beam_width, alpha)
            .with_similarity(VectorSimilarityFunction::Euclidean)
    }

    fn insert_all_sequential<V: VectorSource>(builder: &GraphIndexBuilder<V>) {
        for node in 0..builder.source().size() as NodeId {
            let vector = builder.source().get_vector(node).unwrap().to_vec();
            builder.add_node(node, &vector).unwrap();
        }
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let source = ListVectorSource::new(4, random_vectors(4, 4, 0)).unwrap();
        let err = GraphIndexBuilder::new(IndexConfig::new(4, 0, 10, 1.2), source.clone());
        assert!(matches!(err, Err(IndexError::InvalidConfiguration(_))));
        let err = GraphIndexBuilder::new(IndexConfig::new(8, 4, 10, 1.2), source);
        assert!(matches!(
            err,
            Err(IndexError::DimensionMismatch {
                expected: 8,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_add_node_dimension_mismatch() {
        let builder = builder(4, 4, euclidean(4, 4, 10, 1.2));
        let err = builder.add_node(0, &[0.0; 3]);
        assert!(matches!(err, Err(IndexError::DimensionMismatch { .. })));
        assert_eq!(builder.graph().size(), 0);
    }

    #[test]
    fn test_first_node_becomes_entry_point() {
        let builder = builder(2, 4, euclidean(4, 4, 10, 1.2));
        let vector = builder.source().get_vector(0).unwrap().to_vec();
        builder.add_node_at_level(0, &vector, 2).unwrap();
        assert_eq!(builder.graph().entry_point(), Some(EntryPoint { node: 0, level: 2 }));
        assert_eq!(builder.graph().size(), 1);
        assert_eq!(builder.graph().degree(0, 0), Some(0));
    }

    #[test]
    #[traced_test]
    fn test_duplicate_insert_is_noop() {
        let builder = builder(10, 4, euclidean(4, 4, 10, 1.2));
        insert_all_sequential(&builder);
        let before = builder.graph().snapshot();
        let vector = builder.source().get_vector(3).unwrap().to_vec();
        builder.add_node_at_level(3, &vector, 5).unwrap();
        assert!(logs_contain("Node already present"));
        assert_eq!(builder.graph().snapshot(), before);
        assert_eq!(builder.graph().size(), 10);
    }

    #[test]
    fn test_flat_graph_has_single_layer() {
        let config = euclidean(4, 4, 10, 1.2).with_hierarchical(false);
        let mut builder = builder(100, 4, config);
        let vector = builder.source().get_vector(0).unwrap().to_vec();
        builder.add_node_at_level(0, &vector, 3).unwrap();
        builder.build().unwrap();
        assert_eq!(builder.graph().num_layers(), 1);
        assert_eq!(builder.graph().max_layer(), 0);
        assert_eq!(builder.graph().size(), 100);
    }

    #[test]
    fn test_higher_level_raises_entry_point() {
        let builder = builder(3, 4, euclidean(4, 4, 10, 1.2));
        for (node, level) in [(0, 0), (1, 2), (2, 1)] {
            let vector = builder.source().get_vector(node).unwrap().to_vec();
            builder.add_node_at_level(node, &vector, level).unwrap();
        }
        assert_eq!(builder.graph().entry_point(), Some(EntryPoint { node: 1, level: 2 }));
        assert_eq!(builder.graph().node_level(2), Some(1));
        // Node 2 linked to node 1 in layer 1, both ways
        assert!(builder.graph().get_neighbors(2, 1).unwrap().contains(1));
        assert!(builder.graph().get_neighbors(1, 1).unwrap().contains(2));
    }

    const ORIGIN: [f32; 2] = [0.0, 0.0];

    /// Base at the origin and candidates 1 and 2 on a line, so 2 is shadowed
    /// by 1. Candidate 3 sits off the line.
    fn collinear_builder(
        config: IndexConfig,
    ) -> (GraphIndexBuilder<ListVectorSource>, Vec<NodeScore>) {
        let vectors = vec![ORIGIN.to_vec(), vec![1.0, 0.0], vec![2.0, 0.0], vec![0.0, 1.0]];
        let sim = VectorSimilarityFunction::Euclidean;
        let mut candidates = (1..4)
            .map(|n| NodeScore::new(n, sim.compare(&ORIGIN, &vectors[n as usize])))
            .collect::<Vec<_>>();
        sort_best_first(&mut candidates);
        let source = ListVectorSource::new(2, vectors).unwrap();
        let builder = GraphIndexBuilder::new(config, source).unwrap();
        (builder, candidates)
    }

    fn node_ids(selected: &[NodeScore]) -> Vec<NodeId> {
        selected.iter().map(|ns| ns.node).collect()
    }

    #[test]
    fn test_diversity_pruning() {
        let (builder, candidates) = collinear_builder(euclidean(2, 4, 10, 1.0));
        let pending = (0, ORIGIN.as_slice());

        let selected = builder.select_diverse(&candidates, 4, (1.0, 1.0), pending);
        assert_eq!(node_ids(&selected), vec![1, 3]);

        // Relaxed threshold keeps everything
        let selected = builder.select_diverse(&candidates, 4, (0.1, 0.1), pending);
        assert_eq!(selected.len(), 3);

        // Degree bound
        let selected = builder.select_diverse(&candidates, 1, (0.1, 0.1), pending);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].node, 1);
    }

    #[rstest]
    #[case(0.1, vec![1, 3, 2])]
    #[case(1.0, vec![1, 3])]
    #[case(4.0, vec![1])]
    fn test_alpha_bounds_forward_selection(#[case] alpha: f32, #[case] expected: Vec<NodeId>) {
        let (builder, candidates) = collinear_builder(euclidean(2, 4, 10, alpha));
        let selected = builder.select_diverse(
            &candidates,
            4,
            builder.forward_thresholds(),
            (0, ORIGIN.as_slice()),
        );
        assert_eq!(node_ids(&selected), expected);
    }

    #[test]
    fn test_beta_relaxes_back_edge_pruning() {
        let pending = (0, ORIGIN.as_slice());

        let (strict, candidates) = collinear_builder(euclidean(2, 4, 10, 1.0));
        let selected = strict.select_diverse(&candidates, 4, strict.backward_thresholds(), pending);
        assert_eq!(node_ids(&selected), vec![1, 3]);

        // beta > 1 keeps the shadowed edge that beta = 1 drops
        let (relaxed, candidates) = collinear_builder(euclidean(2, 4, 10, 1.0).with_beta(4.0));
        let selected =
            relaxed.select_diverse(&candidates, 4, relaxed.backward_thresholds(), pending);
        assert_eq!(node_ids(&selected), vec![1, 3, 2]);
    }

    #[test]
    fn test_average_degree_falls_as_alpha_rises() {
        let degrees = [1.0, 2.0, 4.0]
            .into_iter()
            .map(|alpha| {
                let mut builder = builder(400, 8, euclidean(8, 8, 40, alpha).with_seed(5));
                builder.build().unwrap();
                let graph = builder.graph();
                let total = graph
                    .node_ids(0)
                    .into_iter()
                    .map(|node| graph.degree(node, 0).unwrap())
                    .sum::<usize>();
                total as f64 / graph.layer_size(0) as f64
            })
            .collect::<Vec<_>>();
        assert!(
            degrees.windows(2).all(|w| w[1] <= w[0]),
            "average degree rose with alpha: {degrees:?}"
        );
        assert!(degrees[2] < degrees[0]);
    }

    #[test]
    fn test_degree_bounds_and_symmetry_after_cleanup() {
        let config = euclidean(8, 4, 30, 1.2).with_seed(3);
        let mut builder = builder(300, 8, config);
        builder.build().unwrap();
        let graph = builder.graph();
        assert_eq!(graph.size(), 300);
        for lc in 0..graph.num_layers() {
            for node in graph.node_ids(lc) {
                let neighbors = graph.get_neighbors(node, lc).unwrap();
                assert!(neighbors.len() <= graph.max_degree_at(lc));
                for other in neighbors.nodes() {
                    assert_ne!(other, node);
                    assert!(
                        graph.get_neighbors(other, lc).unwrap().contains(node),
                        "edge {node} -> {other} in layer {lc} is not symmetric"
                    );
                }
            }
        }
    }

    #[test]
    fn test_cleanup_reconnects_orphans() {
        let mut builder = builder(20, 4, euclidean(4, 4, 10, 1.2));
        insert_all_sequential(&builder);
        // Cut node 7 off from the rest of the graph
        for lc in 0..=builder.graph().node_level(7).unwrap() {
            for other in builder.graph().get_neighbors(7, lc).unwrap().nodes() {
                builder.graph().update_neighbors(other, lc, |a| a.remove(7));
            }
            builder.graph().set_neighbors(7, lc, NodeArray::new(0));
        }
        builder.cleanup().unwrap();
        let result = builder
            .search(builder.source().get_vector(7).unwrap(), 1, &AllLive)
            .unwrap();
        assert_eq!(result.node_ids(), vec![7]);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let mut builder = builder(200, 8, euclidean(8, 6, 20, 1.2));
        builder.build().unwrap();
        let first = builder.graph().snapshot();
        builder.cleanup().unwrap();
        assert_eq!(builder.graph().snapshot(), first);
    }

    #[test]
    fn test_cleanup_with_outstanding_handle() {
        let mut builder = builder(10, 4, euclidean(4, 4, 10, 1.2));
        insert_all_sequential(&builder);
        let handle = builder.shared_graph();
        assert!(matches!(
            builder.cleanup(),
            Err(IndexError::ConcurrentStateViolation(_))
        ));
        drop(handle);
        builder.cleanup().unwrap();
    }

    #[test]
    fn test_sequential_build_is_deterministic() {
        let config = euclidean(8, 6, 20, 1.2).with_seed(11);
        let first = builder(150, 8, config.clone());
        insert_all_sequential(&first);
        let second = builder(150, 8, config);
        insert_all_sequential(&second);
        assert_eq!(first.graph().snapshot(), second.graph().snapshot());
    }
}
