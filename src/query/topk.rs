//! Best-first top-k engine over the augmented tree (C9, tree mode)
//!
//! Frontier entries carry an admissible upper bound on the best combined
//! score reachable below them: exact spatial proximity via mindist, text
//! via the entry's aggregated impact descriptor (inline, stored, or the
//! per-node inverted-file heads at leaf level). Items are scored exactly
//! when popped; the loop stops once the frontier top cannot beat the
//! current k-th score. Entries whose bound ties the threshold are still
//! expanded so equal scores resolve by ascending item id.

use crate::cache::VectorCacheManager;
use crate::index::{InvertedFile, RTree};
use crate::query::{
    step_allowed, PreparedQuery, RankedItem, SearchOptions, SearchOutcome, TopKHeap,
};
use crate::stats::SharedStats;
use crate::types::{Payload, TextSummary};
use crate::{IndexError, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    Node(u32),
    Item { id: u32, spatial: f64 },
}

impl Target {
    fn rank(&self) -> (u8, u32) {
        match self {
            Target::Node(id) => (0, *id),
            Target::Item { id, .. } => (1, *id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FrontierEntry {
    ub: f64,
    target: Target,
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // higher bound first; ties expand nodes before items, smaller ids
        // first, so traversal order is deterministic
        let (self_kind, self_id) = self.target.rank();
        let (other_kind, other_id) = other.target.rank();
        self.ub
            .total_cmp(&other.ub)
            .then_with(|| other_kind.cmp(&self_kind))
            .then_with(|| other_id.cmp(&self_id))
    }
}

pub(crate) fn search(
    tree: &RTree,
    vectors: &VectorCacheManager,
    inverted: &InvertedFile,
    idf: &dyn Fn(u32) -> f64,
    query: &PreparedQuery,
    options: &SearchOptions,
    stats: &SharedStats,
) -> Result<SearchOutcome> {
    let mut results = TopKHeap::new(query.k);
    let Some(root) = tree.root() else {
        return Ok(SearchOutcome::empty());
    };

    let mut frontier: BinaryHeap<FrontierEntry> = BinaryHeap::new();
    let root_text = node_heads_bound(inverted, root, query)?;
    frontier.push(FrontierEntry {
        ub: query.combined(1.0, root_text),
        target: Target::Node(root),
    });

    let mut partial = false;
    let mut pops = 0u64;

    while let Some(top) = frontier.peek() {
        if results.is_full() && top.ub < results.threshold() {
            break;
        }
        if !step_allowed(options, pops)? {
            partial = true;
            break;
        }
        let Some(entry) = frontier.pop() else {
            break;
        };
        pops += 1;
        stats.record(|c| c.heap_pops += 1);

        match entry.target {
            Target::Item { id, spatial } => {
                let text = exact_text(vectors, idf, query, id)?;
                results.push(RankedItem {
                    score: query.combined(spatial, text),
                    item: id,
                });
            }
            Target::Node(id) => {
                let node = tree.read_node(id)?;
                stats.record(|c| c.nodes_visited += 1);
                if node.is_leaf() {
                    // one text bound per leaf: the per-term maxima of its
                    // inverted file dominate every member item
                    let leaf_text = node_heads_bound(inverted, id, query)?;
                    for child in &node.entries {
                        let spatial = query.spatial_bound(&child.rect);
                        let ub = query.combined(spatial, leaf_text);
                        if !results.is_full() || ub >= results.threshold() {
                            frontier.push(FrontierEntry {
                                ub,
                                target: Target::Item {
                                    id: child.id,
                                    spatial,
                                },
                            });
                        }
                    }
                } else {
                    for child in &node.entries {
                        let spatial = query.spatial_bound(&child.rect);
                        let text = child_text_bound(vectors, idf, query, &child.payload)?;
                        let ub = query.combined(spatial, text);
                        if !results.is_full() || ub >= results.threshold() {
                            frontier.push(FrontierEntry {
                                ub,
                                target: Target::Node(child.id),
                            });
                        }
                    }
                }
            }
        }
    }

    Ok(SearchOutcome {
        hits: results.into_hits(),
        partial,
    })
}

/// Text bound for a subtree from the per-term heads of its inverted file.
fn node_heads_bound(
    inverted: &InvertedFile,
    node: u32,
    query: &PreparedQuery,
) -> Result<f64> {
    if query.terms.is_empty() {
        return Ok(0.0);
    }
    let mut sum = 0.0;
    for qt in &query.terms {
        if let Some(impact) = inverted.max_impact(node, qt.term)? {
            sum += qt.weight * impact as f64;
        }
    }
    Ok(sum.min(1.0))
}

/// Text bound for a child entry from its aggregated descriptor.
fn child_text_bound(
    vectors: &VectorCacheManager,
    idf: &dyn Fn(u32) -> f64,
    query: &PreparedQuery,
    payload: &Payload,
) -> Result<f64> {
    if query.terms.is_empty() {
        return Ok(0.0);
    }
    match payload {
        Payload::Text(TextSummary::Inline(impacts)) => Ok(query.text_bound_from_impacts(impacts)),
        Payload::Text(TextSummary::Stored(node_id)) => {
            match vectors.get_node_vector(*node_id, idf) {
                Ok(impacts) => Ok(query.text_bound_from_impacts(&impacts)),
                Err(IndexError::NotFound(_)) => Ok(query.text_bound_unknown()),
                Err(e) => Err(e),
            }
        }
        _ => Ok(query.text_bound_unknown()),
    }
}

/// Exact text score of an item; items without a vector score zero.
fn exact_text(
    vectors: &VectorCacheManager,
    idf: &dyn Fn(u32) -> f64,
    query: &PreparedQuery,
    item: u32,
) -> Result<f64> {
    if query.terms.is_empty() {
        return Ok(0.0);
    }
    match vectors.get_item_vector(item, idf) {
        Ok(vector) => Ok(query.text_score(&vector)),
        Err(IndexError::NotFound(_)) => Ok(0.0),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::distance::weighted_cosine;
    use crate::index::{Augmenter, NodeStats, Vocabulary};
    use crate::query::{QueryRegion, QueryTerm};
    use crate::stats::StatsCenter;
    use crate::storage::{BlockFile, BufferedBlockFile, ListStore};
    use crate::types::{Payload, Point, Rect, SparseVector};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        tree: RTree,
        vectors: VectorCacheManager,
        inverted: InvertedFile,
        nodes: Vocabulary<NodeStats>,
        stats: crate::stats::SharedStats,
        items: Vec<(u32, Point, SparseVector)>,
        _temp: TempDir,
    }

    fn unit_idf(_: u32) -> f64 {
        1.0
    }

    fn create_fixture(max_entries: usize) -> Fixture {
        let temp = TempDir::new().unwrap();
        let stats = StatsCenter::new();
        let config = IndexConfig::default().with_fanout(max_entries);
        let file = BlockFile::create(temp.path(), "blocks", config.block_size, 64, stats.clone())
            .unwrap();
        let file = BufferedBlockFile::new(file, 32, stats.clone()).unwrap();
        let tree = RTree::create(file, &config, stats.clone()).unwrap();
        let item_store =
            ListStore::create(temp.path(), "lists.items", 8, 256, 64, 16, stats.clone()).unwrap();
        let node_store =
            ListStore::create(temp.path(), "lists.nodes", 8, 256, 64, 16, stats.clone()).unwrap();
        let vectors = VectorCacheManager::new(item_store, node_store, 64, stats.clone()).unwrap();
        let inverted = InvertedFile::create(temp.path(), 256, 64, 16, stats.clone()).unwrap();
        let nodes = Vocabulary::create(&temp.path().join("vocab.node"));
        Fixture {
            tree,
            vectors,
            inverted,
            nodes,
            stats,
            items: Vec::new(),
            _temp: temp,
        }
    }

    fn add_item(f: &mut Fixture, id: u32, x: f64, y: f64, terms: Vec<(u32, f32)>) {
        let vector = SparseVector::new(terms);
        f.vectors.put_item_vector(id, vector.clone()).unwrap();
        f.tree
            .insert(id, Rect::from_point(Point::new(x, y)), Payload::None)
            .unwrap();
        f.items.push((id, Point::new(x, y), vector));
    }

    fn augment(f: &Fixture) {
        f.vectors.flush_and_clear().unwrap();
        Augmenter::new(&f.tree, &f.vectors, &f.inverted, &f.nodes, 4)
            .build(&unit_idf)
            .unwrap();
    }

    fn prepare(point: Point, terms: &[(u32, f64)], alpha: f64, k: usize) -> PreparedQuery {
        let norm = terms.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
        let terms = terms
            .iter()
            .map(|(t, w)| QueryTerm {
                term: *t,
                weight: if norm > 0.0 { w / norm } else { 0.0 },
                idf: 1.0,
            })
            .collect();
        PreparedQuery {
            region: QueryRegion::Point(point),
            terms,
            alpha,
            k,
        }
    }

    fn run(f: &Fixture, query: &PreparedQuery, options: &SearchOptions) -> SearchOutcome {
        search(
            &f.tree,
            &f.vectors,
            &f.inverted,
            &unit_idf,
            query,
            options,
            &f.stats,
        )
        .unwrap()
    }

    /// Exhaustively scored expectation with the engine's tie order.
    fn brute_force(f: &Fixture, query: &PreparedQuery, raw_terms: &[(u32, f64)]) -> Vec<(u32, f64)> {
        let query_vector = SparseVector::new(
            raw_terms
                .iter()
                .map(|(t, w)| (*t, *w as f32))
                .collect(),
        );
        let mut scored: Vec<(u32, f64)> = f
            .items
            .iter()
            .map(|(id, point, vector)| {
                let spatial = query.spatial_score(point);
                let text = weighted_cosine(&query_vector, vector, &unit_idf);
                (*id, query.combined(spatial, text))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(query.k);
        scored
    }

    #[test]
    fn empty_tree_returns_nothing() {
        let f = create_fixture(4);
        let query = prepare(Point::new(0.0, 0.0), &[(0, 1.0)], 0.5, 3);
        let outcome = run(&f, &query, &SearchOptions::default());
        assert!(outcome.hits.is_empty());
        assert!(!outcome.partial);
    }

    #[test]
    fn spatial_only_corners() {
        let mut f = create_fixture(4);
        add_item(&mut f, 0, 0.0, 0.0, vec![]);
        add_item(&mut f, 1, 1.0, 0.0, vec![]);
        add_item(&mut f, 2, 0.0, 1.0, vec![]);
        add_item(&mut f, 3, 1.0, 1.0, vec![]);
        augment(&f);
        let query = prepare(Point::new(0.1, 0.1), &[], 1.0, 2);
        let outcome = run(&f, &query, &SearchOptions::default());
        assert_eq!(outcome.hits.len(), 2);
        assert_eq!(outcome.hits[0].item, 0);
        // items 1 and 2 tie in distance; the smaller id wins
        assert_eq!(outcome.hits[1].item, 1);
        assert!(!outcome.partial);
    }

    #[test]
    fn text_only_ranking() {
        let mut f = create_fixture(4);
        add_item(&mut f, 0, 5.0, 5.0, vec![(0, 1.0)]);
        add_item(&mut f, 1, 5.0, 5.0, vec![(0, 0.5), (1, 0.5)]);
        add_item(&mut f, 2, 5.0, 5.0, vec![(1, 1.0)]);
        augment(&f);
        let query = prepare(Point::new(5.0, 5.0), &[(0, 1.0)], 0.0, 2);
        let outcome = run(&f, &query, &SearchOptions::default());
        assert_eq!(outcome.hits.len(), 2);
        assert_eq!(outcome.hits[0].item, 0);
        assert!((outcome.hits[0].score - 1.0).abs() < 1e-9);
        assert_eq!(outcome.hits[1].item, 1);
        assert!((outcome.hits[1].score - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn matches_exhaustive_scoring() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut f = create_fixture(4);
        for id in 0..60u32 {
            let x: f64 = rng.gen_range(0.0..20.0);
            let y: f64 = rng.gen_range(0.0..20.0);
            let mut terms = Vec::new();
            for t in 0..6u32 {
                if rng.gen_bool(0.4) {
                    terms.push((t, rng.gen_range(0.1..1.0f32)));
                }
            }
            add_item(&mut f, id, x, y, terms);
        }
        augment(&f);
        let raw_terms = [(0u32, 1.0f64), (3, 0.5)];
        for alpha in [0.0, 0.3, 0.7, 1.0] {
            let query = prepare(Point::new(10.0, 10.0), &raw_terms, alpha, 5);
            let outcome = run(&f, &query, &SearchOptions::default());
            let expected = brute_force(&f, &query, &raw_terms);
            assert_eq!(outcome.hits.len(), expected.len());
            for (hit, (id, score)) in outcome.hits.iter().zip(&expected) {
                assert_eq!(hit.item, *id, "alpha {alpha}");
                assert!((hit.score - score).abs() < 1e-9, "alpha {alpha}");
            }
        }
    }

    #[test]
    fn zero_budget_is_partial_but_correct() {
        let mut f = create_fixture(4);
        for id in 0..8u32 {
            add_item(&mut f, id, id as f64, 0.0, vec![(0, 1.0)]);
        }
        augment(&f);
        let query = prepare(Point::new(0.0, 0.0), &[(0, 1.0)], 0.5, 3);
        let options = SearchOptions {
            budget: Some(0),
            ..Default::default()
        };
        let outcome = run(&f, &query, &options);
        assert!(outcome.partial);
        assert!(outcome.hits.is_empty());
    }

    #[test]
    fn cancel_flag_aborts() {
        let mut f = create_fixture(4);
        add_item(&mut f, 0, 0.0, 0.0, vec![(0, 1.0)]);
        augment(&f);
        let query = prepare(Point::new(0.0, 0.0), &[(0, 1.0)], 0.5, 1);
        let cancel = Arc::new(AtomicBool::new(true));
        let options = SearchOptions {
            cancel: Some(cancel),
            ..Default::default()
        };
        let result = search(
            &f.tree,
            &f.vectors,
            &f.inverted,
            &unit_idf,
            &query,
            &options,
            &f.stats,
        );
        assert!(matches!(result, Err(IndexError::Cancelled)));
    }

    #[test]
    fn deep_tree_prunes_far_subtrees() {
        let mut f = create_fixture(4);
        for id in 0..64u32 {
            let x = (id % 8) as f64 * 10.0;
            let y = (id / 8) as f64 * 10.0;
            add_item(&mut f, id, x, y, vec![(id % 4, 1.0)]);
        }
        augment(&f);
        let query = prepare(Point::new(0.0, 0.0), &[], 1.0, 1);
        let outcome = run(&f, &query, &SearchOptions::default());
        assert_eq!(outcome.hits[0].item, 0);
        // best-first must not have visited every node to find the corner
        let visited = f.stats.snapshot().nodes_visited;
        let total_blocks = f.tree.allocated_blocks() as u64;
        assert!(
            visited < total_blocks,
            "visited {visited} of {total_blocks} nodes"
        );
    }
}
