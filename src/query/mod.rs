//! Query types and the top-k result heap
//!
//! The public surface is `Query` / `SearchOptions` / `SearchOutcome`; the
//! engines work on a `PreparedQuery` whose terms are interned, IDF-weighted
//! and L2-normalized, so that summing `weight * impact` over matching terms
//! yields the exact cosine at item level and an admissible bound above.

pub(crate) mod lattice;
pub(crate) mod topk;

use crate::distance::proximity;
use crate::types::{Point, Rect, SparseVector};
use crate::{IndexError, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

/// Where the query is anchored spatially.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryRegion {
    Point(Point),
    Rect(Rect),
}

impl QueryRegion {
    /// Lower bound on the distance from the region to any point in `rect`.
    pub fn mindist(&self, rect: &Rect) -> f64 {
        match self {
            QueryRegion::Point(p) => rect.mindist_point(p),
            QueryRegion::Rect(r) => r.mindist_rect(rect),
        }
    }

    /// Distance from the region to a concrete point (0 inside a rect).
    pub fn distance_to_point(&self, point: &Point) -> f64 {
        match self {
            QueryRegion::Point(p) => p.distance(point),
            QueryRegion::Rect(r) => r.mindist_point(point),
        }
    }
}

/// Which retrieval strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Posting-scan for few-term queries over large collections, tree
    /// traversal otherwise.
    #[default]
    Auto,
    Tree,
    PostingScan,
}

/// Soft limits and the hard cancel flag for one query.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Maximum engine steps (heap pops / stream advances). Exceeding it
    /// returns the results so far with `partial = true`.
    pub budget: Option<u64>,
    /// Wall-clock deadline, checked between steps; soft like `budget`.
    pub deadline: Option<Instant>,
    /// Cross-handle cancel flag; aborts with `Cancelled`, discarding
    /// results.
    pub cancel: Option<Arc<AtomicBool>>,
    pub mode: QueryMode,
}

/// A top-k spatial keyword query.
#[derive(Debug, Clone)]
pub struct Query {
    pub region: QueryRegion,
    /// Term weights by external term key; unknown terms contribute zero.
    pub terms: Vec<(String, f32)>,
    /// Result cardinality; the configured default when absent.
    pub k: Option<usize>,
    /// Spatial/text weight; the configured default when absent.
    pub alpha: Option<f64>,
    pub options: SearchOptions,
}

impl Query {
    pub fn at_point(x: f64, y: f64) -> Self {
        Self {
            region: QueryRegion::Point(Point::new(x, y)),
            terms: Vec::new(),
            k: None,
            alpha: None,
            options: SearchOptions::default(),
        }
    }

    pub fn in_rect(rect: Rect) -> Self {
        Self {
            region: QueryRegion::Rect(rect),
            terms: Vec::new(),
            k: None,
            alpha: None,
            options: SearchOptions::default(),
        }
    }

    pub fn with_term(mut self, term: impl Into<String>, weight: f32) -> Self {
        self.terms.push((term.into(), weight));
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = Some(alpha);
        self
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }
}

/// One result: the item and its combined score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub item: u32,
    pub score: f64,
}

/// Query outcome: hits in rank order plus the soft-limit marker.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub partial: bool,
}

impl SearchOutcome {
    pub(crate) fn empty() -> Self {
        Self {
            hits: Vec::new(),
            partial: false,
        }
    }
}

/// An interned query term: `weight` is the IDF-weighted, L2-normalized
/// query component, `idf` the term's smoothed inverse document frequency.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueryTerm {
    pub term: u32,
    pub weight: f64,
    pub idf: f64,
}

/// A query after interning and normalization, ready for the engines.
#[derive(Debug, Clone)]
pub(crate) struct PreparedQuery {
    pub region: QueryRegion,
    pub terms: Vec<QueryTerm>,
    pub alpha: f64,
    pub k: usize,
}

impl PreparedQuery {
    pub fn combined(&self, spatial: f64, text: f64) -> f64 {
        self.alpha * spatial + (1.0 - self.alpha) * text
    }

    pub fn spatial_score(&self, point: &Point) -> f64 {
        proximity(self.region.distance_to_point(point))
    }

    pub fn spatial_bound(&self, rect: &Rect) -> f64 {
        proximity(self.region.mindist(rect))
    }

    /// Exact text score of an item vector (raw weights + TF-IDF norm):
    /// the cosine against the query under the IDF weighting.
    pub fn text_score(&self, vector: &SparseVector) -> f64 {
        let norm = vector.norm();
        if norm == 0.0 {
            return 0.0;
        }
        let mut sum = 0.0;
        for qt in &self.terms {
            if let Some(w) = vector.get(qt.term) {
                sum += qt.weight * qt.idf * w as f64;
            }
        }
        sum / norm
    }

    /// Upper bound from an aggregated impact vector; capped at 1 since a
    /// cosine of non-negative vectors cannot exceed it.
    pub fn text_bound_from_impacts(&self, impacts: &SparseVector) -> f64 {
        let mut sum = 0.0;
        for qt in &self.terms {
            if let Some(impact) = impacts.get(qt.term) {
                sum += qt.weight * impact as f64;
            }
        }
        sum.min(1.0)
    }

    /// Admissible text bound when no aggregate is known: every impact is
    /// at most 1.
    pub fn text_bound_unknown(&self) -> f64 {
        self.terms
            .iter()
            .map(|qt| qt.weight)
            .sum::<f64>()
            .min(1.0)
    }
}

/// A scored item; the ordering puts higher scores first and breaks ties
/// by the smaller item id, which fixes both heap eviction and final
/// output order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RankedItem {
    pub score: f64,
    pub item: u32,
}

impl PartialEq for RankedItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankedItem {}

impl PartialOrd for RankedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // greater = better: higher score, then smaller id
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.item.cmp(&self.item))
    }
}

/// Max-size-k min-heap of ranked items.
pub(crate) struct TopKHeap {
    heap: BinaryHeap<std::cmp::Reverse<RankedItem>>,
    k: usize,
}

impl TopKHeap {
    pub fn new(k: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(k + 1),
            k,
        }
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() == self.k
    }

    /// Score of the k-th (worst retained) result, `-inf` until full.
    pub fn threshold(&self) -> f64 {
        if self.is_full() {
            self.heap.peek().map_or(f64::NEG_INFINITY, |r| r.0.score)
        } else {
            f64::NEG_INFINITY
        }
    }

    pub fn push(&mut self, item: RankedItem) {
        if self.heap.len() < self.k {
            self.heap.push(std::cmp::Reverse(item));
        } else if let Some(worst) = self.heap.peek() {
            if item > worst.0 {
                self.heap.pop();
                self.heap.push(std::cmp::Reverse(item));
            }
        }
    }

    /// Best-first hits.
    pub fn into_hits(self) -> Vec<SearchHit> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|r| SearchHit {
                item: r.0.item,
                score: r.0.score,
            })
            .collect()
    }
}

/// Check the soft limits before an engine step. `Ok(true)` to continue,
/// `Ok(false)` to stop with a partial result; a raised cancel flag is a
/// hard abort.
pub(crate) fn step_allowed(options: &SearchOptions, steps: u64) -> Result<bool> {
    if let Some(cancel) = &options.cancel {
        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(IndexError::Cancelled);
        }
    }
    if let Some(budget) = options.budget {
        if steps >= budget {
            return Ok(false);
        }
    }
    if let Some(deadline) = options.deadline {
        if Instant::now() >= deadline {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranked_item_order_prefers_small_ids_on_ties() {
        let a = RankedItem { score: 0.5, item: 1 };
        let b = RankedItem { score: 0.5, item: 2 };
        let c = RankedItem { score: 0.9, item: 9 };
        assert!(a > b);
        assert!(c > a);
    }

    #[test]
    fn heap_keeps_the_best_k() {
        let mut heap = TopKHeap::new(2);
        assert_eq!(heap.threshold(), f64::NEG_INFINITY);
        heap.push(RankedItem { score: 0.1, item: 1 });
        heap.push(RankedItem { score: 0.9, item: 2 });
        heap.push(RankedItem { score: 0.5, item: 3 });
        assert!(heap.is_full());
        assert!((heap.threshold() - 0.5).abs() < 1e-12);
        let hits = heap.into_hits();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item, 2);
        assert_eq!(hits[1].item, 3);
    }

    #[test]
    fn equal_scores_evict_the_larger_id() {
        let mut heap = TopKHeap::new(1);
        heap.push(RankedItem { score: 0.5, item: 7 });
        heap.push(RankedItem { score: 0.5, item: 3 });
        let hits = heap.into_hits();
        assert_eq!(hits[0].item, 3);
    }

    #[test]
    fn region_distances() {
        let region = QueryRegion::Point(Point::new(0.0, 0.0));
        let rect = Rect::new(3.0, 4.0, 5.0, 6.0).unwrap();
        assert!((region.mindist(&rect) - 5.0).abs() < 1e-12);
        let region = QueryRegion::Rect(Rect::new(0.0, 0.0, 1.0, 1.0).unwrap());
        assert_eq!(region.distance_to_point(&Point::new(0.5, 0.5)), 0.0);
        assert!((region.distance_to_point(&Point::new(2.0, 1.0)) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn text_bounds_cap_at_one() {
        let q = PreparedQuery {
            region: QueryRegion::Point(Point::new(0.0, 0.0)),
            terms: vec![
                QueryTerm { term: 1, weight: 0.8, idf: 1.0 },
                QueryTerm { term: 2, weight: 0.6, idf: 1.0 },
            ],
            alpha: 0.5,
            k: 5,
        };
        let impacts = SparseVector::new(vec![(1, 1.0), (2, 1.0)]);
        assert_eq!(q.text_bound_from_impacts(&impacts), 1.0);
        assert_eq!(q.text_bound_unknown(), 1.0);
    }
}
