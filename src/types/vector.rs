//! Sparse term vectors
//!
//! The vector keeps its pairs sorted by term id so unions and inner
//! products are merge joins. The norm is whatever the producing layer
//! computed (TF-IDF norm for item vectors); it is not persisted and is
//! recomputed on materialization.

use serde::{Deserialize, Serialize};

/// Sparse `term -> weight` vector, sorted by term id, positive weights only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SparseVector {
    terms: Vec<(u32, f32)>,
    norm: f64,
}

impl SparseVector {
    /// Build from unordered pairs: sorts, merges duplicates by summing,
    /// and drops non-positive weights.
    pub fn new(mut pairs: Vec<(u32, f32)>) -> Self {
        pairs.retain(|(_, w)| *w > 0.0);
        pairs.sort_unstable_by_key(|(t, _)| *t);
        let mut terms: Vec<(u32, f32)> = Vec::with_capacity(pairs.len());
        for (term, weight) in pairs {
            match terms.last_mut() {
                Some((last, acc)) if *last == term => *acc += weight,
                _ => terms.push((term, weight)),
            }
        }
        Self { terms, norm: 0.0 }
    }

    /// Build from pairs already sorted by term id with no duplicates.
    pub fn from_sorted(terms: Vec<(u32, f32)>) -> Self {
        debug_assert!(terms.windows(2).all(|w| w[0].0 < w[1].0));
        Self { terms, norm: 0.0 }
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[(u32, f32)] {
        &self.terms
    }

    /// Weight of a term, `None` when absent.
    pub fn get(&self, term: u32) -> Option<f32> {
        self.terms
            .binary_search_by_key(&term, |(t, _)| *t)
            .ok()
            .map(|i| self.terms[i].1)
    }

    pub fn norm(&self) -> f64 {
        self.norm
    }

    pub fn set_norm(&mut self, norm: f64) {
        self.norm = norm;
    }

    /// Element-wise maximum of two vectors (the text aggregation operator).
    /// The result's norm is left at zero; aggregates define their own.
    pub fn max_union(&self, other: &SparseVector) -> SparseVector {
        let mut out = Vec::with_capacity(self.terms.len().max(other.terms.len()));
        let (mut i, mut j) = (0, 0);
        while i < self.terms.len() && j < other.terms.len() {
            let (ta, wa) = self.terms[i];
            let (tb, wb) = other.terms[j];
            match ta.cmp(&tb) {
                std::cmp::Ordering::Less => {
                    out.push((ta, wa));
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push((tb, wb));
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push((ta, wa.max(wb)));
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&self.terms[i..]);
        out.extend_from_slice(&other.terms[j..]);
        SparseVector::from_sorted(out)
    }
}
