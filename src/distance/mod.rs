//! Scoring kernels: spatial proximity and sparse-vector products

use crate::types::SparseVector;

/// Spatial proximity: monotonically decreasing in distance, 1 at distance 0.
#[inline]
pub fn proximity(distance: f64) -> f64 {
    1.0 / (1.0 + distance)
}

/// Inner product of two sorted sparse vectors (merge join).
pub fn sparse_dot(a: &[(u32, f32)], b: &[(u32, f32)]) -> f64 {
    let (mut i, mut j) = (0, 0);
    let mut sum = 0.0f64;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                sum += a[i].1 as f64 * b[j].1 as f64;
                i += 1;
                j += 1;
            }
        }
    }
    sum
}

/// Inner product with per-term reweighting applied to both sides:
/// `sum_t idf(t)^2 * a_t * b_t`. Used for TF-IDF products over raw vectors.
pub fn weighted_dot(a: &[(u32, f32)], b: &[(u32, f32)], idf: &dyn Fn(u32) -> f64) -> f64 {
    let (mut i, mut j) = (0, 0);
    let mut sum = 0.0f64;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                let w = idf(a[i].0);
                sum += w * w * a[i].1 as f64 * b[j].1 as f64;
                i += 1;
                j += 1;
            }
        }
    }
    sum
}

/// TF-IDF norm of a raw weight vector: `sqrt(sum_t (w_t * idf(t))^2)`.
pub fn weighted_norm(terms: &[(u32, f32)], idf: &dyn Fn(u32) -> f64) -> f64 {
    terms
        .iter()
        .map(|(t, w)| {
            let x = *w as f64 * idf(*t);
            x * x
        })
        .sum::<f64>()
        .sqrt()
}

/// Cosine between two raw weight vectors under the given IDF table.
/// Zero when either vector has zero norm.
pub fn weighted_cosine(a: &SparseVector, b: &SparseVector, idf: &dyn Fn(u32) -> f64) -> f64 {
    let na = weighted_norm(a.terms(), idf);
    let nb = weighted_norm(b.terms(), idf);
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    weighted_dot(a.terms(), b.terms(), idf) / (na * nb)
}
