//! Core data types: points, rectangles, augmented payloads, documents

mod vector;

pub use vector::SparseVector;

use crate::{IndexError, Result};
use serde::{Deserialize, Serialize};

/// 2-D point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Minimum bounding rectangle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    /// Construct a rectangle. `min <= max` on both axes.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self> {
        if min_x > max_x || min_y > max_y {
            return Err(IndexError::InvalidArgument(format!(
                "degenerate rectangle [{min_x}, {min_y}] x [{max_x}, {max_y}]"
            )));
        }
        Ok(Self {
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }

    pub fn from_point(point: Point) -> Self {
        Self {
            min_x: point.x,
            min_y: point.y,
            max_x: point.x,
            max_y: point.y,
        }
    }

    /// Center of the rectangle. For point entries this is the point itself.
    pub fn center(&self) -> Point {
        Point::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    pub fn contains_point(&self, point: &Point) -> bool {
        point.x >= self.min_x
            && point.x <= self.max_x
            && point.y >= self.min_y
            && point.y <= self.max_y
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !(self.max_x < other.min_x
            || self.min_x > other.max_x
            || self.max_y < other.min_y
            || self.min_y > other.max_y)
    }

    pub fn expand(&mut self, other: &Rect) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let mut out = *self;
        out.expand(other);
        out
    }

    pub fn area(&self) -> f64 {
        (self.max_x - self.min_x) * (self.max_y - self.min_y)
    }

    /// Area growth required to absorb `other`.
    pub fn enlargement(&self, other: &Rect) -> f64 {
        self.union(other).area() - self.area()
    }

    /// Minimum distance from a point to this rectangle (0 inside).
    pub fn mindist_point(&self, point: &Point) -> f64 {
        let dx = (self.min_x - point.x).max(0.0).max(point.x - self.max_x);
        let dy = (self.min_y - point.y).max(0.0).max(point.y - self.max_y);
        (dx * dx + dy * dy).sqrt()
    }

    /// Minimum distance between two rectangles (0 when they intersect).
    pub fn mindist_rect(&self, other: &Rect) -> f64 {
        let dx = (self.min_x - other.max_x).max(0.0).max(other.min_x - self.max_x);
        let dy = (self.min_y - other.max_y).max(0.0).max(other.min_y - self.max_y);
        (dx * dx + dy * dy).sqrt()
    }
}

/// Aggregated payload carried alongside the geometric extent of an MBR.
///
/// One parameterized type covers the boolean, max-score and text-vector
/// aggregation dimensions; mismatched unions degrade to `None`, which every
/// consumer treats as "no information" (never prunes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum Payload {
    /// No aggregate available.
    #[default]
    None,
    /// OR-aggregated flag.
    Flag(bool),
    /// MAX-aggregated score bound.
    MaxScore(f64),
    /// Aggregated text descriptor of the subtree.
    Text(TextSummary),
}

/// Text descriptor of a subtree: the element-wise maximum impact vector,
/// inlined when small, otherwise a handle into the node vector store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TextSummary {
    Inline(SparseVector),
    Stored(u32),
}

impl Payload {
    /// Aggregate two payloads: OR for flags, MAX for scores, element-wise
    /// MAX for inline text vectors. Anything else (including stored text
    /// handles, which cannot be merged without store access) degrades to
    /// `None`; the next augmentation pass recomputes it.
    pub fn union(&self, other: &Payload) -> Payload {
        match (self, other) {
            (Payload::None, Payload::None) => Payload::None,
            (Payload::Flag(a), Payload::Flag(b)) => Payload::Flag(*a || *b),
            (Payload::MaxScore(a), Payload::MaxScore(b)) => Payload::MaxScore(a.max(*b)),
            (Payload::Text(TextSummary::Inline(a)), Payload::Text(TextSummary::Inline(b))) => {
                Payload::Text(TextSummary::Inline(a.max_union(b)))
            }
            _ => Payload::None,
        }
    }

    /// Whether a subtree carrying this aggregate may contain an entry
    /// satisfying `filter`. Conservative: unknown aggregates answer `true`.
    pub fn may_satisfy(&self, filter: &PayloadFilter) -> bool {
        match (self, filter) {
            (Payload::Flag(flag), PayloadFilter::Flag) => *flag,
            (Payload::MaxScore(score), PayloadFilter::MinScore(min)) => score >= min,
            (Payload::Text(TextSummary::Inline(vector)), PayloadFilter::Terms(terms)) => terms
                .iter()
                .all(|(term, weight)| vector.get(*term).is_some_and(|w| w >= *weight)),
            _ => true,
        }
    }

    /// Whether this aggregate itself satisfies `filter`. Strict: unknown
    /// aggregates answer `false`. Used on leaf entries.
    pub fn satisfies(&self, filter: &PayloadFilter) -> bool {
        match (self, filter) {
            (Payload::Flag(flag), PayloadFilter::Flag) => *flag,
            (Payload::MaxScore(score), PayloadFilter::MinScore(min)) => score >= min,
            (Payload::Text(TextSummary::Inline(vector)), PayloadFilter::Terms(terms)) => terms
                .iter()
                .all(|(term, weight)| vector.get(*term).is_some_and(|w| w >= *weight)),
            _ => false,
        }
    }
}

/// Predicate for payload-aware tree search.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadFilter {
    /// Subtree flag must be set.
    Flag,
    /// Aggregated score must reach the threshold.
    MinScore(f64),
    /// Every listed term must be present with at least the given weight.
    Terms(Vec<(u32, f32)>),
}

/// A geo-tagged text document as handed to the index by the caller.
/// Term strings are interned into dense ids on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// External key, unique per live document.
    pub key: String,
    pub point: Point,
    /// Sparse term weights; non-negative, zero entries are dropped.
    pub terms: Vec<(String, f32)>,
}

impl Document {
    pub fn new(key: impl Into<String>, point: Point, terms: Vec<(String, f32)>) -> Self {
        Self {
            key: key.into(),
            point,
            terms,
        }
    }
}
