//! irtree — disk-resident spatial-textual index
//!
//! Indexes geo-tagged text documents and answers top-k spatial keyword
//! queries: given a query point (or rectangle) and weighted terms, return
//! the k items maximizing `alpha * proximity + (1 - alpha) * cosine`.
//!
//! ## Architecture
//! - Storage: fixed-size block files + LRU write-back buffer + linked-block
//!   record list stores
//! - Index: quadratic-split R-Tree whose node descriptors carry aggregated
//!   text impact vectors, per-node and tree-level inverted files
//! - Ranking: best-first tree traversal with admissible upper bounds, or an
//!   NRA-style parallel posting scan with a source lattice
//! - Vocabulary: persistent term/document/node maps with dense ids and
//!   collection statistics
//!
//! ## Usage
//! ```no_run
//! use irtree::{Document, IndexConfig, IrTree, Point, Query};
//!
//! # fn main() -> irtree::Result<()> {
//! let mut index = IrTree::create(std::path::Path::new("/tmp/idx"), IndexConfig::default())?;
//! index.insert(Document::new("cafe-1", Point::new(12.5, 41.9), vec![
//!     ("espresso".into(), 1.0),
//!     ("pastry".into(), 0.5),
//! ]))?;
//! index.build_augmentation()?;
//! let hits = index.search(&Query::at_point(12.5, 41.9).with_term("espresso", 1.0).with_k(5))?;
//! # let _ = hits;
//! index.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod distance;
pub mod index;
pub mod query;
pub mod stats;
pub mod storage;
pub mod types;

mod error;
mod irtree;
mod manifest;

pub use config::IndexConfig;
pub use error::{IndexError, Result};
pub use irtree::IrTree;
pub use manifest::Manifest;
pub use query::{Query, QueryMode, QueryRegion, SearchHit, SearchOptions, SearchOutcome};
pub use stats::{Counters, StatsCenter};
pub use types::{Document, Payload, PayloadFilter, Point, Rect, SparseVector, TextSummary};
