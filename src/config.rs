//! Index configuration
//!
//! All knobs recognized by the index. The configuration is written into the
//! manifest on `create` and read back on `open`, so an index directory is
//! self-describing.

use crate::{IndexError, Result};
use serde::{Deserialize, Serialize};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default number of blocks per backing file (16 MiB files at 4 KiB blocks).
pub const DEFAULT_BLOCKS_PER_FILE: u32 = 4096;

/// Default capacity of the block buffer (C2), in blocks.
pub const DEFAULT_BUFFERED_BLOCKS: usize = 256;

/// Default capacity of each vector cache (C5), in vectors.
pub const DEFAULT_VECTOR_CACHE_SIZE: usize = 1024;

/// Default maximum entries per tree node.
pub const DEFAULT_MAX_ENTRIES: usize = 32;

/// Default inline threshold: node vectors with at most this many terms are
/// inlined into the parent entry payload instead of stored externally.
pub const DEFAULT_INLINE_VECTOR_THRESHOLD: usize = 8;

/// Configuration for an index instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexConfig {
    /// Byte size of one storage block.
    pub block_size: usize,

    /// Rollover size of a backing block file, in blocks.
    pub blocks_per_file: u32,

    /// Capacity of the buffered block file, in blocks.
    pub buffered_blocks: usize,

    /// Capacity of each vector cache (items and nodes each get this many).
    pub vector_cache_size: usize,

    /// Spatial dimensionality. Geometry is concrete 2-D; the option is
    /// validated so a foreign manifest with a different dimensionality is
    /// rejected instead of silently misread.
    pub dims: usize,

    /// Minimum entries per non-root tree node.
    pub min_entries: usize,

    /// Maximum entries per tree node.
    pub max_entries: usize,

    /// Node vectors with at most this many terms are inlined into the MBR
    /// payload; larger ones are stored through the vector cache.
    pub inline_vector_threshold: usize,

    /// Default spatial/text weight for queries that do not override it.
    pub alpha: f64,

    /// Default result cardinality for queries that do not override it.
    pub k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let max_entries = DEFAULT_MAX_ENTRIES;
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            blocks_per_file: DEFAULT_BLOCKS_PER_FILE,
            buffered_blocks: DEFAULT_BUFFERED_BLOCKS,
            vector_cache_size: DEFAULT_VECTOR_CACHE_SIZE,
            dims: 2,
            min_entries: min_entries_for(max_entries),
            max_entries,
            inline_vector_threshold: DEFAULT_INLINE_VECTOR_THRESHOLD,
            alpha: 0.5,
            k: 10,
        }
    }
}

/// Conventional fill factor: m = ceil(0.4 * M).
pub fn min_entries_for(max_entries: usize) -> usize {
    ((max_entries * 2) + 4) / 5
}

impl IndexConfig {
    /// Set the node fan-out, deriving `min_entries` at the conventional
    /// 0.4 fill factor.
    pub fn with_fanout(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self.min_entries = min_entries_for(max_entries);
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_default_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_buffered_blocks(mut self, blocks: usize) -> Self {
        self.buffered_blocks = blocks;
        self
    }

    pub fn with_inline_vector_threshold(mut self, terms: usize) -> Self {
        self.inline_vector_threshold = terms;
        self
    }

    /// Validate the configuration. Called on `create` and `open`.
    pub fn validate(&self) -> Result<()> {
        if self.dims != 2 {
            return Err(IndexError::InvalidArgument(format!(
                "unsupported dimensionality {} (geometry is 2-D)",
                self.dims
            )));
        }
        if self.block_size < 64 {
            return Err(IndexError::InvalidArgument(format!(
                "block_size {} is below the 64-byte minimum",
                self.block_size
            )));
        }
        if self.blocks_per_file == 0 {
            return Err(IndexError::InvalidArgument(
                "blocks_per_file must be positive".into(),
            ));
        }
        if self.buffered_blocks == 0 || self.vector_cache_size == 0 {
            return Err(IndexError::InvalidArgument(
                "cache capacities must be positive".into(),
            ));
        }
        if self.max_entries < 2 {
            return Err(IndexError::InvalidArgument(format!(
                "max_entries {} must be at least 2",
                self.max_entries
            )));
        }
        if self.min_entries < 1 || self.min_entries > self.max_entries / 2 {
            return Err(IndexError::InvalidArgument(format!(
                "min_entries {} outside 1..={} (max_entries / 2)",
                self.min_entries,
                self.max_entries / 2
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(IndexError::InvalidArgument(format!(
                "alpha {} outside [0, 1]",
                self.alpha
            )));
        }
        if self.k == 0 {
            return Err(IndexError::InvalidArgument("k must be positive".into()));
        }
        Ok(())
    }
}
