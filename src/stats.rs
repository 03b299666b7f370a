//! Statistics center
//!
//! Counters and tallies reported by every layer: block I/O, buffer and
//! vector cache hits, ranking engine step counts. One `StatsCenter` is
//! shared (via `Arc`) across all components of an index handle; `dump()`
//! renders the `stats.log` text written on close.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Raw counter values. Snapshots are plain copies of this struct.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Counters {
    /// Blocks read from the backing files.
    pub block_reads: u64,
    /// Blocks written to the backing files.
    pub block_writes: u64,
    /// Blocks allocated.
    pub blocks_allocated: u64,
    /// Block buffer hits.
    pub buffer_hits: u64,
    /// Block buffer misses.
    pub buffer_misses: u64,
    /// Dirty frames written back on eviction.
    pub buffer_evictions: u64,
    /// Records appended through the list stores.
    pub list_records_written: u64,
    /// Records read through list iterators.
    pub list_records_read: u64,
    /// Vector cache hits (items and nodes combined).
    pub vector_hits: u64,
    /// Vector cache misses.
    pub vector_misses: u64,
    /// Pairwise cosine cache hits.
    pub cosine_hits: u64,
    /// Frontier heap pops performed by the tree engine.
    pub heap_pops: u64,
    /// Tree nodes visited by queries.
    pub nodes_visited: u64,
    /// Postings consumed by either engine.
    pub postings_scanned: u64,
    /// Full candidate refreshes performed by the lattice engine.
    pub lattice_full_updates: u64,
    /// Top-k queries answered.
    pub queries: u64,
}

impl Counters {
    /// Block buffer hit rate over the lifetime of the handle.
    pub fn buffer_hit_rate(&self) -> f64 {
        let total = self.buffer_hits + self.buffer_misses;
        if total == 0 {
            0.0
        } else {
            self.buffer_hits as f64 / total as f64
        }
    }

    /// Vector cache hit rate.
    pub fn vector_hit_rate(&self) -> f64 {
        let total = self.vector_hits + self.vector_misses;
        if total == 0 {
            0.0
        } else {
            self.vector_hits as f64 / total as f64
        }
    }
}

/// Shared statistics center.
#[derive(Debug, Default)]
pub struct StatsCenter {
    counters: RwLock<Counters>,
}

/// Convenience alias used throughout the crate.
pub type SharedStats = Arc<StatsCenter>;

impl StatsCenter {
    pub fn new() -> SharedStats {
        Arc::new(Self::default())
    }

    /// Apply a mutation to the counters.
    #[inline]
    pub fn record<F: FnOnce(&mut Counters)>(&self, f: F) {
        f(&mut self.counters.write());
    }

    /// Copy out the current counter values.
    pub fn snapshot(&self) -> Counters {
        self.counters.read().clone()
    }

    /// Render the counters for `stats.log`.
    pub fn dump(&self) -> String {
        let c = self.snapshot();
        let mut out = String::new();
        out.push_str(&format!("block_reads            {}\n", c.block_reads));
        out.push_str(&format!("block_writes           {}\n", c.block_writes));
        out.push_str(&format!("blocks_allocated       {}\n", c.blocks_allocated));
        out.push_str(&format!("buffer_hits            {}\n", c.buffer_hits));
        out.push_str(&format!("buffer_misses          {}\n", c.buffer_misses));
        out.push_str(&format!("buffer_evictions       {}\n", c.buffer_evictions));
        out.push_str(&format!("buffer_hit_rate        {:.4}\n", c.buffer_hit_rate()));
        out.push_str(&format!("list_records_written   {}\n", c.list_records_written));
        out.push_str(&format!("list_records_read      {}\n", c.list_records_read));
        out.push_str(&format!("vector_hits            {}\n", c.vector_hits));
        out.push_str(&format!("vector_misses          {}\n", c.vector_misses));
        out.push_str(&format!("vector_hit_rate        {:.4}\n", c.vector_hit_rate()));
        out.push_str(&format!("cosine_hits            {}\n", c.cosine_hits));
        out.push_str(&format!("heap_pops              {}\n", c.heap_pops));
        out.push_str(&format!("nodes_visited          {}\n", c.nodes_visited));
        out.push_str(&format!("postings_scanned       {}\n", c.postings_scanned));
        out.push_str(&format!("lattice_full_updates   {}\n", c.lattice_full_updates));
        out.push_str(&format!("queries                {}\n", c.queries));
        out
    }
}
