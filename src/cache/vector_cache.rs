//! Vector cache manager (C5)
//!
//! Two LRU caches of sparse vectors (item vectors and node vectors) with
//! write-behind to their backing list stores, plus a small cache of
//! pairwise item cosines keyed by the ordered id pair. Vectors are stored
//! as 8-byte `(term_id: u32, weight: f32)` records in term order; the norm
//! is not persisted and is computed at materialization from the IDF table
//! supplied by the caller.

use crate::stats::SharedStats;
use crate::storage::ListStore;
use crate::types::SparseVector;
use crate::{distance, IndexError, Result};
use log::trace;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

const COSINE_CACHE_SIZE: usize = 256;

struct CachedVector {
    vector: Arc<SparseVector>,
    dirty: bool,
}

pub struct VectorCacheManager {
    items: Mutex<LruCache<u32, CachedVector>>,
    nodes: Mutex<LruCache<u32, CachedVector>>,
    cosines: Mutex<LruCache<(u32, u32), f64>>,
    item_store: ListStore,
    node_store: ListStore,
    stats: SharedStats,
}

fn encode_vector(vector: &SparseVector) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 8);
    for (term, weight) in vector.terms() {
        bytes.extend_from_slice(&term.to_le_bytes());
        bytes.extend_from_slice(&weight.to_le_bytes());
    }
    bytes
}

impl VectorCacheManager {
    pub fn new(
        item_store: ListStore,
        node_store: ListStore,
        capacity: usize,
        stats: SharedStats,
    ) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            IndexError::InvalidArgument("vector cache capacity must be positive".into())
        })?;
        Ok(Self {
            items: Mutex::new(LruCache::new(capacity)),
            nodes: Mutex::new(LruCache::new(capacity)),
            cosines: Mutex::new(LruCache::new(
                NonZeroUsize::new(COSINE_CACHE_SIZE).unwrap(),
            )),
            item_store,
            node_store,
            stats,
        })
    }

    fn write_through(store: &ListStore, id: u32, vector: &SparseVector) -> Result<()> {
        if store.contains(id as u64) {
            store.remove(id as u64)?;
        }
        store.append(id as u64, &encode_vector(vector))?;
        Ok(())
    }

    fn materialize(
        store: &ListStore,
        id: u32,
        idf: &dyn Fn(u32) -> f64,
        stats: &SharedStats,
    ) -> Result<Arc<SparseVector>> {
        let mut cursor = store.cursor(id as u64)?;
        let mut terms = Vec::with_capacity(cursor.total() as usize);
        while let Some(rec) = cursor.next_record()? {
            let term = u32::from_le_bytes(rec[..4].try_into().unwrap());
            let weight = f32::from_le_bytes(rec[4..8].try_into().unwrap());
            terms.push((term, weight));
        }
        let mut vector = SparseVector::from_sorted(terms);
        vector.set_norm(distance::weighted_norm(vector.terms(), idf));
        stats.record(|c| c.vector_misses += 1);
        Ok(Arc::new(vector))
    }

    fn get(
        cache: &Mutex<LruCache<u32, CachedVector>>,
        store: &ListStore,
        id: u32,
        idf: &dyn Fn(u32) -> f64,
        stats: &SharedStats,
    ) -> Result<Arc<SparseVector>> {
        let mut cache = cache.lock();
        if let Some(entry) = cache.get(&id) {
            stats.record(|c| c.vector_hits += 1);
            return Ok(entry.vector.clone());
        }
        let vector = Self::materialize(store, id, idf, stats)?;
        let displaced = cache.push(
            id,
            CachedVector {
                vector: vector.clone(),
                dirty: false,
            },
        );
        if let Some((old_id, old)) = displaced {
            if old_id != id && old.dirty {
                trace!("write-behind of evicted vector {old_id}");
                Self::write_through(store, old_id, &old.vector)?;
            }
        }
        Ok(vector)
    }

    fn put(
        cache: &Mutex<LruCache<u32, CachedVector>>,
        store: &ListStore,
        id: u32,
        vector: SparseVector,
    ) -> Result<()> {
        let mut cache = cache.lock();
        let displaced = cache.push(
            id,
            CachedVector {
                vector: Arc::new(vector),
                dirty: true,
            },
        );
        if let Some((old_id, old)) = displaced {
            if old_id != id && old.dirty {
                Self::write_through(store, old_id, &old.vector)?;
            }
        }
        Ok(())
    }

    /// Item vector by id; `NotFound` when the item has no stored vector.
    pub fn get_item_vector(
        &self,
        id: u32,
        idf: &dyn Fn(u32) -> f64,
    ) -> Result<Arc<SparseVector>> {
        Self::get(&self.items, &self.item_store, id, idf, &self.stats)
    }

    pub fn get_node_vector(
        &self,
        id: u32,
        idf: &dyn Fn(u32) -> f64,
    ) -> Result<Arc<SparseVector>> {
        Self::get(&self.nodes, &self.node_store, id, idf, &self.stats)
    }

    pub fn put_item_vector(&self, id: u32, vector: SparseVector) -> Result<()> {
        Self::put(&self.items, &self.item_store, id, vector)
    }

    pub fn put_node_vector(&self, id: u32, vector: SparseVector) -> Result<()> {
        Self::put(&self.nodes, &self.node_store, id, vector)
    }

    pub fn has_item_vector(&self, id: u32) -> bool {
        self.items.lock().contains(&id) || self.item_store.contains(id as u64)
    }

    /// Drop an item vector from cache and store.
    pub fn remove_item_vector(&self, id: u32) -> Result<()> {
        self.items.lock().pop(&id);
        if self.item_store.contains(id as u64) {
            self.item_store.remove(id as u64)?;
        }
        Ok(())
    }

    /// Drop every node vector; the augmentation pass rebuilds them.
    pub fn clear_node_vectors(&self) -> Result<()> {
        self.nodes.lock().clear();
        self.node_store.clear()
    }

    /// Cached cosine for the ordered pair, if present.
    pub fn cached_cosine(&self, a: u32, b: u32) -> Option<f64> {
        let key = (a.min(b), a.max(b));
        let hit = self.cosines.lock().get(&key).copied();
        if hit.is_some() {
            self.stats.record(|c| c.cosine_hits += 1);
        }
        hit
    }

    pub fn store_cosine(&self, a: u32, b: u32, value: f64) {
        let key = (a.min(b), a.max(b));
        self.cosines.lock().put(key, value);
    }

    /// Write every dirty vector through: item vectors first, then node
    /// vectors as a batch, so the two stores are never interleaved.
    pub fn flush(&self) -> Result<()> {
        {
            let mut items = self.items.lock();
            for (id, entry) in items.iter_mut() {
                if entry.dirty {
                    Self::write_through(&self.item_store, *id, &entry.vector)?;
                    entry.dirty = false;
                }
            }
        }
        {
            let mut nodes = self.nodes.lock();
            for (id, entry) in nodes.iter_mut() {
                if entry.dirty {
                    Self::write_through(&self.node_store, *id, &entry.vector)?;
                    entry.dirty = false;
                }
            }
        }
        self.item_store.flush()?;
        self.node_store.flush()
    }

    /// Flush, then empty both vector caches and the cosine cache. Later
    /// reads re-materialize with whatever IDF table is then current.
    pub fn flush_and_clear(&self) -> Result<()> {
        self.flush()?;
        self.items.lock().clear();
        self.nodes.lock().clear();
        self.cosines.lock().clear();
        Ok(())
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.item_store.size_in_bytes() + self.node_store.size_in_bytes()
    }

    pub fn close(self) -> Result<()> {
        self.flush()?;
        self.item_store.close()?;
        self.node_store.close()
    }
}
