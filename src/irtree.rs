//! Index facade
//!
//! `IrTree` owns the whole stack: the tree block file and R-Tree, the two
//! vector list stores behind the vector cache manager, the postings store,
//! and the three vocabularies. One handle is one writer; build with
//! `insert` + `build_augmentation`, then query with `search`. `flush`
//! makes all durable state visible; `close` also dumps `stats.log`.

use crate::cache::VectorCacheManager;
use crate::config::IndexConfig;
use crate::distance::weighted_dot;
use crate::index::{
    Augmenter, DocStats, InvertedFile, NodeStats, RTree, TermStats, TreeMeta, Vocabulary,
    NO_NODE,
};
use crate::manifest::Manifest;
use crate::query::{
    lattice, topk, PreparedQuery, Query, QueryMode, QueryTerm, SearchOutcome,
};
use crate::stats::{Counters, SharedStats, StatsCenter};
use crate::storage::{BlockFile, BufferedBlockFile, ListStore};
use crate::types::{Document, Payload, Point, Rect, SparseVector};
use crate::{IndexError, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};

const TREE_BASE: &str = "blocks";
const ITEM_LIST_BASE: &str = "lists.items";
const NODE_LIST_BASE: &str = "lists.nodes";
const VECTOR_RECORD_SIZE: usize = 8;
const STATS_FILE: &str = "stats.log";

pub struct IrTree {
    dir: PathBuf,
    config: IndexConfig,
    stats: SharedStats,
    tree: RTree,
    vectors: VectorCacheManager,
    inverted: InvertedFile,
    terms: Vocabulary<TermStats>,
    docs: Vocabulary<DocStats>,
    nodes: Vocabulary<NodeStats>,
    augmented: bool,
}

impl IrTree {
    /// Create a new index in `dir` (created if missing, must not already
    /// hold an index).
    pub fn create(dir: &Path, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;
        if Manifest::exists(dir) {
            return Err(IndexError::InvalidArgument(format!(
                "{} already holds an index",
                dir.display()
            )));
        }
        let stats = StatsCenter::new();
        let tree_file = BlockFile::create(
            dir,
            TREE_BASE,
            config.block_size,
            config.blocks_per_file,
            stats.clone(),
        )?;
        let tree_file = BufferedBlockFile::new(tree_file, config.buffered_blocks, stats.clone())?;
        let tree = RTree::create(tree_file, &config, stats.clone())?;
        let item_store = ListStore::create(
            dir,
            ITEM_LIST_BASE,
            VECTOR_RECORD_SIZE,
            config.block_size,
            config.blocks_per_file,
            config.buffered_blocks,
            stats.clone(),
        )?;
        let node_store = ListStore::create(
            dir,
            NODE_LIST_BASE,
            VECTOR_RECORD_SIZE,
            config.block_size,
            config.blocks_per_file,
            config.buffered_blocks,
            stats.clone(),
        )?;
        let vectors = VectorCacheManager::new(
            item_store,
            node_store,
            config.vector_cache_size,
            stats.clone(),
        )?;
        let inverted = InvertedFile::create(
            dir,
            config.block_size,
            config.blocks_per_file,
            config.buffered_blocks,
            stats.clone(),
        )?;
        let terms = Vocabulary::create(&dir.join("vocab.term"));
        let docs = Vocabulary::create(&dir.join("vocab.doc"));
        let nodes = Vocabulary::create(&dir.join("vocab.node"));
        let index = Self {
            dir: dir.to_path_buf(),
            config,
            stats,
            tree,
            vectors,
            inverted,
            terms,
            docs,
            nodes,
            augmented: false,
        };
        index.write_manifest()?;
        info!("created index at {}", index.dir.display());
        Ok(index)
    }

    /// Open an existing index; the configuration comes from the manifest.
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest = Manifest::load(dir)?;
        let config = manifest.config.clone();
        config.validate()?;
        let stats = StatsCenter::new();
        let tree_file = BlockFile::open(
            dir,
            TREE_BASE,
            config.block_size,
            config.blocks_per_file,
            manifest.tree_blocks,
            stats.clone(),
        )?;
        let tree_file = BufferedBlockFile::new(tree_file, config.buffered_blocks, stats.clone())?;
        let tree = RTree::open(
            tree_file,
            &config,
            TreeMeta {
                root: manifest.root.unwrap_or(NO_NODE),
                height: manifest.height,
                items: manifest.item_count,
            },
            stats.clone(),
        )?;
        let item_store = ListStore::open(
            dir,
            ITEM_LIST_BASE,
            VECTOR_RECORD_SIZE,
            config.block_size,
            config.blocks_per_file,
            config.buffered_blocks,
            stats.clone(),
        )?;
        let node_store = ListStore::open(
            dir,
            NODE_LIST_BASE,
            VECTOR_RECORD_SIZE,
            config.block_size,
            config.blocks_per_file,
            config.buffered_blocks,
            stats.clone(),
        )?;
        let vectors = VectorCacheManager::new(
            item_store,
            node_store,
            config.vector_cache_size,
            stats.clone(),
        )?;
        let inverted = InvertedFile::open(
            dir,
            config.block_size,
            config.blocks_per_file,
            config.buffered_blocks,
            stats.clone(),
        )?;
        let terms = Vocabulary::open(&dir.join("vocab.term"))?;
        let docs = Vocabulary::open(&dir.join("vocab.doc"))?;
        let nodes = Vocabulary::open(&dir.join("vocab.node"))?;
        debug!(
            "opened index at {} with {} items",
            dir.display(),
            manifest.item_count
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            stats,
            tree,
            vectors,
            inverted,
            terms,
            docs,
            nodes,
            augmented: manifest.augmented,
        })
    }

    /// Smoothed inverse document frequency over live documents:
    /// `1 + ln(N / df)`. Zero for unknown terms.
    fn idf_value(&self, term: u32) -> f64 {
        let n = self.tree.len() as f64;
        if n <= 0.0 {
            return 0.0;
        }
        match self.terms.stats(term) {
            Some(stats) if stats.df > 0 => (1.0 + (n / stats.df as f64).ln()).max(0.0),
            _ => 0.0,
        }
    }

    /// Insert a document. Weights must be non-negative; zero weights are
    /// dropped. A key may only be re-inserted after `remove`.
    pub fn insert(&mut self, doc: Document) -> Result<()> {
        let id = match self.docs.lookup(&doc.key) {
            Some(id) => {
                let stats = self.docs.stats(id).unwrap_or_default();
                if stats.alive {
                    return Err(IndexError::InvalidArgument(format!(
                        "duplicate document key {:?}",
                        doc.key
                    )));
                }
                id
            }
            None => self.docs.intern(&doc.key)?.0,
        };

        let mut pairs = Vec::with_capacity(doc.terms.len());
        for (term, weight) in &doc.terms {
            if *weight < 0.0 || !weight.is_finite() {
                return Err(IndexError::InvalidArgument(format!(
                    "term {term:?} has weight {weight}"
                )));
            }
            if *weight == 0.0 {
                continue;
            }
            let (term_id, _) = self.terms.intern(term)?;
            pairs.push((term_id, *weight));
        }
        let vector = SparseVector::new(pairs);
        for (term_id, weight) in vector.terms() {
            self.terms.update_stats(*term_id, |s| {
                s.df += 1;
                s.total_weight += *weight as f64;
            })?;
        }
        self.docs.update_stats(id, |s| {
            s.x = doc.point.x;
            s.y = doc.point.y;
            s.term_count = vector.len() as u32;
            s.alive = true;
        })?;
        self.vectors.put_item_vector(id, vector)?;
        self.tree
            .insert(id, Rect::from_point(doc.point), Payload::None)?;
        self.augmented = false;
        Ok(())
    }

    /// Remove a document by key. Returns whether it was present.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let Some(id) = self.docs.lookup(key) else {
            return Ok(false);
        };
        let stats = self.docs.stats(id).unwrap_or_default();
        if !stats.alive {
            return Ok(false);
        }
        let point = Point::new(stats.x, stats.y);
        let vector = match self.vectors.get_item_vector(id, &|_| 1.0) {
            Ok(v) => (*v).clone(),
            Err(IndexError::NotFound(_)) => SparseVector::default(),
            Err(e) => return Err(e),
        };
        if !self.tree.remove(id, &Rect::from_point(point))? {
            return Err(IndexError::Corrupt(format!(
                "document {key:?} is in the directory but not in the tree"
            )));
        }
        for (term_id, weight) in vector.terms() {
            self.terms.update_stats(*term_id, |s| {
                s.df = s.df.saturating_sub(1);
                s.total_weight -= *weight as f64;
            })?;
        }
        self.vectors.remove_item_vector(id)?;
        self.docs.update_stats(id, |s| s.alive = false)?;
        self.augmented = false;
        Ok(true)
    }

    /// Run the post-order augmentation pass: node descriptors, per-node
    /// inverted files and the tree-level posting lists. Idempotent;
    /// required before text-bearing queries.
    pub fn build_augmentation(&mut self) -> Result<()> {
        // clear caches first so every vector re-materializes with the
        // final collection statistics
        self.vectors.flush_and_clear()?;
        let augmenter = Augmenter::new(
            &self.tree,
            &self.vectors,
            &self.inverted,
            &self.nodes,
            self.config.inline_vector_threshold,
        );
        augmenter.build(&|t| self.idf_value(t))?;
        self.augmented = true;
        self.flush()
    }

    pub fn is_augmented(&self) -> bool {
        self.augmented
    }

    /// Answer a top-k spatial keyword query.
    pub fn search(&self, query: &Query) -> Result<SearchOutcome> {
        let k = query.k.unwrap_or(self.config.k);
        let alpha = query.alpha.unwrap_or(self.config.alpha);
        if k == 0 {
            return Err(IndexError::InvalidArgument("k must be positive".into()));
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(IndexError::InvalidArgument(format!(
                "alpha {alpha} outside [0, 1]"
            )));
        }

        let mut resolved: Vec<(u32, f64)> = Vec::with_capacity(query.terms.len());
        for (term, weight) in &query.terms {
            if *weight < 0.0 || !weight.is_finite() {
                return Err(IndexError::InvalidArgument(format!(
                    "query term {term:?} has weight {weight}"
                )));
            }
            if *weight == 0.0 {
                continue;
            }
            // unknown terms contribute zero and are dropped here
            if let Some(term_id) = self.terms.lookup(term) {
                resolved.push((term_id, *weight as f64));
            }
        }
        if alpha < 1.0 && !resolved.is_empty() && !self.augmented {
            return Err(IndexError::InvalidArgument(
                "keyword queries require build_augmentation".into(),
            ));
        }

        let weighted: Vec<(u32, f64, f64)> = resolved
            .iter()
            .map(|(t, w)| {
                let idf = self.idf_value(*t);
                (*t, w * idf, idf)
            })
            .collect();
        let norm = weighted.iter().map(|(_, w, _)| w * w).sum::<f64>().sqrt();
        let terms: Vec<QueryTerm> = if norm > 0.0 {
            weighted
                .into_iter()
                .map(|(term, w, idf)| QueryTerm {
                    term,
                    weight: w / norm,
                    idf,
                })
                .collect()
        } else {
            Vec::new()
        };
        let prepared = PreparedQuery {
            region: query.region,
            terms,
            alpha,
            k,
        };
        self.stats.record(|c| c.queries += 1);

        let use_scan = match query.options.mode {
            QueryMode::Tree => false,
            QueryMode::PostingScan => {
                if prepared.terms.is_empty()
                    || prepared.terms.len() > lattice::MAX_LATTICE_SOURCES
                {
                    return Err(IndexError::InvalidArgument(format!(
                        "posting scan needs 1..={} known query terms",
                        lattice::MAX_LATTICE_SOURCES
                    )));
                }
                if !self.augmented {
                    return Err(IndexError::InvalidArgument(
                        "posting scan requires build_augmentation".into(),
                    ));
                }
                true
            }
            QueryMode::Auto => {
                self.augmented
                    && !prepared.terms.is_empty()
                    && prepared.terms.len() <= lattice::MAX_LATTICE_SOURCES
                    && self.tree.len() > (4 * self.config.max_entries) as u64
            }
        };

        if use_scan {
            lattice::search(
                &self.inverted,
                &prepared,
                &query.options,
                &|id| {
                    self.docs
                        .stats(id)
                        .map(|s| Point::new(s.x, s.y))
                },
                &self.stats,
            )
        } else {
            topk::search(
                &self.tree,
                &self.vectors,
                &self.inverted,
                &|t| self.idf_value(t),
                &prepared,
                &query.options,
                &self.stats,
            )
        }
    }

    /// Plain window query: ids of items whose point lies in `rect`.
    pub fn range(&self, rect: &Rect) -> Result<Vec<u32>> {
        Ok(self
            .tree
            .search(rect, None)?
            .into_iter()
            .map(|e| e.id)
            .collect())
    }

    /// TF-IDF cosine between two stored documents, through the pairwise
    /// cosine cache.
    pub fn similarity(&self, key_a: &str, key_b: &str) -> Result<f64> {
        let a = self.item_id(key_a).ok_or_else(|| {
            IndexError::NotFound(format!("document {key_a:?}"))
        })?;
        let b = self.item_id(key_b).ok_or_else(|| {
            IndexError::NotFound(format!("document {key_b:?}"))
        })?;
        if let Some(cached) = self.vectors.cached_cosine(a, b) {
            return Ok(cached);
        }
        let idf = |t: u32| self.idf_value(t);
        let va = self.vectors.get_item_vector(a, &idf)?;
        let vb = self.vectors.get_item_vector(b, &idf)?;
        let value = if va.norm() == 0.0 || vb.norm() == 0.0 {
            0.0
        } else {
            weighted_dot(va.terms(), vb.terms(), &idf) / (va.norm() * vb.norm())
        };
        self.vectors.store_cosine(a, b, value);
        Ok(value)
    }

    /// Internal id of a live document.
    pub fn item_id(&self, key: &str) -> Option<u32> {
        let id = self.docs.lookup(key)?;
        self.docs.stats(id).filter(|s| s.alive).map(|_| id)
    }

    /// External key of an item id.
    pub fn doc_key(&self, item: u32) -> Option<String> {
        self.docs.key_of(item)
    }

    /// Live document count.
    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn stats(&self) -> Counters {
        self.stats.snapshot()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.tree.size_in_bytes() + self.vectors.size_in_bytes() + self.inverted.size_in_bytes()
    }

    fn write_manifest(&self) -> Result<()> {
        let meta = self.tree.meta();
        let manifest = Manifest {
            root: (meta.root != NO_NODE).then_some(meta.root),
            height: meta.height,
            item_count: meta.items,
            tree_blocks: self.tree.allocated_blocks(),
            augmented: self.augmented,
            ..Manifest::new(self.config.clone())
        };
        manifest.store(&self.dir)
    }

    /// Write every dirty cache and directory through and persist the
    /// manifest. Idempotent: a second flush with no intervening writes
    /// leaves the same bytes on disk.
    pub fn flush(&self) -> Result<()> {
        self.vectors.flush()?;
        self.inverted.flush()?;
        self.terms.flush()?;
        self.docs.flush()?;
        self.nodes.flush()?;
        self.tree.flush()?;
        self.write_manifest()
    }

    /// Flush, dump `stats.log`, and close the backing files.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        std::fs::write(self.dir.join(STATS_FILE), self.stats.dump())?;
        self.vectors.close()?;
        self.inverted.close()?;
        self.tree.close()?;
        info!("closed index at {}", self.dir.display());
        Ok(())
    }
}
