//! Textual augmentation (C8)
//!
//! Post-order pass over the tree after all inserts. Every node gets an
//! aggregated text descriptor: the element-wise maximum of its children's
//! impact vectors, where an item's impact for term t is
//! `weight(t) * idf(t) / norm(item)` (the document-normalized TF-IDF
//! component). Summing impacts against a normalized query vector yields
//! the exact cosine at the item level and an admissible upper bound at
//! every node level.
//!
//! Per node, an inverted file maps each term of the descriptor to
//! `(child_id, impact)` postings; the same pass accumulates the
//! collection-wide posting lists under `TREE_LEVEL_NODE`. Parent entries
//! receive the child descriptor inline when it is small, otherwise the
//! descriptor is stored through the vector cache and referenced by id.

use crate::cache::VectorCacheManager;
use crate::index::{
    InvertedFile, NodeStats, Posting, RTree, Vocabulary, TREE_LEVEL_NODE,
};
use crate::types::{Payload, SparseVector, TextSummary};
use crate::{IndexError, Result};
use ahash::AHashMap;
use log::debug;

pub struct Augmenter<'a> {
    tree: &'a RTree,
    vectors: &'a VectorCacheManager,
    inverted: &'a InvertedFile,
    nodes: &'a Vocabulary<NodeStats>,
    inline_threshold: usize,
}

impl<'a> Augmenter<'a> {
    pub fn new(
        tree: &'a RTree,
        vectors: &'a VectorCacheManager,
        inverted: &'a InvertedFile,
        nodes: &'a Vocabulary<NodeStats>,
        inline_threshold: usize,
    ) -> Self {
        Self {
            tree,
            vectors,
            inverted,
            nodes,
            inline_threshold,
        }
    }

    /// Rebuild all node descriptors and inverted files from scratch.
    pub fn build(&self, idf: &dyn Fn(u32) -> f64) -> Result<()> {
        self.inverted.clear()?;
        self.vectors.clear_node_vectors()?;
        let Some(root) = self.tree.root() else {
            return Ok(());
        };
        let mut tree_postings: AHashMap<u32, Vec<Posting>> = AHashMap::new();
        self.augment_node(root, idf, &mut tree_postings)?;

        let mut terms: Vec<u32> = tree_postings.keys().copied().collect();
        terms.sort_unstable();
        for term in terms {
            let postings = tree_postings.remove(&term).unwrap();
            self.inverted.write_postings(TREE_LEVEL_NODE, term, postings)?;
        }
        debug!("augmentation complete, height {}", self.tree.height());
        Ok(())
    }

    /// Document-normalized impacts of one item vector.
    fn item_impacts(vector: &SparseVector, idf: &dyn Fn(u32) -> f64) -> SparseVector {
        let norm = vector.norm();
        if norm == 0.0 {
            return SparseVector::default();
        }
        SparseVector::from_sorted(
            vector
                .terms()
                .iter()
                .map(|(t, w)| (*t, (*w as f64 * idf(*t) / norm) as f32))
                .collect(),
        )
    }

    fn augment_node(
        &self,
        node_id: u32,
        idf: &dyn Fn(u32) -> f64,
        tree_postings: &mut AHashMap<u32, Vec<Posting>>,
    ) -> Result<SparseVector> {
        let mut node = self.tree.read_node(node_id)?;
        let mut child_vectors: Vec<(u32, SparseVector)> = Vec::with_capacity(node.entries.len());

        if node.is_leaf() {
            for entry in &node.entries {
                let impacts = match self.vectors.get_item_vector(entry.id, idf) {
                    Ok(vector) => Self::item_impacts(&vector, idf),
                    // an item without a stored vector contributes nothing
                    Err(IndexError::NotFound(_)) => SparseVector::default(),
                    Err(e) => return Err(e),
                };
                for (term, impact) in impacts.terms() {
                    tree_postings.entry(*term).or_default().push(Posting {
                        id: entry.id,
                        impact: *impact,
                    });
                }
                child_vectors.push((entry.id, impacts));
            }
        } else {
            for index in 0..node.entries.len() {
                let child_id = node.entries[index].id;
                let child_vector = self.augment_node(child_id, idf, tree_postings)?;
                node.entries[index].payload = if child_vector.len() <= self.inline_threshold {
                    Payload::Text(TextSummary::Inline(child_vector.clone()))
                } else {
                    Payload::Text(TextSummary::Stored(child_id))
                };
                child_vectors.push((child_id, child_vector));
            }
            self.tree.write_node(node_id, &node)?;
        }

        let mut aggregated = SparseVector::default();
        for (_, vector) in &child_vectors {
            aggregated = aggregated.max_union(vector);
        }

        // per-node inverted file: one list per descriptor term
        let mut node_postings: AHashMap<u32, Vec<Posting>> = AHashMap::new();
        for (child_id, vector) in &child_vectors {
            for (term, impact) in vector.terms() {
                node_postings.entry(*term).or_default().push(Posting {
                    id: *child_id,
                    impact: *impact,
                });
            }
        }
        let mut terms: Vec<u32> = node_postings.keys().copied().collect();
        terms.sort_unstable();
        for term in terms {
            let postings = node_postings.remove(&term).unwrap();
            self.inverted.write_postings(node_id, term, postings)?;
        }

        self.vectors.put_node_vector(node_id, aggregated.clone())?;
        let (vocab_id, _) = self.nodes.intern(&format!("n{node_id}"))?;
        self.nodes.update_stats(vocab_id, |s| {
            s.term_count = aggregated.len() as u32;
            s.level = node.level;
        })?;

        Ok(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::stats::StatsCenter;
    use crate::storage::{BlockFile, BufferedBlockFile, ListStore};
    use crate::types::{Point, Rect};
    use tempfile::TempDir;

    struct Fixture {
        tree: RTree,
        vectors: VectorCacheManager,
        inverted: InvertedFile,
        nodes: Vocabulary<NodeStats>,
        _temp: TempDir,
    }

    fn create_fixture(max_entries: usize) -> Fixture {
        let temp = TempDir::new().unwrap();
        let stats = StatsCenter::new();
        let config = IndexConfig::default().with_fanout(max_entries);
        let file = BlockFile::create(temp.path(), "blocks", config.block_size, 64, stats.clone())
            .unwrap();
        let file = BufferedBlockFile::new(file, 32, stats.clone()).unwrap();
        let tree = RTree::create(file, &config, stats.clone()).unwrap();
        let items = ListStore::create(temp.path(), "lists.items", 8, 256, 64, 16, stats.clone())
            .unwrap();
        let node_store =
            ListStore::create(temp.path(), "lists.nodes", 8, 256, 64, 16, stats.clone()).unwrap();
        let vectors = VectorCacheManager::new(items, node_store, 64, stats.clone()).unwrap();
        let inverted = InvertedFile::create(temp.path(), 256, 64, 16, stats).unwrap();
        let nodes = Vocabulary::create(&temp.path().join("vocab.node"));
        Fixture {
            tree,
            vectors,
            inverted,
            nodes,
            _temp: temp,
        }
    }

    fn insert_item(f: &Fixture, id: u32, x: f64, y: f64, terms: Vec<(u32, f32)>) {
        f.vectors
            .put_item_vector(id, SparseVector::new(terms))
            .unwrap();
        f.tree
            .insert(id, Rect::from_point(Point::new(x, y)), Payload::None)
            .unwrap();
    }

    fn unit_idf(_: u32) -> f64 {
        1.0
    }

    #[test]
    fn single_leaf_builds_exact_impacts() {
        let f = create_fixture(4);
        // two items sharing term 1, norms 1.0 and sqrt(2)/2 scaling
        insert_item(&f, 0, 0.0, 0.0, vec![(1, 1.0)]);
        insert_item(&f, 1, 1.0, 1.0, vec![(1, 1.0), (2, 1.0)]);
        f.vectors.flush_and_clear().unwrap();
        let augmenter =
            Augmenter::new(&f.tree, &f.vectors, &f.inverted, &f.nodes, 8);
        augmenter.build(&unit_idf).unwrap();

        let root = f.tree.root().unwrap();
        // item 0: impact(1) = 1.0; item 1: impact(1) = impact(2) = 1/sqrt(2)
        let head = f.inverted.max_impact(root, 1).unwrap().unwrap();
        assert!((head - 1.0).abs() < 1e-6);
        let head2 = f.inverted.max_impact(root, 2).unwrap().unwrap();
        assert!((head2 as f64 - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);

        // tree-level postings carry both items for term 1, best first
        let mut stream = f.inverted.stream(TREE_LEVEL_NODE, 1).unwrap().unwrap();
        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.id, 0);
        let second = stream.next().unwrap().unwrap();
        assert_eq!(second.id, 1);
        assert!(first.impact >= second.impact);
    }

    #[test]
    fn node_descriptor_dominates_children() {
        let f = create_fixture(4);
        for i in 0..20u32 {
            insert_item(
                &f,
                i,
                (i % 5) as f64,
                (i / 5) as f64,
                vec![(i % 3, 1.0), (3 + i % 2, 0.5)],
            );
        }
        f.vectors.flush_and_clear().unwrap();
        let augmenter =
            Augmenter::new(&f.tree, &f.vectors, &f.inverted, &f.nodes, 2);
        augmenter.build(&unit_idf).unwrap();

        // walk: every parent's descriptor must dominate each child's
        let root = f.tree.root().unwrap();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = f.tree.read_node(id).unwrap();
            let parent_vec = f.vectors.get_node_vector(id, &unit_idf).unwrap();
            if node.is_leaf() {
                continue;
            }
            for entry in &node.entries {
                let child_vec = f.vectors.get_node_vector(entry.id, &unit_idf).unwrap();
                for (term, weight) in child_vec.terms() {
                    let parent_weight = parent_vec.get(*term).unwrap_or(0.0);
                    assert!(
                        parent_weight >= *weight - 1e-6,
                        "term {term} not dominated"
                    );
                }
                match &entry.payload {
                    Payload::Text(TextSummary::Inline(v)) => {
                        assert!(v.len() <= 2, "inline threshold violated")
                    }
                    Payload::Text(TextSummary::Stored(stored_id)) => {
                        assert_eq!(*stored_id, entry.id)
                    }
                    other => panic!("unaugmented payload {other:?}"),
                }
                stack.push(entry.id);
            }
        }
    }

    #[test]
    fn rebuild_is_idempotent() {
        let f = create_fixture(4);
        for i in 0..10u32 {
            insert_item(&f, i, i as f64, 0.0, vec![(i % 4, 1.0)]);
        }
        f.vectors.flush_and_clear().unwrap();
        let augmenter =
            Augmenter::new(&f.tree, &f.vectors, &f.inverted, &f.nodes, 8);
        augmenter.build(&unit_idf).unwrap();
        let root = f.tree.root().unwrap();
        let first = f.inverted.max_impact(root, 0).unwrap();
        augmenter.build(&unit_idf).unwrap();
        let second = f.inverted.max_impact(root, 0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_tree_is_a_no_op() {
        let f = create_fixture(4);
        let augmenter =
            Augmenter::new(&f.tree, &f.vectors, &f.inverted, &f.nodes, 8);
        augmenter.build(&unit_idf).unwrap();
        assert!(f
            .inverted
            .stream(TREE_LEVEL_NODE, 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn items_without_text_aggregate_to_empty() {
        let f = create_fixture(4);
        insert_item(&f, 0, 0.0, 0.0, vec![]);
        insert_item(&f, 1, 1.0, 0.0, vec![]);
        f.vectors.flush_and_clear().unwrap();
        let augmenter =
            Augmenter::new(&f.tree, &f.vectors, &f.inverted, &f.nodes, 8);
        augmenter.build(&unit_idf).unwrap();
        let root = f.tree.root().unwrap();
        let vector = f.vectors.get_node_vector(root, &unit_idf).unwrap();
        assert!(vector.is_empty());
    }
}
