//! Disk-resident R-Tree (C7)
//!
//! Guttman R-Tree with quadratic split. One node per buffered block,
//! serialized with bincode into a zero-padded block buffer; the node id is
//! its block id. Nodes hold `level` (leaves are level 1) and up to
//! `max_entries` entries of `{id, rect, payload}`; non-root nodes hold at
//! least `min_entries`. The node MBR is never stored in the node itself:
//! it lives in the parent entry (and, for the root, nowhere), and equals
//! the union of the node's entries, payload aggregation included.
//!
//! All tie-breakers (choose-subtree, split seeds, group assignment) are
//! deterministic, falling back to the smaller id, so identical insertion
//! sequences produce identical trees.

use crate::config::IndexConfig;
use crate::stats::SharedStats;
use crate::storage::BufferedBlockFile;
use crate::types::{Payload, PayloadFilter, Rect, SparseVector, TextSummary};
use crate::{IndexError, Result};
use log::trace;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Absent node marker (empty tree root).
pub const NO_NODE: u32 = u32::MAX;

/// Level of leaf nodes. Entries of a leaf are items.
pub const LEAF_LEVEL: u16 = 1;

/// One slot of a tree node: a child node or an item, its MBR and the
/// aggregated payload of the subtree below it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub id: u32,
    pub rect: Rect,
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub level: u16,
    pub entries: Vec<Entry>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.level == LEAF_LEVEL
    }

    /// Union of all entries: geometric extent and aggregated payload.
    pub fn bounds(&self) -> Option<(Rect, Payload)> {
        let first = self.entries.first()?;
        let mut rect = first.rect;
        let mut payload = first.payload.clone();
        for entry in &self.entries[1..] {
            rect.expand(&entry.rect);
            payload = payload.union(&entry.payload);
        }
        Some((rect, payload))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TreeMeta {
    pub root: u32,
    pub height: u16,
    pub items: u64,
}

pub struct RTree {
    file: BufferedBlockFile,
    meta: RwLock<TreeMeta>,
    max_entries: usize,
    min_entries: usize,
    stats: SharedStats,
}

impl RTree {
    pub fn create(file: BufferedBlockFile, config: &IndexConfig, stats: SharedStats) -> Result<Self> {
        Self::check_node_fit(config, file.block_size())?;
        Ok(Self {
            file,
            meta: RwLock::new(TreeMeta {
                root: NO_NODE,
                height: 0,
                items: 0,
            }),
            max_entries: config.max_entries,
            min_entries: config.min_entries,
            stats,
        })
    }

    pub fn open(
        file: BufferedBlockFile,
        config: &IndexConfig,
        meta: TreeMeta,
        stats: SharedStats,
    ) -> Result<Self> {
        Self::check_node_fit(config, file.block_size())?;
        if meta.root != NO_NODE && meta.root >= file.len() {
            return Err(IndexError::Corrupt(format!(
                "root node {} is outside the allocated {} blocks",
                meta.root,
                file.len()
            )));
        }
        Ok(Self {
            file,
            meta: RwLock::new(meta),
            max_entries: config.max_entries,
            min_entries: config.min_entries,
            stats,
        })
    }

    /// A full node with every payload inlined at the threshold must fit a
    /// block, otherwise the configuration is unusable.
    fn check_node_fit(config: &IndexConfig, block_size: usize) -> Result<()> {
        let vector = SparseVector::new(
            (0..config.inline_vector_threshold as u32)
                .map(|t| (t, 1.0f32))
                .collect(),
        );
        let worst = Node {
            level: u16::MAX,
            entries: vec![
                Entry {
                    id: u32::MAX,
                    rect: Rect::from_point(crate::types::Point::new(0.0, 0.0)),
                    payload: Payload::Text(TextSummary::Inline(vector)),
                };
                config.max_entries
            ],
        };
        let need = bincode::serialized_size(&worst)? as usize;
        if need > block_size {
            return Err(IndexError::InvalidArgument(format!(
                "a full node needs {need} bytes but blocks hold {block_size}; \
                 lower max_entries or inline_vector_threshold"
            )));
        }
        Ok(())
    }

    pub fn read_node(&self, id: u32) -> Result<Node> {
        let buf = self.file.read_vec(id)?;
        let node: Node = bincode::deserialize(&buf)?;
        Ok(node)
    }

    pub fn write_node(&self, id: u32, node: &Node) -> Result<()> {
        let bytes = bincode::serialize(node)?;
        if bytes.len() > self.file.block_size() {
            return Err(IndexError::Full(format!(
                "node {} serializes to {} bytes, block size is {}",
                id,
                bytes.len(),
                self.file.block_size()
            )));
        }
        let mut block = vec![0u8; self.file.block_size()];
        block[..bytes.len()].copy_from_slice(&bytes);
        self.file.write(id, &block)
    }

    pub fn root(&self) -> Option<u32> {
        let meta = self.meta.read();
        (meta.root != NO_NODE).then_some(meta.root)
    }

    pub fn height(&self) -> u16 {
        self.meta.read().height
    }

    /// Number of item entries in the tree.
    pub fn len(&self) -> u64 {
        self.meta.read().items
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn meta(&self) -> TreeMeta {
        *self.meta.read()
    }

    /// Insert an item entry at the leaf level.
    pub fn insert(&self, id: u32, rect: Rect, payload: Payload) -> Result<()> {
        let mut meta = self.meta.write();
        self.insert_at_level(Entry { id, rect, payload }, LEAF_LEVEL, &mut meta)?;
        meta.items += 1;
        Ok(())
    }

    fn insert_at_level(&self, entry: Entry, target_level: u16, meta: &mut TreeMeta) -> Result<()> {
        if meta.root == NO_NODE {
            let node = Node {
                level: target_level,
                entries: vec![entry],
            };
            let id = self.file.allocate()?;
            self.write_node(id, &node)?;
            meta.root = id;
            meta.height = target_level;
            return Ok(());
        }

        let mut path: Vec<(u32, usize)> = Vec::new();
        let mut current = meta.root;
        let mut node = self.read_node(current)?;
        while node.level > target_level {
            let child_index = Self::choose_subtree(&node, &entry.rect);
            path.push((current, child_index));
            current = node.entries[child_index].id;
            node = self.read_node(current)?;
        }
        if node.level != target_level {
            return Err(IndexError::Corrupt(format!(
                "descent for level {target_level} landed on a level-{} node",
                node.level
            )));
        }
        node.entries.push(entry);
        self.complete_insert(path, current, node, meta)
    }

    /// Least-enlargement child; ties by smaller post-enlargement area,
    /// then smaller id.
    fn choose_subtree(node: &Node, rect: &Rect) -> usize {
        let mut best = 0usize;
        let mut best_enlargement = f64::INFINITY;
        let mut best_area = f64::INFINITY;
        for (index, entry) in node.entries.iter().enumerate() {
            let area = entry.rect.union(rect).area();
            let enlargement = area - entry.rect.area();
            let better = enlargement < best_enlargement
                || (enlargement == best_enlargement
                    && (area < best_area
                        || (area == best_area && entry.id < node.entries[best].id)));
            if better {
                best = index;
                best_enlargement = enlargement;
                best_area = area;
            }
        }
        best
    }

    /// Write `node` back, splitting and propagating upward while it
    /// overflows, then refresh ancestor bounds along the remaining path.
    fn complete_insert(
        &self,
        mut path: Vec<(u32, usize)>,
        mut node_id: u32,
        mut node: Node,
        meta: &mut TreeMeta,
    ) -> Result<()> {
        loop {
            if node.entries.len() <= self.max_entries {
                self.write_node(node_id, &node)?;
                let (mut rect, mut payload) =
                    node.bounds().expect("written node cannot be empty");
                for (parent_id, child_index) in path.into_iter().rev() {
                    let mut parent = self.read_node(parent_id)?;
                    parent.entries[child_index].rect = rect;
                    parent.entries[child_index].payload = payload;
                    let (next_rect, next_payload) =
                        parent.bounds().expect("parent cannot be empty");
                    self.write_node(parent_id, &parent)?;
                    rect = next_rect;
                    payload = next_payload;
                }
                return Ok(());
            }

            let level = node.level;
            let (group_a, group_b) = self.quadratic_split(std::mem::take(&mut node.entries));
            let node_a = Node {
                level,
                entries: group_a,
            };
            let node_b = Node {
                level,
                entries: group_b,
            };
            let new_id = self.file.allocate()?;
            self.write_node(node_id, &node_a)?;
            self.write_node(new_id, &node_b)?;
            trace!("split node {node_id} at level {level}, new sibling {new_id}");
            let (rect_a, payload_a) = node_a.bounds().unwrap();
            let (rect_b, payload_b) = node_b.bounds().unwrap();

            match path.pop() {
                Some((parent_id, child_index)) => {
                    let mut parent = self.read_node(parent_id)?;
                    parent.entries[child_index].rect = rect_a;
                    parent.entries[child_index].payload = payload_a;
                    parent.entries.push(Entry {
                        id: new_id,
                        rect: rect_b,
                        payload: payload_b,
                    });
                    node_id = parent_id;
                    node = parent;
                }
                None => {
                    let root = Node {
                        level: level + 1,
                        entries: vec![
                            Entry {
                                id: node_id,
                                rect: rect_a,
                                payload: payload_a,
                            },
                            Entry {
                                id: new_id,
                                rect: rect_b,
                                payload: payload_b,
                            },
                        ],
                    };
                    let root_id = self.file.allocate()?;
                    self.write_node(root_id, &root)?;
                    meta.root = root_id;
                    meta.height = level + 1;
                    return Ok(());
                }
            }
        }
    }

    /// Quadratic split: seed with the pair wasting the most area, then
    /// assign by least enlargement, forcing the remainder once a group
    /// could no longer leave `min_entries` for the other.
    fn quadratic_split(&self, entries: Vec<Entry>) -> (Vec<Entry>, Vec<Entry>) {
        let n = entries.len();
        let (mut seed_a, mut seed_b) = (0usize, 1usize);
        let mut worst = f64::NEG_INFINITY;
        for i in 0..n {
            for j in (i + 1)..n {
                let waste = entries[i].rect.union(&entries[j].rect).area()
                    - entries[i].rect.area()
                    - entries[j].rect.area();
                if waste > worst {
                    worst = waste;
                    seed_a = i;
                    seed_b = j;
                }
            }
        }

        let mut group_a: Vec<Entry> = Vec::with_capacity(n);
        let mut group_b: Vec<Entry> = Vec::with_capacity(n);
        let mut rect_a = entries[seed_a].rect;
        let mut rect_b = entries[seed_b].rect;
        let force_at = self.max_entries + 1 - self.min_entries;

        // seeds join their groups first so the force threshold counts them
        let mut rest: Vec<Entry> = Vec::with_capacity(n - 2);
        for (index, entry) in entries.into_iter().enumerate() {
            if index == seed_a {
                group_a.push(entry);
            } else if index == seed_b {
                group_b.push(entry);
            } else {
                rest.push(entry);
            }
        }

        for entry in rest {
            if group_a.len() >= force_at {
                rect_b.expand(&entry.rect);
                group_b.push(entry);
                continue;
            }
            if group_b.len() >= force_at {
                rect_a.expand(&entry.rect);
                group_a.push(entry);
                continue;
            }
            let enlargement_a = rect_a.enlargement(&entry.rect);
            let enlargement_b = rect_b.enlargement(&entry.rect);
            let take_a = enlargement_a < enlargement_b
                || (enlargement_a == enlargement_b
                    && (rect_a.area() < rect_b.area()
                        || (rect_a.area() == rect_b.area()
                            && group_a.len() <= group_b.len())));
            if take_a {
                rect_a.expand(&entry.rect);
                group_a.push(entry);
            } else {
                rect_b.expand(&entry.rect);
                group_b.push(entry);
            }
        }
        (group_a, group_b)
    }

    /// Remove the item entry with the given id whose MBR is contained in
    /// `rect`. Underfull nodes are dissolved and their surviving entries
    /// reinserted at their original levels. Returns whether an entry was
    /// removed.
    pub fn remove(&self, id: u32, rect: &Rect) -> Result<bool> {
        let mut meta = self.meta.write();
        if meta.root == NO_NODE {
            return Ok(false);
        }
        let Some((leaf_id, entry_index, path)) =
            self.find_leaf(meta.root, rect, id, Vec::new())?
        else {
            return Ok(false);
        };

        let mut node = self.read_node(leaf_id)?;
        node.entries.remove(entry_index);

        let mut orphans: Vec<(u16, Vec<Entry>)> = Vec::new();
        let mut current_id = leaf_id;
        let mut path = path;
        loop {
            if !path.is_empty() && node.entries.len() < self.min_entries {
                orphans.push((node.level, std::mem::take(&mut node.entries)));
                let (parent_id, child_index) = path.pop().unwrap();
                let mut parent = self.read_node(parent_id)?;
                parent.entries.remove(child_index);
                current_id = parent_id;
                node = parent;
                continue;
            }
            if node.entries.is_empty() {
                // the tree is now empty
                meta.root = NO_NODE;
                meta.height = 0;
            } else {
                self.write_node(current_id, &node)?;
                let (mut bounds_rect, mut payload) = node.bounds().unwrap();
                for (parent_id, child_index) in path.into_iter().rev() {
                    let mut parent = self.read_node(parent_id)?;
                    parent.entries[child_index].rect = bounds_rect;
                    parent.entries[child_index].payload = payload;
                    let (next_rect, next_payload) = parent.bounds().unwrap();
                    self.write_node(parent_id, &parent)?;
                    bounds_rect = next_rect;
                    payload = next_payload;
                }
            }
            break;
        }

        meta.items -= 1;

        for (level, entries) in orphans {
            for entry in entries {
                self.insert_at_level(entry, level, &mut meta)?;
            }
        }

        // shrink the root while it has a single child
        while meta.root != NO_NODE {
            let root = self.read_node(meta.root)?;
            if root.level > LEAF_LEVEL && root.entries.len() == 1 {
                meta.root = root.entries[0].id;
                meta.height = root.level - 1;
            } else {
                break;
            }
        }
        Ok(true)
    }

    #[allow(clippy::type_complexity)]
    fn find_leaf(
        &self,
        node_id: u32,
        rect: &Rect,
        id: u32,
        mut path: Vec<(u32, usize)>,
    ) -> Result<Option<(u32, usize, Vec<(u32, usize)>)>> {
        let node = self.read_node(node_id)?;
        if node.is_leaf() {
            for (index, entry) in node.entries.iter().enumerate() {
                if entry.id == id && entry.rect == *rect {
                    return Ok(Some((node_id, index, path)));
                }
            }
            return Ok(None);
        }
        for (index, entry) in node.entries.iter().enumerate() {
            if entry.rect.contains_rect(rect) {
                path.push((node_id, index));
                if let Some(found) = self.find_leaf(entry.id, rect, id, path.clone())? {
                    return Ok(Some(found));
                }
                path.pop();
            }
        }
        Ok(None)
    }

    /// Leaf entries whose MBR intersects `query`. With a filter, subtrees
    /// whose aggregate cannot satisfy it are pruned and leaf entries must
    /// satisfy it outright.
    pub fn search(&self, query: &Rect, filter: Option<&PayloadFilter>) -> Result<Vec<Entry>> {
        let meta = self.meta.read();
        let mut out = Vec::new();
        if meta.root == NO_NODE {
            return Ok(out);
        }
        self.search_node(meta.root, query, filter, &mut out)?;
        Ok(out)
    }

    fn search_node(
        &self,
        node_id: u32,
        query: &Rect,
        filter: Option<&PayloadFilter>,
        out: &mut Vec<Entry>,
    ) -> Result<()> {
        let node = self.read_node(node_id)?;
        self.stats.record(|c| c.nodes_visited += 1);
        if node.is_leaf() {
            for entry in &node.entries {
                let matches = entry.rect.intersects(query)
                    && filter.map_or(true, |f| entry.payload.satisfies(f));
                if matches {
                    out.push(entry.clone());
                }
            }
            return Ok(());
        }
        for entry in &node.entries {
            let descend = entry.rect.intersects(query)
                && filter.map_or(true, |f| entry.payload.may_satisfy(f));
            if descend {
                self.search_node(entry.id, query, filter, out)?;
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    pub fn allocated_blocks(&self) -> u32 {
        self.file.len()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.file.size_in_bytes()
    }

    pub fn close(self) -> Result<()> {
        self.file.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsCenter;
    use crate::storage::BlockFile;
    use crate::types::Point;
    use tempfile::TempDir;

    fn test_config(max_entries: usize) -> IndexConfig {
        IndexConfig::default().with_fanout(max_entries)
    }

    fn create_test_tree(temp: &TempDir, max_entries: usize) -> RTree {
        let stats = StatsCenter::new();
        let config = test_config(max_entries);
        let file = BlockFile::create(temp.path(), "blocks", config.block_size, 64, stats.clone())
            .unwrap();
        let file = BufferedBlockFile::new(file, 32, stats.clone()).unwrap();
        RTree::create(file, &config, stats).unwrap()
    }

    fn point_rect(x: f64, y: f64) -> Rect {
        Rect::from_point(Point::new(x, y))
    }

    /// Walk the tree checking fan-out bounds, uniform leaf depth and MBR
    /// closure; returns all item entries.
    fn check_invariants(tree: &RTree) -> Vec<Entry> {
        let mut items = Vec::new();
        let Some(root) = tree.root() else {
            assert_eq!(tree.height(), 0);
            return items;
        };
        let root_node = tree.read_node(root).unwrap();
        assert_eq!(root_node.level, tree.height());
        assert!(!root_node.entries.is_empty());
        walk(tree, root, true, &mut items);
        items
    }

    fn walk(tree: &RTree, node_id: u32, is_root: bool, items: &mut Vec<Entry>) {
        let node = tree.read_node(node_id).unwrap();
        if !is_root {
            assert!(
                node.entries.len() >= tree.min_entries,
                "node {node_id} underfull: {}",
                node.entries.len()
            );
        }
        assert!(node.entries.len() <= tree.max_entries);
        if node.is_leaf() {
            items.extend(node.entries.iter().cloned());
            return;
        }
        for entry in &node.entries {
            let child = tree.read_node(entry.id).unwrap();
            assert_eq!(child.level, node.level - 1, "levels must step by one");
            let (child_rect, _) = child.bounds().unwrap();
            assert_eq!(entry.rect, child_rect, "parent entry MBR must be tight");
            walk(tree, entry.id, false, items);
        }
    }

    #[test]
    fn single_insert_makes_a_root_leaf() {
        let temp = TempDir::new().unwrap();
        let tree = create_test_tree(&temp, 4);
        tree.insert(1, point_rect(0.5, 0.5), Payload::None).unwrap();
        assert_eq!(tree.height(), LEAF_LEVEL);
        assert_eq!(tree.len(), 1);
        let items = check_invariants(&tree);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, 1);
    }

    #[test]
    fn split_forcing_sequence() {
        let temp = TempDir::new().unwrap();
        let tree = create_test_tree(&temp, 4);
        let points = [
            (0.0, 0.0),
            (1.0, 0.0),
            (2.0, 0.0),
            (0.0, 5.0),
            (1.0, 5.0),
            (2.0, 5.0),
            (0.0, 9.0),
            (1.0, 9.0),
            (2.0, 9.0),
        ];
        for (i, (x, y)) in points.iter().enumerate() {
            tree.insert(i as u32, point_rect(*x, *y), Payload::None)
                .unwrap();
        }
        assert_eq!(tree.len(), 9);
        assert!(tree.height() >= 2, "nine inserts at M=4 must split");
        let items = check_invariants(&tree);
        assert_eq!(items.len(), 9);
        let mut ids: Vec<u32> = items.iter().map(|e| e.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn identical_sequences_build_identical_trees() {
        let build = |temp: &TempDir| {
            let tree = create_test_tree(temp, 4);
            for i in 0..30u32 {
                let x = (i % 7) as f64;
                let y = (i % 11) as f64;
                tree.insert(i, point_rect(x, y), Payload::None).unwrap();
            }
            let mut dump = Vec::new();
            let root = tree.root().unwrap();
            let mut stack = vec![root];
            while let Some(id) = stack.pop() {
                let node = tree.read_node(id).unwrap();
                if !node.is_leaf() {
                    stack.extend(node.entries.iter().map(|e| e.id));
                }
                dump.push((id, node));
            }
            dump
        };
        let temp_a = TempDir::new().unwrap();
        let temp_b = TempDir::new().unwrap();
        assert_eq!(build(&temp_a), build(&temp_b));
    }

    #[test]
    fn shape_holds_under_many_inserts() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let temp = TempDir::new().unwrap();
        let tree = create_test_tree(&temp, 6);
        for i in 0..200u32 {
            let x: f64 = rng.gen_range(-100.0..100.0);
            let y: f64 = rng.gen_range(-100.0..100.0);
            tree.insert(i, point_rect(x, y), Payload::None).unwrap();
        }
        let items = check_invariants(&tree);
        assert_eq!(items.len(), 200);
    }

    #[test]
    fn window_search_matches_brute_force() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let temp = TempDir::new().unwrap();
        let tree = create_test_tree(&temp, 5);
        let mut points = Vec::new();
        for i in 0..120u32 {
            let x: f64 = rng.gen_range(0.0..50.0);
            let y: f64 = rng.gen_range(0.0..50.0);
            points.push((i, x, y));
            tree.insert(i, point_rect(x, y), Payload::None).unwrap();
        }
        let window = Rect::new(10.0, 10.0, 30.0, 30.0).unwrap();
        let mut found: Vec<u32> = tree
            .search(&window, None)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        found.sort_unstable();
        let mut expected: Vec<u32> = points
            .iter()
            .filter(|(_, x, y)| window.contains_point(&Point::new(*x, *y)))
            .map(|(i, _, _)| *i)
            .collect();
        expected.sort_unstable();
        assert_eq!(found, expected);
    }

    #[test]
    fn remove_reinserts_orphans_and_keeps_shape() {
        let temp = TempDir::new().unwrap();
        let tree = create_test_tree(&temp, 4);
        let mut rects = Vec::new();
        for i in 0..40u32 {
            let rect = point_rect((i % 8) as f64, (i / 8) as f64);
            rects.push(rect);
            tree.insert(i, rect, Payload::None).unwrap();
        }
        for i in (0..40u32).step_by(2) {
            assert!(tree.remove(i, &rects[i as usize]).unwrap());
        }
        assert_eq!(tree.len(), 20);
        let items = check_invariants(&tree);
        let mut ids: Vec<u32> = items.iter().map(|e| e.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..40).step_by(2).collect::<Vec<_>>());
        // removing a missing entry is a no-op
        assert!(!tree.remove(0, &rects[0]).unwrap());
    }

    #[test]
    fn remove_everything_empties_the_tree() {
        let temp = TempDir::new().unwrap();
        let tree = create_test_tree(&temp, 4);
        for i in 0..10u32 {
            tree.insert(i, point_rect(i as f64, 0.0), Payload::None)
                .unwrap();
        }
        for i in 0..10u32 {
            assert!(tree.remove(i, &point_rect(i as f64, 0.0)).unwrap());
        }
        assert_eq!(tree.len(), 0);
        assert!(tree.root().is_none());
        // and the tree is usable again
        tree.insert(99, point_rect(1.0, 1.0), Payload::None).unwrap();
        assert_eq!(check_invariants(&tree).len(), 1);
    }

    #[test]
    fn payload_aggregation_flows_to_the_root() {
        let temp = TempDir::new().unwrap();
        let tree = create_test_tree(&temp, 4);
        for i in 0..12u32 {
            tree.insert(
                i,
                point_rect(i as f64, (i % 3) as f64),
                Payload::MaxScore(i as f64 / 10.0),
            )
            .unwrap();
        }
        let root = tree.read_node(tree.root().unwrap()).unwrap();
        let (_, payload) = root.bounds().unwrap();
        assert_eq!(payload, Payload::MaxScore(1.1));
    }

    #[test]
    fn payload_filtered_search() {
        let temp = TempDir::new().unwrap();
        let tree = create_test_tree(&temp, 4);
        for i in 0..20u32 {
            tree.insert(
                i,
                point_rect(i as f64, 0.0),
                Payload::MaxScore(i as f64),
            )
            .unwrap();
        }
        let window = Rect::new(0.0, 0.0, 19.0, 0.0).unwrap();
        let found = tree
            .search(&window, Some(&PayloadFilter::MinScore(15.0)))
            .unwrap();
        let mut ids: Vec<u32> = found.into_iter().map(|e| e.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![15, 16, 17, 18, 19]);
    }

    #[test]
    fn nodes_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let stats = StatsCenter::new();
        let config = test_config(4);
        let meta;
        let blocks;
        {
            let file =
                BlockFile::create(temp.path(), "blocks", config.block_size, 64, stats.clone())
                    .unwrap();
            let file = BufferedBlockFile::new(file, 32, stats.clone()).unwrap();
            let tree = RTree::create(file, &config, stats.clone()).unwrap();
            for i in 0..25u32 {
                tree.insert(i, point_rect(i as f64, i as f64), Payload::None)
                    .unwrap();
            }
            meta = tree.meta();
            blocks = tree.allocated_blocks();
            tree.close().unwrap();
        }
        let file = BlockFile::open(
            temp.path(),
            "blocks",
            config.block_size,
            64,
            blocks,
            stats.clone(),
        )
        .unwrap();
        let file = BufferedBlockFile::new(file, 32, stats.clone()).unwrap();
        let tree = RTree::open(file, &config, meta, stats).unwrap();
        assert_eq!(tree.len(), 25);
        let items = check_invariants(&tree);
        assert_eq!(items.len(), 25);
    }

    #[test]
    fn oversized_config_rejected() {
        let temp = TempDir::new().unwrap();
        let stats = StatsCenter::new();
        let mut config = test_config(64).with_inline_vector_threshold(64);
        config.block_size = 512;
        let file = BlockFile::create(temp.path(), "blocks", 512, 64, stats.clone()).unwrap();
        let file = BufferedBlockFile::new(file, 8, stats.clone()).unwrap();
        assert!(matches!(
            RTree::create(file, &config, stats),
            Err(IndexError::InvalidArgument(_))
        ));
    }
}
