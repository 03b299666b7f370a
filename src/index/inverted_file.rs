//! Inverted file (C6)
//!
//! Per-node and tree-level posting lists over one list store. A posting is
//! an 8-byte `(id: u32, impact: f32)` record; the synthetic list key
//! combines node id and term id. Lists are written in descending impact
//! order (ties by ascending id), so the head record carries the maximum
//! impact of the term within the subtree and streams are monotonically
//! non-increasing, which the ranking engines rely on.
//!
//! The reserved node id `TREE_LEVEL_NODE` holds the collection-wide
//! posting lists consumed by the posting-scan engine.

use crate::stats::SharedStats;
use crate::storage::{ListCursor, ListStore};
use crate::Result;
use std::cmp::Ordering;
use std::path::Path;

/// Reserved node id for the tree-level (whole-collection) inverted file.
pub const TREE_LEVEL_NODE: u32 = u32::MAX;

const POSTING_RECORD_SIZE: usize = 8;

/// One posting: the child or item id and its impact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Posting {
    pub id: u32,
    pub impact: f32,
}

fn posting_key(node: u32, term: u32) -> u64 {
    ((node as u64) << 32) | term as u64
}

pub struct InvertedFile {
    store: ListStore,
    stats: SharedStats,
}

impl InvertedFile {
    pub fn create(
        dir: &Path,
        block_size: usize,
        blocks_per_file: u32,
        buffer_capacity: usize,
        stats: SharedStats,
    ) -> Result<Self> {
        let store = ListStore::create(
            dir,
            "lists.postings",
            POSTING_RECORD_SIZE,
            block_size,
            blocks_per_file,
            buffer_capacity,
            stats.clone(),
        )?;
        Ok(Self { store, stats })
    }

    pub fn open(
        dir: &Path,
        block_size: usize,
        blocks_per_file: u32,
        buffer_capacity: usize,
        stats: SharedStats,
    ) -> Result<Self> {
        let store = ListStore::open(
            dir,
            "lists.postings",
            POSTING_RECORD_SIZE,
            block_size,
            blocks_per_file,
            buffer_capacity,
            stats.clone(),
        )?;
        Ok(Self { store, stats })
    }

    /// Write the posting list for a term within a node, replacing any
    /// previous list. Postings are sorted by descending impact, ties by
    /// ascending id.
    pub fn write_postings(
        &self,
        node: u32,
        term: u32,
        mut postings: Vec<Posting>,
    ) -> Result<()> {
        postings.sort_unstable_by(|a, b| {
            b.impact
                .partial_cmp(&a.impact)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        let key = posting_key(node, term);
        if self.store.contains(key) {
            self.store.remove(key)?;
        }
        let mut bytes = Vec::with_capacity(postings.len() * POSTING_RECORD_SIZE);
        for posting in &postings {
            bytes.extend_from_slice(&posting.id.to_le_bytes());
            bytes.extend_from_slice(&posting.impact.to_le_bytes());
        }
        self.store.append(key, &bytes)?;
        Ok(())
    }

    /// Maximum impact of `term` within `node`'s subtree, i.e. the head of
    /// its posting list. `None` when the term does not occur there.
    pub fn max_impact(&self, node: u32, term: u32) -> Result<Option<f32>> {
        match self.stream(node, term)? {
            Some(mut stream) => Ok(stream.next()?.map(|p| p.impact)),
            None => Ok(None),
        }
    }

    /// Restartable posting stream, `None` when the term has no list for
    /// this node (missing postings mean zero contribution, not an error).
    pub fn stream(&self, node: u32, term: u32) -> Result<Option<PostingStream<'_>>> {
        let key = posting_key(node, term);
        if !self.store.contains(key) {
            return Ok(None);
        }
        Ok(Some(PostingStream {
            cursor: self.store.cursor(key)?,
            stats: self.stats.clone(),
        }))
    }

    /// Number of postings for a term within a node.
    pub fn posting_count(&self, node: u32, term: u32) -> u64 {
        self.store.record_count(posting_key(node, term))
    }

    /// Drop every posting list (augmentation rebuild).
    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.store.size_in_bytes()
    }

    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}

/// Restartable stream over one posting list, in descending impact order.
pub struct PostingStream<'a> {
    cursor: ListCursor<'a>,
    stats: SharedStats,
}

impl<'a> PostingStream<'a> {
    pub fn next(&mut self) -> Result<Option<Posting>> {
        match self.cursor.next_record()? {
            Some(rec) => {
                let id = u32::from_le_bytes(rec[..4].try_into().unwrap());
                let impact = f32::from_le_bytes(rec[4..8].try_into().unwrap());
                self.stats.record(|c| c.postings_scanned += 1);
                Ok(Some(Posting { id, impact }))
            }
            None => Ok(None),
        }
    }

    pub fn rewind(&mut self) {
        self.cursor.rewind();
    }

    pub fn remaining(&self) -> u64 {
        self.cursor.remaining()
    }
}
