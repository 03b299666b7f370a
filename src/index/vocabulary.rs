//! Vocabulary (C4)
//!
//! Persistent bijection between external string keys and dense internal
//! ids, with a typed per-entry statistics payload. Ids are assigned
//! monotonically from 0 and never reused, so the entry vector index is the
//! id. One instance each exists for terms, documents and nodes.

use crate::{IndexError, Result};
use ahash::AHashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const VOCAB_MAGIC: u32 = 0x4952_5642; // "IRVB"
const VOCAB_VERSION: u32 = 1;

/// Per-term statistics: document frequency and the summed weight of the
/// term across the collection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TermStats {
    pub df: u32,
    pub total_weight: f64,
}

/// Per-document statistics. The point rides here so an item discovered in
/// a posting stream can be scored spatially without touching the tree.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct DocStats {
    pub x: f64,
    pub y: f64,
    pub term_count: u32,
    /// Cleared on remove; a dead entry keeps its id (ids are never reused)
    /// and may be revived by re-inserting the same key.
    pub alive: bool,
}

/// Per-node statistics recorded by the augmentation pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeStats {
    pub term_count: u32,
    pub level: u16,
}

#[derive(Serialize, Deserialize)]
struct VocabDisk<S> {
    magic: u32,
    version: u32,
    entries: Vec<(String, S)>,
}

struct VocabState<S> {
    forward: AHashMap<String, u32>,
    entries: Vec<(String, S)>,
    dirty: bool,
}

pub struct Vocabulary<S> {
    path: PathBuf,
    state: RwLock<VocabState<S>>,
}

impl<S> Vocabulary<S>
where
    S: Serialize + DeserializeOwned + Clone + Default,
{
    pub fn create(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            state: RwLock::new(VocabState {
                forward: AHashMap::new(),
                entries: Vec::new(),
                dirty: true,
            }),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|_| IndexError::NotFound(format!("vocabulary {}", path.display())))?;
        if bytes.len() < 4 {
            return Err(IndexError::Corrupt(format!(
                "vocabulary {} is too short",
                path.display()
            )));
        }
        let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if crc32fast::hash(payload) != stored_crc {
            return Err(IndexError::Corrupt(format!(
                "vocabulary {} checksum mismatch",
                path.display()
            )));
        }
        let disk: VocabDisk<S> = bincode::deserialize(payload)?;
        if disk.magic != VOCAB_MAGIC || disk.version != VOCAB_VERSION {
            return Err(IndexError::Corrupt(format!(
                "vocabulary {} has foreign magic or version",
                path.display()
            )));
        }
        let forward = disk
            .entries
            .iter()
            .enumerate()
            .map(|(id, (key, _))| (key.clone(), id as u32))
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(VocabState {
                forward,
                entries: disk.entries,
                dirty: false,
            }),
        })
    }

    /// Map a key to its dense id, assigning the next id on first sight.
    /// Returns the id and whether it is new. Empty keys are rejected:
    /// the persisted format cannot distinguish them from padding.
    pub fn intern(&self, key: &str) -> Result<(u32, bool)> {
        if key.is_empty() {
            return Err(IndexError::InvalidArgument(
                "empty vocabulary key".into(),
            ));
        }
        let mut state = self.state.write();
        if let Some(id) = state.forward.get(key) {
            return Ok((*id, false));
        }
        if state.entries.len() >= u32::MAX as usize {
            return Err(IndexError::Full("vocabulary id space exhausted".into()));
        }
        let id = state.entries.len() as u32;
        state.forward.insert(key.to_string(), id);
        state.entries.push((key.to_string(), S::default()));
        state.dirty = true;
        Ok((id, true))
    }

    pub fn lookup(&self, key: &str) -> Option<u32> {
        self.state.read().forward.get(key).copied()
    }

    pub fn key_of(&self, id: u32) -> Option<String> {
        self.state
            .read()
            .entries
            .get(id as usize)
            .map(|(key, _)| key.clone())
    }

    pub fn stats(&self, id: u32) -> Option<S> {
        self.state
            .read()
            .entries
            .get(id as usize)
            .map(|(_, stats)| stats.clone())
    }

    /// Mutate the statistics of an entry in place.
    pub fn update_stats<F: FnOnce(&mut S)>(&self, id: u32, f: F) -> Result<()> {
        let mut state = self.state.write();
        match state.entries.get_mut(id as usize) {
            Some((_, stats)) => {
                f(stats);
                state.dirty = true;
                Ok(())
            }
            None => Err(IndexError::NotFound(format!("vocabulary id {id}"))),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the map. Entries are written in id order, so repeated
    /// flushes of the same state are byte-identical.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.dirty {
            return Ok(());
        }
        let disk = VocabDisk {
            magic: VOCAB_MAGIC,
            version: VOCAB_VERSION,
            entries: state.entries.clone(),
        };
        let mut bytes = bincode::serialize(&disk)?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        std::fs::write(&self.path, &bytes)?;
        state.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn intern_is_dense_and_stable() {
        let temp = TempDir::new().unwrap();
        let vocab: Vocabulary<TermStats> = Vocabulary::create(&temp.path().join("vocab.term"));
        assert_eq!(vocab.intern("alpha").unwrap(), (0, true));
        assert_eq!(vocab.intern("beta").unwrap(), (1, true));
        assert_eq!(vocab.intern("alpha").unwrap(), (0, false));
        assert_eq!(vocab.lookup("beta"), Some(1));
        assert_eq!(vocab.lookup("gamma"), None);
        assert_eq!(vocab.key_of(1).as_deref(), Some("beta"));
    }

    #[test]
    fn rejects_empty_keys() {
        let temp = TempDir::new().unwrap();
        let vocab: Vocabulary<TermStats> = Vocabulary::create(&temp.path().join("vocab.term"));
        assert!(matches!(
            vocab.intern(""),
            Err(IndexError::InvalidArgument(_))
        ));
    }

    #[test]
    fn stats_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vocab.term");
        {
            let vocab: Vocabulary<TermStats> = Vocabulary::create(&path);
            let (id, _) = vocab.intern("alpha").unwrap();
            vocab
                .update_stats(id, |s| {
                    s.df = 3;
                    s.total_weight = 1.5;
                })
                .unwrap();
            vocab.flush().unwrap();
        }
        let vocab: Vocabulary<TermStats> = Vocabulary::open(&path).unwrap();
        assert_eq!(vocab.len(), 1);
        let stats = vocab.stats(0).unwrap();
        assert_eq!(stats.df, 3);
        assert_eq!(stats.total_weight, 1.5);
        assert_eq!(vocab.lookup("alpha"), Some(0));
    }

    #[test]
    fn checksum_mismatch_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vocab.doc");
        {
            let vocab: Vocabulary<DocStats> = Vocabulary::create(&path);
            vocab.intern("doc-1").unwrap();
            vocab.flush().unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let at = bytes.len() / 2;
        bytes[at] ^= 0x55;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            Vocabulary::<DocStats>::open(&path),
            Err(IndexError::Corrupt(_))
        ));
    }

    #[test]
    fn flush_twice_same_bytes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vocab.node");
        let vocab: Vocabulary<NodeStats> = Vocabulary::create(&path);
        vocab.intern("n0").unwrap();
        vocab.intern("n1").unwrap();
        vocab.flush().unwrap();
        let first = std::fs::read(&path).unwrap();
        vocab.flush().unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn update_unknown_id_is_not_found() {
        let temp = TempDir::new().unwrap();
        let vocab: Vocabulary<TermStats> = Vocabulary::create(&temp.path().join("v"));
        assert!(matches!(
            vocab.update_stats(9, |_| {}),
            Err(IndexError::NotFound(_))
        ));
    }
}
