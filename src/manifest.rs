//! Index manifest (`rtree.meta`)
//!
//! Human-readable JSON describing one index directory: format version,
//! the full configuration, the tree root and its block count, and whether
//! the augmentation pass has run. Written on every flush; read on open,
//! where a foreign magic or version is rejected instead of misread.

use crate::config::IndexConfig;
use crate::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MANIFEST_FILE: &str = "rtree.meta";
const MANIFEST_MAGIC: &str = "irtree";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub magic: String,
    pub version: u32,
    pub config: IndexConfig,
    /// Root node block id; `None` for an empty tree.
    pub root: Option<u32>,
    pub height: u16,
    pub item_count: u64,
    /// Allocated blocks in the tree block file.
    pub tree_blocks: u32,
    pub augmented: bool,
}

impl Manifest {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            magic: MANIFEST_MAGIC.to_string(),
            version: MANIFEST_VERSION,
            config,
            root: None,
            height: 0,
            item_count: 0,
            tree_blocks: 0,
            augmented: false,
        }
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = std::fs::read(&path)
            .map_err(|_| IndexError::NotFound(format!("manifest {}", path.display())))?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        if manifest.magic != MANIFEST_MAGIC {
            return Err(IndexError::Corrupt(format!(
                "manifest magic {:?} is not an index manifest",
                manifest.magic
            )));
        }
        if manifest.version != MANIFEST_VERSION {
            return Err(IndexError::Corrupt(format!(
                "manifest version {} unsupported (expected {MANIFEST_VERSION})",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    pub fn store(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(dir.join(MANIFEST_FILE), bytes)?;
        Ok(())
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE).exists()
    }
}
