//! Block file (C1)
//!
//! Fixed-size blocks over a rolling set of backing files named
//! `{base}.{n}.dat`. Block ids are dense and monotonically assigned;
//! `block_id / blocks_per_file` selects the file,
//! `(block_id % blocks_per_file) * block_size` the offset. Reads and
//! writes are whole blocks; there is no per-block checksum.

use crate::stats::SharedStats;
use crate::{IndexError, Result};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct BlockFile {
    dir: PathBuf,
    base: String,
    block_size: usize,
    blocks_per_file: u32,
    files: Vec<File>,
    total_blocks: u32,
    stats: SharedStats,
}

impl BlockFile {
    /// Start an empty block file set. Any stale backing file from a prior
    /// incarnation with the same base name is truncated on first use.
    pub fn create(
        dir: &Path,
        base: &str,
        block_size: usize,
        blocks_per_file: u32,
        stats: SharedStats,
    ) -> Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            block_size,
            blocks_per_file,
            files: Vec::new(),
            total_blocks: 0,
            stats,
        })
    }

    /// Reopen an existing block file set holding `expected_blocks` blocks.
    /// Backing files shorter than the expectation are corrupt; longer ones
    /// can remain after a crash mid-flush and are tolerated.
    pub fn open(
        dir: &Path,
        base: &str,
        block_size: usize,
        blocks_per_file: u32,
        expected_blocks: u32,
        stats: SharedStats,
    ) -> Result<Self> {
        let mut out = Self::create(dir, base, block_size, blocks_per_file, stats)?;
        let file_count = expected_blocks.div_ceil(blocks_per_file);
        for index in 0..file_count {
            let path = out.file_path(index as usize);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|_| IndexError::NotFound(format!("block file {}", path.display())))?;
            let blocks_in_file = if index + 1 == file_count {
                expected_blocks - index * blocks_per_file
            } else {
                blocks_per_file
            };
            let need = blocks_in_file as u64 * block_size as u64;
            let have = file.metadata()?.len();
            if have < need {
                return Err(IndexError::Corrupt(format!(
                    "block file {} holds {have} bytes, expected at least {need}",
                    path.display()
                )));
            }
            out.files.push(file);
        }
        out.total_blocks = expected_blocks;
        Ok(out)
    }

    fn file_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.{}.dat", self.base, index))
    }

    fn locate(&self, block_id: u32) -> (usize, u64) {
        let file_index = (block_id / self.blocks_per_file) as usize;
        let offset = (block_id % self.blocks_per_file) as u64 * self.block_size as u64;
        (file_index, offset)
    }

    /// Reserve the next block id. The backing file is zero-extended so the
    /// block reads back as zeros before its first write.
    pub fn allocate(&mut self) -> Result<u32> {
        if self.total_blocks == u32::MAX {
            return Err(IndexError::Full("block id space exhausted".into()));
        }
        let id = self.total_blocks;
        let (file_index, offset) = self.locate(id);
        if file_index == self.files.len() {
            let path = self.file_path(file_index);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            debug!("block file rollover: opened {}", path.display());
            self.files.push(file);
        }
        let file = &self.files[file_index];
        let need = offset + self.block_size as u64;
        if file.metadata()?.len() < need {
            file.set_len(need)?;
        }
        self.total_blocks += 1;
        self.stats.record(|c| c.blocks_allocated += 1);
        Ok(id)
    }

    pub fn read(&mut self, block_id: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.block_size {
            return Err(IndexError::InvalidArgument(format!(
                "read buffer is {} bytes, block size is {}",
                buf.len(),
                self.block_size
            )));
        }
        if block_id >= self.total_blocks {
            return Err(IndexError::NotFound(format!("block {block_id}")));
        }
        let (file_index, offset) = self.locate(block_id);
        let file = &mut self.files[file_index];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        self.stats.record(|c| c.block_reads += 1);
        Ok(())
    }

    pub fn write(&mut self, block_id: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != self.block_size {
            return Err(IndexError::InvalidArgument(format!(
                "write buffer is {} bytes, block size is {}",
                buf.len(),
                self.block_size
            )));
        }
        if block_id >= self.total_blocks {
            return Err(IndexError::NotFound(format!("block {block_id}")));
        }
        let (file_index, offset) = self.locate(block_id);
        let file = &mut self.files[file_index];
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        self.stats.record(|c| c.block_writes += 1);
        Ok(())
    }

    /// Allocated block count.
    pub fn len(&self) -> u32 {
        self.total_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.total_blocks == 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }

    pub fn sync(&mut self) -> Result<()> {
        for file in &self.files {
            file.sync_all()?;
        }
        Ok(())
    }
}
