//! List store (C3)
//!
//! Variable-length lists of fixed-size records, keyed by integer, laid out
//! across buffered blocks. Each block holds `(B - 8) / R` records followed
//! by an 8-byte trailer: `used_records: u32`, `next_block_id: u32`
//! (`u32::MAX` terminates the chain). The per-key directory lives in memory
//! and is persisted to a `{base}.dir` sidecar together with the free list;
//! freed blocks are only reusable if the sidecar reached disk.
//!
//! Appends extend the remembered partially-filled tail block of the list in
//! place before allocating; fresh allocations pull from the free list first.

use crate::stats::SharedStats;
use crate::storage::{BlockFile, BufferedBlockFile};
use crate::{IndexError, Result};
use ahash::AHashMap;
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Chain terminator / absent block marker.
pub const NO_BLOCK: u32 = u32::MAX;

const TRAILER_LEN: usize = 8;
const SIDECAR_MAGIC: u32 = 0x4C49_5354; // "LIST"
const SIDECAR_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
struct ListDir {
    head: u32,
    tail: u32,
    /// Records used in the tail block (the reusable free suffix starts here).
    tail_used: u32,
    total: u64,
}

impl ListDir {
    fn empty() -> Self {
        Self {
            head: NO_BLOCK,
            tail: NO_BLOCK,
            tail_used: 0,
            total: 0,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SidecarDisk {
    magic: u32,
    version: u32,
    record_size: u32,
    total_blocks: u32,
    free: Vec<u32>,
    entries: Vec<(u64, ListDir)>,
}

struct ListState {
    dir: AHashMap<u64, ListDir>,
    free: Vec<u32>,
    dirty: bool,
}

pub struct ListStore {
    file: BufferedBlockFile,
    sidecar_path: PathBuf,
    record_size: usize,
    records_per_block: usize,
    state: RwLock<ListState>,
    stats: SharedStats,
}

impl ListStore {
    /// Create an empty store for `record_size`-byte records.
    pub fn create(
        dir: &Path,
        base: &str,
        record_size: usize,
        block_size: usize,
        blocks_per_file: u32,
        buffer_capacity: usize,
        stats: SharedStats,
    ) -> Result<Self> {
        let records_per_block = Self::records_per_block(block_size, record_size)?;
        let file = BlockFile::create(dir, base, block_size, blocks_per_file, stats.clone())?;
        let file = BufferedBlockFile::new(file, buffer_capacity, stats.clone())?;
        Ok(Self {
            file,
            sidecar_path: dir.join(format!("{base}.dir")),
            record_size,
            records_per_block,
            state: RwLock::new(ListState {
                dir: AHashMap::new(),
                free: Vec::new(),
                dirty: true,
            }),
            stats,
        })
    }

    /// Reopen a store from its sidecar.
    pub fn open(
        dir: &Path,
        base: &str,
        record_size: usize,
        block_size: usize,
        blocks_per_file: u32,
        buffer_capacity: usize,
        stats: SharedStats,
    ) -> Result<Self> {
        let records_per_block = Self::records_per_block(block_size, record_size)?;
        let sidecar_path = dir.join(format!("{base}.dir"));
        let bytes = std::fs::read(&sidecar_path)
            .map_err(|_| IndexError::NotFound(format!("sidecar {}", sidecar_path.display())))?;
        if bytes.len() < 4 {
            return Err(IndexError::Corrupt(format!(
                "sidecar {} is too short",
                sidecar_path.display()
            )));
        }
        let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if crc32fast::hash(payload) != stored_crc {
            return Err(IndexError::Corrupt(format!(
                "sidecar {} checksum mismatch",
                sidecar_path.display()
            )));
        }
        let disk: SidecarDisk = bincode::deserialize(payload)?;
        if disk.magic != SIDECAR_MAGIC || disk.version != SIDECAR_VERSION {
            return Err(IndexError::Corrupt(format!(
                "sidecar {} has foreign magic or version",
                sidecar_path.display()
            )));
        }
        if disk.record_size as usize != record_size {
            return Err(IndexError::Corrupt(format!(
                "sidecar {} records are {} bytes, store expects {}",
                sidecar_path.display(),
                disk.record_size,
                record_size
            )));
        }
        let file = BlockFile::open(
            dir,
            base,
            block_size,
            blocks_per_file,
            disk.total_blocks,
            stats.clone(),
        )?;
        let file = BufferedBlockFile::new(file, buffer_capacity, stats.clone())?;
        Ok(Self {
            file,
            sidecar_path,
            record_size,
            records_per_block,
            state: RwLock::new(ListState {
                dir: disk.entries.into_iter().collect(),
                free: disk.free,
                dirty: false,
            }),
            stats,
        })
    }

    fn records_per_block(block_size: usize, record_size: usize) -> Result<usize> {
        if record_size == 0 {
            return Err(IndexError::InvalidArgument("record size must be positive".into()));
        }
        let per_block = block_size.saturating_sub(TRAILER_LEN) / record_size;
        if per_block == 0 {
            return Err(IndexError::InvalidArgument(format!(
                "block size {block_size} cannot hold a {record_size}-byte record"
            )));
        }
        Ok(per_block)
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    fn trailer(&self, block: &[u8]) -> (u32, u32) {
        let at = block.len() - TRAILER_LEN;
        let used = u32::from_le_bytes(block[at..at + 4].try_into().unwrap());
        let next = u32::from_le_bytes(block[at + 4..].try_into().unwrap());
        (used, next)
    }

    fn set_trailer(&self, block: &mut [u8], used: u32, next: u32) {
        let at = block.len() - TRAILER_LEN;
        block[at..at + 4].copy_from_slice(&used.to_le_bytes());
        block[at + 4..].copy_from_slice(&next.to_le_bytes());
    }

    fn take_block(&self, state: &mut ListState) -> Result<u32> {
        match state.free.pop() {
            Some(id) => Ok(id),
            None => self.file.allocate(),
        }
    }

    /// Append `records` (a multiple of the record size) to the list under
    /// `key`, creating it on first use. Returns the number of records
    /// written.
    pub fn append(&self, key: u64, records: &[u8]) -> Result<usize> {
        if records.len() % self.record_size != 0 {
            return Err(IndexError::InvalidArgument(format!(
                "append of {} bytes is not a multiple of the {}-byte record size",
                records.len(),
                self.record_size
            )));
        }
        let count = records.len() / self.record_size;
        let mut state = self.state.write();
        let mut entry = *state.dir.get(&key).unwrap_or(&ListDir::empty());
        state.dirty = true;
        if count == 0 {
            state.dir.insert(key, entry);
            return Ok(0);
        }

        let mut remaining = records;
        // fill the free suffix of the remembered tail block first
        if entry.tail != NO_BLOCK && (entry.tail_used as usize) < self.records_per_block {
            let mut block = self.file.read_vec(entry.tail)?;
            let (used, next) = self.trailer(&block);
            if used != entry.tail_used || next != NO_BLOCK {
                return Err(IndexError::Corrupt(format!(
                    "tail block {} trailer disagrees with directory",
                    entry.tail
                )));
            }
            let space = self.records_per_block - entry.tail_used as usize;
            let take = space.min(remaining.len() / self.record_size);
            let bytes = take * self.record_size;
            let at = entry.tail_used as usize * self.record_size;
            block[at..at + bytes].copy_from_slice(&remaining[..bytes]);
            entry.tail_used += take as u32;
            self.set_trailer(&mut block, entry.tail_used, NO_BLOCK);
            self.file.write(entry.tail, &block)?;
            remaining = &remaining[bytes..];
        }

        while !remaining.is_empty() {
            let block_id = self.take_block(&mut state)?;
            let take = self.records_per_block.min(remaining.len() / self.record_size);
            let bytes = take * self.record_size;
            let mut block = vec![0u8; self.file.block_size()];
            block[..bytes].copy_from_slice(&remaining[..bytes]);
            self.set_trailer(&mut block, take as u32, NO_BLOCK);
            self.file.write(block_id, &block)?;
            remaining = &remaining[bytes..];

            if entry.tail == NO_BLOCK {
                entry.head = block_id;
            } else {
                let mut prev = self.file.read_vec(entry.tail)?;
                let (used, _) = self.trailer(&prev);
                self.set_trailer(&mut prev, used, block_id);
                self.file.write(entry.tail, &prev)?;
            }
            entry.tail = block_id;
            entry.tail_used = take as u32;
        }

        entry.total += count as u64;
        state.dir.insert(key, entry);
        self.stats.record(|c| c.list_records_written += count as u64);
        Ok(count)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.state.read().dir.contains_key(&key)
    }

    /// Records stored under `key`; 0 for unknown keys.
    pub fn record_count(&self, key: u64) -> u64 {
        self.state.read().dir.get(&key).map_or(0, |e| e.total)
    }

    /// Number of lists in the store.
    pub fn list_count(&self) -> usize {
        self.state.read().dir.len()
    }

    /// Lazy restartable cursor over the records of `key`.
    pub fn cursor(&self, key: u64) -> Result<ListCursor<'_>> {
        let entry = self
            .state
            .read()
            .dir
            .get(&key)
            .copied()
            .ok_or_else(|| IndexError::NotFound(format!("list {key}")))?;
        Ok(ListCursor {
            store: self,
            head: entry.head,
            total: entry.total,
            block: Vec::new(),
            next_block: entry.head,
            used: 0,
            index: 0,
            consumed: 0,
        })
    }

    /// Unlink the list under `key`; its blocks go to the free list.
    pub fn remove(&self, key: u64) -> Result<()> {
        let mut state = self.state.write();
        let entry = state
            .dir
            .remove(&key)
            .ok_or_else(|| IndexError::NotFound(format!("list {key}")))?;
        state.dirty = true;
        let mut block_id = entry.head;
        let mut freed = 0u64;
        while block_id != NO_BLOCK {
            let block = self.file.read_vec(block_id)?;
            let (used, next) = self.trailer(&block);
            if used as usize > self.records_per_block {
                return Err(IndexError::Corrupt(format!(
                    "block {block_id} claims {used} records, capacity is {}",
                    self.records_per_block
                )));
            }
            state.free.push(block_id);
            freed += 1;
            block_id = next;
        }
        let expected = (entry.total as usize).div_ceil(self.records_per_block) as u64;
        if freed != expected {
            return Err(IndexError::Corrupt(format!(
                "list chain held {freed} blocks, directory expected {expected}"
            )));
        }
        debug!("removed list {key}, freed {freed} blocks");
        Ok(())
    }

    /// Drop every list and put all allocated blocks on the free list.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        state.dir.clear();
        state.free = (0..self.file.len()).rev().collect();
        state.dirty = true;
        Ok(())
    }

    /// Flush buffered blocks and persist the directory sidecar.
    pub fn flush(&self) -> Result<()> {
        self.file.flush()?;
        let mut state = self.state.write();
        if !state.dirty {
            return Ok(());
        }
        let mut entries: Vec<(u64, ListDir)> =
            state.dir.iter().map(|(k, v)| (*k, *v)).collect();
        // sorted so repeated flushes are byte-identical
        entries.sort_unstable_by_key(|(k, _)| *k);
        state.free.sort_unstable();
        state.free.reverse();
        let disk = SidecarDisk {
            magic: SIDECAR_MAGIC,
            version: SIDECAR_VERSION,
            record_size: self.record_size as u32,
            total_blocks: self.file.len(),
            free: state.free.clone(),
            entries,
        };
        let mut bytes = bincode::serialize(&disk)?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        std::fs::write(&self.sidecar_path, &bytes)?;
        state.dirty = false;
        Ok(())
    }

    pub fn size_in_bytes(&self) -> u64 {
        let sidecar = std::fs::metadata(&self.sidecar_path)
            .map(|m| m.len())
            .unwrap_or(0);
        self.file.size_in_bytes() + sidecar
    }

    pub fn close(self) -> Result<()> {
        self.flush()?;
        self.file.close()
    }
}

/// Lazy, restartable cursor over one list's records.
pub struct ListCursor<'a> {
    store: &'a ListStore,
    head: u32,
    total: u64,
    block: Vec<u8>,
    next_block: u32,
    used: u32,
    index: u32,
    consumed: u64,
}

impl<'a> ListCursor<'a> {
    /// Next record, or `None` at the end of the list.
    pub fn next_record(&mut self) -> Result<Option<&[u8]>> {
        if self.consumed == self.total {
            return Ok(None);
        }
        if self.block.is_empty() || self.index == self.used {
            if self.index == self.used && !self.block.is_empty() {
                // a partially-filled block may only terminate the chain
                if (self.used as usize) < self.store.records_per_block {
                    return Err(IndexError::Corrupt(
                        "underfull block in the middle of a list chain".into(),
                    ));
                }
            }
            if self.next_block == NO_BLOCK {
                return Err(IndexError::Corrupt(format!(
                    "list chain ended after {} of {} records",
                    self.consumed, self.total
                )));
            }
            let block_id = self.next_block;
            self.block = self.store.file.read_vec(block_id)?;
            let (used, next) = self.store.trailer(&self.block);
            if used == 0 || used as usize > self.store.records_per_block {
                return Err(IndexError::Corrupt(format!(
                    "block {block_id} claims {used} records, capacity is {}",
                    self.store.records_per_block
                )));
            }
            self.used = used;
            self.next_block = next;
            self.index = 0;
        }
        let at = self.index as usize * self.store.record_size;
        let record = &self.block[at..at + self.store.record_size];
        self.index += 1;
        self.consumed += 1;
        self.store.stats.record(|c| c.list_records_read += 1);
        Ok(Some(record))
    }

    /// Rewind to the head of the list; the next `next_record` re-reads
    /// from the first block.
    pub fn rewind(&mut self) {
        self.block.clear();
        self.next_block = self.head;
        self.used = 0;
        self.index = 0;
        self.consumed = 0;
    }

    /// Records not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.total - self.consumed
    }

    /// Total records in the list.
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsCenter;
    use tempfile::TempDir;

    const BLOCK: usize = 72; // 8 records of 8 bytes + trailer

    fn create_test_store(temp: &TempDir) -> ListStore {
        ListStore::create(temp.path(), "lists.test", 8, BLOCK, 16, 8, StatsCenter::new()).unwrap()
    }

    fn record(value: u64) -> [u8; 8] {
        value.to_le_bytes()
    }

    fn collect(store: &ListStore, key: u64) -> Vec<u64> {
        let mut cursor = store.cursor(key).unwrap();
        let mut out = Vec::new();
        while let Some(rec) = cursor.next_record().unwrap() {
            out.push(u64::from_le_bytes(rec.try_into().unwrap()));
        }
        out
    }

    #[test]
    fn append_and_iterate() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        let mut bytes = Vec::new();
        for v in 0..20u64 {
            bytes.extend_from_slice(&record(v));
        }
        assert_eq!(store.append(7, &bytes).unwrap(), 20);
        assert_eq!(store.record_count(7), 20);
        assert_eq!(collect(&store, 7), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn cursor_is_restartable() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        let mut bytes = Vec::new();
        for v in 0..30u64 {
            bytes.extend_from_slice(&record(v));
        }
        store.append(1, &bytes).unwrap();
        let mut cursor = store.cursor(1).unwrap();
        let mut first = Vec::new();
        while let Some(rec) = cursor.next_record().unwrap() {
            first.push(rec.to_vec());
        }
        cursor.rewind();
        let mut second = Vec::new();
        while let Some(rec) = cursor.next_record().unwrap() {
            second.push(rec.to_vec());
        }
        assert_eq!(first, second);
    }

    #[test]
    fn tail_block_is_reused_across_appends() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        store.append(3, &record(1)).unwrap();
        store.append(3, &record(2)).unwrap();
        store.append(3, &record(3)).unwrap();
        // 3 records fit one 8-record block
        assert_eq!(store.file.len(), 1);
        assert_eq!(collect(&store, 3), vec![1, 2, 3]);
    }

    #[test]
    fn removed_blocks_are_recycled() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        let mut bytes = Vec::new();
        for v in 0..16u64 {
            bytes.extend_from_slice(&record(v));
        }
        store.append(1, &bytes).unwrap();
        let blocks_before = store.file.len();
        store.remove(1).unwrap();
        assert!(matches!(store.cursor(1), Err(IndexError::NotFound(_))));
        store.append(2, &bytes).unwrap();
        assert_eq!(store.file.len(), blocks_before);
        assert_eq!(collect(&store, 2), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn misaligned_append_rejected() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        assert!(matches!(
            store.append(1, &[0u8; 5]),
            Err(IndexError::InvalidArgument(_))
        ));
    }

    #[test]
    fn survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = create_test_store(&temp);
            let mut bytes = Vec::new();
            for v in 0..12u64 {
                bytes.extend_from_slice(&record(v));
            }
            store.append(5, &bytes).unwrap();
            store.close().unwrap();
        }
        let store =
            ListStore::open(temp.path(), "lists.test", 8, BLOCK, 16, 8, StatsCenter::new())
                .unwrap();
        assert_eq!(collect(&store, 5), (0..12).collect::<Vec<_>>());
        // the remembered free suffix of the tail keeps being reused
        store.append(5, &record(99)).unwrap();
        assert_eq!(store.record_count(5), 13);
    }

    #[test]
    fn sidecar_corruption_detected() {
        let temp = TempDir::new().unwrap();
        {
            let store = create_test_store(&temp);
            store.append(1, &record(1)).unwrap();
            store.close().unwrap();
        }
        let path = temp.path().join("lists.test.dir");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            ListStore::open(temp.path(), "lists.test", 8, BLOCK, 16, 8, StatsCenter::new()),
            Err(IndexError::Corrupt(_))
        ));
    }

    #[test]
    fn record_size_mismatch_on_open() {
        let temp = TempDir::new().unwrap();
        {
            let store = create_test_store(&temp);
            store.append(1, &record(1)).unwrap();
            store.close().unwrap();
        }
        assert!(matches!(
            ListStore::open(temp.path(), "lists.test", 16, BLOCK, 16, 8, StatsCenter::new()),
            Err(IndexError::Corrupt(_))
        ));
    }

    #[test]
    fn flush_twice_same_bytes() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        store.append(2, &record(42)).unwrap();
        store.flush().unwrap();
        let first = std::fs::read(temp.path().join("lists.test.dir")).unwrap();
        store.flush().unwrap();
        let second = std::fs::read(temp.path().join("lists.test.dir")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn clear_recycles_everything() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        let mut bytes = Vec::new();
        for v in 0..32u64 {
            bytes.extend_from_slice(&record(v));
        }
        store.append(1, &bytes).unwrap();
        store.append(2, &bytes).unwrap();
        let blocks = store.file.len();
        store.clear().unwrap();
        assert_eq!(store.list_count(), 0);
        store.append(3, &bytes).unwrap();
        assert_eq!(store.file.len(), blocks);
    }
}
