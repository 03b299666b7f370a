//! Buffered block file (C2)
//!
//! Read-through, write-back LRU cache of block frames over a `BlockFile`.
//! Evicting a dirty frame writes it through; a failed write-back surfaces
//! to the operation that triggered the eviction. `flush()` writes every
//! dirty frame and syncs the backing files without disturbing residency.

use crate::stats::SharedStats;
use crate::storage::BlockFile;
use crate::{IndexError, Result};
use log::trace;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

struct Frame {
    data: Box<[u8]>,
    dirty: bool,
}

struct Inner {
    file: BlockFile,
    cache: LruCache<u32, Frame>,
}

impl Inner {
    /// Insert a frame, writing back whatever dirty frame it displaces.
    fn install(&mut self, block_id: u32, frame: Frame, stats: &SharedStats) -> Result<()> {
        if let Some((evicted_id, evicted)) = self.cache.push(block_id, frame) {
            if evicted_id != block_id && evicted.dirty {
                trace!("write-back of evicted block {evicted_id}");
                self.file.write(evicted_id, &evicted.data)?;
                stats.record(|c| c.buffer_evictions += 1);
            }
        }
        Ok(())
    }
}

pub struct BufferedBlockFile {
    inner: Mutex<Inner>,
    block_size: usize,
    stats: SharedStats,
}

impl BufferedBlockFile {
    pub fn new(file: BlockFile, capacity: usize, stats: SharedStats) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| IndexError::InvalidArgument("buffer capacity must be positive".into()))?;
        let block_size = file.block_size();
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                cache: LruCache::new(capacity),
            }),
            block_size,
            stats,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn allocate(&self) -> Result<u32> {
        self.inner.lock().file.allocate()
    }

    /// Read a block into `buf`, through the cache.
    pub fn read(&self, block_id: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.block_size {
            return Err(IndexError::InvalidArgument(format!(
                "read buffer is {} bytes, block size is {}",
                buf.len(),
                self.block_size
            )));
        }
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.cache.get(&block_id) {
            buf.copy_from_slice(&frame.data);
            self.stats.record(|c| c.buffer_hits += 1);
            return Ok(());
        }
        inner.file.read(block_id, buf)?;
        let frame = Frame {
            data: buf.to_vec().into_boxed_slice(),
            dirty: false,
        };
        inner.install(block_id, frame, &self.stats)?;
        self.stats.record(|c| c.buffer_misses += 1);
        Ok(())
    }

    /// Read a block into a fresh buffer.
    pub fn read_vec(&self, block_id: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        self.read(block_id, &mut buf)?;
        Ok(buf)
    }

    /// Write a block. The buffer is cloned into the cache dirty; the
    /// backing file is touched only on eviction or flush.
    pub fn write(&self, block_id: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != self.block_size {
            return Err(IndexError::InvalidArgument(format!(
                "write buffer is {} bytes, block size is {}",
                buf.len(),
                self.block_size
            )));
        }
        let mut inner = self.inner.lock();
        if block_id >= inner.file.len() {
            return Err(IndexError::NotFound(format!("block {block_id}")));
        }
        let frame = Frame {
            data: buf.to_vec().into_boxed_slice(),
            dirty: true,
        };
        inner.install(block_id, frame, &self.stats)
    }

    /// Write every dirty frame through and sync the backing files.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let dirty: Vec<u32> = inner
            .cache
            .iter()
            .filter(|(_, frame)| frame.dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in dirty {
            // peek, not get: flushing must not disturb recency
            let data = inner.cache.peek(&id).map(|f| f.data.clone());
            if let Some(data) = data {
                inner.file.write(id, &data)?;
            }
            if let Some(frame) = inner.cache.peek_mut(&id) {
                frame.dirty = false;
            }
        }
        inner.file.sync()
    }

    /// Allocated block count.
    pub fn len(&self) -> u32 {
        self.inner.lock().file.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.inner.lock().file.size_in_bytes()
    }

    pub fn close(self) -> Result<()> {
        self.flush()
    }
}
