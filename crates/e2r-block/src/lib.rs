#![forbid(unsafe_code)]
//! Block I/O layer for ext2 images.
//!
//! Provides the `ByteDevice` trait (positioned reads over a backing image),
//! two implementations of it, and the `BlockReader` that turns a block
//! number plus an in-block byte range into bytes, optionally through a
//! small read-through LRU cache.

use e2r_error::{E2rError, Result};
use e2r_types::{BlockNumber, BlockSize, ByteOffset, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Owned block buffer.
///
/// Invariant: length == block size of the reader that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

/// Byte-addressed, read-only device (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// A range ending past `len_bytes()` fails with `TruncatedImage`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;
}

fn check_range(offset: ByteOffset, len: usize, image_len: u64) -> Result<()> {
    let needed = u64::try_from(len)
        .map_err(|_| E2rError::CorruptImage("read length overflows u64".to_owned()))?;
    let end = offset
        .checked_add(needed)
        .ok_or_else(|| E2rError::CorruptImage("read range overflows u64".to_owned()))?;
    if end.0 > image_len {
        return Err(E2rError::TruncatedImage {
            offset: offset.0,
            needed,
            image_len,
        });
    }
    Ok(())
}

/// File-backed byte device using positioned reads.
///
/// `FileExt::read_exact_at` does not touch a shared seek position, so the
/// device can be shared across threads without a lock.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| E2rError::ImageNotFound {
            path: path.display().to_string(),
            source,
        })?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, "opened image");
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let needed = buf.len() as u64;
        self.file.read_exact_at(buf, offset.0).map_err(|err| {
            // The file shrank after it was opened.
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                E2rError::TruncatedImage {
                    offset: offset.0,
                    needed,
                    image_len: self.len,
                }
            } else {
                E2rError::Io(err)
            }
        })
    }
}

/// Byte device over any seekable reader (in-memory images, pipes to files).
///
/// A read is a seek followed by `read_exact`; both happen under one lock so
/// concurrent readers can never interleave a seek with another read.
#[derive(Debug)]
pub struct ReaderByteDevice<R> {
    inner: Mutex<R>,
    len: u64,
}

impl<R: Read + Seek + Send> ReaderByteDevice<R> {
    /// Wrap `reader`; its length is taken by seeking to the end.
    pub fn new(mut reader: R) -> Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner: Mutex::new(reader),
            len,
        })
    }
}

impl<R: Read + Seek + Send> ByteDevice for ReaderByteDevice<R> {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let mut guard = self.inner.lock();
        guard.seek(SeekFrom::Start(offset.0))?;
        guard.read_exact(buf)?;
        drop(guard);
        Ok(())
    }
}

/// Read the ext2 superblock region (1024 bytes at offset 1024).
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; EXT2_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT2_SUPERBLOCK_SIZE];
    let offset = u64::try_from(EXT2_SUPERBLOCK_OFFSET)
        .map_err(|_| E2rError::CorruptImage("superblock offset does not fit u64".to_owned()))?;
    dev.read_exact_at(ByteOffset(offset), &mut buf)?;
    Ok(buf)
}

// ── LRU block cache ─────────────────────────────────────────────────────────

/// Hit/miss counters for the block cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct LruState {
    capacity: usize,
    /// Front is least recently used.
    order: VecDeque<BlockNumber>,
    resident: HashMap<BlockNumber, Vec<u8>>,
    stats: CacheStats,
}

impl LruState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            resident: HashMap::with_capacity(capacity),
            stats: CacheStats::default(),
        }
    }

    fn touch(&mut self, key: BlockNumber) {
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            let _ = self.order.remove(pos);
        }
        self.order.push_back(key);
    }

    fn get(&mut self, key: BlockNumber) -> Option<Vec<u8>> {
        let bytes = self.resident.get(&key).cloned()?;
        self.touch(key);
        self.stats.hits += 1;
        Some(bytes)
    }

    fn insert(&mut self, key: BlockNumber, bytes: Vec<u8>) {
        self.stats.misses += 1;
        if self.resident.insert(key, bytes).is_none() {
            while self.resident.len() > self.capacity {
                let Some(victim) = self.order.pop_front() else {
                    break;
                };
                let _ = self.resident.remove(&victim);
                self.stats.evictions += 1;
                trace!(block = victim.0, "evicted cached block");
            }
        }
        self.touch(key);
    }
}

// ── BlockReader ─────────────────────────────────────────────────────────────

/// Reads byte ranges out of fixed-size blocks of a backing device.
///
/// This is the read capability every traversal operation is handed; nothing
/// above this layer touches the device directly.
pub struct BlockReader {
    dev: Box<dyn ByteDevice>,
    block_size: BlockSize,
    cache: Option<Mutex<LruState>>,
}

impl std::fmt::Debug for BlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReader")
            .field("len_bytes", &self.dev.len_bytes())
            .field("block_size", &self.block_size)
            .field("cached", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl BlockReader {
    /// Create a reader. `cache_blocks == 0` disables caching.
    #[must_use]
    pub fn new(dev: Box<dyn ByteDevice>, block_size: BlockSize, cache_blocks: usize) -> Self {
        let cache = (cache_blocks > 0).then(|| Mutex::new(LruState::new(cache_blocks)));
        Self {
            dev,
            block_size,
            cache,
        }
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn device(&self) -> &dyn ByteDevice {
        self.dev.as_ref()
    }

    /// Number of whole blocks the backing image holds.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.dev.len_bytes() / u64::from(self.block_size.get())
    }

    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.lock().stats)
    }

    /// Read `len` bytes starting `offset` bytes into `block`.
    ///
    /// Fails with `OutOfRange` unless `offset < block_size` and
    /// `offset + len <= block_size`; a range past the end of the image fails
    /// with `TruncatedImage`. Only whole blocks go through the cache, so a
    /// range inside a partial final block reads the same with or without it.
    pub fn read_block(&self, block: BlockNumber, offset: usize, len: usize) -> Result<Vec<u8>> {
        let bs = self.block_size.as_usize();
        let in_range = offset < bs && offset.checked_add(len).is_some_and(|end| end <= bs);
        if !in_range {
            return Err(E2rError::OutOfRange {
                offset,
                len,
                block_size: self.block_size.get(),
            });
        }

        if self.cache.is_some() && block.0 < self.block_count() {
            let full = self.read_full_block(block)?;
            return Ok(full.as_slice()[offset..offset + len].to_vec());
        }

        let start = self.block_offset(block)?;
        let start = start
            .checked_add(offset as u64)
            .ok_or_else(|| E2rError::CorruptImage(format!("block {block} offset overflow")))?;
        let mut buf = vec![0_u8; len];
        self.dev.read_exact_at(start, &mut buf)?;
        trace!(block = block.0, offset, len, "read block range");
        Ok(buf)
    }

    /// Read a whole block.
    pub fn read_full_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.lock().get(block) {
                return Ok(BlockBuf::new(bytes));
            }
        }

        let start = self.block_offset(block)?;
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        self.dev.read_exact_at(start, &mut buf)?;
        trace!(block = block.0, "read full block");

        if let Some(cache) = &self.cache {
            cache.lock().insert(block, buf.clone());
        }
        Ok(BlockBuf::new(buf))
    }

    fn block_offset(&self, block: BlockNumber) -> Result<ByteOffset> {
        block
            .to_byte_offset(self.block_size)
            .ok_or_else(|| E2rError::CorruptImage(format!("block {block} offset overflow")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn patterned_image(blocks: usize, block_size: usize) -> Vec<u8> {
        let mut bytes = vec![0_u8; blocks * block_size];
        for (i, chunk) in bytes.chunks_mut(block_size).enumerate() {
            chunk.fill(u8::try_from(i).expect("block index fits u8"));
            chunk[0] = 0xAA;
        }
        bytes
    }

    fn reader(blocks: usize, cache_blocks: usize) -> BlockReader {
        let dev = ReaderByteDevice::new(Cursor::new(patterned_image(blocks, 1024))).expect("dev");
        BlockReader::new(
            Box::new(dev),
            BlockSize::new(1024).expect("bs"),
            cache_blocks,
        )
    }

    #[test]
    fn read_block_returns_requested_range() {
        let r = reader(4, 0);
        assert_eq!(r.block_count(), 4);
        assert_eq!(r.read_block(BlockNumber(2), 0, 3).expect("read"), vec![0xAA, 2, 2]);
        assert_eq!(r.read_block(BlockNumber(3), 1020, 4).expect("read"), vec![3; 4]);
        assert_eq!(r.read_full_block(BlockNumber(1)).expect("full").as_slice().len(), 1024);
    }

    #[test]
    fn read_block_rejects_out_of_range() {
        let r = reader(4, 0);
        assert!(matches!(
            r.read_block(BlockNumber(0), 1024, 0),
            Err(E2rError::OutOfRange { offset: 1024, .. })
        ));
        assert!(matches!(
            r.read_block(BlockNumber(0), 1000, 25),
            Err(E2rError::OutOfRange { len: 25, .. })
        ));
        assert!(matches!(
            r.read_block(BlockNumber(0), 1, usize::MAX),
            Err(E2rError::OutOfRange { .. })
        ));
    }

    #[test]
    fn read_past_image_end_is_truncated() {
        let r = reader(4, 0);
        assert!(matches!(
            r.read_block(BlockNumber(4), 0, 16),
            Err(E2rError::TruncatedImage {
                offset: 4096,
                needed: 16,
                image_len: 4096,
            })
        ));
        let cached = reader(4, 8);
        assert!(matches!(
            cached.read_full_block(BlockNumber(9)),
            Err(E2rError::TruncatedImage { .. })
        ));
    }

    #[test]
    fn partial_tail_block_reads_same_with_and_without_cache() {
        let mut bytes = patterned_image(2, 1024);
        bytes.truncate(1500);
        let open = |cache_blocks| {
            let dev = ReaderByteDevice::new(Cursor::new(bytes.clone())).expect("dev");
            BlockReader::new(Box::new(dev), BlockSize::new(1024).expect("bs"), cache_blocks)
        };
        let (plain, cached) = (open(0), open(8));

        let expected = {
            let mut head = vec![1_u8; 100];
            head[0] = 0xAA;
            head
        };
        assert_eq!(plain.read_block(BlockNumber(1), 0, 100).expect("uncached"), expected);
        assert_eq!(cached.read_block(BlockNumber(1), 0, 100).expect("cached"), expected);

        // Ranges past the tail fail identically.
        for r in [&plain, &cached] {
            assert!(matches!(
                r.read_block(BlockNumber(1), 400, 200),
                Err(E2rError::TruncatedImage {
                    offset: 1424,
                    needed: 200,
                    image_len: 1500,
                })
            ));
        }
        assert_eq!(cached.cache_stats().expect("cache").misses, 0);
    }

    #[test]
    fn cache_hits_after_first_read() {
        let r = reader(4, 2);
        let first = r.read_block(BlockNumber(1), 0, 8).expect("first");
        let second = r.read_block(BlockNumber(1), 0, 8).expect("second");
        assert_eq!(first, second);
        let stats = r.cache_stats().expect("cache enabled");
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let r = reader(4, 2);
        r.read_full_block(BlockNumber(0)).expect("b0");
        r.read_full_block(BlockNumber(1)).expect("b1");
        r.read_full_block(BlockNumber(0)).expect("b0 hit");
        r.read_full_block(BlockNumber(2)).expect("b2 evicts b1");
        r.read_full_block(BlockNumber(0)).expect("b0 still resident");
        let stats = r.cache_stats().expect("cache enabled");
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.evictions, 1);

        r.read_full_block(BlockNumber(1)).expect("b1 reloaded");
        assert_eq!(r.cache_stats().expect("cache").misses, 4);
    }

    #[test]
    fn disabled_cache_has_no_stats() {
        assert!(reader(2, 0).cache_stats().is_none());
    }

    #[test]
    fn superblock_region_read_from_offset_1024() {
        let dev = ReaderByteDevice::new(Cursor::new(patterned_image(3, 1024))).expect("dev");
        let region = read_superblock_region(&dev).expect("region");
        assert_eq!(region[0], 0xAA);
        assert_eq!(region[1], 1);

        let short = ReaderByteDevice::new(Cursor::new(vec![0_u8; 1500])).expect("dev");
        assert!(matches!(
            read_superblock_region(&short),
            Err(E2rError::TruncatedImage { .. })
        ));
    }

    #[test]
    fn file_device_reads_positioned() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tmp");
        tmp.write_all(&patterned_image(2, 1024)).expect("write");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open(tmp.path()).expect("open");
        assert_eq!(dev.len_bytes(), 2048);
        let mut buf = [0_u8; 4];
        dev.read_exact_at(ByteOffset(1024), &mut buf).expect("read");
        assert_eq!(buf, [0xAA, 1, 1, 1]);
        assert!(matches!(
            dev.read_exact_at(ByteOffset(2046), &mut buf),
            Err(E2rError::TruncatedImage { .. })
        ));
    }

    #[test]
    fn missing_file_is_image_not_found() {
        let dir = tempfile::tempdir().expect("dir");
        let path = dir.path().join("absent.img");
        let err = FileByteDevice::open(&path).expect_err("missing");
        assert!(matches!(err, E2rError::ImageNotFound { .. }));
        assert!(err.to_string().contains("absent.img"));
    }

    #[test]
    fn reader_device_is_shareable_across_threads() {
        let dev = Arc::new(
            ReaderByteDevice::new(Cursor::new(patterned_image(8, 1024))).expect("dev"),
        );
        let handles: Vec<_> = (0..8_u8)
            .map(|block| {
                let dev = Arc::clone(&dev);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let mut buf = [0_u8; 16];
                        dev.read_exact_at(ByteOffset(u64::from(block) * 1024 + 8), &mut buf)
                            .expect("read");
                        assert_eq!(buf, [block; 16]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
    }
}
