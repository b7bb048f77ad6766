#![forbid(unsafe_code)]
//! Logical-to-physical block mapping through ext2 block pointers.
//!
//! An inode's `i_block` holds 12 direct pointers, then one single-indirect
//! and one double-indirect pointer. With `K = block_size / 4` pointers per
//! indirect block, logical index `i` maps as:
//!
//! | Range | Tier |
//! |-------|------|
//! | `[0, 12)` | direct, `i_block[i]` |
//! | `[12, 12 + K)` | single-indirect, slot `i - 12` |
//! | `[12 + K, 12 + K + K²)` | double-indirect, outer `(i - 12 - K) / K`, inner `(i - 12 - K) % K` |
//! | beyond | triple-indirect, not walked |
//!
//! A zero pointer at any level is a hole and reads as zeros.

use e2r_block::{BlockBuf, BlockReader};
use e2r_error::{E2rError, Result};
use e2r_ondisk::{Ext2Inode, indirect_pointer};
use e2r_types::{BlockNumber, BlockSize, EXT2_NDIR_BLOCKS, InodeNumber};
use tracing::trace;

/// Which part of the pointer tree a logical block index falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerTier {
    Direct { slot: usize },
    Single { index: u32 },
    Double { outer: u32, inner: u32 },
    Triple,
}

const NDIR: u64 = EXT2_NDIR_BLOCKS as u64;

/// First logical index that needs the triple-indirect pointer.
#[must_use]
pub fn mapped_block_limit(block_size: BlockSize) -> u64 {
    let k = u64::from(block_size.pointers_per_block());
    NDIR + k + k * k
}

/// Classify a logical block index into its pointer tier.
#[must_use]
pub fn classify(logical: u64, block_size: BlockSize) -> PointerTier {
    let k = u64::from(block_size.pointers_per_block());
    if logical < NDIR {
        #[allow(clippy::cast_possible_truncation)]
        return PointerTier::Direct {
            slot: logical as usize,
        };
    }
    let rel = logical - NDIR;
    if rel < k {
        #[allow(clippy::cast_possible_truncation)]
        return PointerTier::Single { index: rel as u32 };
    }
    let rel = rel - k;
    if rel < k * k {
        #[allow(clippy::cast_possible_truncation)]
        return PointerTier::Double {
            outer: (rel / k) as u32,
            inner: (rel % k) as u32,
        };
    }
    PointerTier::Triple
}

/// Number of logical blocks covering the inode's recorded size.
#[must_use]
pub fn logical_block_count(inode: &Ext2Inode, block_size: BlockSize) -> u64 {
    block_size.blocks_for(inode.size)
}

/// Fail with `TriIndirectUnsupported` if the inode's size reaches past the
/// double-indirect range.
pub fn ensure_mappable(inode: &Ext2Inode, ino: InodeNumber, block_size: BlockSize) -> Result<()> {
    let limit = mapped_block_limit(block_size);
    if logical_block_count(inode, block_size) > limit {
        return Err(E2rError::TriIndirectUnsupported {
            ino: ino.0,
            logical_block: limit,
        });
    }
    Ok(())
}

fn nonzero(ptr: u32) -> Option<BlockNumber> {
    (ptr != 0).then(|| BlockNumber(u64::from(ptr)))
}

fn pointer_at(block: &BlockBuf, index: u32, ino: InodeNumber, at: BlockNumber) -> Result<u32> {
    indirect_pointer(block.as_slice(), index).map_err(|err| {
        E2rError::CorruptImage(format!("inode {ino}: indirect block {at}: {err}"))
    })
}

/// Remembers the most recently loaded indirect blocks so sequential walks
/// read each pointer block once.
#[derive(Debug, Default)]
struct PointerCache {
    single: Option<(BlockNumber, BlockBuf)>,
    double: Option<(BlockNumber, BlockBuf)>,
}

impl PointerCache {
    fn load<'c>(
        slot: &'c mut Option<(BlockNumber, BlockBuf)>,
        reader: &BlockReader,
        block: BlockNumber,
        tier: &'static str,
    ) -> Result<&'c BlockBuf> {
        let stale = slot.as_ref().is_none_or(|(cached, _)| *cached != block);
        if stale {
            trace!(tier, block = block.0, "load indirect block");
            *slot = Some((block, reader.read_full_block(block)?));
        }
        slot.as_ref()
            .map(|(_, buf)| buf)
            .ok_or_else(|| E2rError::CorruptImage("indirect block cache empty".to_owned()))
    }

    fn resolve(
        &mut self,
        reader: &BlockReader,
        inode: &Ext2Inode,
        ino: InodeNumber,
        logical: u64,
    ) -> Result<Option<BlockNumber>> {
        match classify(logical, reader.block_size()) {
            PointerTier::Direct { slot } => Ok(nonzero(inode.direct_blocks()[slot])),
            PointerTier::Single { index } => {
                let Some(ind) = nonzero(inode.single_indirect()) else {
                    return Ok(None);
                };
                let buf = Self::load(&mut self.single, reader, ind, "single")?;
                Ok(nonzero(pointer_at(buf, index, ino, ind)?))
            }
            PointerTier::Double { outer, inner } => {
                let Some(dind) = nonzero(inode.double_indirect()) else {
                    return Ok(None);
                };
                let buf = Self::load(&mut self.double, reader, dind, "double")?;
                let Some(ind) = nonzero(pointer_at(buf, outer, ino, dind)?) else {
                    return Ok(None);
                };
                let buf = Self::load(&mut self.single, reader, ind, "single")?;
                Ok(nonzero(pointer_at(buf, inner, ino, ind)?))
            }
            PointerTier::Triple => Err(E2rError::TriIndirectUnsupported {
                ino: ino.0,
                logical_block: logical,
            }),
        }
    }
}

/// Map logical block `logical` of `inode` to a physical block.
///
/// Returns `Ok(None)` for a hole.
pub fn physical_block(
    reader: &BlockReader,
    inode: &Ext2Inode,
    ino: InodeNumber,
    logical: u64,
) -> Result<Option<BlockNumber>> {
    PointerCache::default().resolve(reader, inode, ino, logical)
}

/// Lazy, block-at-a-time stream of a file's bytes.
///
/// Yields one chunk per logical block; holes come back zero-filled and the
/// final chunk is cut so the stream totals exactly `i_size` bytes.
#[derive(Debug)]
pub struct FileContent<'a> {
    reader: &'a BlockReader,
    inode: &'a Ext2Inode,
    ino: InodeNumber,
    next_logical: u64,
    remaining: u64,
    pointers: PointerCache,
    done: bool,
}

impl FileContent<'_> {
    /// Bytes not yet yielded.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn next_chunk(&mut self) -> Result<Vec<u8>> {
        let bs = self.reader.block_size();
        let len = self.remaining.min(u64::from(bs.get()));
        #[allow(clippy::cast_possible_truncation)]
        let len = len as usize;
        let logical = self.next_logical;
        let chunk = match self
            .pointers
            .resolve(self.reader, self.inode, self.ino, logical)?
        {
            Some(phys) => self.reader.read_block(phys, 0, len)?,
            None => {
                trace!(ino = self.ino.0, logical, "hole");
                vec![0_u8; len]
            }
        };
        self.next_logical += 1;
        self.remaining -= len as u64;
        Ok(chunk)
    }
}

impl Iterator for FileContent<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == 0 {
            return None;
        }
        let chunk = self.next_chunk();
        if chunk.is_err() {
            self.done = true;
        }
        Some(chunk)
    }
}

/// Stream the content of `inode`.
///
/// Fails up front with `TriIndirectUnsupported` when the recorded size
/// needs triple-indirect blocks. Each call starts a fresh stream.
pub fn content<'a>(
    reader: &'a BlockReader,
    inode: &'a Ext2Inode,
    ino: InodeNumber,
) -> Result<FileContent<'a>> {
    ensure_mappable(inode, ino, reader.block_size())?;
    Ok(FileContent {
        reader,
        inode,
        ino,
        next_logical: 0,
        remaining: inode.size,
        pointers: PointerCache::default(),
        done: false,
    })
}

/// Read up to `buf.len()` bytes starting at byte `offset`, clipped to `i_size`.
///
/// Returns the number of bytes read (0 at or past end of file).
pub fn read_file_data(
    reader: &BlockReader,
    inode: &Ext2Inode,
    ino: InodeNumber,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    if offset >= inode.size {
        return Ok(0);
    }
    let available = inode.size - offset;
    let to_read = usize::try_from(available).map_or(buf.len(), |avail| avail.min(buf.len()));

    let bs = reader.block_size();
    let bs64 = u64::from(bs.get());
    let mut pointers = PointerCache::default();
    let mut done = 0_usize;
    while done < to_read {
        let pos = offset + done as u64;
        let logical = pos / bs64;
        #[allow(clippy::cast_possible_truncation)]
        let in_block = (pos % bs64) as usize;
        let chunk = (bs.as_usize() - in_block).min(to_read - done);
        let dst = &mut buf[done..done + chunk];
        match pointers.resolve(reader, inode, ino, logical)? {
            Some(phys) => dst.copy_from_slice(&reader.read_block(phys, in_block, chunk)?),
            None => dst.fill(0),
        }
        done += chunk;
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2r_block::ReaderByteDevice;
    use e2r_harness::{Ext2Image, ImageBuilder, ImageConfig, pattern};
    use e2r_inode::{load_group_descriptors, load_superblock, resolve_inode};
    use e2r_ondisk::{Ext2GroupDesc, Ext2Superblock};
    use std::io::Cursor;

    struct Fixture {
        reader: BlockReader,
        sb: Ext2Superblock,
        groups: Vec<Ext2GroupDesc>,
    }

    impl Fixture {
        fn new(image: Ext2Image, cache_blocks: usize) -> Self {
            let dev = ReaderByteDevice::new(Cursor::new(image.into_bytes())).expect("dev");
            let sb = load_superblock(&dev, true).expect("sb");
            let reader = BlockReader::new(
                Box::new(dev),
                BlockSize::new(sb.block_size).expect("bs"),
                cache_blocks,
            );
            let groups = load_group_descriptors(&reader, &sb).expect("gdt");
            Self { reader, sb, groups }
        }

        fn inode(&self, ino: InodeNumber) -> Ext2Inode {
            resolve_inode(&self.reader, &self.groups, &self.sb, ino).expect("inode")
        }

        fn collect(&self, ino: InodeNumber) -> Vec<u8> {
            let inode = self.inode(ino);
            content(&self.reader, &inode, ino)
                .expect("content")
                .collect::<Result<Vec<_>>>()
                .expect("chunks")
                .concat()
        }
    }

    fn file_image(block_size: u32, data: &[u8]) -> (Ext2Image, InodeNumber) {
        let mut b = ImageBuilder::with_config(ImageConfig {
            block_size,
            blocks_count: u32::try_from(data.len() / block_size as usize + 128)
                .expect("blocks")
                .max(256),
            ..ImageConfig::default()
        })
        .expect("builder");
        let root = b.root();
        let ino = b.write_file(root, "data", data).expect("file");
        (b.finish().expect("finish"), ino)
    }

    #[test]
    fn classify_boundaries_1k() {
        let bs = BlockSize::new(1024).expect("bs");
        assert_eq!(classify(0, bs), PointerTier::Direct { slot: 0 });
        assert_eq!(classify(11, bs), PointerTier::Direct { slot: 11 });
        assert_eq!(classify(12, bs), PointerTier::Single { index: 0 });
        assert_eq!(classify(267, bs), PointerTier::Single { index: 255 });
        assert_eq!(classify(268, bs), PointerTier::Double { outer: 0, inner: 0 });
        assert_eq!(classify(268 + 257, bs), PointerTier::Double { outer: 1, inner: 1 });
        assert_eq!(
            classify(65_803, bs),
            PointerTier::Double {
                outer: 255,
                inner: 255
            }
        );
        assert_eq!(classify(65_804, bs), PointerTier::Triple);
        assert_eq!(mapped_block_limit(bs), 65_804);
    }

    #[test]
    fn classify_scales_with_block_size() {
        let bs = BlockSize::new(4096).expect("bs");
        assert_eq!(classify(12 + 1023, bs), PointerTier::Single { index: 1023 });
        assert_eq!(classify(12 + 1024, bs), PointerTier::Double { outer: 0, inner: 0 });
        assert_eq!(mapped_block_limit(bs), 12 + 1024 + 1024 * 1024);
    }

    #[test]
    fn twelve_block_boundary_switches_to_single_indirect() {
        let data = pattern(13 * 1024);
        let (image, ino) = file_image(1024, &data);
        let expected = image.data_blocks(ino).expect("blocks").to_vec();
        let fx = Fixture::new(image, 0);
        let inode = fx.inode(ino);

        assert_ne!(inode.single_indirect(), 0);
        let b11 = physical_block(&fx.reader, &inode, ino, 11).expect("b11");
        assert_eq!(b11, Some(BlockNumber(u64::from(inode.direct_blocks()[11]))));
        let b12 = physical_block(&fx.reader, &inode, ino, 12).expect("b12");
        assert_eq!(b12, Some(BlockNumber(u64::from(expected[12]))));
        assert!(!inode.direct_blocks().contains(&expected[12]));
    }

    #[test]
    fn exactly_twelve_blocks_uses_no_indirection() {
        let data = pattern(12 * 1024);
        let (image, ino) = file_image(1024, &data);
        let fx = Fixture::new(image, 0);
        let inode = fx.inode(ino);
        assert_eq!(inode.single_indirect(), 0);
        assert_eq!(fx.collect(ino), data);
    }

    #[test]
    fn content_round_trips_across_tiers() {
        for bs in [1024_u32, 2048, 4096] {
            let k = bs as usize / 4;
            // Direct, every single-indirect slot, and a few double-indirect blocks.
            let len = (12 + k + 3) * bs as usize + 77;
            let data = pattern(len);
            let (image, ino) = file_image(bs, &data);
            let fx = Fixture::new(image, 16);
            let got = fx.collect(ino);
            assert_eq!(got.len(), len, "block size {bs}");
            assert!(got == data, "content mismatch at block size {bs}");
            assert_ne!(fx.inode(ino).double_indirect(), 0);
        }
    }

    #[test]
    fn content_emits_exactly_i_size() {
        for len in [0_usize, 1, 5, 1023, 1024, 1025, 5000] {
            let data = pattern(len);
            let (image, ino) = file_image(1024, &data);
            let fx = Fixture::new(image, 0);
            let inode = fx.inode(ino);
            let stream = content(&fx.reader, &inode, ino).expect("content");
            assert_eq!(stream.remaining(), len as u64);
            let total: usize = stream.map(|c| c.expect("chunk").len()).sum();
            assert_eq!(total, len);
        }
    }

    #[test]
    fn content_is_restartable() {
        let data = pattern(3000);
        let (image, ino) = file_image(1024, &data);
        let fx = Fixture::new(image, 0);
        assert_eq!(fx.collect(ino), fx.collect(ino));
    }

    #[test]
    fn holes_read_as_zeros() {
        let mut b = ImageBuilder::new().expect("builder");
        let root = b.root();
        let ino = b
            .write_sparse_file(
                root,
                "sparse",
                300 * 1024,
                &[(3, b"abc".as_slice()), (270, b"xyz".as_slice())],
            )
            .expect("sparse");
        let fx = Fixture::new(b.finish().expect("finish"), 0);
        let inode = fx.inode(ino);

        assert_eq!(physical_block(&fx.reader, &inode, ino, 0).expect("hole"), None);
        assert_eq!(physical_block(&fx.reader, &inode, ino, 20).expect("hole"), None);
        assert!(physical_block(&fx.reader, &inode, ino, 270).expect("mapped").is_some());

        let bytes = fx.collect(ino);
        assert_eq!(bytes.len(), 300 * 1024);
        assert_eq!(&bytes[3 * 1024..3 * 1024 + 3], b"abc");
        assert_eq!(&bytes[270 * 1024..270 * 1024 + 3], b"xyz");
        assert!(bytes[..3 * 1024].iter().all(|b| *b == 0));
        assert!(bytes[4 * 1024..270 * 1024].iter().all(|b| *b == 0));
    }

    #[test]
    fn triple_indirect_size_is_unsupported() {
        let mut b = ImageBuilder::new().expect("builder");
        let root = b.root();
        let size = (65_804 + 1) * 1024;
        let ino = b.write_sparse_file(root, "huge", size, &[]).expect("huge");
        let fx = Fixture::new(b.finish().expect("finish"), 0);
        let inode = fx.inode(ino);

        let err = content(&fx.reader, &inode, ino).expect_err("tind");
        assert!(matches!(
            err,
            E2rError::TriIndirectUnsupported {
                logical_block: 65_804,
                ..
            }
        ));
        assert!(matches!(
            physical_block(&fx.reader, &inode, ino, 65_804),
            Err(E2rError::TriIndirectUnsupported { .. })
        ));
        // Data below the limit is still reachable by offset.
        let mut buf = [1_u8; 8];
        assert_eq!(
            read_file_data(&fx.reader, &inode, ino, 0, &mut buf).expect("read"),
            8
        );
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn read_file_data_is_clipped_to_size() {
        let data = pattern(20 * 1024 + 10);
        let (image, ino) = file_image(1024, &data);
        let fx = Fixture::new(image, 4);
        let inode = fx.inode(ino);

        let mut buf = vec![0_u8; 2048];
        let n = read_file_data(&fx.reader, &inode, ino, 11 * 1024 + 500, &mut buf).expect("read");
        assert_eq!(n, 2048);
        assert_eq!(buf, data[11 * 1024 + 500..13 * 1024 + 500]);

        let n = read_file_data(&fx.reader, &inode, ino, 20 * 1024, &mut buf).expect("tail");
        assert_eq!(n, 10);
        assert_eq!(&buf[..10], &data[20 * 1024..]);

        let n = read_file_data(&fx.reader, &inode, ino, 1 << 40, &mut buf).expect("eof");
        assert_eq!(n, 0);
    }

    #[test]
    fn tier_limit_matches_ensure_mappable() {
        let bs = BlockSize::new(1024).expect("bs");
        let mut inode = Ext2Inode::parse_from_bytes(&[0_u8; 128]).expect("inode");
        inode.size = 65_804 * 1024;
        assert!(ensure_mappable(&inode, InodeNumber(12), bs).is_ok());
        inode.size += 1;
        assert!(ensure_mappable(&inode, InodeNumber(12), bs).is_err());
    }
}
