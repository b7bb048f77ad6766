#![forbid(unsafe_code)]
//! In-memory ext2 image construction for tests and fixtures.
//!
//! `ImageBuilder` lays out a small but structurally complete ext2 image:
//! superblock, group descriptor table, per-group bitmaps and inode tables,
//! directories packed into as many blocks as their entries need, and files
//! mapped through direct, single-indirect and double-indirect pointers
//! (with optional holes).

use anyhow::{Context, Result, bail, ensure};
use e2r_types::{
    EXT2_DIR_ENTRY_HEADER_LEN, EXT2_GOOD_OLD_INODE_SIZE, EXT2_GROUP_DESC_SIZE, EXT2_IND_BLOCK,
    EXT2_DIND_BLOCK, EXT2_N_BLOCKS, EXT2_NAME_LEN, EXT2_NDIR_BLOCKS, EXT2_SUPER_MAGIC,
    EXT2_SUPERBLOCK_OFFSET, InodeNumber, S_IFDIR, S_IFIFO, S_IFLNK, S_IFREG,
};
use std::collections::BTreeMap;

/// Directory entry file type codes (`EXT2_FT_*`).
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_FIFO: u8 = 5;
pub const FT_SYMLINK: u8 = 7;

/// Geometry of the image to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageConfig {
    pub block_size: u32,
    pub blocks_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    /// 0 writes a revision-0 superblock with fixed 128-byte inodes.
    pub revision: u32,
    pub inode_size: u16,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_count: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 128,
            revision: 1,
            inode_size: 128,
        }
    }
}

impl ImageConfig {
    fn first_data_block(&self) -> u32 {
        u32::from(self.block_size == 1024)
    }

    fn groups(&self) -> u32 {
        (self.blocks_count - self.first_data_block()).div_ceil(self.blocks_per_group)
    }

    fn inode_size(&self) -> u16 {
        if self.revision == 0 {
            EXT2_GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size
        }
    }

    fn log_block_size(&self) -> u32 {
        self.block_size.trailing_zeros() - 10
    }
}

#[derive(Debug, Clone)]
struct DirRecord {
    ino: u32,
    name: Vec<u8>,
    file_type: u8,
}

#[derive(Debug, Clone)]
struct InodeSpec {
    mode: u16,
    size: u64,
    links: u16,
    /// Physical block per logical index; 0 is a hole.
    blocks: Vec<u32>,
    /// Entries for directories, laid out at `finish`.
    entries: Option<Vec<DirRecord>>,
}

/// A finished image plus the layout facts tests need to poke at it.
#[derive(Debug, Clone)]
pub struct Ext2Image {
    pub bytes: Vec<u8>,
    pub block_size: u32,
    inode_offsets: BTreeMap<u32, usize>,
    data_blocks: BTreeMap<u32, Vec<u32>>,
}

impl Ext2Image {
    /// Byte offset of an inode record inside `bytes`.
    #[must_use]
    pub fn inode_offset(&self, ino: InodeNumber) -> Option<usize> {
        self.inode_offsets.get(&ino.0).copied()
    }

    /// Physical data block per logical index of an inode (0 marks a hole).
    #[must_use]
    pub fn data_blocks(&self, ino: InodeNumber) -> Option<&[u32]> {
        self.data_blocks.get(&ino.0).map(Vec::as_slice)
    }

    /// Byte offset of a block inside `bytes`.
    #[must_use]
    pub fn block_offset(&self, block: u32) -> usize {
        block as usize * self.block_size as usize
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Builds ext2 images in memory.
///
/// The root directory (inode 2) exists from the start. Inodes are handed out
/// sequentially from 11 unless [`ImageBuilder::set_next_inode`] moves the
/// cursor; blocks are bump-allocated after the metadata area.
#[derive(Debug)]
pub struct ImageBuilder {
    config: ImageConfig,
    image: Vec<u8>,
    next_block: u32,
    next_inode: u32,
    inode_tables: Vec<u32>,
    bitmaps: Vec<(u32, u32)>,
    inodes: BTreeMap<u32, InodeSpec>,
}

impl ImageBuilder {
    /// Builder with [`ImageConfig::default`] geometry.
    pub fn new() -> Result<Self> {
        Self::with_config(ImageConfig::default())
    }

    pub fn with_config(config: ImageConfig) -> Result<Self> {
        ensure!(
            matches!(config.block_size, 1024 | 2048 | 4096),
            "unsupported block size {}",
            config.block_size
        );
        ensure!(config.blocks_per_group > 0, "blocks_per_group must be > 0");
        ensure!(config.inodes_per_group >= 11, "need room for reserved inodes");
        ensure!(
            config.blocks_count > config.first_data_block(),
            "blocks_count too small"
        );

        let bs = config.block_size as usize;
        let image_len = config.blocks_count as usize * bs;
        let groups = config.groups();
        let gdt_bytes = groups as usize * EXT2_GROUP_DESC_SIZE;
        let gdt_blocks = u32::try_from(gdt_bytes.div_ceil(bs)).context("gdt too large")?;
        let table_blocks = (config.inodes_per_group * u32::from(config.inode_size()))
            .div_ceil(config.block_size);

        let mut builder = Self {
            config,
            image: vec![0_u8; image_len],
            next_block: config.first_data_block() + 1 + gdt_blocks,
            next_inode: 11,
            inode_tables: Vec::new(),
            bitmaps: Vec::new(),
            inodes: BTreeMap::new(),
        };

        for _ in 0..groups {
            let block_bitmap = builder.alloc_block()?;
            let inode_bitmap = builder.alloc_block()?;
            builder.bitmaps.push((block_bitmap, inode_bitmap));
            let table = builder.next_block;
            for _ in 0..table_blocks {
                builder.alloc_block()?;
            }
            builder.inode_tables.push(table);
        }

        builder.inodes.insert(
            InodeNumber::ROOT.0,
            InodeSpec {
                mode: S_IFDIR | 0o755,
                size: 0,
                links: 2,
                blocks: Vec::new(),
                entries: Some(vec![
                    DirRecord {
                        ino: InodeNumber::ROOT.0,
                        name: b".".to_vec(),
                        file_type: FT_DIR,
                    },
                    DirRecord {
                        ino: InodeNumber::ROOT.0,
                        name: b"..".to_vec(),
                        file_type: FT_DIR,
                    },
                ]),
            },
        );
        Ok(builder)
    }

    #[must_use]
    pub fn root(&self) -> InodeNumber {
        InodeNumber::ROOT
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    /// Total inode count the superblock will advertise.
    #[must_use]
    pub fn inodes_count(&self) -> u32 {
        self.config.groups() * self.config.inodes_per_group
    }

    /// Move the inode allocation cursor (must not go backwards over used inodes).
    pub fn set_next_inode(&mut self, ino: u32) -> Result<()> {
        ensure!(
            ino >= 11 && ino <= self.inodes_count(),
            "inode {ino} outside allocatable range"
        );
        ensure!(!self.inodes.contains_key(&ino), "inode {ino} already used");
        self.next_inode = ino;
        Ok(())
    }

    /// Create a subdirectory.
    pub fn mkdir(&mut self, parent: InodeNumber, name: &str) -> Result<InodeNumber> {
        let ino = self.alloc_inode()?;
        self.inodes.insert(
            ino,
            InodeSpec {
                mode: S_IFDIR | 0o755,
                size: 0,
                links: 2,
                blocks: Vec::new(),
                entries: Some(vec![
                    DirRecord {
                        ino,
                        name: b".".to_vec(),
                        file_type: FT_DIR,
                    },
                    DirRecord {
                        ino: parent.0,
                        name: b"..".to_vec(),
                        file_type: FT_DIR,
                    },
                ]),
            },
        );
        self.link(parent, name, InodeNumber(ino), FT_DIR)?;
        if let Some(spec) = self.inodes.get_mut(&parent.0) {
            spec.links += 1;
        }
        Ok(InodeNumber(ino))
    }

    /// Create a regular file holding `data`, stored densely.
    pub fn write_file(&mut self, parent: InodeNumber, name: &str, data: &[u8]) -> Result<InodeNumber> {
        let bs = self.config.block_size as usize;
        let chunks: Vec<(u64, &[u8])> = data
            .chunks(bs)
            .enumerate()
            .map(|(index, chunk)| (index as u64, chunk))
            .collect();
        self.write_sparse_file(parent, name, data.len() as u64, &chunks)
    }

    /// Create a regular file of `size` bytes where only the listed logical
    /// blocks are allocated; everything else is a hole.
    pub fn write_sparse_file(
        &mut self,
        parent: InodeNumber,
        name: &str,
        size: u64,
        chunks: &[(u64, &[u8])],
    ) -> Result<InodeNumber> {
        let bs = u64::from(self.config.block_size);
        let k = bs / 4;
        let mapped_limit = EXT2_NDIR_BLOCKS as u64 + k + k * k;
        let logical_count = usize::try_from(size.div_ceil(bs).min(mapped_limit))
            .context("file too large")?;

        let mut blocks = vec![0_u32; logical_count];
        for (logical, data) in chunks {
            ensure!(
                *logical < mapped_limit,
                "builder cannot place data at logical block {logical}"
            );
            ensure!(data.len() as u64 <= bs, "chunk larger than a block");
            let index = usize::try_from(*logical).context("logical index")?;
            ensure!(index < logical_count, "chunk {logical} beyond file size");
            let phys = self.alloc_block()?;
            let off = phys as usize * bs as usize;
            self.image[off..off + data.len()].copy_from_slice(data);
            blocks[index] = phys;
        }

        let ino = self.alloc_inode()?;
        self.inodes.insert(
            ino,
            InodeSpec {
                mode: S_IFREG | 0o644,
                size,
                links: 1,
                blocks,
                entries: None,
            },
        );
        self.link(parent, name, InodeNumber(ino), FT_REG_FILE)?;
        Ok(InodeNumber(ino))
    }

    /// Create a fast symlink (target stored inside `i_block`, no data blocks).
    pub fn symlink(&mut self, parent: InodeNumber, name: &str, target: &str) -> Result<InodeNumber> {
        ensure!(target.len() < 60, "only fast symlinks are supported");
        let ino = self.alloc_inode()?;
        let mut inline = [0_u8; 60];
        inline[..target.len()].copy_from_slice(target.as_bytes());
        let words: Vec<u32> = inline
            .chunks(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        self.inodes.insert(
            ino,
            InodeSpec {
                mode: S_IFLNK | 0o777,
                size: target.len() as u64,
                links: 1,
                blocks: words,
                entries: None,
            },
        );
        self.link(parent, name, InodeNumber(ino), FT_SYMLINK)?;
        Ok(InodeNumber(ino))
    }

    /// Create a named pipe.
    pub fn mkfifo(&mut self, parent: InodeNumber, name: &str) -> Result<InodeNumber> {
        let ino = self.alloc_inode()?;
        self.inodes.insert(
            ino,
            InodeSpec {
                mode: S_IFIFO | 0o644,
                size: 0,
                links: 1,
                blocks: Vec::new(),
                entries: None,
            },
        );
        self.link(parent, name, InodeNumber(ino), FT_FIFO)?;
        Ok(InodeNumber(ino))
    }

    /// Add a raw directory entry to `dir` pointing at `target`.
    pub fn link(&mut self, dir: InodeNumber, name: &str, target: InodeNumber, file_type: u8) -> Result<()> {
        ensure!(!name.is_empty(), "empty name");
        ensure!(name.len() <= EXT2_NAME_LEN, "name too long: {name}");
        let spec = self
            .inodes
            .get_mut(&dir.0)
            .with_context(|| format!("no inode {dir}"))?;
        let Some(entries) = spec.entries.as_mut() else {
            bail!("inode {dir} is not a directory");
        };
        entries.push(DirRecord {
            ino: target.0,
            name: name.as_bytes().to_vec(),
            file_type,
        });
        Ok(())
    }

    /// Add an unused (inode 0) record to `dir`, as left behind by a deletion.
    pub fn add_deleted_entry(&mut self, dir: InodeNumber, name: &str) -> Result<()> {
        self.link(dir, name, InodeNumber(0), 0)
    }

    /// Lay out directories, write inodes, descriptors and the superblock.
    pub fn finish(mut self) -> Result<Ext2Image> {
        let dirs: Vec<u32> = self
            .inodes
            .iter()
            .filter(|(_, spec)| spec.entries.is_some())
            .map(|(ino, _)| *ino)
            .collect();
        for ino in dirs {
            self.layout_directory(ino)?;
        }

        let mut inode_offsets = BTreeMap::new();
        let mut data_blocks = BTreeMap::new();
        let specs: Vec<(u32, InodeSpec)> = self
            .inodes
            .iter()
            .map(|(ino, spec)| (*ino, spec.clone()))
            .collect();
        for (ino, spec) in specs {
            let offset = self.inode_offset(ino)?;
            let block = if spec.mode & 0o170_000 == S_IFLNK {
                let mut inline = [0_u32; EXT2_N_BLOCKS];
                inline.copy_from_slice(&spec.blocks);
                inline
            } else {
                data_blocks.insert(ino, spec.blocks.clone());
                self.map_blocks(&spec.blocks)?
            };
            self.write_inode(offset, &spec, &block);
            inode_offsets.insert(ino, offset);
        }

        self.write_group_descriptors();
        self.write_superblock();

        Ok(Ext2Image {
            bytes: self.image,
            block_size: self.config.block_size,
            inode_offsets,
            data_blocks,
        })
    }

    // ── internals ────────────────────────────────────────────────────────

    fn alloc_block(&mut self) -> Result<u32> {
        ensure!(
            self.next_block < self.config.blocks_count,
            "image full ({} blocks)",
            self.config.blocks_count
        );
        let block = self.next_block;
        self.next_block += 1;
        Ok(block)
    }

    fn alloc_inode(&mut self) -> Result<u32> {
        while self.inodes.contains_key(&self.next_inode) {
            self.next_inode += 1;
        }
        ensure!(self.next_inode <= self.inodes_count(), "out of inodes");
        let ino = self.next_inode;
        self.next_inode += 1;
        Ok(ino)
    }

    fn inode_offset(&self, ino: u32) -> Result<usize> {
        let ipg = self.config.inodes_per_group;
        let group = ((ino - 1) / ipg) as usize;
        let index = ((ino - 1) % ipg) as usize;
        let table = *self.inode_tables.get(group).context("inode group")?;
        Ok(table as usize * self.config.block_size as usize
            + index * usize::from(self.config.inode_size()))
    }

    fn layout_directory(&mut self, ino: u32) -> Result<()> {
        let bs = self.config.block_size as usize;
        let entries = self
            .inodes
            .get(&ino)
            .and_then(|spec| spec.entries.clone())
            .unwrap_or_default();

        // Greedy packing; the last record of each block absorbs the slack.
        let mut packed: Vec<Vec<&DirRecord>> = vec![Vec::new()];
        let mut used = 0_usize;
        for entry in &entries {
            let rec = record_len(entry.name.len());
            if used + rec > bs {
                packed.push(Vec::new());
                used = 0;
            }
            if let Some(block) = packed.last_mut() {
                block.push(entry);
            }
            used += rec;
        }

        let mut blocks = Vec::with_capacity(packed.len());
        for records in &packed {
            let phys = self.alloc_block()?;
            let base = phys as usize * bs;
            let mut offset = 0_usize;
            for (i, entry) in records.iter().enumerate() {
                let rec = if i + 1 == records.len() {
                    bs - offset
                } else {
                    record_len(entry.name.len())
                };
                let at = base + offset;
                put_u32(&mut self.image, at, entry.ino);
                put_u16(&mut self.image, at + 4, u16::try_from(rec).context("rec_len")?);
                self.image[at + 6] = u8::try_from(entry.name.len()).context("name_len")?;
                self.image[at + 7] = entry.file_type;
                self.image[at + 8..at + 8 + entry.name.len()].copy_from_slice(&entry.name);
                offset += rec;
            }
            blocks.push(phys);
        }

        if let Some(spec) = self.inodes.get_mut(&ino) {
            spec.size = (blocks.len() * bs) as u64;
            spec.blocks = blocks;
        }
        Ok(())
    }

    /// Build `i_block` for a logical->physical map, allocating indirect blocks.
    fn map_blocks(&mut self, blocks: &[u32]) -> Result<[u32; EXT2_N_BLOCKS]> {
        let bs = self.config.block_size as usize;
        let k = bs / 4;
        let mut i_block = [0_u32; EXT2_N_BLOCKS];

        for (slot, phys) in blocks.iter().take(EXT2_NDIR_BLOCKS).enumerate() {
            i_block[slot] = *phys;
        }

        let single = blocks.get(EXT2_NDIR_BLOCKS..).unwrap_or(&[]);
        let (single, double) = single.split_at(single.len().min(k));
        if single.iter().any(|b| *b != 0) {
            i_block[EXT2_IND_BLOCK] = self.write_pointer_block(single)?;
        }

        if double.iter().any(|b| *b != 0) {
            let mut level1 = Vec::with_capacity(double.len().div_ceil(k));
            for chunk in double.chunks(k) {
                let ptr = if chunk.iter().any(|b| *b != 0) {
                    self.write_pointer_block(chunk)?
                } else {
                    0
                };
                level1.push(ptr);
            }
            i_block[EXT2_DIND_BLOCK] = self.write_pointer_block(&level1)?;
        }

        Ok(i_block)
    }

    fn write_pointer_block(&mut self, pointers: &[u32]) -> Result<u32> {
        let block = self.alloc_block()?;
        let base = block as usize * self.config.block_size as usize;
        for (i, ptr) in pointers.iter().enumerate() {
            put_u32(&mut self.image, base + i * 4, *ptr);
        }
        Ok(block)
    }

    fn write_inode(&mut self, offset: usize, spec: &InodeSpec, i_block: &[u32; EXT2_N_BLOCKS]) {
        let img = &mut self.image;
        put_u16(img, offset, spec.mode);
        #[allow(clippy::cast_possible_truncation)]
        put_u32(img, offset + 0x04, spec.size as u32);
        put_u16(img, offset + 0x1A, spec.links);
        let data_blocks = if spec.mode & 0o170_000 == S_IFLNK {
            0
        } else {
            spec.blocks.iter().filter(|b| **b != 0).count() as u32
        };
        let sectors = data_blocks * (self.config.block_size / 512);
        put_u32(img, offset + 0x1C, sectors);
        for (slot, ptr) in i_block.iter().enumerate() {
            put_u32(img, offset + 0x28 + slot * 4, *ptr);
        }
        if spec.mode & 0o170_000 == S_IFREG {
            put_u32(img, offset + 0x6C, (spec.size >> 32) as u32);
        }
    }

    fn write_group_descriptors(&mut self) {
        let bs = self.config.block_size as usize;
        let gdt = (self.config.first_data_block() as usize + 1) * bs;
        for (group, table) in self.inode_tables.clone().into_iter().enumerate() {
            let at = gdt + group * EXT2_GROUP_DESC_SIZE;
            let (block_bitmap, inode_bitmap) = self.bitmaps[group];
            put_u32(&mut self.image, at, block_bitmap);
            put_u32(&mut self.image, at + 0x04, inode_bitmap);
            put_u32(&mut self.image, at + 0x08, table);
        }
    }

    fn write_superblock(&mut self) {
        let cfg = self.config;
        let used_inodes = self.inodes.keys().filter(|ino| **ino >= 11).count() as u32 + 10;
        let sb = EXT2_SUPERBLOCK_OFFSET;
        let img = &mut self.image;
        put_u32(img, sb, self.config.groups() * cfg.inodes_per_group);
        put_u32(img, sb + 0x04, cfg.blocks_count);
        put_u32(img, sb + 0x0C, cfg.blocks_count - self.next_block);
        put_u32(
            img,
            sb + 0x10,
            (self.config.groups() * cfg.inodes_per_group).saturating_sub(used_inodes),
        );
        put_u32(img, sb + 0x14, cfg.first_data_block());
        put_u32(img, sb + 0x18, cfg.log_block_size());
        put_u32(img, sb + 0x20, cfg.blocks_per_group);
        put_u32(img, sb + 0x24, cfg.blocks_per_group);
        put_u32(img, sb + 0x28, cfg.inodes_per_group);
        put_u16(img, sb + 0x38, EXT2_SUPER_MAGIC);
        put_u16(img, sb + 0x3A, 1); // clean
        put_u16(img, sb + 0x3C, 1); // continue on errors
        put_u32(img, sb + 0x4C, cfg.revision);
        if cfg.revision > 0 {
            put_u32(img, sb + 0x54, 11);
            put_u16(img, sb + 0x58, cfg.inode_size);
            put_u32(img, sb + 0x60, 0x0002); // filetype
        }
        img[sb + 0x78..sb + 0x78 + 7].copy_from_slice(b"fixture");
    }
}

fn record_len(name_len: usize) -> usize {
    (EXT2_DIR_ENTRY_HEADER_LEN + name_len + 3) & !3
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// The sample image used by fixtures and CLI tests.
///
/// ```text
/// /                 root (inode 2)
/// /lost+found       dir (11)
/// /notes.txt        "hello" (13)
/// /docs             dir
/// /docs/big.bin     spans direct and single-indirect blocks
/// /docs/sparse.bin  hole-only prefix, data in the double-indirect range
/// /link             fast symlink to notes.txt
/// /pipe             fifo
/// ```
pub fn sample_image(block_size: u32) -> Result<Ext2Image> {
    let mut b = ImageBuilder::with_config(ImageConfig {
        block_size,
        blocks_count: 4 * 1024 * 1024 / block_size,
        ..ImageConfig::default()
    })?;
    let root = b.root();
    b.mkdir(root, "lost+found")?;
    b.set_next_inode(13)?;
    b.write_file(root, "notes.txt", b"hello")?;
    let docs = b.mkdir(root, "docs")?;
    b.write_file(docs, "big.bin", &pattern(20 * block_size as usize + 100))?;

    let k = u64::from(block_size / 4);
    let dind_start = 12 + k;
    b.write_sparse_file(
        docs,
        "sparse.bin",
        (dind_start + 3) * u64::from(block_size),
        &[(dind_start + 1, b"deep".as_slice())],
    )?;
    b.symlink(root, "link", "notes.txt")?;
    b.mkfifo(root, "pipe")?;
    b.finish()
}

/// Deterministic non-repeating-per-block byte pattern.
#[must_use]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + i / 251) % 251).unwrap_or(0))
        .collect()
}
